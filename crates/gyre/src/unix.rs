//! Local-stream socket plumbing.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};

use socket2::{Domain, SockAddr, Socket, Type};

/// Connect to a local-stream socket, without blocking.
///
/// Local connects usually complete immediately; a full server backlog
/// reports `EAGAIN` and is handled like an in-progress connect.
pub(crate) fn dial(path: &str) -> io::Result<UnixStream> {
    let sock = Socket::new(Domain::UNIX, Type::STREAM, None)?;

    sock.set_nonblocking(true)?;
    match sock.connect(&SockAddr::unix(path)?) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(UnixStream::from(OwnedFd::from(sock)))
}

/// Listen for connections on the given filesystem path.
pub(crate) fn listen(path: &str) -> io::Result<UnixListener> {
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        assert!(dial(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_listen_and_dial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let path = path.to_str().unwrap();

        let _listener = listen(path).unwrap();
        dial(path).unwrap();
    }
}
