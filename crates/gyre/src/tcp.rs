//! TCP socket plumbing: non-blocking dial, bound listeners, endpoint
//! resolution.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use socket2::{Domain, Socket, Type};

use crate::address::{is_valid_ip, is_valid_port, Address};

/// Connect to a peer given a remote address, without blocking.
///
/// The returned stream is connecting; it becomes writable once the
/// connection is established or refused.
pub(crate) fn dial(addr: &SocketAddr, bind: Option<&Address>) -> io::Result<TcpStream> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let sock = Socket::new(domain, Type::STREAM, None)?;

    sock.set_nonblocking(true)?;
    if let Some(bind) = bind {
        sock.bind(&bind_endpoint(bind)?.into())?;
    }

    match sock.connect(&(*addr).into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}

/// Listen for connections on the given address.
pub(crate) fn listen(addr: &SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let sock = Socket::new(domain, Type::STREAM, None)?;

    sock.set_reuse_address(true)?;
    sock.bind(&(*addr).into())?;
    sock.listen(128)?;

    let listener: TcpListener = sock.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// The endpoint for a host/port pair when both are literals.
pub(crate) fn literal_endpoint(host: &str, port: &str) -> Option<SocketAddr> {
    if !is_valid_ip(host) || !is_valid_port(port) {
        return None;
    }
    Some(SocketAddr::new(host.parse().ok()?, port.parse().ok()?))
}

/// Resolve a host and port (numeric or service name) through the name
/// service. Blocking; connectors run this on a worker thread.
pub(crate) fn resolve(host: &str, port: &str) -> io::Result<Vec<SocketAddr>> {
    let target = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = target.to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {target}"),
        ));
    }
    Ok(addrs)
}

fn bind_endpoint(bind: &Address) -> io::Result<SocketAddr> {
    let ip = bind.host().parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid bind address {}", bind.host()),
        )
    })?;
    Ok(SocketAddr::new(ip, bind.port()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_endpoint() {
        assert_eq!(
            literal_endpoint("127.0.0.1", "80"),
            Some("127.0.0.1:80".parse().unwrap())
        );
        assert_eq!(literal_endpoint("localhost", "80"), None);
        assert_eq!(literal_endpoint("127.0.0.1", "http"), None);
    }

    #[test]
    fn test_listen_on_ephemeral_port() {
        let listener = listen(&"127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
