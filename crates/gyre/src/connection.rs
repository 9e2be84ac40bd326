//! Shared connection state machine.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

use crate::address::Address;
use crate::buffer::MessageBuffer;
use crate::error::Error;
use crate::protocol::Protocol;
use crate::reactor::ConnectorId;
use crate::tls::TlsStream;

/// How much free space the read buffer keeps ahead of each read.
pub(crate) const READ_CHUNK: usize = 16 * 1024;

/// Lifecycle of a connection.
///
/// `Connecting` is a client socket whose connect has not completed yet
/// (no protocol attached). `Handshaking` is TLS only. `Draining` means a
/// close was requested and pending writes are flushing (or a deferred
/// close is queued). `ShuttingDown` is the TLS close_notify exchange.
/// `Closed` is terminal and the registry slot is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Connecting,
    Handshaking,
    Open,
    Draining,
    ShuttingDown,
    Closed,
}

pub(crate) enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream>),
    Unix(UnixStream),
}

impl Stream {
    /// Plain byte read; not used by the TLS transport, which pumps its
    /// session instead.
    pub fn io_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
            Stream::Tls(_) => Err(io::ErrorKind::Unsupported.into()),
        }
    }

    /// Plain byte write; see `io_read`.
    pub fn io_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
            Stream::Tls(_) => Err(io::ErrorKind::Unsupported.into()),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }

    /// The connect error of an in-progress socket, if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Stream::Tcp(s) => s.take_error(),
            Stream::Tls(t) => t.sock.take_error(),
            Stream::Unix(s) => s.take_error(),
        }
    }
}

pub(crate) struct Connection {
    pub stream: Stream,
    pub protocol: Option<Box<dyn Protocol>>,
    pub phase: Phase,
    /// Write interest is armed; a flush is scheduled for the next
    /// writability event.
    pub writing: bool,
    pub error: Option<Error>,
    pub read_buf: MessageBuffer,
    pub write_queue: VecDeque<MessageBuffer>,
    pub local: Address,
    pub peer: Address,
    /// Back-reference for client connections, so the connector learns of
    /// `connection_lost` after hand-off.
    pub connector: Option<ConnectorId>,
    /// `make_connection` was dispatched; `connection_lost` is owed.
    pub greeted: bool,
}

impl Connection {
    pub fn new(
        stream: Stream,
        local: Address,
        peer: Address,
        phase: Phase,
        protocol: Option<Box<dyn Protocol>>,
    ) -> Self {
        Self {
            stream,
            protocol,
            phase,
            writing: false,
            error: None,
            read_buf: MessageBuffer::new(),
            write_queue: VecDeque::new(),
            local,
            peer,
            connector: None,
            greeted: false,
        }
    }

    /// Whether the connection is aborting (queued bytes discarded, no
    /// further transmission wanted).
    pub fn aborting(&self) -> bool {
        matches!(self.error, Some(Error::ConnectionAbort))
    }
}

/// Merge trailing queued segments into the head so one write covers them.
///
/// Only the head segment is ever being transmitted; order is preserved.
pub(crate) fn coalesce(queue: &mut VecDeque<MessageBuffer>) {
    if queue.len() <= 1 {
        return;
    }
    let extra: usize = queue.iter().skip(1).map(|b| b.active_size()).sum();
    let mut head = queue.pop_front().expect("queue is non-empty");
    head.ensure_free_space(extra);
    for segment in queue.drain(..) {
        head.write(segment.read_slice());
    }
    queue.push_front(head);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_preserves_order() {
        let mut queue: VecDeque<MessageBuffer> = VecDeque::new();
        queue.push_back(MessageBuffer::from(&b"A"[..]));
        queue.push_back(MessageBuffer::from(&b"B"[..]));
        queue.push_back(MessageBuffer::from(&b"C"[..]));

        coalesce(&mut queue);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].read_slice(), b"ABC");
    }

    #[test]
    fn test_coalesce_respects_consumed_prefix() {
        let mut queue: VecDeque<MessageBuffer> = VecDeque::new();
        let mut head = MessageBuffer::from(&b"xyz"[..]);
        head.read_completed(1);
        queue.push_back(head);
        queue.push_back(MessageBuffer::from(&b"w"[..]));

        coalesce(&mut queue);
        assert_eq!(queue[0].read_slice(), b"yzw");
    }
}
