//! Listeners: bind, accept loop, factory start/stop.

use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use tracing::{debug, error};

use crate::address::Address;
use crate::connection::{Connection, Phase, Stream};
use crate::error::Error;
use crate::protocol::{Factory, Protocol};
use crate::reactor::{ListenerId, Reactor, SourceKey};
use crate::tls::{self, TlsContext, TlsStream};
use crate::{tcp, unix};

pub(crate) enum Acceptor {
    Tcp(TcpListener),
    Unix(UnixListener),
}

pub(crate) struct Listener {
    pub acceptor: Option<Acceptor>,
    pub factory: Box<dyn Factory>,
    pub tls: Option<Arc<TlsContext>>,
    pub connected: bool,
    pub local: Address,
}

enum Accepted {
    Tcp(TcpStream, Address),
    Unix(UnixStream, Address),
}

impl Reactor {
    /// Bind a TCP listener and start accepting.
    ///
    /// `interface` is an IP literal or resolvable host (empty selects
    /// `0.0.0.0`); `port` is numeric or a service name, with `"0"` asking
    /// the OS to choose.
    pub fn listen_tcp(
        &mut self,
        interface: &str,
        port: &str,
        factory: Box<dyn Factory>,
    ) -> Result<ListenerId, Error> {
        self.listen_stream(interface, port, factory, None)
    }

    /// Bind a TLS listener; `context` must be server-side and is shared by
    /// every accepted connection.
    pub fn listen_tls(
        &mut self,
        interface: &str,
        port: &str,
        factory: Box<dyn Factory>,
        context: Arc<TlsContext>,
    ) -> Result<ListenerId, Error> {
        self.listen_stream(interface, port, factory, Some(context))
    }

    fn listen_stream(
        &mut self,
        interface: &str,
        port: &str,
        mut factory: Box<dyn Factory>,
        tls: Option<Arc<TlsContext>>,
    ) -> Result<ListenerId, Error> {
        let interface = if interface.is_empty() { "0.0.0.0" } else { interface };
        let endpoint = match tcp::literal_endpoint(interface, port) {
            Some(endpoint) => endpoint,
            None => tcp::resolve(interface, port)?[0],
        };
        let listener = tcp::listen(&endpoint)?;
        let local = Address::from(listener.local_addr()?);
        debug!(target: "reactor", "Listening for incoming connections on {}", local);

        factory.do_start();
        let id = self.next_listener_id();
        self.sources
            .register(SourceKey::Listener(id), &listener, popol::interest::READ);
        self.listeners.insert(
            id,
            Listener {
                acceptor: Some(Acceptor::Tcp(listener)),
                factory,
                tls,
                connected: true,
                local,
            },
        );
        Ok(id)
    }

    /// Bind a UNIX-domain listener on a filesystem path.
    pub fn listen_unix(
        &mut self,
        path: &str,
        mut factory: Box<dyn Factory>,
    ) -> Result<ListenerId, Error> {
        let listener = unix::listen(path)?;
        let local = Address::unix(path);
        debug!(target: "reactor", "Listening for incoming connections on {}", local);

        factory.do_start();
        let id = self.next_listener_id();
        self.sources
            .register(SourceKey::Listener(id), &listener, popol::interest::READ);
        self.listeners.insert(
            id,
            Listener {
                acceptor: Some(Acceptor::Unix(listener)),
                factory,
                tls: None,
                connected: true,
                local,
            },
        );
        Ok(id)
    }

    /// Close the acceptor and stop the factory. An accept already in
    /// flight is cancelled silently. Idempotent.
    pub fn stop_listening(&mut self, id: ListenerId) -> Result<(), Error> {
        let Some(listener) = self.listeners.get_mut(&id) else { return Ok(()) };
        if !listener.connected {
            return Ok(());
        }
        listener.connected = false;
        listener.acceptor = None;
        self.sources.unregister(&SourceKey::Listener(id));

        let Some(listener) = self.listeners.get_mut(&id) else { return Ok(()) };
        listener.factory.do_stop();
        debug!(target: "reactor", "Listener closed on {}", listener.local);
        Ok(())
    }

    /// The listener's bound address; reports the OS-chosen port after a
    /// port-0 bind.
    pub fn listener_address(&self, id: ListenerId) -> Option<Address> {
        self.listeners.get(&id).map(|l| l.local.clone())
    }

    /// Accept until the socket would block. Individual accept failures
    /// are logged and do not tear the listener down.
    pub(crate) fn accept_ready(&mut self, id: ListenerId) {
        loop {
            let (step, tls) = {
                let Some(listener) = self.listeners.get(&id) else { return };
                if !listener.connected {
                    return;
                }
                let step = match listener.acceptor.as_ref() {
                    Some(Acceptor::Tcp(acceptor)) => acceptor
                        .accept()
                        .map(|(stream, addr)| Accepted::Tcp(stream, Address::from(addr))),
                    Some(Acceptor::Unix(acceptor)) => acceptor.accept().map(|(stream, addr)| {
                        let peer = addr
                            .as_pathname()
                            .map(|p| Address::unix(p.to_string_lossy()))
                            .unwrap_or_else(|| Address::unix(""));
                        Accepted::Unix(stream, peer)
                    }),
                    None => return,
                };
                (step, listener.tls.clone())
            };

            match step {
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    // Transient accept failure; the listener stays up and
                    // the next readiness event retries.
                    error!(target: "reactor", "Accept error: {}", e);
                    return;
                }
                Ok(Accepted::Tcp(stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        error!(target: "reactor", "{}: Accept error: {}", peer, e);
                        continue;
                    }
                    let local = stream
                        .local_addr()
                        .map(Address::from)
                        .unwrap_or_default();
                    let Some(protocol) = self.build_protocol(id, &peer) else { continue };
                    self.register_accepted_tcp(stream, protocol, tls, local, peer);
                }
                Ok(Accepted::Unix(stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        error!(target: "reactor", "Accept error: {}", e);
                        continue;
                    }
                    let local = self
                        .listeners
                        .get(&id)
                        .map(|l| l.local.clone())
                        .unwrap_or_default();
                    let Some(protocol) = self.build_protocol(id, &peer) else { continue };
                    let conn_id = self.next_conn_id();
                    self.sources
                        .register(SourceKey::Conn(conn_id), &stream, popol::interest::ALL);
                    self.conns.insert(
                        conn_id,
                        Connection::new(Stream::Unix(stream), local, peer, Phase::Open, Some(protocol)),
                    );
                    self.dispatch_make_connection(conn_id);
                }
            }
        }
    }

    /// Returning `None` drops the accepted socket.
    fn build_protocol(&mut self, id: ListenerId, peer: &Address) -> Option<Box<dyn Protocol>> {
        let listener = self.listeners.get_mut(&id)?;
        listener.factory.build_protocol(peer)
    }

    fn register_accepted_tcp(
        &mut self,
        stream: TcpStream,
        protocol: Box<dyn Protocol>,
        tls: Option<Arc<TlsContext>>,
        local: Address,
        peer: Address,
    ) {
        let conn_id = self.next_conn_id();
        match tls {
            None => {
                self.sources
                    .register(SourceKey::Conn(conn_id), &stream, popol::interest::ALL);
                self.conns.insert(
                    conn_id,
                    Connection::new(Stream::Tcp(stream), local, peer, Phase::Open, Some(protocol)),
                );
                self.dispatch_make_connection(conn_id);
            }
            Some(context) => {
                let session = match context.server_session() {
                    Ok(session) => session,
                    Err(e) => {
                        error!(target: "tls", "{}: Handshake error: {}", peer, e);
                        return;
                    }
                };
                self.sources
                    .register(SourceKey::Conn(conn_id), &stream, popol::interest::ALL);
                self.conns.insert(
                    conn_id,
                    Connection::new(
                        Stream::Tls(Box::new(TlsStream::new(stream, session))),
                        local,
                        peer,
                        Phase::Handshaking,
                        Some(protocol),
                    ),
                );
                self.dispatch_make_connection(conn_id);
                if self.conns.get(&conn_id).map(|c| c.phase) == Some(Phase::Handshaking) {
                    tls::flush_transport(self, conn_id);
                }
            }
        }
    }
}
