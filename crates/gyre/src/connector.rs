//! Connectors: resolve, connect, timeout, retry surface.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error};

use crate::address::Address;
use crate::connection::{Connection, Phase, Stream};
use crate::error::Error;
use crate::protocol::ClientFactory;
use crate::reactor::{ConnectionId, ConnectorId, Reactor, SourceKey};
use crate::timer::DelayedCall;
use crate::tls::{self, TlsContext, TlsStream};
use crate::{tcp, unix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
}

pub(crate) enum ConnectorKind {
    Tcp { host: String, port: String, bind: Option<Address> },
    Tls { host: String, port: String, bind: Option<Address>, context: Arc<TlsContext> },
    Unix { path: String },
}

pub(crate) struct Connector {
    pub kind: ConnectorKind,
    /// Taken out for the duration of a factory callback.
    pub factory: Option<Box<dyn ClientFactory>>,
    pub factory_started: bool,
    pub state: ConnectorState,
    pub timeout: f64,
    pub timeout_call: Option<DelayedCall>,
    pub error: Option<Error>,
    /// The in-flight connecting socket, released on hand-off.
    pub conn: Option<ConnectionId>,
    pub endpoints: VecDeque<SocketAddr>,
    pub resolving: bool,
    /// Bumped per `start_connecting`; stale timer and resolver
    /// completions are discarded by comparing against it.
    pub attempt: u64,
}

/// Completion posted back by a resolver thread.
pub(crate) struct Resolved {
    pub connector: ConnectorId,
    pub attempt: u64,
    pub result: io::Result<Vec<SocketAddr>>,
}

impl Reactor {
    /// Create a TCP connector and start its first attempt.
    ///
    /// `timeout` is in seconds; zero or negative disables the connect
    /// timeout. `bind` optionally pins the local address before
    /// connecting.
    pub fn connect_tcp(
        &mut self,
        host: &str,
        port: &str,
        factory: Box<dyn ClientFactory>,
        timeout: f64,
        bind: Option<Address>,
    ) -> Result<ConnectorId, Error> {
        let kind = ConnectorKind::Tcp { host: host.into(), port: port.into(), bind };
        self.add_connector(kind, factory, timeout)
    }

    /// Create a TLS connector; `context` must be client-side.
    pub fn connect_tls(
        &mut self,
        host: &str,
        port: &str,
        factory: Box<dyn ClientFactory>,
        context: Arc<TlsContext>,
        timeout: f64,
        bind: Option<Address>,
    ) -> Result<ConnectorId, Error> {
        let kind = ConnectorKind::Tls { host: host.into(), port: port.into(), bind, context };
        self.add_connector(kind, factory, timeout)
    }

    /// Create a UNIX-domain connector for a filesystem path.
    pub fn connect_unix(
        &mut self,
        path: &str,
        factory: Box<dyn ClientFactory>,
        timeout: f64,
    ) -> Result<ConnectorId, Error> {
        let kind = ConnectorKind::Unix { path: path.into() };
        self.add_connector(kind, factory, timeout)
    }

    fn add_connector(
        &mut self,
        kind: ConnectorKind,
        factory: Box<dyn ClientFactory>,
        timeout: f64,
    ) -> Result<ConnectorId, Error> {
        let id = self.next_connector_id();
        self.connectors.insert(
            id,
            Connector {
                kind,
                factory: Some(factory),
                factory_started: false,
                state: ConnectorState::Disconnected,
                timeout,
                timeout_call: None,
                error: None,
                conn: None,
                endpoints: VecDeque::new(),
                resolving: false,
                attempt: 0,
            },
        );
        self.start_connecting(id)?;
        Ok(id)
    }

    /// Begin a connect attempt. The connector must be disconnected; a
    /// factory may call this from `client_connection_failed` or
    /// `client_connection_lost` to reconnect.
    pub fn start_connecting(&mut self, id: ConnectorId) -> Result<(), Error> {
        let deferred = {
            let Some(c) = self.connectors.get_mut(&id) else {
                return Err(Error::NotDisconnected);
            };
            if c.state != ConnectorState::Disconnected {
                return Err(Error::NotDisconnected);
            }
            c.state = ConnectorState::Connecting;
            c.error = None;
            c.endpoints.clear();
            c.resolving = false;
            c.attempt = c.attempt.wrapping_add(1);
            // Inside one of this factory's own callbacks the factory
            // object is moved out; pick the attempt up next turn.
            c.factory.is_none()
        };
        if deferred {
            self.add_callback(move |reactor| reactor.begin_attempt(id));
        } else {
            self.begin_attempt(id);
        }
        Ok(())
    }

    fn begin_attempt(&mut self, id: ConnectorId) {
        let (timeout, attempt) = {
            let Some(c) = self.connectors.get_mut(&id) else { return };
            if c.state != ConnectorState::Connecting {
                return; // stopped before the deferred attempt began
            }
            if !c.factory_started {
                if let Some(factory) = c.factory.as_mut() {
                    factory.do_start();
                    c.factory_started = true;
                }
            }
            (c.timeout, c.attempt)
        };

        self.launch(id);

        if self.connectors.get(&id).map(|c| c.state) != Some(ConnectorState::Connecting) {
            return;
        }
        if timeout > 0.0 {
            let call = self.call_later(timeout, move |reactor| {
                reactor.connector_timeout(id, attempt);
            });
            if let Some(c) = self.connectors.get_mut(&id) {
                c.timeout_call = Some(call);
            }
        }
        self.with_client_factory(id, |factory, reactor| {
            factory.started_connecting(reactor, id);
        });
    }

    /// Go straight to connect for literal endpoints, else resolve first.
    fn launch(&mut self, id: ConnectorId) {
        enum Step {
            Connect(SocketAddr),
            Resolve(String, String),
            Unix(String),
        }

        let step = {
            let Some(c) = self.connectors.get(&id) else { return };
            match &c.kind {
                ConnectorKind::Unix { path } => Step::Unix(path.clone()),
                ConnectorKind::Tcp { host, port, .. } | ConnectorKind::Tls { host, port, .. } => {
                    match tcp::literal_endpoint(host, port) {
                        Some(endpoint) => Step::Connect(endpoint),
                        None => Step::Resolve(host.clone(), port.clone()),
                    }
                }
            }
        };

        match step {
            Step::Unix(path) => match unix::dial(&path) {
                Ok(stream) => {
                    let peer = Address::unix(&path);
                    let conn_id = self.next_conn_id();
                    self.sources
                        .register(SourceKey::Conn(conn_id), &stream, popol::interest::ALL);
                    let mut conn = Connection::new(
                        Stream::Unix(stream),
                        Address::default(),
                        peer,
                        Phase::Connecting,
                        None,
                    );
                    conn.connector = Some(id);
                    self.conns.insert(conn_id, conn);
                    if let Some(c) = self.connectors.get_mut(&id) {
                        c.conn = Some(conn_id);
                    }
                }
                Err(e) => {
                    error!(target: "reactor", "{}: Dial error: {}", path, e);
                    self.fail_attempt_later(id, e.into());
                }
            },
            Step::Connect(endpoint) => {
                if let Some(c) = self.connectors.get_mut(&id) {
                    c.endpoints = VecDeque::from([endpoint]);
                }
                self.connect_next(id);
            }
            Step::Resolve(host, port) => self.start_resolve(id, host, port),
        }
    }

    fn start_resolve(&mut self, id: ConnectorId, host: String, port: String) {
        let attempt = {
            let Some(c) = self.connectors.get_mut(&id) else { return };
            c.resolving = true;
            c.attempt
        };
        let tx = self.resolved_tx.clone();
        let waker = Arc::clone(&self.waker);
        // Name resolution blocks; run it off-thread and post the result
        // back to the loop.
        std::thread::spawn(move || {
            let result = tcp::resolve(&host, &port);
            let _ = tx.send(Resolved { connector: id, attempt, result });
            waker.wake().ok();
        });
    }

    pub(crate) fn handle_resolved(&mut self, msg: Resolved) {
        let Some(c) = self.connectors.get_mut(&msg.connector) else { return };
        // A stale completion: the attempt was stopped or superseded.
        // Cleanup already happened; stay silent.
        if !c.resolving || c.attempt != msg.attempt || c.state != ConnectorState::Connecting {
            return;
        }
        c.resolving = false;
        match msg.result {
            Ok(addrs) => {
                c.endpoints = addrs.into();
                self.connect_next(msg.connector);
            }
            Err(e) => {
                error!(target: "reactor", "Resolve error: {}", e);
                c.error = Some(e.into());
                self.connector_failed(msg.connector);
            }
        }
    }

    /// Try the next resolved endpoint. Synchronous dial failures walk the
    /// list; exhaustion fails the attempt with the last error.
    fn connect_next(&mut self, id: ConnectorId) {
        loop {
            let (endpoint, bind) = {
                let Some(c) = self.connectors.get_mut(&id) else { return };
                if c.state != ConnectorState::Connecting {
                    return;
                }
                let Some(endpoint) = c.endpoints.pop_front() else {
                    let reason = c.error.clone().unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, "no endpoints to connect").into()
                    });
                    self.fail_attempt_later(id, reason);
                    return;
                };
                let bind = match &c.kind {
                    ConnectorKind::Tcp { bind, .. } | ConnectorKind::Tls { bind, .. } => {
                        bind.clone()
                    }
                    ConnectorKind::Unix { .. } => None,
                };
                (endpoint, bind)
            };

            match tcp::dial(&endpoint, bind.as_ref()) {
                Ok(stream) => {
                    // For TLS the session is created up front, before the
                    // socket connects; the handshake begins at hand-off.
                    let session = {
                        let Some(c) = self.connectors.get(&id) else { return };
                        match &c.kind {
                            ConnectorKind::Tls { host, context, .. } => {
                                match context.client_session(host) {
                                    Ok(session) => Some(session),
                                    Err(e) => {
                                        error!(target: "tls", "{}: Session error: {}", host, e);
                                        self.fail_attempt_later(id, e);
                                        return;
                                    }
                                }
                            }
                            _ => None,
                        }
                    };
                    let peer = Address::from(endpoint);
                    let stream = match session {
                        Some(session) => Stream::Tls(Box::new(TlsStream::new(stream, session))),
                        None => Stream::Tcp(stream),
                    };
                    let conn_id = self.next_conn_id();
                    match &stream {
                        Stream::Tcp(s) => {
                            self.sources
                                .register(SourceKey::Conn(conn_id), s, popol::interest::ALL)
                        }
                        Stream::Tls(t) => self.sources.register(
                            SourceKey::Conn(conn_id),
                            &t.sock,
                            popol::interest::ALL,
                        ),
                        Stream::Unix(_) => unreachable!("unix connects do not take this path"),
                    }
                    let mut conn =
                        Connection::new(stream, Address::default(), peer, Phase::Connecting, None);
                    conn.connector = Some(id);
                    self.conns.insert(conn_id, conn);
                    if let Some(c) = self.connectors.get_mut(&id) {
                        c.conn = Some(conn_id);
                    }
                    return;
                }
                Err(e) => {
                    error!(target: "reactor", "{}: Dial error: {}", endpoint, e);
                    if let Some(c) = self.connectors.get_mut(&id) {
                        c.error = Some(e.into());
                    }
                    // fall through to the next endpoint
                }
            }
        }
    }

    /// The connecting socket became writable: either connected or failed.
    pub(crate) fn finish_connect(&mut self, conn_id: ConnectionId) {
        let (id, sock_err) = {
            let Some(conn) = self.conns.get(&conn_id) else { return };
            let Some(id) = conn.connector else { return };
            let err = match conn.stream.take_error() {
                Ok(err) => err,
                Err(e) => Some(e),
            };
            (id, err)
        };

        if let Some(e) = sock_err {
            self.connect_attempt_errored(id, conn_id, e);
            return;
        }

        // Connected; fix up addresses from the socket.
        let (local, peer) = {
            let Some(conn) = self.conns.get(&conn_id) else { return };
            match &conn.stream {
                Stream::Tcp(s) => match (s.local_addr(), s.peer_addr()) {
                    (Ok(local), Ok(peer)) => (Address::from(local), Address::from(peer)),
                    (Err(e), _) | (_, Err(e)) => {
                        self.connect_attempt_errored(id, conn_id, e);
                        return;
                    }
                },
                Stream::Tls(t) => match (t.sock.local_addr(), t.sock.peer_addr()) {
                    (Ok(local), Ok(peer)) => (Address::from(local), Address::from(peer)),
                    (Err(e), _) | (_, Err(e)) => {
                        self.connect_attempt_errored(id, conn_id, e);
                        return;
                    }
                },
                Stream::Unix(s) => {
                    let local = s
                        .local_addr()
                        .ok()
                        .and_then(|a| a.as_pathname().map(|p| Address::unix(p.to_string_lossy())))
                        .unwrap_or_else(|| Address::unix(""));
                    (local, conn.peer.clone())
                }
            }
        };

        debug!(target: "reactor", "{}: Connected", peer);

        // Hand-off: the connector releases the connection, cancels its
        // timeout and asks the factory for a protocol.
        let protocol = {
            let Some(c) = self.connectors.get_mut(&id) else { return };
            c.state = ConnectorState::Connected;
            c.conn = None;
            if let Some(call) = c.timeout_call.take() {
                if !call.cancelled() {
                    let _ = call.cancel();
                }
            }
            match c.factory.as_mut() {
                Some(factory) => factory.build_protocol(&peer),
                None => None,
            }
        };

        match protocol {
            None => {
                self.drop_conn(conn_id);
                self.connector_lost(id, Error::ConnectionDone);
            }
            Some(protocol) => {
                let is_tls = {
                    let Some(conn) = self.conns.get_mut(&conn_id) else { return };
                    conn.protocol = Some(protocol);
                    conn.local = local;
                    conn.peer = peer;
                    conn.writing = false;
                    conn.phase = if conn.stream.is_tls() {
                        Phase::Handshaking
                    } else {
                        Phase::Open
                    };
                    conn.stream.is_tls()
                };
                self.set_write_interest(conn_id, false);
                self.dispatch_make_connection(conn_id);
                if is_tls
                    && self.conns.get(&conn_id).map(|c| c.phase) == Some(Phase::Handshaking)
                {
                    // Kick the handshake off (the client speaks first).
                    tls::flush_transport(self, conn_id);
                }
            }
        }
    }

    fn connect_attempt_errored(&mut self, id: ConnectorId, conn_id: ConnectionId, e: io::Error) {
        self.drop_conn(conn_id);
        let has_more = {
            let Some(c) = self.connectors.get_mut(&id) else { return };
            c.conn = None;
            c.error = Some(Error::from(e));
            !c.endpoints.is_empty()
        };
        if has_more {
            self.connect_next(id);
        } else {
            if let Some(c) = self.connectors.get(&id) {
                if let Some(Error::Io(e)) = &c.error {
                    error!(target: "reactor", "Connect error {:?}: {}", e.kind(), e);
                }
            }
            self.connector_failed(id);
        }
    }

    fn connector_timeout(&mut self, id: ConnectorId, attempt: u64) {
        {
            let Some(c) = self.connectors.get_mut(&id) else { return };
            if c.state != ConnectorState::Connecting || c.attempt != attempt {
                return;
            }
            error!(target: "reactor", "Connect error: attempt timed out");
            c.error = Some(Error::Timeout);
        }
        self.connector_failed(id);
    }

    /// Abort the attempt in flight. The factory is notified with
    /// `UserAbort` on the next turn, mirroring a cancelled completion.
    pub fn stop_connecting(&mut self, id: ConnectorId) -> Result<(), Error> {
        let (pending_conn, attempt) = {
            let Some(c) = self.connectors.get_mut(&id) else {
                return Err(Error::NotConnecting);
            };
            if c.state != ConnectorState::Connecting {
                return Err(Error::NotConnecting);
            }
            c.error = Some(Error::UserAbort);
            c.state = ConnectorState::Disconnected;
            c.resolving = false;
            (c.conn.take(), c.attempt)
        };
        if let Some(conn_id) = pending_conn {
            self.drop_conn(conn_id);
        }
        self.add_callback(move |reactor| reactor.connector_failed_if(id, attempt));
        Ok(())
    }

    /// Record `reason` and fail the attempt on the next turn, after
    /// `started_connecting` has been delivered.
    fn fail_attempt_later(&mut self, id: ConnectorId, reason: Error) {
        let attempt = {
            let Some(c) = self.connectors.get_mut(&id) else { return };
            c.error = Some(reason);
            c.attempt
        };
        self.add_callback(move |reactor| reactor.connector_failed_if(id, attempt));
    }

    fn connector_failed_if(&mut self, id: ConnectorId, attempt: u64) {
        let current = self.connectors.get(&id).map(|c| c.attempt);
        if current == Some(attempt) {
            self.connector_failed(id);
        }
    }

    /// The attempt is over without a connection. Notify the factory; stop
    /// it unless the callback started a new attempt.
    pub(crate) fn connector_failed(&mut self, id: ConnectorId) {
        let (pending_conn, reason) = {
            let Some(c) = self.connectors.get_mut(&id) else { return };
            if let Some(call) = c.timeout_call.take() {
                if !call.cancelled() {
                    let _ = call.cancel();
                }
            }
            c.resolving = false;
            c.state = ConnectorState::Disconnected;
            (c.conn.take(), c.error.clone().unwrap_or(Error::ConnectionDone))
        };
        if let Some(conn_id) = pending_conn {
            self.drop_conn(conn_id);
        }
        self.with_client_factory(id, move |factory, reactor| {
            factory.client_connection_failed(reactor, id, reason);
        });
        self.maybe_stop_client_factory(id);
    }

    /// An established client connection went away.
    pub(crate) fn connector_lost(&mut self, id: ConnectorId, reason: Error) {
        {
            let Some(c) = self.connectors.get_mut(&id) else { return };
            c.error = Some(reason.clone());
            c.state = ConnectorState::Disconnected;
            c.conn = None;
        }
        self.with_client_factory(id, move |factory, reactor| {
            factory.client_connection_lost(reactor, id, reason);
        });
        self.maybe_stop_client_factory(id);
    }

    fn with_client_factory<F>(&mut self, id: ConnectorId, f: F)
    where
        F: FnOnce(&mut Box<dyn ClientFactory>, &mut Reactor),
    {
        let Some(mut factory) = self.connectors.get_mut(&id).and_then(|c| c.factory.take())
        else {
            return;
        };
        f(&mut factory, self);
        if let Some(c) = self.connectors.get_mut(&id) {
            c.factory = Some(factory);
        }
    }

    fn maybe_stop_client_factory(&mut self, id: ConnectorId) {
        let Some(c) = self.connectors.get_mut(&id) else { return };
        if c.state == ConnectorState::Disconnected && c.factory_started {
            if let Some(factory) = c.factory.as_mut() {
                factory.do_stop();
                c.factory_started = false;
            }
        }
    }
}
