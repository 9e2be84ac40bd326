//! Poll-based reactor. A single-threaded event loop driving listeners,
//! connectors and stream connections.
//!
//! The reactor owns every live object in registries keyed by opaque ids;
//! user code (protocols, factories, timer callbacks) is handed `&mut
//! Reactor` and refers to connections by id. Closing a socket from inside
//! a completion path is deferred to the next turn through the callback
//! queue, so no handler ever pulls the rug out from under itself.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, trace};

use crate::connection::{coalesce, Connection, Phase, Stream, READ_CHUNK};
use crate::connector::{Connector, Resolved};
use crate::error::Error;
use crate::listener::Listener;
use crate::protocol::Protocol;
use crate::timer::{DelayedCall, TimerQueue};
use crate::tls;

/// Maximum amount of time to wait for i/o when no timer is due sooner.
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Opaque handle to a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

/// Opaque handle to a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Opaque handle to a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectorId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceKey {
    Conn(ConnectionId),
    Listener(ListenerId),
    Waker,
}

type Callback = Box<dyn FnOnce(&mut Reactor)>;

enum CloseAction {
    /// Keep flushing; the drain path closes when the queue empties.
    Drain,
    /// Begin the close_notify exchange.
    TlsShutdown,
    /// Nothing in flight; close on the next turn.
    DeferredClose,
}

/// The event loop.
pub struct Reactor {
    pub(crate) sources: popol::Sources<SourceKey>,
    pub(crate) waker: Arc<popol::Waker>,
    pub(crate) conns: HashMap<ConnectionId, Connection>,
    pub(crate) listeners: HashMap<ListenerId, Listener>,
    pub(crate) connectors: HashMap<ConnectorId, Connector>,
    timers: TimerQueue,
    pending: VecDeque<Callback>,
    /// Connections closed while their protocol was out being dispatched;
    /// the dispatcher owes them their `connection_lost`.
    orphaned: HashMap<ConnectionId, (Error, Option<ConnectorId>)>,
    pub(crate) resolved_tx: flume::Sender<Resolved>,
    resolved_rx: flume::Receiver<Resolved>,
    next_id: u64,
    running: bool,
    stop_requested: bool,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let mut sources = popol::Sources::new();
        let waker = Arc::new(popol::Waker::new(&mut sources, SourceKey::Waker)?);
        let (resolved_tx, resolved_rx) = flume::unbounded();

        Ok(Self {
            sources,
            waker,
            conns: HashMap::new(),
            listeners: HashMap::new(),
            connectors: HashMap::new(),
            timers: TimerQueue::new(),
            pending: VecDeque::new(),
            orphaned: HashMap::new(),
            resolved_tx,
            resolved_rx,
            next_id: 0,
            running: false,
            stop_requested: false,
        })
    }

    /// Run the event loop until [`stop`](Self::stop) is called.
    pub fn run(&mut self) -> Result<(), Error> {
        if self.running {
            return Err(Error::ReactorAlreadyRunning);
        }
        self.running = true;
        self.stop_requested = false;

        // I/O readiness events populated by `wait_timeout`.
        let mut events = Vec::with_capacity(32);

        while !self.stop_requested {
            self.drain_pending();
            self.drain_resolved();
            self.fire_timers();
            if self.stop_requested {
                break;
            }

            let timeout = self.poll_timeout();
            trace!(
                target: "reactor",
                "Polling {} source(s) and {} timer(s), waking up in {:?}",
                self.sources.len(),
                self.timers.len(),
                timeout,
            );
            match self.sources.wait_timeout(&mut events, timeout) {
                Ok(_) => {
                    for event in events.drain(..) {
                        self.dispatch(event);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.running = false;
                    return Err(e.into());
                }
            }
            self.fire_timers();
        }
        self.running = false;
        Ok(())
    }

    /// Ask the running loop to return.
    pub fn stop(&mut self) -> Result<(), Error> {
        if !self.running {
            return Err(Error::ReactorNotRunning);
        }
        self.stop_requested = true;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Enqueue `callback` to run on the next turn of the loop.
    pub fn add_callback<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut Reactor) + 'static,
    {
        self.pending.push_back(Box::new(callback));
    }

    /// Schedule `callback` to run once after `delay` seconds.
    ///
    /// The callback fires no earlier than the delay; cancelling the
    /// returned handle guarantees it never fires.
    pub fn call_later<F>(&mut self, delay: f64, callback: F) -> DelayedCall
    where
        F: FnOnce(&mut Reactor) + 'static,
    {
        let delay = if delay > 0.0 { Duration::from_secs_f64(delay) } else { Duration::ZERO };
        self.timers.register(Instant::now() + delay, Box::new(callback))
    }

    pub(crate) fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn next_conn_id(&mut self) -> ConnectionId {
        ConnectionId(self.alloc_id())
    }

    pub(crate) fn next_listener_id(&mut self) -> ListenerId {
        ListenerId(self.alloc_id())
    }

    pub(crate) fn next_connector_id(&mut self) -> ConnectorId {
        ConnectorId(self.alloc_id())
    }

    fn drain_pending(&mut self) {
        while let Some(callback) = self.pending.pop_front() {
            callback(self);
            if self.stop_requested {
                break;
            }
        }
    }

    fn drain_resolved(&mut self) {
        while let Ok(msg) = self.resolved_rx.try_recv() {
            self.handle_resolved(msg);
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(callback) = self.timers.pop_due(now) {
            callback(self);
            if self.stop_requested {
                break;
            }
        }
    }

    fn poll_timeout(&mut self) -> Duration {
        match self.timers.next_wakeup(Instant::now()) {
            Some(until) => until.min(WAIT_TIMEOUT),
            None => WAIT_TIMEOUT,
        }
    }

    fn dispatch(&mut self, event: popol::Event<SourceKey>) {
        match event.key {
            SourceKey::Waker => {
                trace!(target: "reactor", "Woken up");
                popol::Waker::reset(event.source).ok();
                self.drain_resolved();
            }
            SourceKey::Listener(id) => {
                if event.is_invalid() {
                    self.sources.unregister(&event.key);
                    return;
                }
                if event.is_readable() {
                    self.accept_ready(id);
                }
            }
            SourceKey::Conn(id) => {
                if event.is_invalid() {
                    // Nb. This shouldn't happen. It means the source wasn't
                    // properly unregistered, or there is a duplicate source.
                    error!(target: "reactor", "{:?}: Socket is invalid, removing", id);
                    self.sources.unregister(&event.key);
                    return;
                }
                let connecting = self
                    .conns
                    .get(&id)
                    .map(|c| c.phase == Phase::Connecting)
                    .unwrap_or(false);
                if connecting {
                    // A connecting socket signals completion (or failure)
                    // through writability.
                    if event.is_writable() || event.is_error() || event.is_hangup() {
                        self.finish_connect(id);
                    }
                    return;
                }
                if event.is_writable() {
                    self.conn_writable(id);
                }
                if event.is_readable() {
                    self.conn_readable(id);
                }
            }
        }
    }

    fn conn_readable(&mut self, id: ConnectionId) {
        let (phase, is_tls) = match self.conns.get(&id) {
            Some(conn) => (conn.phase, conn.stream.is_tls()),
            None => return,
        };
        if matches!(phase, Phase::Connecting | Phase::Closed) {
            return;
        }
        if is_tls {
            tls::conn_readable(self, id);
        } else {
            self.stream_read(id);
        }
    }

    fn conn_writable(&mut self, id: ConnectionId) {
        let (phase, is_tls) = match self.conns.get(&id) {
            Some(conn) => (conn.phase, conn.stream.is_tls()),
            None => return,
        };
        if is_tls {
            tls::conn_writable(self, id);
            return;
        }
        match phase {
            Phase::Open | Phase::Draining => self.flush_writes(id),
            _ => {}
        }
    }

    /// One read off a plain stream.
    fn stream_read(&mut self, id: ConnectionId) {
        enum Outcome {
            Eof,
            Delivered,
            Blocked,
            Failed(io::Error),
        }

        let outcome = {
            let Some(conn) = self.conns.get_mut(&id) else { return };
            conn.read_buf.normalize();
            conn.read_buf.ensure_free_space(READ_CHUNK);
            match conn.stream.io_read(conn.read_buf.write_slice()) {
                Ok(0) => Outcome::Eof,
                Ok(n) => {
                    conn.read_buf.write_completed(n);
                    if matches!(conn.phase, Phase::Draining) {
                        // Close already requested; swallow the bytes.
                        let active = conn.read_buf.active_size();
                        conn.read_buf.read_completed(active);
                        Outcome::Blocked
                    } else {
                        Outcome::Delivered
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    Outcome::Blocked
                }
                Err(e) => Outcome::Failed(e),
            }
        };

        match outcome {
            Outcome::Eof => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.error.get_or_insert(Error::ConnectionDone);
                }
                self.close_connection(id);
            }
            Outcome::Delivered => self.deliver_data(id),
            Outcome::Blocked => {}
            Outcome::Failed(e) => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    error!(target: "reactor", "{}: Read error {:?}: {}", conn.peer, e.kind(), e);
                    conn.error.get_or_insert(Error::from(e));
                }
                self.close_connection(id);
            }
        }
    }

    /// Hand the read buffer's unread bytes to the protocol, then reclaim
    /// the buffer. The protocol must consume or copy during the call.
    pub(crate) fn deliver_data(&mut self, id: ConnectionId) {
        let (mut protocol, buf) = {
            let Some(conn) = self.conns.get_mut(&id) else { return };
            if conn.read_buf.is_empty() {
                return;
            }
            let Some(protocol) = conn.protocol.take() else { return };
            (protocol, std::mem::take(&mut conn.read_buf))
        };

        protocol.data_received(self, buf.read_slice());

        if let Some(conn) = self.conns.get_mut(&id) {
            let mut buf = buf;
            let active = buf.active_size();
            buf.read_completed(active);
            conn.read_buf = buf;
            conn.protocol = Some(protocol);
        } else {
            self.deliver_orphaned_lost(id, protocol);
        }
    }

    pub(crate) fn dispatch_make_connection(&mut self, id: ConnectionId) {
        let mut protocol = {
            let Some(conn) = self.conns.get_mut(&id) else { return };
            match conn.protocol.take() {
                Some(protocol) => {
                    conn.greeted = true;
                    protocol
                }
                None => return,
            }
        };
        protocol.make_connection(self, id);
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.protocol = Some(protocol);
        } else {
            self.deliver_orphaned_lost(id, protocol);
        }
    }

    /// The connection closed while its protocol was out on the stack;
    /// settle the owed `connection_lost` now that the callback returned.
    fn deliver_orphaned_lost(&mut self, id: ConnectionId, mut protocol: Box<dyn Protocol>) {
        let Some((reason, connector)) = self.orphaned.remove(&id) else { return };
        protocol.connection_lost(self, reason.clone());
        if let Some(connector) = connector {
            self.connector_lost(connector, reason);
        }
    }

    /// Flush the write queue of a plain stream connection.
    fn flush_writes(&mut self, id: ConnectionId) {
        enum Outcome {
            Drained,
            Blocked,
            Failed(io::Error),
        }

        let outcome = {
            let Some(conn) = self.conns.get_mut(&id) else { return };
            if !matches!(conn.phase, Phase::Open | Phase::Draining) {
                return;
            }
            coalesce(&mut conn.write_queue);
            loop {
                let Some(head) = conn.write_queue.front_mut() else {
                    break Outcome::Drained;
                };
                match conn.stream.io_write(head.read_slice()) {
                    Ok(n) => {
                        head.read_completed(n);
                        if head.active_size() == 0 {
                            conn.write_queue.pop_front();
                        } else {
                            break Outcome::Blocked;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Outcome::Blocked,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break Outcome::Failed(e),
                }
            }
        };

        match outcome {
            Outcome::Drained => {
                let draining = {
                    let Some(conn) = self.conns.get_mut(&id) else { return };
                    conn.writing = false;
                    conn.phase == Phase::Draining
                };
                self.set_write_interest(id, false);
                if draining {
                    self.close_connection(id);
                }
            }
            Outcome::Blocked => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.writing = true;
                }
                self.set_write_interest(id, true);
            }
            Outcome::Failed(e) => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    error!(target: "reactor", "{}: Write error {:?}: {}", conn.peer, e.kind(), e);
                    conn.error.get_or_insert(Error::from(e));
                }
                self.close_connection(id);
            }
        }
    }

    /// Queue bytes for transmission on `conn`, in submission order.
    ///
    /// Writes on a closing or closed connection are silently dropped.
    /// During a TLS handshake the bytes are queued and flush once the
    /// session is established.
    pub fn write(&mut self, conn: ConnectionId, data: &[u8]) {
        let start = {
            let Some(c) = self.conns.get_mut(&conn) else { return };
            if !matches!(c.phase, Phase::Open | Phase::Handshaking) {
                return;
            }
            if data.is_empty() {
                return;
            }
            c.write_queue.push_back(data.into());
            c.phase == Phase::Open
        };
        if start {
            self.start_writing(conn);
        }
    }

    pub(crate) fn start_writing(&mut self, id: ConnectionId) {
        let arm = {
            let Some(conn) = self.conns.get_mut(&id) else { return };
            if conn.writing {
                false
            } else {
                conn.writing = true;
                true
            }
        };
        if arm {
            self.set_write_interest(id, true);
        }
    }

    /// Close gracefully: flush everything queued, then close. The peer
    /// sees the pending bytes before EOF.
    pub fn lose_connection(&mut self, conn: ConnectionId) {
        let action = {
            let Some(c) = self.conns.get_mut(&conn) else { return };
            match c.phase {
                Phase::Open => {
                    c.error.get_or_insert(Error::ConnectionDone);
                    if c.stream.is_tls() {
                        if !c.writing && c.write_queue.is_empty() {
                            CloseAction::TlsShutdown
                        } else {
                            // The flush path shuts down once drained.
                            c.phase = Phase::Draining;
                            CloseAction::Drain
                        }
                    } else {
                        c.phase = Phase::Draining;
                        if c.writing {
                            CloseAction::Drain
                        } else {
                            CloseAction::DeferredClose
                        }
                    }
                }
                Phase::Handshaking => {
                    c.error.get_or_insert(Error::ConnectionDone);
                    c.phase = Phase::Draining;
                    CloseAction::DeferredClose
                }
                _ => return,
            }
        };
        self.apply_close_action(conn, action);
    }

    /// Close immediately: cancel outstanding I/O and discard queued
    /// bytes. For an established TLS session a close_notify still goes
    /// out, best effort.
    pub fn abort_connection(&mut self, conn: ConnectionId) {
        let action = {
            let Some(c) = self.conns.get_mut(&conn) else { return };
            match c.phase {
                Phase::Open => {
                    c.error = Some(Error::ConnectionAbort);
                    c.write_queue.clear();
                    if c.stream.is_tls() {
                        CloseAction::TlsShutdown
                    } else {
                        c.phase = Phase::Draining;
                        CloseAction::DeferredClose
                    }
                }
                Phase::Handshaking => {
                    c.error = Some(Error::ConnectionAbort);
                    c.write_queue.clear();
                    c.phase = Phase::Draining;
                    CloseAction::DeferredClose
                }
                _ => return,
            }
        };
        self.apply_close_action(conn, action);
    }

    fn apply_close_action(&mut self, conn: ConnectionId, action: CloseAction) {
        match action {
            CloseAction::Drain => {}
            CloseAction::TlsShutdown => tls::start_shutdown(self, conn),
            CloseAction::DeferredClose => self.schedule_close(conn),
        }
    }

    /// Closing from inside a completion path is deferred to the next turn.
    pub(crate) fn schedule_close(&mut self, id: ConnectionId) {
        self.add_callback(move |reactor| {
            if reactor.conns.contains_key(&id) {
                reactor.close_connection(id);
            }
        });
    }

    /// Tear the connection down: unregister, close the socket, then
    /// deliver `connection_lost` exactly once.
    pub(crate) fn close_connection(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.conns.remove(&id) else { return };
        self.sources.unregister(&SourceKey::Conn(id));
        conn.phase = Phase::Closed;

        let reason = conn.error.take().unwrap_or(Error::ConnectionDone);
        let protocol = conn.protocol.take();
        let connector = conn.connector.take();
        let greeted = conn.greeted;
        // The socket closes before the lifecycle callback fires.
        drop(conn);
        trace!(target: "reactor", "{:?}: Closed ({})", id, reason);

        match protocol {
            Some(mut protocol) => {
                protocol.connection_lost(self, reason.clone());
                if let Some(connector) = connector {
                    self.connector_lost(connector, reason);
                }
            }
            // The protocol is out being dispatched right now; the
            // dispatcher settles `connection_lost` when it returns.
            None if greeted => {
                self.orphaned.insert(id, (reason, connector));
            }
            None => {}
        }
    }

    /// Remove a connection that was never handed to a protocol.
    pub(crate) fn drop_conn(&mut self, id: ConnectionId) {
        if self.conns.remove(&id).is_some() {
            self.sources.unregister(&SourceKey::Conn(id));
        }
    }

    pub(crate) fn set_write_interest(&mut self, id: ConnectionId, on: bool) {
        if let Some(source) = self.sources.get_mut(&SourceKey::Conn(id)) {
            if on {
                source.set(popol::interest::WRITE);
            } else {
                source.unset(popol::interest::WRITE);
            }
        }
    }

    /// TCP_NODELAY state; always true for UNIX connections.
    pub fn no_delay(&self, conn: ConnectionId) -> Option<bool> {
        let c = self.conns.get(&conn)?;
        match &c.stream {
            Stream::Tcp(s) => socket2::SockRef::from(s).nodelay().ok(),
            Stream::Tls(t) => socket2::SockRef::from(&t.sock).nodelay().ok(),
            Stream::Unix(_) => Some(true),
        }
    }

    /// Toggle TCP_NODELAY. Ignored for UNIX connections.
    pub fn set_no_delay(&mut self, conn: ConnectionId, enabled: bool) -> Result<(), Error> {
        let Some(c) = self.conns.get(&conn) else { return Ok(()) };
        match &c.stream {
            Stream::Tcp(s) => socket2::SockRef::from(s).set_nodelay(enabled)?,
            Stream::Tls(t) => socket2::SockRef::from(&t.sock).set_nodelay(enabled)?,
            Stream::Unix(_) => {}
        }
        Ok(())
    }

    /// SO_KEEPALIVE state.
    pub fn keep_alive(&self, conn: ConnectionId) -> Option<bool> {
        let c = self.conns.get(&conn)?;
        match &c.stream {
            Stream::Tcp(s) => socket2::SockRef::from(s).keepalive().ok(),
            Stream::Tls(t) => socket2::SockRef::from(&t.sock).keepalive().ok(),
            Stream::Unix(s) => socket2::SockRef::from(s).keepalive().ok(),
        }
    }

    /// Toggle SO_KEEPALIVE.
    pub fn set_keep_alive(&mut self, conn: ConnectionId, enabled: bool) -> Result<(), Error> {
        let Some(c) = self.conns.get(&conn) else { return Ok(()) };
        match &c.stream {
            Stream::Tcp(s) => socket2::SockRef::from(s).set_keepalive(enabled)?,
            Stream::Tls(t) => socket2::SockRef::from(&t.sock).set_keepalive(enabled)?,
            Stream::Unix(s) => socket2::SockRef::from(s).set_keepalive(enabled)?,
        }
        Ok(())
    }

    /// The connection's local address: host and port for IP transports, a
    /// filesystem path (port 0) for UNIX.
    pub fn local_address(&self, conn: ConnectionId) -> Option<crate::Address> {
        self.conns.get(&conn).map(|c| c.local.clone())
    }

    /// The peer's address.
    pub fn remote_address(&self, conn: ConnectionId) -> Option<crate::Address> {
        self.conns.get(&conn).map(|c| c.peer.clone())
    }
}
