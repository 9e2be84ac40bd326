#![allow(dead_code)]
//! Shared plumbing for the integration tests: recording protocols and
//! factories, a watchdog, and a deterministically slow endpoint.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

use gyre::{
    Address, ClientFactory, ConnectionId, ConnectorId, Error, Factory, Protocol, Reactor,
};

pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// What one protocol observed.
#[derive(Default)]
pub struct Events {
    pub connected: usize,
    pub data: Vec<u8>,
    pub lost: Vec<Error>,
}

impl Events {
    pub fn lost_once(&self) -> bool {
        self.lost.len() == 1
    }

    pub fn lost_once_with_done(&self) -> bool {
        self.lost_once() && self.lost[0].is_done()
    }
}

pub type Shared = Rc<RefCell<Events>>;

pub fn shared() -> Shared {
    Rc::new(RefCell::new(Events::default()))
}

type ConnectHook = Box<dyn FnMut(&mut Reactor, ConnectionId)>;
type DataHook = Box<dyn FnMut(&mut Reactor, ConnectionId, &[u8])>;
type LostHook = Box<dyn FnMut(&mut Reactor)>;

/// A protocol that records everything it sees and runs optional scripted
/// hooks.
pub struct Recorder {
    events: Shared,
    conn: Option<ConnectionId>,
    on_connect: Option<ConnectHook>,
    on_data: Option<DataHook>,
    on_lost: Option<LostHook>,
}

impl Recorder {
    pub fn new(events: Shared) -> Self {
        Self { events, conn: None, on_connect: None, on_data: None, on_lost: None }
    }

    pub fn on_connect(mut self, hook: impl FnMut(&mut Reactor, ConnectionId) + 'static) -> Self {
        self.on_connect = Some(Box::new(hook));
        self
    }

    pub fn on_data(
        mut self,
        hook: impl FnMut(&mut Reactor, ConnectionId, &[u8]) + 'static,
    ) -> Self {
        self.on_data = Some(Box::new(hook));
        self
    }

    pub fn on_lost(mut self, hook: impl FnMut(&mut Reactor) + 'static) -> Self {
        self.on_lost = Some(Box::new(hook));
        self
    }

    pub fn boxed(self) -> Box<dyn Protocol> {
        Box::new(self)
    }
}

impl Protocol for Recorder {
    fn make_connection(&mut self, reactor: &mut Reactor, conn: ConnectionId) {
        self.conn = Some(conn);
        self.events.borrow_mut().connected += 1;
        if let Some(hook) = self.on_connect.as_mut() {
            hook(reactor, conn);
        }
    }

    fn data_received(&mut self, reactor: &mut Reactor, data: &[u8]) {
        self.events.borrow_mut().data.extend_from_slice(data);
        if let Some(hook) = self.on_data.as_mut() {
            let conn = self.conn.expect("data before make_connection");
            hook(reactor, conn, data);
        }
    }

    fn connection_lost(&mut self, reactor: &mut Reactor, reason: Error) {
        self.events.borrow_mut().lost.push(reason);
        if let Some(hook) = self.on_lost.as_mut() {
            hook(reactor);
        }
    }
}

/// An echoing protocol recording into `events`.
pub fn echo_protocol(events: Shared) -> Box<dyn Protocol> {
    Recorder::new(events)
        .on_data(|reactor, conn, data| {
            let data = data.to_vec();
            reactor.write(conn, &data);
        })
        .boxed()
}

/// What a factory observed.
#[derive(Default)]
pub struct FactoryLog {
    pub started: usize,
    pub stopped: usize,
    pub built: usize,
    pub client_started: usize,
    pub client_failed: Vec<Error>,
    pub client_lost: Vec<Error>,
}

pub type SharedLog = Rc<RefCell<FactoryLog>>;

type FailedHook = Box<dyn FnMut(&mut Reactor, ConnectorId)>;

/// A factory handing out pre-built protocols in order, recording its
/// lifecycle. Usable on both the listening and the connecting side.
pub struct TestFactory {
    protocols: VecDeque<Box<dyn Protocol>>,
    log: SharedLog,
    on_failed: Option<FailedHook>,
}

impl TestFactory {
    pub fn new(protocol: Box<dyn Protocol>) -> Self {
        Self::with_protocols(vec![protocol])
    }

    pub fn with_protocols(protocols: Vec<Box<dyn Protocol>>) -> Self {
        Self {
            protocols: protocols.into(),
            log: Rc::new(RefCell::new(FactoryLog::default())),
            on_failed: None,
        }
    }

    /// A factory whose `build_protocol` always declines.
    pub fn refusing() -> Self {
        Self::with_protocols(Vec::new())
    }

    pub fn log(&self) -> SharedLog {
        Rc::clone(&self.log)
    }

    pub fn on_failed(mut self, hook: impl FnMut(&mut Reactor, ConnectorId) + 'static) -> Self {
        self.on_failed = Some(Box::new(hook));
        self
    }
}

impl Factory for TestFactory {
    fn do_start(&mut self) {
        self.log.borrow_mut().started += 1;
    }

    fn do_stop(&mut self) {
        self.log.borrow_mut().stopped += 1;
    }

    fn build_protocol(&mut self, _peer: &Address) -> Option<Box<dyn Protocol>> {
        self.log.borrow_mut().built += 1;
        self.protocols.pop_front()
    }
}

impl ClientFactory for TestFactory {
    fn started_connecting(&mut self, _reactor: &mut Reactor, _connector: ConnectorId) {
        self.log.borrow_mut().client_started += 1;
    }

    fn client_connection_failed(
        &mut self,
        reactor: &mut Reactor,
        connector: ConnectorId,
        reason: Error,
    ) {
        self.log.borrow_mut().client_failed.push(reason);
        if let Some(hook) = self.on_failed.as_mut() {
            hook(reactor, connector);
        }
    }

    fn client_connection_lost(
        &mut self,
        _reactor: &mut Reactor,
        _connector: ConnectorId,
        reason: Error,
    ) {
        self.log.borrow_mut().client_lost.push(reason);
    }
}

/// Stop the reactor after `seconds` regardless of progress; assertions
/// after `run` catch whatever did not happen in time.
pub fn watchdog(reactor: &mut Reactor, seconds: f64) {
    reactor.call_later(seconds, |r| {
        let _ = r.stop();
    });
}

/// An endpoint that accepts nothing: a bound listener with a zero
/// backlog, saturated with pending connects, so further SYNs are dropped
/// and a connect attempt hangs until it is cancelled or times out.
pub struct SlowEndpoint {
    _listener: socket2::Socket,
    _plugs: Vec<socket2::Socket>,
    pub addr: SocketAddr,
}

pub fn slow_endpoint() -> SlowEndpoint {
    use socket2::{Domain, Socket, Type};

    let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    listener
        .bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())
        .unwrap();
    listener.listen(0).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();

    let mut plugs = Vec::new();
    for _ in 0..4 {
        let plug = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        plug.set_nonblocking(true).unwrap();
        let _ = plug.connect(&addr.into());
        plugs.push(plug);
    }
    SlowEndpoint { _listener: listener, _plugs: plugs, addr }
}
