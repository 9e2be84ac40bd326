//! Reactor-driven stream networking.
//!
//! A single-threaded event loop hosts byte-stream connections over three
//! transports: plain TCP, TLS over TCP, and UNIX-domain sockets. User
//! code plugs in through two small contracts:
//!
//! - a [`Protocol`] receives the events of one connection
//!   (`make_connection`, `data_received`, `connection_lost`) and drives
//!   it back through the reactor (`write`, `lose_connection`,
//!   `abort_connection`);
//! - a [`Factory`] (or [`ClientFactory`] on the connecting side) mints a
//!   protocol per accepted or initiated connection.
//!
//! The [`Reactor`] owns every live listener, connector and connection;
//! handles are opaque ids, valid on the reactor thread only. Scheduling
//! primitives ([`Reactor::call_later`], [`Reactor::add_callback`]) are
//! part of the same loop, so a protocol can arm timers without leaving
//! its thread.
//!
//! ```no_run
//! use gyre::{Address, Error, Factory, Protocol, Reactor, ConnectionId};
//!
//! struct Echo(Option<ConnectionId>);
//!
//! impl Protocol for Echo {
//!     fn make_connection(&mut self, _reactor: &mut Reactor, conn: ConnectionId) {
//!         self.0 = Some(conn);
//!     }
//!     fn data_received(&mut self, reactor: &mut Reactor, data: &[u8]) {
//!         if let Some(conn) = self.0 {
//!             reactor.write(conn, data);
//!         }
//!     }
//!     fn connection_lost(&mut self, _reactor: &mut Reactor, _reason: Error) {}
//! }
//!
//! struct EchoFactory;
//!
//! impl Factory for EchoFactory {
//!     fn build_protocol(&mut self, _peer: &Address) -> Option<Box<dyn Protocol>> {
//!         Some(Box::new(Echo(None)))
//!     }
//! }
//!
//! let mut reactor = Reactor::new().unwrap();
//! reactor.listen_tcp("127.0.0.1", "0", Box::new(EchoFactory)).unwrap();
//! reactor.run().unwrap();
//! ```

pub mod address;
pub mod buffer;
pub mod error;
pub mod protocol;
pub mod reactor;
pub mod timer;
pub mod tls;

mod connection;
mod connector;
mod listener;
mod tcp;
mod unix;

pub use address::Address;
pub use buffer::MessageBuffer;
pub use error::Error;
pub use protocol::{ClientFactory, Factory, Protocol};
pub use reactor::{ConnectionId, ConnectorId, ListenerId, Reactor};
pub use timer::DelayedCall;
pub use tls::{TlsContext, TlsOptions, VerifyMode};
