//! Contracts implemented by user code.
//!
//! A [`Protocol`] receives the byte events of a single connection; a
//! [`Factory`] mints protocols for accepted connections, a
//! [`ClientFactory`] additionally observes the lifecycle of the connector
//! that initiated them. All callbacks run on the reactor thread and
//! receive the reactor so they can drive connections, schedule timers or
//! start new attempts; connections are referred to by their opaque id.

use crate::address::Address;
use crate::error::Error;
use crate::reactor::{ConnectionId, ConnectorId, Reactor};

/// Byte-event handler bound to one connection.
pub trait Protocol {
    /// The connection is up. Called once, before any data event. For TLS
    /// connections this fires while the handshake is still in progress;
    /// writes issued here are queued until the session is established.
    fn make_connection(&mut self, reactor: &mut Reactor, conn: ConnectionId);

    /// Bytes arrived, in arrival order, without re-framing. The slice is
    /// only valid for the duration of the call; consume or copy it out.
    fn data_received(&mut self, reactor: &mut Reactor, data: &[u8]);

    /// The connection is gone. Called exactly once, after the socket is
    /// closed; `reason` identifies the cause.
    fn connection_lost(&mut self, reactor: &mut Reactor, reason: Error);
}

/// Producer of protocols for a listener or connector.
pub trait Factory {
    /// Called before the first accept, and again after a restart.
    fn do_start(&mut self) {}

    /// Called after the last close.
    fn do_stop(&mut self) {}

    /// Mint a protocol for a peer. Returning `None` rejects the
    /// connection; the socket is dropped.
    fn build_protocol(&mut self, peer: &Address) -> Option<Box<dyn Protocol>>;
}

/// A factory driving outgoing connections.
pub trait ClientFactory: Factory {
    /// A connect attempt was started.
    fn started_connecting(&mut self, _reactor: &mut Reactor, _connector: ConnectorId) {}

    /// The attempt failed before a connection was established.
    fn client_connection_failed(
        &mut self,
        _reactor: &mut Reactor,
        _connector: ConnectorId,
        _reason: Error,
    ) {
    }

    /// An established connection was lost.
    fn client_connection_lost(
        &mut self,
        _reactor: &mut Reactor,
        _connector: ConnectorId,
        _reason: Error,
    ) {
    }
}
