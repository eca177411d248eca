//! Transport contract
//!
//! A transport is a duplex byte stream to one server. Outgoing bytes are
//! pushed with [`Transport::send`]; decoded replies and failures come back
//! through [`TransportEvents`] on whatever thread the transport reads on.
//! Replies must be delivered in the order the server sent them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerAddress;
use crate::utils::{ConnectionError, RespValue};

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub address: ServerAddress,
    /// Previously resolved socket address, when DNS is resolved only once
    pub resolved: Option<SocketAddr>,
    pub timeout: Duration,
    /// Longest a single write may block before the link counts as failed
    pub write_timeout: Duration,
}

/// Callbacks from a transport's read side
pub trait TransportEvents: Send + Sync {
    /// A complete reply was decoded
    fn on_reply(&self, reply: RespValue);

    /// The stream failed; no more replies will arrive
    fn on_error(&self, error: ConnectionError);
}

/// Write side of an established connection
pub trait Transport: Send + Sync {
    /// Write one or more encoded requests
    fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError>;

    /// Resolved peer address, cached when DNS is resolved only once
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Close the stream; the read side stops without raising `on_error`
    ///
    /// Must not wait for a `send` in progress: a write blocked on a full
    /// socket has to fail once the stream is closed.
    fn close(&self);
}

/// Opens transports
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        target: &ConnectTarget,
        events: Arc<dyn TransportEvents>,
    ) -> Result<Box<dyn Transport>, ConnectionError>;
}
