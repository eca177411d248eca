//! Error types for valkey-mux

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Top-level error surfaced to callers of the multiplexer
///
/// Every variant is `Clone` so a single failure (for example a dropped
/// socket) can be delivered to each request that was in flight on it.
#[derive(Error, Debug, Clone)]
pub enum MuxError {
    #[error("No connection is available to service this operation: {0}")]
    NoRoute(String),

    #[error("Multi-key operations must involve a single slot; keys use slots {first} and {second}")]
    MultiSlot { first: u16, second: u16 },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("{0}")]
    Timeout(Box<TimeoutDetails>),

    #[error("This operation is not available unless admin mode is enabled: {0}")]
    AdminNotPermitted(String),

    #[error("This operation has been disabled in the command-map: {0}")]
    CommandDisabled(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("The multiplexer has been closed")]
    Closed,
}

impl MuxError {
    /// Whether this error means the caller's wait expired
    pub fn is_timeout(&self) -> bool {
        matches!(self, MuxError::Timeout(_))
    }

    /// Whether the request never reached a server
    pub fn is_no_route(&self) -> bool {
        matches!(self, MuxError::NoRoute(_))
    }
}

/// Diagnostics attached to a timed-out request
///
/// Enough context to tell "server is slow" (deep in-flight queue, recent
/// reads) from "server is gone" (no reads for a long time).
#[derive(Debug, Clone)]
pub struct TimeoutDetails {
    pub command: String,
    pub node: String,
    pub timeout_ms: u64,
    pub elapsed_ms: u64,
    /// Requests waiting to be written to the node
    pub outbound: usize,
    /// Requests written and awaiting a reply
    pub in_flight: usize,
    pub state: String,
    pub last_read_ms_ago: Option<u64>,
    /// The request was still unsent and has been dropped from the outbound queue
    pub send_canceled: bool,
}

impl fmt::Display for TimeoutDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timeout performing {} ({}ms), node: {}, elapsed: {}ms, outbound: {}, in-flight: {}, state: {}",
            self.command,
            self.timeout_ms,
            self.node,
            self.elapsed_ms,
            self.outbound,
            self.in_flight,
            self.state
        )?;
        if let Some(ms) = self.last_read_ms_ago {
            write!(f, ", last-read: {}ms ago", ms)?;
        }
        if self.send_canceled {
            write!(f, ", send canceled")?;
        }
        Ok(())
    }
}

/// How a connection failed, as reported in connection-failed events
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionFailureKind {
    UnableToConnect,
    AuthenticationFailure,
    SocketFailure,
    /// The node stopped answering within the response timeout
    NoResponse,
    /// Closed locally (shutdown)
    Closed,
}

impl fmt::Display for ConnectionFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionFailureKind::UnableToConnect => "unable-to-connect",
            ConnectionFailureKind::AuthenticationFailure => "authentication-failure",
            ConnectionFailureKind::SocketFailure => "socket-failure",
            ConnectionFailureKind::NoResponse => "no-response",
            ConnectionFailureKind::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Connection-related errors
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Failed to connect to {address}: {source}")]
    ConnectFailed {
        address: String,
        source: Arc<io::Error>,
    },

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Socket failure on {address}: {reason}")]
    SocketFailure { address: String, reason: String },

    #[error("No response from {address} within {elapsed_ms}ms")]
    NoResponse { address: String, elapsed_ms: u64 },

    #[error("Connection closed unexpectedly")]
    Closed,
}

impl ConnectionError {
    pub fn connect_failed(address: impl Into<String>, source: io::Error) -> Self {
        ConnectionError::ConnectFailed {
            address: address.into(),
            source: Arc::new(source),
        }
    }

    pub fn kind(&self) -> ConnectionFailureKind {
        match self {
            ConnectionError::ConnectFailed { .. } => ConnectionFailureKind::UnableToConnect,
            ConnectionError::AuthFailed(_) => ConnectionFailureKind::AuthenticationFailure,
            ConnectionError::SocketFailure { .. } => ConnectionFailureKind::SocketFailure,
            ConnectionError::NoResponse { .. } => ConnectionFailureKind::NoResponse,
            ConnectionError::Closed => ConnectionFailureKind::Closed,
        }
    }
}

/// RESP protocol errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl ProtocolError {
    pub fn unexpected(expected: &str, actual: impl fmt::Debug) -> Self {
        ProtocolError::UnexpectedResponse {
            expected: expected.to_string(),
            actual: format!("{:?}", actual),
        }
    }
}

/// Cluster-related errors
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("Failed to parse CLUSTER NODES response: {0}")]
    ParseFailed(String),

    #[error("No primary nodes found in cluster")]
    NoPrimaries,

    #[error("Slot {0} has no assigned node")]
    UnassignedSlot(u16),

    #[error("Slot ranges overlap at slot {0}")]
    OverlappingRanges(u16),
}

pub type Result<T> = std::result::Result<T, MuxError>;
