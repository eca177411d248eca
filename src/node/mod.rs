//! Per-server connection state

pub mod handle;
pub mod registry;

pub use handle::{
    ConnectionState, LinkFailure, NodeCounters, NodeHandle, NodeRole, NodeStatus, ServerKind,
    UnselectableReason,
};
pub use registry::NodeRegistry;
