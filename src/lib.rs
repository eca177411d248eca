//! valkey-mux library
//!
//! Connection multiplexer for Valkey/Redis deployments: keeps one connection
//! per server, discovers standalone, replicated, proxied and clustered
//! topologies, routes each request to the right node and completes its
//! result back to the caller.

pub mod client;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod heartbeat;
pub mod multiplexer;
pub mod node;
pub mod topology;
pub mod utils;

#[cfg(test)]
mod testing;

pub use client::{
    Connector, IntegerReply, OkReply, Raw, Request, ResultProcessor, StringReply, TcpConnector,
};
pub use config::{MuxConfig, ReadPreference, ServerAddress};
pub use dispatch::{CompletionMode, Dispatched, ReplyFuture};
pub use events::{ChangeSource, MuxEvent};
pub use multiplexer::{Multiplexer, MuxStatus};
pub use topology::{DeploymentKind, TopologySnapshot};
pub use utils::{MuxError, RespValue, Result};
