//! Utility modules

pub mod clock;
pub mod error;
pub mod resp;

pub use error::{
    ClusterError, ConnectionError, ConnectionFailureKind, MuxError, ProtocolError, Result,
    TimeoutDetails,
};
pub use resp::{RespDecoder, RespEncoder, RespValue};
