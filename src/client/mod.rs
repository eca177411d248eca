//! Client connection layer

pub mod processor;
pub mod request;
pub mod tcp;
pub mod transport;

pub use processor::{IntegerReply, OkReply, Raw, ResultProcessor, StringReply};
pub use request::Request;
pub use tcp::{TcpConnector, TcpTransport};
pub use transport::{ConnectTarget, Connector, Transport, TransportEvents};
