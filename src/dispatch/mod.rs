//! Request dispatch and completion

pub mod completion;
pub mod dispatcher;
pub mod message;

pub use completion::{
    CompletionMode, CompletionPool, CompletionRef, CompletionWaiter, PoolStats, Reply,
};
pub use dispatcher::{Dispatched, ReplyFuture};
pub use message::{Message, MessageKind};
