//! Result processors
//!
//! A processor turns the raw reply into the caller's type. It runs on the
//! consuming side, when the caller unwraps the result, so a slow or failing
//! conversion never stalls the reader thread.

use crate::utils::{MuxError, ProtocolError, RespValue};

/// Converts a raw reply into a typed result
pub trait ResultProcessor: Send + Sync + 'static {
    type Output: Send + 'static;

    fn process(&self, reply: RespValue) -> Result<Self::Output, MuxError>;
}

/// Error replies become [`MuxError::Server`]
fn reject_error(reply: RespValue) -> Result<RespValue, MuxError> {
    match reply {
        RespValue::Error(msg) => Err(MuxError::Server(msg)),
        other => Ok(other),
    }
}

/// Returns the reply as-is; error replies still become [`MuxError::Server`]
#[derive(Debug, Clone, Copy, Default)]
pub struct Raw;

impl ResultProcessor for Raw {
    type Output = RespValue;

    fn process(&self, reply: RespValue) -> Result<RespValue, MuxError> {
        reject_error(reply)
    }
}

/// String or nil
#[derive(Debug, Clone, Copy, Default)]
pub struct StringReply;

impl ResultProcessor for StringReply {
    type Output = Option<String>;

    fn process(&self, reply: RespValue) -> Result<Option<String>, MuxError> {
        match reject_error(reply)? {
            RespValue::Null => Ok(None),
            RespValue::SimpleString(s) => Ok(Some(s)),
            RespValue::BulkString(b) => Ok(Some(String::from_utf8_lossy(&b).into_owned())),
            RespValue::Integer(i) => Ok(Some(i.to_string())),
            other => Err(ProtocolError::unexpected("string", other).into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerReply;

impl ResultProcessor for IntegerReply {
    type Output = i64;

    fn process(&self, reply: RespValue) -> Result<i64, MuxError> {
        match reject_error(reply)? {
            RespValue::Integer(i) => Ok(i),
            RespValue::BulkString(ref b) => std::str::from_utf8(b)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtocolError::Parse("not an integer".to_string()).into()),
            other => Err(ProtocolError::unexpected("integer", other).into()),
        }
    }
}

/// Expects `+OK`
#[derive(Debug, Clone, Copy, Default)]
pub struct OkReply;

impl ResultProcessor for OkReply {
    type Output = ();

    fn process(&self, reply: RespValue) -> Result<(), MuxError> {
        match reject_error(reply)? {
            RespValue::SimpleString(ref s) if s == "OK" => Ok(()),
            other => Err(ProtocolError::unexpected("OK", other).into()),
        }
    }
}
