//! RESP2 encoder and decoder
//!
//! The engine only needs a small slice of the protocol: commands go out as
//! arrays of bulk strings, replies come back as any RESP2 value.

use std::io::{self, BufRead};

/// RESP value types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:1000\r\n)
    Integer(i64),
    /// Bulk string ($6\r\nfoobar\r\n)
    BulkString(Vec<u8>),
    /// Null bulk string or null array
    Null,
    /// Array (*2\r\n...)
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn simple(s: &str) -> Self {
        RespValue::SimpleString(s.to_string())
    }

    pub fn error(s: &str) -> Self {
        RespValue::Error(s.to_string())
    }

    /// Get as string (for simple string or bulk string)
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Short type name used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            RespValue::SimpleString(_) => "simple-string",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::BulkString(_) => "bulk-string",
            RespValue::Null => "null",
            RespValue::Array(_) => "array",
        }
    }
}

/// RESP encoder with pre-allocated buffer
pub struct RespEncoder {
    buf: Vec<u8>,
}

impl RespEncoder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Encode a command as RESP array of bulk strings
    pub fn encode_command<A: AsRef<[u8]>>(&mut self, args: &[A]) {
        // *<count>\r\n
        self.buf.push(b'*');
        self.write_int(args.len() as i64);
        self.buf.extend_from_slice(b"\r\n");

        // $<len>\r\n<data>\r\n
        for arg in args {
            let arg = arg.as_ref();
            self.buf.push(b'$');
            self.write_int(arg.len() as i64);
            self.buf.extend_from_slice(b"\r\n");
            self.buf.extend_from_slice(arg);
            self.buf.extend_from_slice(b"\r\n");
        }
    }

    /// Encode a reply value (used by in-memory test servers)
    pub fn encode_value(&mut self, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                self.buf.push(b'+');
                self.buf.extend_from_slice(s.as_bytes());
                self.buf.extend_from_slice(b"\r\n");
            }
            RespValue::Error(e) => {
                self.buf.push(b'-');
                self.buf.extend_from_slice(e.as_bytes());
                self.buf.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(i) => {
                self.buf.push(b':');
                self.write_int(*i);
                self.buf.extend_from_slice(b"\r\n");
            }
            RespValue::BulkString(data) => {
                self.buf.push(b'$');
                self.write_int(data.len() as i64);
                self.buf.extend_from_slice(b"\r\n");
                self.buf.extend_from_slice(data);
                self.buf.extend_from_slice(b"\r\n");
            }
            RespValue::Null => self.buf.extend_from_slice(b"$-1\r\n"),
            RespValue::Array(items) => {
                self.buf.push(b'*');
                self.write_int(items.len() as i64);
                self.buf.extend_from_slice(b"\r\n");
                for item in items {
                    self.encode_value(item);
                }
            }
        }
    }

    #[inline]
    fn write_int(&mut self, value: i64) {
        let mut buffer = itoa::Buffer::new();
        let s = buffer.format(value);
        self.buf.extend_from_slice(s.as_bytes());
    }
}

/// Largest bulk string accepted, matching the server's default proto-max-bulk-len
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Elements preallocated for an array before any of them is read
const ARRAY_PREALLOC: usize = 1024;

/// Blocking RESP decoder over a buffered reader
///
/// Each call reads exactly one reply, blocking until it is complete.
pub struct RespDecoder<R> {
    reader: R,
    line_buf: Vec<u8>,
}

impl<R: BufRead> RespDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_buf: Vec::with_capacity(256),
        }
    }

    /// Decode next RESP value from stream
    pub fn decode(&mut self) -> io::Result<RespValue> {
        self.line_buf.clear();
        self.reader.read_until(b'\n', &mut self.line_buf)?;

        if self.line_buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed",
            ));
        }

        let mut end = self.line_buf.len();
        while end > 0 && matches!(self.line_buf[end - 1], b'\r' | b'\n') {
            end -= 1;
        }
        if end == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Empty RESP line"));
        }

        let type_byte = self.line_buf[0];
        let content = String::from_utf8_lossy(&self.line_buf[1..end]).into_owned();

        match type_byte {
            b'+' => Ok(RespValue::SimpleString(content)),
            b'-' => Ok(RespValue::Error(content)),
            b':' => {
                let value: i64 = content
                    .parse()
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Invalid integer"))?;
                Ok(RespValue::Integer(value))
            }
            b'$' => {
                let len: i64 = content.parse().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "Invalid bulk string length")
                })?;

                if len < 0 {
                    return Ok(RespValue::Null);
                }
                if len > MAX_BULK_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Bulk string length {} exceeds limit", len),
                    ));
                }

                let mut data = vec![0u8; len as usize];
                self.reader.read_exact(&mut data)?;

                // trailing \r\n
                let mut crlf = [0u8; 2];
                self.reader.read_exact(&mut crlf)?;

                Ok(RespValue::BulkString(data))
            }
            b'*' => {
                let count: i64 = content.parse().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "Invalid array length")
                })?;

                if count < 0 {
                    return Ok(RespValue::Null);
                }

                let mut elements = Vec::with_capacity((count as usize).min(ARRAY_PREALLOC));
                for _ in 0..count {
                    elements.push(self.decode()?);
                }

                Ok(RespValue::Array(elements))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid RESP type byte: {}", type_byte as char),
            )),
        }
    }
}
