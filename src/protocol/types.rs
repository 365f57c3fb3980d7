//! Wire values.
//!
//! Every value on the wire starts with a one-byte marker and every scalar
//! unit ends with CRLF:
//!
//! ```text
//! +OK\r\n                       simple string
//! -ERR boom\r\n                 error
//! :42\r\n                       integer
//! $5\r\nhello\r\n               bulk string ($-1\r\n is Null)
//! *2\r\n$3\r\nGET\r\n$1\r\nk\r\n  array of two bulk strings
//! ```
//!
//! Requests are arrays of bulk strings. Replies may use any shape.

use bytes::Bytes;
use std::fmt;

/// Line terminator for every scalar unit.
pub const CRLF: &[u8] = b"\r\n";

/// The fixed encoding of a Null bulk string.
pub const NULL_BULK: &[u8] = b"$-1\r\n";

/// Leading type bytes.
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A decoded (or to-be-encoded) protocol value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+<text>\r\n`. Must not contain CR or LF.
    SimpleString(String),

    /// `-<text>\r\n`
    Error(String),

    /// `:<n>\r\n`. Supported by the codec, not produced by any command.
    Integer(i64),

    /// `$<len>\r\n<bytes>\r\n`, binary safe.
    BulkString(Bytes),

    /// `$-1\r\n`
    Null,

    /// `*<count>\r\n` followed by `count` encoded elements.
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    /// Creates a bulk string.
    ///
    /// ```
    /// use tallykv::protocol::RespValue;
    /// let v = RespValue::bulk_string("bar");
    /// assert_eq!(v.serialize(), b"$3\r\nbar\r\n");
    /// ```
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// `+OK`
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// `+PONG`
    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Builds a request frame (`*n` of bulk strings) from its parts.
    ///
    /// ```
    /// use tallykv::protocol::RespValue;
    /// let frame = RespValue::command(["GET", "foo"]);
    /// assert_eq!(frame.serialize(), b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
    /// ```
    pub fn command<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        RespValue::Array(
            parts
                .into_iter()
                .map(|part| RespValue::BulkString(part.into()))
                .collect(),
        )
    }

    /// Encodes the value into a fresh buffer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len_hint());
        self.serialize_into(&mut buf);
        buf
    }

    /// Appends the encoding of the value to `buf`.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => write_line(buf, prefix::SIMPLE_STRING, s.as_bytes()),
            RespValue::Error(s) => write_line(buf, prefix::ERROR, s.as_bytes()),
            RespValue::Integer(n) => write_line(buf, prefix::INTEGER, n.to_string().as_bytes()),
            RespValue::BulkString(data) => {
                write_line(buf, prefix::BULK_STRING, data.len().to_string().as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => buf.extend_from_slice(NULL_BULK),
            RespValue::Array(values) => {
                write_line(buf, prefix::ARRAY, values.len().to_string().as_bytes());
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    // Rough size used only to pre-size the output buffer.
    fn encoded_len_hint(&self) -> usize {
        match self {
            RespValue::SimpleString(s) | RespValue::Error(s) => s.len() + 3,
            RespValue::Integer(_) => 24,
            RespValue::BulkString(data) => data.len() + 16,
            RespValue::Null => NULL_BULK.len(),
            RespValue::Array(values) => {
                16 + values.iter().map(RespValue::encoded_len_hint).sum::<usize>()
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Borrows the payload of a bulk or simple string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Returns the payload of a bulk or simple string as `Bytes`.
    ///
    /// Cloning a bulk string only bumps a reference count.
    pub fn to_bytes(&self) -> Option<Bytes> {
        match self {
            RespValue::BulkString(b) => Some(b.clone()),
            RespValue::SimpleString(s) => Some(Bytes::from(s.clone())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

fn write_line(buf: &mut Vec<u8>, marker: u8, body: &[u8]) {
    buf.push(marker);
    buf.extend_from_slice(body);
    buf.extend_from_slice(CRLF);
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "{}", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary, {} bytes)", data.len()),
            },
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) if values.is_empty() => write!(f, "(empty array)"),
            RespValue::Array(values) => {
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, v)?;
                }
                Ok(())
            }
        }
    }
}
