//! Incremental wire decoder.
//!
//! The parser never consumes input on its own. Given a buffer it returns:
//! - `Ok(Some((value, consumed)))` when one complete top-level value is
//!   available; the caller advances its buffer by `consumed`
//! - `Ok(None)` when the buffer holds only a prefix of a value
//! - `Err(ParseError)` when the bytes can never form a valid value
//!
//! A single top-level value may span at most [`MAX_FRAME_SIZE`] bytes. The
//! limit is checked against declared bulk lengths as soon as their header
//! arrives, so a caller buffering an incomplete frame never needs to hold
//! more than that.
//!
//! The same decoder serves live connections and append-only log replay.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The leading byte is not a known type marker
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// A length, count or integer line is not a decimal number
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Simple string or error text is not UTF-8
    #[error("invalid UTF-8 in line")]
    InvalidUtf8,

    /// Negative bulk length other than -1
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Negative array count other than -1
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Bulk payload not followed by CRLF
    #[error("bulk string missing trailing CRLF")]
    MissingCrlf,

    #[error("maximum nesting depth of {0} exceeded")]
    TooDeep(usize),

    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Largest accepted top-level value, headers included (512 MiB).
pub const MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Deepest accepted array nesting.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Decoder for one top-level value at a time.
///
/// ```
/// use tallykv::protocol::{RespParser, RespValue};
///
/// let mut parser = RespParser::new();
/// let (value, consumed) = parser
///     .parse(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n")
///     .unwrap()
///     .unwrap();
/// assert_eq!(value, RespValue::command(["GET", "foo"]));
/// assert_eq!(consumed, 22);
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    depth: usize,
}

impl RespParser {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to decode one value from the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        self.depth = 0;
        self.parse_value(buf, 0)
    }

    /// Decodes the value starting at `pos`. On success returns the value and
    /// the position just past it.
    fn parse_value(&mut self, buf: &[u8], pos: usize) -> ParseResult<Option<(RespValue, usize)>> {
        let Some(&marker) = buf.get(pos) else {
            return Ok(None);
        };

        match marker {
            prefix::SIMPLE_STRING => Ok(read_text(buf, pos)?
                .map(|(text, end)| (RespValue::SimpleString(text), end))),
            prefix::ERROR => Ok(read_text(buf, pos)?.map(|(text, end)| (RespValue::Error(text), end))),
            prefix::INTEGER => Ok(read_number(buf, pos)?.map(|(n, end)| (RespValue::Integer(n), end))),
            prefix::BULK_STRING => parse_bulk_string(buf, pos),
            prefix::ARRAY => self.parse_array(buf, pos),
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    /// `*<count>\r\n<elements...>`
    fn parse_array(&mut self, buf: &[u8], pos: usize) -> ParseResult<Option<(RespValue, usize)>> {
        let Some((count, mut end)) = read_number(buf, pos)? else {
            return Ok(None);
        };

        if count == -1 {
            return Ok(Some((RespValue::Null, end)));
        }
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::TooDeep(MAX_NESTING_DEPTH));
        }

        // Cap the preallocation: the count is peer-controlled.
        let mut elements = Vec::with_capacity((count as usize).min(1024));

        for _ in 0..count {
            match self.parse_value(buf, end)? {
                Some((value, next)) => {
                    elements.push(value);
                    end = next;
                }
                None => return Ok(None),
            }
        }

        self.depth -= 1;
        Ok(Some((RespValue::Array(elements), end)))
    }
}

/// `$<len>\r\n<data>\r\n`, or `$-1\r\n` for Null.
fn parse_bulk_string(buf: &[u8], pos: usize) -> ParseResult<Option<(RespValue, usize)>> {
    let Some((length, start)) = read_number(buf, pos)? else {
        return Ok(None);
    };

    if length == -1 {
        return Ok(Some((RespValue::Null, start)));
    }
    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }

    // Checked before the payload arrives: the whole frame must fit.
    let length = usize::try_from(length).unwrap_or(usize::MAX);
    let end = start.saturating_add(length).saturating_add(CRLF.len());
    if end > MAX_FRAME_SIZE {
        return Err(ParseError::FrameTooLarge {
            size: end,
            max: MAX_FRAME_SIZE,
        });
    }

    if buf.len() < end {
        return Ok(None);
    }
    if &buf[start + length..end] != CRLF {
        return Err(ParseError::MissingCrlf);
    }

    let data = Bytes::copy_from_slice(&buf[start..start + length]);
    Ok(Some((RespValue::BulkString(data), end)))
}

/// Reads the line after the marker byte at `pos`. Returns the line body and
/// the position just past its CRLF.
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let body = &buf[pos + 1..];
    find_crlf(body).map(|len| (&body[..len], pos + 1 + len + CRLF.len()))
}

fn read_text(buf: &[u8], pos: usize) -> ParseResult<Option<(String, usize)>> {
    match read_line(buf, pos) {
        Some((line, end)) => {
            let text = std::str::from_utf8(line).map_err(|_| ParseError::InvalidUtf8)?;
            Ok(Some((text.to_string(), end)))
        }
        None => Ok(None),
    }
}

fn read_number(buf: &[u8], pos: usize) -> ParseResult<Option<(i64, usize)>> {
    match read_line(buf, pos) {
        Some((line, end)) => {
            let n = std::str::from_utf8(line)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| {
                    ParseError::InvalidInteger(String::from_utf8_lossy(line).into_owned())
                })?;
            Ok(Some((n, end)))
        }
        None => Ok(None),
    }
}

/// Position of the first `\r\n`, if any.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Decodes a single value with a fresh parser.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}
