//! Wire protocol codec.
//!
//! A length-prefixed, CRLF-delimited format: one marker byte, a header line,
//! and (for bulk strings and arrays) a self-delimiting body. Arrays nest.
//!
//! - `types`: the `RespValue` enum and its encoder
//! - `parser`: the incremental decoder
//!
//! ```
//! use tallykv::protocol::{parse_message, RespValue};
//!
//! let (value, consumed) = parse_message(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n")
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(consumed, 22);
//! assert_eq!(value.serialize(), b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_message, ParseError, ParseResult, RespParser, MAX_FRAME_SIZE};
pub use types::RespValue;
