//! Command layer.
//!
//! ```text
//! RespValue ──Request::from_frame──> Request ──CommandHandler──> RespValue
//!                                               │
//!                                               ├─ lock resolution (storage)
//!                                               ├─ dispatch (exhaustive match)
//!                                               └─ AOF append for SET / HSET
//! ```
//!
//! - `command`: the closed `Command` enum with its static lock binding,
//!   arity and mutating flag, plus `Request`
//! - `handler`: the dispatch table and `CommandHandler`

pub mod command;
pub mod handler;

pub use command::{Command, Request, RequestError};
pub use handler::{dispatch, unsupported, CommandError, CommandHandler};
