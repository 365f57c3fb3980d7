//! The closed set of supported commands and the validated request shape.

use crate::protocol::RespValue;
use crate::storage::{LockDescriptor, LockTarget};
use std::fmt;
use std::ops::RangeInclusive;
use thiserror::Error;

/// Every command the server understands.
///
/// Anything else is answered with `+command not supported` by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ping,
    Set,
    Get,
    HSet,
    HGet,
    HGetAll,
    Multi,
    Exec,
    Discard,
    Watch,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::Ping,
        Command::Set,
        Command::Get,
        Command::HSet,
        Command::HGet,
        Command::HGetAll,
        Command::Multi,
        Command::Exec,
        Command::Discard,
        Command::Watch,
    ];

    /// Looks a command up by name, ignoring ASCII case.
    pub fn from_name(name: &[u8]) -> Option<Command> {
        Command::ALL
            .into_iter()
            .find(|command| command.name().as_bytes().eq_ignore_ascii_case(name))
    }

    /// Canonical upper-case name.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Set => "SET",
            Command::Get => "GET",
            Command::HSet => "HSET",
            Command::HGet => "HGET",
            Command::HGetAll => "HGETALL",
            Command::Multi => "MULTI",
            Command::Exec => "EXEC",
            Command::Discard => "DISCARD",
            Command::Watch => "WATCH",
        }
    }

    /// The lock this command must run under, if it touches the store.
    pub fn lock(&self) -> Option<LockDescriptor> {
        match self {
            Command::Get => Some(LockDescriptor::Shared(LockTarget::Keyspace)),
            Command::Set => Some(LockDescriptor::Exclusive(LockTarget::Keyspace)),
            Command::HGet | Command::HGetAll => Some(LockDescriptor::Shared(LockTarget::Hashspace)),
            Command::HSet => Some(LockDescriptor::Exclusive(LockTarget::Hashspace)),
            Command::Ping | Command::Multi | Command::Exec | Command::Discard | Command::Watch => {
                None
            }
        }
    }

    /// Accepted argument counts, command name excluded.
    pub fn arity(&self) -> RangeInclusive<usize> {
        match self {
            Command::Ping => 0..=1,
            Command::Set => 2..=2,
            Command::Get => 1..=1,
            Command::HSet => 3..=3,
            Command::HGet => 2..=2,
            Command::HGetAll => 1..=1,
            Command::Multi => 0..=0,
            // Never consulted: these are answered before the arity check.
            Command::Exec | Command::Discard | Command::Watch => 0..=0,
        }
    }

    /// Whether successful execution must be recorded in the append-only log.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Command::Set | Command::HSet)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a decoded frame is not a usable request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("request is not an array")]
    NotAnArray,

    #[error("request array is empty")]
    Empty,

    #[error("command name is not a string")]
    InvalidName,
}

/// A client frame that has the shape `[name, arg...]`.
///
/// The original frame is kept intact so it can be appended to the log
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    name: String,
    command: Option<Command>,
    frame: RespValue,
}

impl Request {
    /// Validates the request shape and resolves the command name.
    ///
    /// ```
    /// use tallykv::commands::{Command, Request};
    /// use tallykv::protocol::RespValue;
    ///
    /// let request = Request::from_frame(RespValue::command(["hgetall", "h"])).unwrap();
    /// assert_eq!(request.command(), Some(Command::HGetAll));
    /// assert_eq!(request.name(), "HGETALL");
    /// assert_eq!(request.args().len(), 1);
    /// ```
    pub fn from_frame(frame: RespValue) -> Result<Request, RequestError> {
        let parts = frame.as_array().ok_or(RequestError::NotAnArray)?;
        let head = parts.first().ok_or(RequestError::Empty)?;
        let raw_name = head.as_bytes().ok_or(RequestError::InvalidName)?;

        let command = Command::from_name(raw_name);
        let name = match command {
            Some(command) => command.name().to_string(),
            None => String::from_utf8_lossy(raw_name).to_uppercase(),
        };

        Ok(Request {
            name,
            command,
            frame,
        })
    }

    /// `None` when the name is not a supported command.
    pub fn command(&self) -> Option<Command> {
        self.command
    }

    /// Upper-cased command name as sent by the client.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments after the command name.
    pub fn args(&self) -> &[RespValue] {
        self.frame.as_array().map(|parts| &parts[1..]).unwrap_or(&[])
    }

    /// The frame as received.
    pub fn frame(&self) -> &RespValue {
        &self.frame
    }
}
