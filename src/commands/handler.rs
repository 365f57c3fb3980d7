//! Command dispatch.
//!
//! [`dispatch`] is the dispatch table: an exhaustive match from [`Command`]
//! to its handler. Handlers validate arity first and only then touch the
//! store through the caller's [`LockSet`].
//!
//! [`CommandHandler`] wraps the table with lock acquisition and logging:
//!
//! ```text
//!  Request ──> resolve_locks ──> Store::acquire ──> dispatch ──> reply
//!                                       │               │
//!                                       │               └─ SET/HSET ok ─> Aof::append
//!                                       └──────── held until the reply (or batch) is done
//! ```
//!
//! | Command | Args | Reply |
//! |---|---|---|
//! | `PING [msg]` | 0-1 | `+PONG` or bulk `msg` |
//! | `SET key value` | 2 | `+OK` |
//! | `GET key` | 1 | bulk or Null |
//! | `HSET hash field value` | 3 | bulk `OK` |
//! | `HGET hash field` | 2 | bulk or Null |
//! | `HGETALL hash` | 1 | array of field, value, ... or bulk `no such hash` |
//! | `MULTI` | 0 | `+OK` |

use crate::commands::command::{Command, Request};
use crate::persistence::Aof;
use crate::protocol::RespValue;
use crate::storage::{resolve_locks, LockSet, Store, StoreError};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, trace};

/// Failures that become an error reply. None of them touch the store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR wrong number of arguments for '{}' command", .0.name().to_lowercase())]
    WrongArity(Command),

    #[error("ERR invalid argument")]
    InvalidArgument,

    #[error("ERR {0} without MULTI")]
    WithoutMulti(Command),

    #[error("ERR WATCH is not supported")]
    WatchUnsupported,

    #[error("ERR {0}")]
    Store(#[from] StoreError),
}

impl CommandError {
    pub fn into_reply(self) -> RespValue {
        RespValue::error(self.to_string())
    }
}

/// Reply for names outside the command set.
pub fn unsupported() -> RespValue {
    RespValue::simple_string("command not supported")
}

/// Runs `command` against the store views held in `locks`.
///
/// Transaction-control verbs reaching this point were sent outside a
/// transaction; the session handles them while one is open.
pub fn dispatch(command: Command, args: &[RespValue], locks: &mut LockSet<'_>) -> RespValue {
    let result = match command {
        Command::Exec | Command::Discard => Err(CommandError::WithoutMulti(command)),
        Command::Watch => Err(CommandError::WatchUnsupported),
        _ if !command.arity().contains(&args.len()) => Err(CommandError::WrongArity(command)),
        Command::Ping => Ok(cmd_ping(args)),
        Command::Set => cmd_set(args, locks),
        Command::Get => cmd_get(args, locks),
        Command::HSet => cmd_hset(args, locks),
        Command::HGet => cmd_hget(args, locks),
        Command::HGetAll => cmd_hgetall(args, locks),
        Command::Multi => Ok(RespValue::ok()),
    };

    result.unwrap_or_else(CommandError::into_reply)
}

fn arg(value: &RespValue) -> Result<Bytes, CommandError> {
    value.to_bytes().ok_or(CommandError::InvalidArgument)
}

fn bulk_or_null(value: Option<Bytes>) -> RespValue {
    value.map(RespValue::BulkString).unwrap_or(RespValue::Null)
}

/// PING [message]
fn cmd_ping(args: &[RespValue]) -> RespValue {
    match args.first().and_then(RespValue::to_bytes) {
        Some(message) => RespValue::bulk_string(message),
        None if args.is_empty() => RespValue::pong(),
        None => CommandError::InvalidArgument.into_reply(),
    }
}

/// SET key value
fn cmd_set(args: &[RespValue], locks: &mut LockSet<'_>) -> Result<RespValue, CommandError> {
    let key = arg(&args[0])?;
    let value = arg(&args[1])?;

    locks.keyspace_mut()?.set_string(key, value);
    Ok(RespValue::ok())
}

/// GET key
fn cmd_get(args: &[RespValue], locks: &mut LockSet<'_>) -> Result<RespValue, CommandError> {
    let key = arg(&args[0])?;
    Ok(bulk_or_null(locks.keyspace()?.get_string(&key)))
}

/// HSET hash field value
fn cmd_hset(args: &[RespValue], locks: &mut LockSet<'_>) -> Result<RespValue, CommandError> {
    let hash = arg(&args[0])?;
    let field = arg(&args[1])?;
    let value = arg(&args[2])?;

    locks.hashspace_mut()?.set_hash_field(hash, field, value);
    Ok(RespValue::bulk_string("OK"))
}

/// HGET hash field
fn cmd_hget(args: &[RespValue], locks: &mut LockSet<'_>) -> Result<RespValue, CommandError> {
    let hash = arg(&args[0])?;
    let field = arg(&args[1])?;
    Ok(bulk_or_null(locks.hashspace()?.get_hash_field(&hash, &field)))
}

/// HGETALL hash
fn cmd_hgetall(args: &[RespValue], locks: &mut LockSet<'_>) -> Result<RespValue, CommandError> {
    let hash = arg(&args[0])?;

    match locks.hashspace()?.get_all_hash_fields(&hash) {
        Ok(pairs) => Ok(RespValue::array(
            pairs
                .into_iter()
                .flat_map(|(field, value)| [RespValue::BulkString(field), RespValue::BulkString(value)])
                .collect(),
        )),
        // A missing hash is reported in-band, not as an error reply.
        Err(e @ StoreError::HashNotFound) => Ok(RespValue::bulk_string(e.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Executes requests against the shared store, logging writes to the
/// append-only file when one is attached.
///
/// Cheap to clone: one per connection.
#[derive(Clone)]
pub struct CommandHandler {
    store: Arc<Store>,
    aof: Option<Arc<Aof>>,
}

impl CommandHandler {
    /// A handler that never logs. Used for replay and for running without
    /// persistence.
    pub fn new(store: Arc<Store>) -> Self {
        Self { store, aof: None }
    }

    pub fn with_aof(store: Arc<Store>, aof: Arc<Aof>) -> Self {
        Self {
            store,
            aof: Some(aof),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Executes a single request under its own lock.
    ///
    /// ```
    /// use tallykv::commands::{CommandHandler, Request};
    /// use tallykv::protocol::RespValue;
    /// use tallykv::storage::Store;
    /// use std::sync::Arc;
    ///
    /// let handler = CommandHandler::new(Arc::new(Store::new()));
    /// let set = Request::from_frame(RespValue::command(["SET", "foo", "bar"])).unwrap();
    /// assert_eq!(handler.execute(&set), RespValue::ok());
    /// ```
    pub fn execute(&self, request: &Request) -> RespValue {
        let Some(command) = request.command() else {
            trace!(command = %request.name(), "unsupported command");
            return unsupported();
        };

        let mut locks = self.store.acquire(&resolve_locks([command]));
        self.run(command, request, &mut locks)
    }

    /// Executes a queued batch atomically.
    ///
    /// Every lock the batch needs is taken before the first command runs and
    /// released after the last, so no other connection observes a partial
    /// batch. Replies are returned in queue order.
    pub fn execute_batch(&self, requests: &[Request]) -> RespValue {
        let descriptors = resolve_locks(requests.iter().filter_map(Request::command));
        let mut locks = self.store.acquire(&descriptors);
        trace!(commands = requests.len(), locks = ?descriptors, "executing batch");

        let replies = requests
            .iter()
            .map(|request| match request.command() {
                Some(command) => self.run(command, request, &mut locks),
                None => unsupported(),
            })
            .collect();

        locks.release();
        RespValue::Array(replies)
    }

    fn run(&self, command: Command, request: &Request, locks: &mut LockSet<'_>) -> RespValue {
        let reply = dispatch(command, request.args(), locks);

        // Appended while the write lock is still held, so log order matches
        // the order in which writes were applied.
        if command.is_mutating() && !reply.is_error() {
            if let Some(aof) = &self.aof {
                if let Err(e) = aof.append(request.frame()) {
                    error!(command = %command, error = %e, "failed to append to AOF");
                    return RespValue::error(format!("ERR failed to persist command: {}", e));
                }
            }
        }

        reply
    }
}
