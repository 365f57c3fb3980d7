//! Per-connection transaction state machine.
//!
//! ```text
//!            MULTI (ok)
//!   Normal ─────────────> Queued ──┐ any other command: enqueue, reply <<Queued>>
//!     ▲                     │  ▲   │
//!     │                     │  └───┘
//!     └─────────────────────┘
//!       EXEC     run batch, reply array
//!       DISCARD  drop queue
//!       MULTI    drop queue, error
//!       WATCH    drop queue, +ERR notice
//! ```
//!
//! Queued commands do not execute until EXEC, which runs the whole batch
//! under one lock set (see `CommandHandler::execute_batch`).

use crate::commands::{Command, CommandHandler, Request};
use crate::protocol::RespValue;
use tracing::debug;

/// Reply to every command deferred by an open transaction.
pub const QUEUED_REPLY: &str = "<<Queued>>";

/// Reply to EXEC with nothing queued.
pub const EMPTY_EXEC_REPLY: &str = "no changes made";

/// Reply to DISCARD.
pub const DISCARD_REPLY: &str = "transaction discarded, no changes made";

pub const NESTED_MULTI_ERROR: &str = "ERR MULTI calls can not be nested, transaction aborted";

/// Sent as a simple string, not an error reply.
pub const WATCH_ERROR: &str = "ERR WATCH is not supported, transaction aborted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Normal,
    Queued,
}

/// Requests deferred between MULTI and EXEC/DISCARD. Never persisted.
#[derive(Debug, Default)]
pub struct CommandQueue {
    requests: Vec<Request>,
}

impl CommandQueue {
    pub fn push(&mut self, request: Request) {
        self.requests.push(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Empties the queue, returning its requests in FIFO order.
    pub fn take(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.requests)
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }
}

/// Transaction state of one connection.
#[derive(Debug, Default)]
pub struct Session {
    state: TransactionState,
    queue: CommandQueue,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of requests waiting for EXEC.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Routes one request according to the current state.
    pub fn handle(&mut self, request: Request, handler: &CommandHandler) -> RespValue {
        match self.state {
            TransactionState::Normal => self.handle_normal(request, handler),
            TransactionState::Queued => self.handle_queued(request, handler),
        }
    }

    fn handle_normal(&mut self, request: Request, handler: &CommandHandler) -> RespValue {
        let reply = handler.execute(&request);

        if request.command() == Some(Command::Multi) && !reply.is_error() {
            debug!("transaction started");
            self.state = TransactionState::Queued;
        }

        reply
    }

    fn handle_queued(&mut self, request: Request, handler: &CommandHandler) -> RespValue {
        match request.command() {
            Some(Command::Exec) => {
                let batch = self.queue.take();
                self.state = TransactionState::Normal;

                if batch.is_empty() {
                    return RespValue::bulk_string(EMPTY_EXEC_REPLY);
                }
                debug!(commands = batch.len(), "executing transaction");
                handler.execute_batch(&batch)
            }
            Some(Command::Discard) => {
                self.abort("discarded");
                RespValue::bulk_string(DISCARD_REPLY)
            }
            Some(Command::Multi) => {
                self.abort("nested MULTI");
                RespValue::error(NESTED_MULTI_ERROR)
            }
            Some(Command::Watch) => {
                self.abort("WATCH inside MULTI");
                RespValue::simple_string(WATCH_ERROR)
            }
            _ => {
                self.queue.push(request);
                RespValue::bulk_string(QUEUED_REPLY)
            }
        }
    }

    fn abort(&mut self, reason: &str) {
        debug!(reason, dropped = self.queue.len(), "transaction aborted");
        self.queue.clear();
        self.state = TransactionState::Normal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use bytes::Bytes;
    use std::sync::Arc;

    fn request(parts: &[&'static str]) -> Request {
        Request::from_frame(RespValue::command(parts.iter().copied())).unwrap()
    }

    fn setup() -> (Session, CommandHandler) {
        (Session::new(), CommandHandler::new(Arc::new(Store::new())))
    }

    fn value_of(handler: &CommandHandler, key: &[u8]) -> Option<Bytes> {
        handler.store().snapshot().keyspace.get_string(key)
    }

    #[test]
    fn test_multi_exec() {
        let (mut session, handler) = setup();

        assert_eq!(session.handle(request(&["MULTI"]), &handler), RespValue::ok());
        assert_eq!(session.state(), TransactionState::Queued);

        let queued = session.handle(request(&["SET", "a", "1"]), &handler);
        assert_eq!(queued.serialize(), b"$10\r\n<<Queued>>\r\n");
        assert_eq!(value_of(&handler, b"a"), None, "queued command must not run yet");

        let reply = session.handle(request(&["EXEC"]), &handler);
        assert_eq!(reply, RespValue::array(vec![RespValue::ok()]));
        assert_eq!(session.state(), TransactionState::Normal);
        assert_eq!(value_of(&handler, b"a"), Some(Bytes::from("1")));
    }

    #[test]
    fn test_exec_runs_in_fifo_order() {
        let (mut session, handler) = setup();
        session.handle(request(&["multi"]), &handler);
        session.handle(request(&["SET", "k", "v1"]), &handler);
        session.handle(request(&["GET", "k"]), &handler);
        session.handle(request(&["SET", "k", "v2"]), &handler);
        session.handle(request(&["HSET", "h", "f", "v"]), &handler);
        assert_eq!(session.queued(), 4);

        let reply = session.handle(request(&["exec"]), &handler);
        assert_eq!(
            reply,
            RespValue::array(vec![
                RespValue::ok(),
                RespValue::bulk_string("v1"),
                RespValue::ok(),
                RespValue::bulk_string("OK"),
            ])
        );
        assert_eq!(session.queued(), 0);
        assert_eq!(value_of(&handler, b"k"), Some(Bytes::from("v2")));
    }

    #[test]
    fn test_empty_exec() {
        let (mut session, handler) = setup();
        session.handle(request(&["MULTI"]), &handler);
        assert_eq!(
            session.handle(request(&["EXEC"]), &handler),
            RespValue::bulk_string(EMPTY_EXEC_REPLY)
        );
        assert_eq!(session.state(), TransactionState::Normal);
    }

    #[test]
    fn test_discard_drops_queue() {
        let (mut session, handler) = setup();
        session.handle(request(&["MULTI"]), &handler);
        session.handle(request(&["SET", "a", "1"]), &handler);

        assert_eq!(
            session.handle(request(&["DISCARD"]), &handler),
            RespValue::bulk_string(DISCARD_REPLY)
        );
        assert_eq!(session.state(), TransactionState::Normal);
        assert_eq!(value_of(&handler, b"a"), None);

        // Back in normal mode: EXEC is now an error.
        assert_eq!(
            session.handle(request(&["EXEC"]), &handler),
            RespValue::error("ERR EXEC without MULTI")
        );
    }

    #[test]
    fn test_nested_multi_aborts() {
        let (mut session, handler) = setup();
        session.handle(request(&["MULTI"]), &handler);
        session.handle(request(&["SET", "a", "1"]), &handler);

        assert_eq!(
            session.handle(request(&["MULTI"]), &handler),
            RespValue::error(NESTED_MULTI_ERROR)
        );
        assert_eq!(session.state(), TransactionState::Normal);
        assert_eq!(session.queued(), 0);
        assert_eq!(value_of(&handler, b"a"), None);
    }

    #[test]
    fn test_watch_aborts() {
        let (mut session, handler) = setup();
        session.handle(request(&["MULTI"]), &handler);
        session.handle(request(&["HSET", "h", "f", "v"]), &handler);

        assert_eq!(
            session.handle(request(&["WATCH", "k"]), &handler).serialize(),
            b"+ERR WATCH is not supported, transaction aborted\r\n"
        );
        assert_eq!(session.state(), TransactionState::Normal);
        assert!(handler.store().snapshot().hashspace.is_empty());
    }

    #[test]
    fn test_multi_with_arguments_does_not_open_transaction() {
        let (mut session, handler) = setup();
        assert!(session.handle(request(&["MULTI", "x"]), &handler).is_error());
        assert_eq!(session.state(), TransactionState::Normal);
        assert_eq!(session.handle(request(&["SET", "a", "1"]), &handler), RespValue::ok());
    }

    #[test]
    fn test_queued_errors_surface_at_exec() {
        let (mut session, handler) = setup();
        session.handle(request(&["MULTI"]), &handler);
        session.handle(request(&["GET"]), &handler);
        session.handle(request(&["BLPOP", "q"]), &handler);
        session.handle(request(&["PING"]), &handler);

        let reply = session.handle(request(&["EXEC"]), &handler);
        assert_eq!(
            reply,
            RespValue::array(vec![
                RespValue::error("ERR wrong number of arguments for 'get' command"),
                RespValue::simple_string("command not supported"),
                RespValue::pong(),
            ])
        );
    }
}
