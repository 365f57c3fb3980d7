//! MULTI / EXEC transactions.
//!
//! Each connection owns a [`Session`]. While a transaction is open its
//! requests are queued instead of executed; EXEC hands the whole queue to
//! `CommandHandler::execute_batch`, which holds every lock the batch needs
//! from the first queued command to the last.

pub mod session;

pub use session::{
    CommandQueue, Session, TransactionState, DISCARD_REPLY, EMPTY_EXEC_REPLY, NESTED_MULTI_ERROR,
    QUEUED_REPLY, WATCH_ERROR,
};
