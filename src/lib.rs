//! # TallyKV - A Small Transactional In-Memory Key-Value Server
//!
//! TallyKV speaks a RESP-compatible wire protocol and keeps two independent
//! keyspaces in memory: plain strings and hashes of field/value pairs.
//! Clients can group commands with `MULTI` / `EXEC`, and every successful
//! write is appended to a log that is replayed on startup.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               TallyKV                                │
//! │                                                                      │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐               │
//! │  │ TCP Server  │───>│ Connection  │───>│  Session    │               │
//! │  │ (Listener)  │    │  Handler    │    │ (MULTI/EXEC)│               │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘               │
//! │                                               ▼                      │
//! │  ┌─────────────┐    ┌─────────────────────────────────────────────┐  │
//! │  │   RESP      │    │               CommandHandler                │  │
//! │  │   Parser    │    │   resolve_locks ──> Store::acquire ──> run  │  │
//! │  └─────────────┘    └───────────────┬───────────────────┬─────────┘  │
//! │                                     ▼                   ▼            │
//! │                     ┌──────────────────────────┐  ┌──────────────┐   │
//! │                     │          Store           │  │     Aof      │   │
//! │                     │ ┌────────┐  ┌──────────┐ │  │ append + 1s  │   │
//! │                     │ │Keyspace│  │Hashspace │ │  │ fsync task   │   │
//! │                     │ │RwLock  │  │RwLock    │ │  └──────────────┘   │
//! │                     │ └────────┘  └──────────┘ │                     │
//! │                     └──────────────────────────┘                     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use tallykv::commands::CommandHandler;
//! use tallykv::connection::{handle_connection, ConnectionStats};
//! use tallykv::persistence::{Aof, DEFAULT_FSYNC_INTERVAL};
//! use tallykv::storage::Store;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(Store::new());
//!     let aof = Arc::new(Aof::open("tallykv.aof", DEFAULT_FSYNC_INTERVAL)?);
//!     aof.replay(Arc::clone(&store))?;
//!
//!     let stats = Arc::new(ConnectionStats::new());
//!     let listener = TcpListener::bind("127.0.0.1:6379").await?;
//!
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         let handler = CommandHandler::with_aof(Arc::clone(&store), Arc::clone(&aof));
//!         tokio::spawn(handle_connection(stream, addr, handler, Arc::clone(&stats)));
//!     }
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `PING [message]`
//! - `SET key value` / `GET key`
//! - `HSET hash field value` / `HGET hash field` / `HGETALL hash`
//! - `MULTI` / `EXEC` / `DISCARD`
//!
//! `WATCH` is recognised but rejected.
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP value type, encoder and incremental decoder
//! - [`storage`]: the two keyspaces and the locks that guard them
//! - [`commands`]: command table, dispatch and execution
//! - [`transaction`]: per-connection MULTI/EXEC state
//! - [`persistence`]: append-only file, periodic fsync, replay
//! - [`connection`]: client connection management
//! - [`config`]: command-line options
//!
//! ## Locking
//!
//! Each keyspace sits behind its own `RwLock`, so string and hash traffic
//! never block each other. A request (or a whole `EXEC` batch) first works
//! out which locks it needs, then takes them together in a fixed order and
//! holds them until its last command has run and been logged.

pub mod commands;
pub mod config;
pub mod connection;
pub mod persistence;
pub mod protocol;
pub mod storage;
pub mod transaction;

pub use commands::{Command, CommandHandler, Request};
pub use config::Config;
pub use connection::{handle_connection, serve_connection, ConnectionStats};
pub use persistence::{Aof, PersistenceError};
pub use protocol::{ParseError, RespParser, RespValue};
pub use storage::{resolve_locks, LockDescriptor, Store};
pub use transaction::Session;

/// Default listening port (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

pub const DEFAULT_HOST: &str = "127.0.0.1";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
