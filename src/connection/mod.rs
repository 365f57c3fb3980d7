//! Client connections.
//!
//! Each accepted socket gets its own task running a [`ConnectionHandler`].
//! Tasks share only the [`CommandHandler`](crate::commands::CommandHandler)
//! (store and AOF behind their own locks) and the [`ConnectionStats`].
//!
//! ```text
//!   TcpListener (main.rs)
//!        │ accept()
//!        ▼
//!   tokio::spawn(serve_connection(..))
//!        │
//!        ▼
//!   ConnectionHandler: read ──> decode ──> Session ──> reply
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use tallykv::commands::CommandHandler;
//! use tallykv::connection::{serve_connection, ConnectionStats};
//! use tallykv::storage::Store;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let store = Arc::new(Store::new());
//! let stats = Arc::new(ConnectionStats::new());
//! let handler = CommandHandler::new(store);
//!
//! let (stream, addr) = listener.accept().await?;
//! tokio::spawn(serve_connection(stream, addr, handler, stats, Duration::from_secs(60)));
//! ```

pub mod handler;

pub use handler::{
    handle_connection, serve_connection, ConnectionError, ConnectionHandler, ConnectionStats,
    DEFAULT_IDLE_TIMEOUT,
};
