//! Durability.
//!
//! - `aof`: the append-only file of mutating requests, and its replay
//! - `sync`: the periodic fsync task owned by the `Aof`
//!
//! Lifecycle:
//!
//! ```text
//! Aof::open ──> Aof::replay ──> serve (append per SET/HSET) ──> Aof::shutdown
//!    │                                                              │
//!    └──────────── SyncTask: fsync every interval ──────────────────┘
//! ```

pub mod aof;
pub mod sync;

pub use aof::{replay_records, Aof, PersistenceError, ReplayStats, DEFAULT_FSYNC_INTERVAL};
pub use sync::SyncTask;
