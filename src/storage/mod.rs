//! In-memory storage.
//!
//! Two independently locked keyspaces: the flat keyspace (SET/GET) and the
//! hashspace (HSET/HGET/HGETALL). A command on one never waits for a writer
//! on the other.
//!
//! ## Locking discipline
//!
//! - `Store` performs no locking inside its data operations
//! - callers resolve the locks a batch needs with [`resolve_locks`]
//! - [`Store::acquire`] blocks until every lock is granted and returns a
//!   [`LockSet`]; the keyspaces are only reachable through it
//! - acquisition order is fixed (keyspace, then hashspace), so concurrent
//!   batches cannot deadlock
//!
//! ```
//! use tallykv::commands::Command;
//! use tallykv::storage::{resolve_locks, Store};
//! use bytes::Bytes;
//!
//! let store = Store::new();
//! {
//!     let mut locks = store.acquire(&resolve_locks([Command::HSet]));
//!     locks
//!         .hashspace_mut()
//!         .unwrap()
//!         .set_hash_field(Bytes::from("h"), Bytes::from("f"), Bytes::from("v"));
//! }
//! let locks = store.acquire(&resolve_locks([Command::HGet]));
//! assert_eq!(
//!     locks.hashspace().unwrap().get_hash_field(b"h", b"f"),
//!     Some(Bytes::from("v"))
//! );
//! ```

pub mod locks;
pub mod store;

pub use locks::{resolve_locks, LockDescriptor, LockSet, LockTarget};
pub use store::{Hashspace, Keyspace, Store, StoreError, StoreSnapshot};
