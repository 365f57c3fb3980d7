//! The two keyspaces.
//!
//! `Store` owns one `RwLock` per keyspace. The data operations are defined on
//! the guarded types (`Keyspace`, `Hashspace`) rather than on `Store` itself,
//! so nothing can touch the maps without first taking the lock that the
//! command is bound to. A transaction keeps its `LockSet` alive across every
//! queued operation and releases it once at the end.
//!
//! ```text
//! ┌──────────────────────── Store ────────────────────────┐
//! │  RwLock<Keyspace>            RwLock<Hashspace>        │
//! │  key -> value                hash -> (field -> value) │
//! │  SET / GET                   HSET / HGET / HGETALL    │
//! └───────────────────────────────────────────────────────┘
//! ```

use crate::storage::locks::{LockDescriptor, LockSet, LockTarget};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Errors raised by store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// HGETALL on a hash that was never written
    #[error("no such hash")]
    HashNotFound,

    /// An operation ran without the lock its command is bound to
    #[error("{target} lock not held in {mode} mode")]
    LockNotHeld {
        target: LockTarget,
        mode: &'static str,
    },
}

/// The flat key/value space.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Keyspace {
    entries: HashMap<Bytes, Bytes>,
}

impl Keyspace {
    pub fn get_string(&self, key: &[u8]) -> Option<Bytes> {
        self.entries.get(key).cloned()
    }

    /// Inserts or overwrites `key`.
    pub fn set_string(&mut self, key: Bytes, value: Bytes) {
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The two-level hash space: hash name -> field -> value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Hashspace {
    hashes: HashMap<Bytes, BTreeMap<Bytes, Bytes>>,
}

impl Hashspace {
    pub fn get_hash_field(&self, hash: &[u8], field: &[u8]) -> Option<Bytes> {
        self.hashes.get(hash).and_then(|fields| fields.get(field)).cloned()
    }

    /// Sets `field` in `hash`, creating the hash on first write.
    pub fn set_hash_field(&mut self, hash: Bytes, field: Bytes, value: Bytes) {
        self.hashes.entry(hash).or_default().insert(field, value);
    }

    /// Returns every field/value pair of `hash` in ascending field order.
    pub fn get_all_hash_fields(&self, hash: &[u8]) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        let fields = self.hashes.get(hash).ok_or(StoreError::HashNotFound)?;
        Ok(fields
            .iter()
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect())
    }

    /// Number of hashes.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// A point-in-time copy of both keyspaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub keyspace: Keyspace,
    pub hashspace: Hashspace,
}

/// Shared in-memory state. Construct once and share through an `Arc`.
///
/// ```
/// use tallykv::storage::{resolve_locks, Store};
/// use tallykv::commands::Command;
/// use bytes::Bytes;
///
/// let store = Store::new();
/// let locks = resolve_locks([Command::Set, Command::Get]);
/// let mut guard = store.acquire(&locks);
/// guard
///     .keyspace_mut()
///     .unwrap()
///     .set_string(Bytes::from("foo"), Bytes::from("bar"));
/// assert_eq!(
///     guard.keyspace().unwrap().get_string(b"foo"),
///     Some(Bytes::from("bar"))
/// );
/// ```
#[derive(Debug, Default)]
pub struct Store {
    keyspace: RwLock<Keyspace>,
    hashspace: RwLock<Hashspace>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until every lock in `descriptors` is held.
    ///
    /// Locks are always taken keyspace first, then hashspace, whatever the
    /// order of `descriptors`. Dropping the returned set releases them.
    pub fn acquire(&self, descriptors: &[LockDescriptor]) -> LockSet<'_> {
        let mut set = LockSet::empty();

        if let Some(descriptor) = find(descriptors, LockTarget::Keyspace) {
            set.hold_keyspace(descriptor.lock(&self.keyspace));
        }
        if let Some(descriptor) = find(descriptors, LockTarget::Hashspace) {
            set.hold_hashspace(descriptor.lock(&self.hashspace));
        }

        set
    }

    /// Copies both keyspaces under shared locks.
    pub fn snapshot(&self) -> StoreSnapshot {
        let keyspace = self.keyspace.read().unwrap_or_else(PoisonError::into_inner);
        let hashspace = self.hashspace.read().unwrap_or_else(PoisonError::into_inner);
        StoreSnapshot {
            keyspace: keyspace.clone(),
            hashspace: hashspace.clone(),
        }
    }
}

fn find(descriptors: &[LockDescriptor], target: LockTarget) -> Option<LockDescriptor> {
    descriptors.iter().copied().find(|d| d.target() == target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::storage::locks::resolve_locks;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_and_get_string() {
        let mut keyspace = Keyspace::default();
        assert_eq!(keyspace.get_string(b"foo"), None);

        keyspace.set_string(Bytes::from("foo"), Bytes::from("bar"));
        keyspace.set_string(Bytes::from("foo"), Bytes::from("baz"));
        assert_eq!(keyspace.get_string(b"foo"), Some(Bytes::from("baz")));
        assert_eq!(keyspace.len(), 1);
    }

    #[test]
    fn test_hash_fields_are_created_lazily() {
        let mut hashspace = Hashspace::default();
        assert!(hashspace.is_empty());
        assert_eq!(hashspace.get_hash_field(b"h", b"f"), None);

        hashspace.set_hash_field(Bytes::from("h"), Bytes::from("f2"), Bytes::from("v2"));
        hashspace.set_hash_field(Bytes::from("h"), Bytes::from("f1"), Bytes::from("v1"));

        assert_eq!(hashspace.len(), 1);
        assert_eq!(hashspace.get_hash_field(b"h", b"f1"), Some(Bytes::from("v1")));
        assert_eq!(hashspace.get_hash_field(b"h", b"nope"), None);
        assert_eq!(
            hashspace.get_all_hash_fields(b"h"),
            Ok(vec![
                (Bytes::from("f1"), Bytes::from("v1")),
                (Bytes::from("f2"), Bytes::from("v2")),
            ])
        );
    }

    #[test]
    fn test_get_all_on_missing_hash() {
        let hashspace = Hashspace::default();
        assert_eq!(
            hashspace.get_all_hash_fields(b"ghost"),
            Err(StoreError::HashNotFound)
        );
    }

    #[test]
    fn test_acquire_only_requested_locks() {
        let store = Store::new();
        let guard = store.acquire(&resolve_locks([Command::Get]));

        assert!(guard.keyspace().is_ok());
        assert!(guard.hashspace().is_err());
    }

    #[test]
    fn test_snapshot_equality() {
        let a = Store::new();
        let b = Store::new();
        for store in [&a, &b] {
            let mut guard = store.acquire(&resolve_locks([Command::Set, Command::HSet]));
            guard
                .keyspace_mut()
                .unwrap()
                .set_string(Bytes::from("k"), Bytes::from("v"));
            guard.hashspace_mut().unwrap().set_hash_field(
                Bytes::from("h"),
                Bytes::from("f"),
                Bytes::from("v"),
            );
        }
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_concurrent_writers_on_both_spaces() {
        let store = Arc::new(Store::new());
        let mut handles = vec![];

        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    // Alternate first-reference order to exercise the fixed acquisition order.
                    let batch = if i % 2 == 0 {
                        [Command::Set, Command::HSet]
                    } else {
                        [Command::HSet, Command::Set]
                    };
                    let mut guard = store.acquire(&resolve_locks(batch));
                    let key = Bytes::from(format!("key-{}-{}", i, j));
                    guard
                        .keyspace_mut()
                        .unwrap()
                        .set_string(key.clone(), Bytes::from("v"));
                    guard.hashspace_mut().unwrap().set_hash_field(
                        Bytes::from(format!("h-{}", i)),
                        key,
                        Bytes::from("v"),
                    );
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.keyspace.len(), 800);
        assert_eq!(snapshot.hashspace.len(), 8);
    }
}
