//! Lock descriptors and lock sets.
//!
//! Every command name is statically bound to at most one lock descriptor
//! (see `Command::lock`). A batch of commands is reduced to the distinct
//! locks it needs with [`resolve_locks`], then acquired in one go with
//! `Store::acquire`. The resulting [`LockSet`] is the only way to reach the
//! keyspaces, and dropping it releases everything it holds.

use crate::commands::Command;
use crate::storage::store::{Hashspace, Keyspace, StoreError};
use std::fmt;
use std::ops::Deref;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Which of the two store locks a descriptor refers to.
///
/// The declaration order is the acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockTarget {
    Keyspace,
    Hashspace,
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::Keyspace => write!(f, "keyspace"),
            LockTarget::Hashspace => write!(f, "hashspace"),
        }
    }
}

/// A lock together with the mode it must be held in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDescriptor {
    Shared(LockTarget),
    Exclusive(LockTarget),
}

impl LockDescriptor {
    pub fn target(&self) -> LockTarget {
        match self {
            LockDescriptor::Shared(target) | LockDescriptor::Exclusive(target) => *target,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, LockDescriptor::Exclusive(_))
    }

    /// Blocks until `lock` is held in this descriptor's mode.
    ///
    /// A poisoned lock is still granted: every mutation is a single map
    /// insert, so a panicking holder cannot leave a map half-updated.
    pub(crate) fn lock<'a, T>(&self, lock: &'a RwLock<T>) -> Guard<'a, T> {
        match self {
            LockDescriptor::Shared(_) => {
                Guard::Shared(lock.read().unwrap_or_else(PoisonError::into_inner))
            }
            LockDescriptor::Exclusive(_) => {
                Guard::Exclusive(lock.write().unwrap_or_else(PoisonError::into_inner))
            }
        }
    }
}

/// Reduces a batch of commands to the distinct locks it needs.
///
/// Descriptors are deduplicated by target and ordered by first reference.
/// When any command needs a target exclusively the merged descriptor is
/// exclusive, so a batch of GET followed by SET holds the keyspace lock
/// once, for writing.
///
/// ```
/// use tallykv::commands::Command;
/// use tallykv::storage::{resolve_locks, LockDescriptor, LockTarget};
///
/// let locks = resolve_locks([Command::HGet, Command::Get, Command::Set, Command::Ping]);
/// assert_eq!(
///     locks,
///     vec![
///         LockDescriptor::Shared(LockTarget::Hashspace),
///         LockDescriptor::Exclusive(LockTarget::Keyspace),
///     ]
/// );
/// ```
pub fn resolve_locks<I>(commands: I) -> Vec<LockDescriptor>
where
    I: IntoIterator<Item = Command>,
{
    let mut resolved: Vec<LockDescriptor> = Vec::with_capacity(2);

    for descriptor in commands.into_iter().filter_map(|command| command.lock()) {
        match resolved
            .iter_mut()
            .find(|existing| existing.target() == descriptor.target())
        {
            Some(existing) => {
                if descriptor.is_exclusive() {
                    *existing = descriptor;
                }
            }
            None => resolved.push(descriptor),
        }
    }

    resolved
}

/// A held store lock in either mode.
pub(crate) enum Guard<'a, T> {
    Shared(RwLockReadGuard<'a, T>),
    Exclusive(RwLockWriteGuard<'a, T>),
}

impl<T> Guard<'_, T> {
    fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Guard::Shared(_) => None,
            Guard::Exclusive(guard) => Some(&mut **guard),
        }
    }
}

impl<T> Deref for Guard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Guard::Shared(guard) => guard,
            Guard::Exclusive(guard) => guard,
        }
    }
}

/// The locks held for one command or one transaction batch.
pub struct LockSet<'a> {
    keyspace: Option<Guard<'a, Keyspace>>,
    hashspace: Option<Guard<'a, Hashspace>>,
}

impl<'a> LockSet<'a> {
    pub(crate) fn empty() -> Self {
        Self {
            keyspace: None,
            hashspace: None,
        }
    }

    pub(crate) fn hold_keyspace(&mut self, guard: Guard<'a, Keyspace>) {
        self.keyspace = Some(guard);
    }

    pub(crate) fn hold_hashspace(&mut self, guard: Guard<'a, Hashspace>) {
        self.hashspace = Some(guard);
    }

    pub fn keyspace(&self) -> Result<&Keyspace, StoreError> {
        self.keyspace.as_deref().ok_or(StoreError::LockNotHeld {
            target: LockTarget::Keyspace,
            mode: "shared",
        })
    }

    pub fn keyspace_mut(&mut self) -> Result<&mut Keyspace, StoreError> {
        self.keyspace
            .as_mut()
            .and_then(Guard::get_mut)
            .ok_or(StoreError::LockNotHeld {
                target: LockTarget::Keyspace,
                mode: "exclusive",
            })
    }

    pub fn hashspace(&self) -> Result<&Hashspace, StoreError> {
        self.hashspace.as_deref().ok_or(StoreError::LockNotHeld {
            target: LockTarget::Hashspace,
            mode: "shared",
        })
    }

    pub fn hashspace_mut(&mut self) -> Result<&mut Hashspace, StoreError> {
        self.hashspace
            .as_mut()
            .and_then(Guard::get_mut)
            .ok_or(StoreError::LockNotHeld {
                target: LockTarget::Hashspace,
                mode: "exclusive",
            })
    }

    /// Descriptors for the locks currently held, in acquisition order.
    pub fn held(&self) -> Vec<LockDescriptor> {
        fn describe<T>(guard: &Option<Guard<'_, T>>, target: LockTarget) -> Option<LockDescriptor> {
            guard.as_ref().map(|g| match g {
                Guard::Shared(_) => LockDescriptor::Shared(target),
                Guard::Exclusive(_) => LockDescriptor::Exclusive(target),
            })
        }

        describe(&self.keyspace, LockTarget::Keyspace)
            .into_iter()
            .chain(describe(&self.hashspace, LockTarget::Hashspace))
            .collect()
    }

    /// Releases every held lock.
    pub fn release(self) {}
}
