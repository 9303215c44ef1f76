//! Write serialization by key.
//!
//! Two workers must never merge overlapping groups at the same time. Writers
//! acquire the whole key set of their unit of work in one step; disjoint sets
//! proceed concurrently, overlapping sets wait.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::graph::{CommunityId, NodeId};
use crate::storage::StorageError;

/// Table of keys currently held by a writer.
#[derive(Debug)]
pub struct LockTable<K> {
    held: Mutex<HashSet<K>>,
    released: Condvar,
}

/// Per-node locks held by merges, resolutions and edge writes.
pub type NodeLockTable = LockTable<NodeId>;

/// Per-community locks held by soft-link writes.
pub type CommunityLockTable = LockTable<CommunityId>;

/// Guard over node locks.
pub type NodeLockGuard<'a> = LockGuard<'a, NodeId>;

impl<K> Default for LockTable<K> {
    fn default() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }
}

impl<K: Copy + Eq + Hash + Ord> LockTable<K> {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> Result<MutexGuard<'_, HashSet<K>>, StorageError> {
        self.held
            .lock()
            .map_err(|_| StorageError::BackendError("poisoned lock: lock_table".to_string()))
    }

    /// Block until every key in `keys` is free, then hold them all.
    pub fn acquire<I>(&self, keys: I) -> Result<LockGuard<'_, K>, StorageError>
    where
        I: IntoIterator<Item = K>,
    {
        let keys = dedup(keys);
        let mut held = self.held()?;
        while keys.iter().any(|k| held.contains(k)) {
            held = self
                .released
                .wait(held)
                .map_err(|_| StorageError::BackendError("poisoned lock: lock_table".to_string()))?;
        }
        held.extend(keys.iter().copied());
        Ok(LockGuard { table: self, keys })
    }

    /// Hold every key in `keys` if all are free right now; otherwise `None`.
    pub fn try_acquire<I>(&self, keys: I) -> Result<Option<LockGuard<'_, K>>, StorageError>
    where
        I: IntoIterator<Item = K>,
    {
        let keys = dedup(keys);
        let mut held = self.held()?;
        if keys.iter().any(|k| held.contains(k)) {
            return Ok(None);
        }
        held.extend(keys.iter().copied());
        Ok(Some(LockGuard { table: self, keys }))
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn dedup<K: Ord, I: IntoIterator<Item = K>>(keys: I) -> Vec<K> {
    let mut out: Vec<K> = keys.into_iter().collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Releases its keys on drop.
#[derive(Debug)]
pub struct LockGuard<'a, K: Eq + Hash> {
    table: &'a LockTable<K>,
    keys: Vec<K>,
}

impl<K: Eq + Hash> LockGuard<'_, K> {
    /// The held keys, sorted.
    #[must_use]
    pub fn ids(&self) -> &[K] {
        &self.keys
    }
}

impl<K: Eq + Hash> Drop for LockGuard<'_, K> {
    fn drop(&mut self) {
        let mut held = self.table.held.lock().unwrap_or_else(PoisonError::into_inner);
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.table.released.notify_all();
    }
}
