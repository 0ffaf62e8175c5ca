// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-key locks.
//!
//! Operations on the same key are serialized, operations on different keys run in parallel.
//! Several keys are always acquired in their sort order so two operations can't deadlock each
//! other.
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

/// Held locks, released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

#[derive(Debug)]
pub struct KeyLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K> Default for KeyLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> KeyLocks<K>
where
    K: Clone + Ord + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        // Holding the map lock is fine, it is never held across an await point.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

        // Locks nobody holds or waits for can go.
        locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);

        locks.entry(key.clone()).or_default().clone()
    }

    pub async fn lock(&self, key: K) -> KeyGuard {
        self.lock_all([key]).await
    }

    /// Acquires the locks of all given keys.
    pub async fn lock_all(&self, keys: impl IntoIterator<Item = K>) -> KeyGuard {
        let keys: BTreeSet<K> = keys.into_iter().collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let mutex = self.mutex(&key);
            guards.push(mutex.lock_owned().await);
        }
        KeyGuard { _guards: guards }
    }

    /// Number of keys with a lock, held or not yet cleaned up.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
