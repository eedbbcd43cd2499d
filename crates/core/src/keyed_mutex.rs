// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable<K> = DashMap<K, Arc<Mutex<()>>>;

/// Mutual exclusion per key. Holders of different keys never block each other.
///
/// Lock entries are created on first use and removed once the last holder or waiter of a key
/// is gone, so the table only grows with the number of keys locked concurrently.
#[derive(Debug)]
pub struct KeyedMutex<K: Eq + Hash> {
    locks: Arc<LockTable<K>>,
}

impl<K: Eq + Hash> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self {
            locks: Arc::default(),
        }
    }
}

impl<K: Eq + Hash> Clone for KeyedMutex<K> {
    fn clone(&self) -> Self {
        Self {
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    /// Waits until the lock for `key` is available. The lock is released when the returned
    /// guard is dropped.
    pub async fn lock(&self, key: K) -> KeyedMutexGuard<K> {
        // the shard lock must not be held across the await below
        let mutex = Arc::clone(&self.locks.entry(key.clone()).or_default());
        let guard = mutex.lock_owned().await;

        KeyedMutexGuard {
            key,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys which are currently held or waited upon.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct KeyedMutexGuard<K: Eq + Hash> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable<K>>,
}

impl<K: Eq + Hash> KeyedMutexGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash> Drop for KeyedMutexGuard<K> {
    fn drop(&mut self) {
        // release first so the table holds the only reference if nobody else is waiting
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

static_assertions::assert_impl_all!(KeyedMutex<String>: Send, Sync, Clone);
