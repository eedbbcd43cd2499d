// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Store and cache doubles simulating lagging watches, failing stores and concurrent writers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use pubguard_types::budget::{BudgetStatus, UnavailableBudget};
use pubguard_types::identifiers::BudgetRef;

use crate::budget_store::{
    BudgetStore, CacheError, InMemoryBudgetStore, LocalCache, ReadError, SecondaryCache,
    WriteError,
};

#[derive(Debug, thiserror::Error)]
#[error("store unavailable")]
pub struct StoreUnavailable;

#[derive(Debug, thiserror::Error)]
#[error("watch disconnected")]
pub struct WatchDisconnected;

/// Secondary cache serving whatever snapshot it was last fed, no matter how stale.
#[derive(Debug, Default)]
pub struct LaggingCache {
    budget: Mutex<Option<UnavailableBudget>>,
    failing: bool,
}

impl LaggingCache {
    pub fn with(budget: UnavailableBudget) -> Self {
        Self {
            budget: Mutex::new(Some(budget)),
            failing: false,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            budget: Mutex::default(),
            failing: true,
        }
    }

    pub fn set(&self, budget: UnavailableBudget) {
        *self.budget.lock() = Some(budget);
    }
}

#[async_trait]
impl SecondaryCache for LaggingCache {
    async fn get(&self, budget: &BudgetRef) -> Result<Option<UnavailableBudget>, ReadError> {
        if self.failing {
            return Err(ReadError::retryable(WatchDisconnected));
        }

        Ok(self
            .budget
            .lock()
            .as_ref()
            .filter(|cached| &cached.reference == budget)
            .cloned())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cache unavailable")]
pub struct CacheUnavailable;

/// Local cache failing every read and write.
#[derive(Debug, Default)]
pub struct FailingLocalCache {
    puts: AtomicUsize,
}

impl FailingLocalCache {
    /// Number of rejected writes.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }
}

impl LocalCache for FailingLocalCache {
    fn get(&self, _budget: &BudgetRef) -> Result<Option<UnavailableBudget>, CacheError> {
        Err(CacheError::Other(Box::new(CacheUnavailable)))
    }

    fn put(&self, _budget: UnavailableBudget) -> Result<(), CacheError> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        Err(CacheError::Other(Box::new(CacheUnavailable)))
    }
}

/// Store whose reads always fail. Writes fail too unless an inner store is wrapped.
pub struct FailingStore {
    inner: Option<Arc<dyn BudgetStore>>,
    retryable: bool,
}

impl FailingStore {
    pub fn retryable() -> Self {
        Self {
            inner: None,
            retryable: true,
        }
    }

    pub fn terminal() -> Self {
        Self {
            inner: None,
            retryable: false,
        }
    }

    /// Fails reads with a retryable error and passes writes on to `inner`.
    pub fn retryable_reads_of(inner: Arc<dyn BudgetStore>) -> Self {
        Self {
            inner: Some(inner),
            retryable: true,
        }
    }
}

#[async_trait]
impl BudgetStore for FailingStore {
    async fn get(&self, _budget: &BudgetRef) -> Result<UnavailableBudget, ReadError> {
        if self.retryable {
            Err(ReadError::retryable(StoreUnavailable))
        } else {
            Err(ReadError::terminal(StoreUnavailable))
        }
    }

    async fn update_status(
        &self,
        budget: &UnavailableBudget,
    ) -> Result<UnavailableBudget, WriteError> {
        match &self.inner {
            Some(inner) => inner.update_status(budget).await,
            None if self.retryable => Err(WriteError::retryable(StoreUnavailable)),
            None => Err(WriteError::terminal(StoreUnavailable)),
        }
    }
}

type StatusModifier = Box<dyn Fn(&mut BudgetStatus) + Send + Sync>;

/// Wraps an [`InMemoryBudgetStore`] and lets another writer modify the budget right before each
/// of the first `conflicts` status writes, so those writes lose with a version conflict.
pub struct ConflictingStore {
    inner: Arc<InMemoryBudgetStore>,
    remaining_conflicts: AtomicUsize,
    modify: StatusModifier,
    forced_reads: AtomicUsize,
}

impl ConflictingStore {
    pub fn new(
        inner: Arc<InMemoryBudgetStore>,
        conflicts: usize,
        modify: impl Fn(&mut BudgetStatus) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            remaining_conflicts: AtomicUsize::new(conflicts),
            modify: Box::new(modify),
            forced_reads: AtomicUsize::new(0),
        }
    }

    /// Number of reads served, i.e. reads bypassing every cache.
    pub fn forced_reads(&self) -> usize {
        self.forced_reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BudgetStore for ConflictingStore {
    async fn get(&self, budget: &BudgetRef) -> Result<UnavailableBudget, ReadError> {
        self.forced_reads.fetch_add(1, Ordering::Relaxed);
        BudgetStore::get(self.inner.as_ref(), budget).await
    }

    async fn update_status(
        &self,
        budget: &UnavailableBudget,
    ) -> Result<UnavailableBudget, WriteError> {
        let conflict = self
            .remaining_conflicts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if conflict {
            self.inner
                .modify_status(&budget.reference, |status| (self.modify)(status));
        }
        self.inner.update_status(budget).await
    }
}
