// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use pubguard_types::budget::{BudgetStatus, UnavailableBudget};
use pubguard_types::identifiers::BudgetRef;
use pubguard_types::ResourceVersion;

use super::{BudgetStore, ReadError, SecondaryCache, WriteError};

/// Budget store keeping all budgets in memory. Every successful write assigns the next numeric
/// resource version, so concurrent writers are detected exactly like with a remote store.
#[derive(Debug, Default)]
pub struct InMemoryBudgetStore {
    budgets: Mutex<HashMap<BudgetRef, UnavailableBudget>>,
    status_writes: AtomicUsize,
}

impl InMemoryBudgetStore {
    /// Creates or replaces a budget and returns it with its newly assigned resource version.
    pub fn insert(&self, mut budget: UnavailableBudget) -> UnavailableBudget {
        let mut budgets = self.budgets.lock();
        let current = budgets
            .get(&budget.reference)
            .map(|stored| stored.resource_version.clone())
            .unwrap_or(ResourceVersion::EMPTY);
        budget.resource_version = current.next();
        budgets.insert(budget.reference.clone(), budget.clone());
        budget
    }

    /// Modifies the status of a stored budget as another writer would, bumping its version.
    pub fn modify_status(
        &self,
        budget: &BudgetRef,
        modify: impl FnOnce(&mut BudgetStatus),
    ) -> Option<UnavailableBudget> {
        let mut budgets = self.budgets.lock();
        let stored = budgets.get_mut(budget)?;
        modify(&mut stored.status);
        stored.resource_version = stored.resource_version.next();
        Some(stored.clone())
    }

    pub fn snapshot(&self, budget: &BudgetRef) -> Option<UnavailableBudget> {
        self.budgets.lock().get(budget).cloned()
    }

    /// Number of successful [`BudgetStore::update_status`] calls.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BudgetStore for InMemoryBudgetStore {
    async fn get(&self, budget: &BudgetRef) -> Result<UnavailableBudget, ReadError> {
        self.snapshot(budget)
            .ok_or_else(|| ReadError::NotFound(budget.clone()))
    }

    async fn update_status(
        &self,
        budget: &UnavailableBudget,
    ) -> Result<UnavailableBudget, WriteError> {
        let mut budgets = self.budgets.lock();
        let Some(stored) = budgets.get_mut(&budget.reference) else {
            return Err(WriteError::NotFound(budget.reference.clone()));
        };

        if stored.resource_version != budget.resource_version {
            return Err(WriteError::VersionConflict(format!(
                "budget '{}' is at version {}, write was based on version {}",
                budget.reference, stored.resource_version, budget.resource_version
            )));
        }

        stored.status = budget.status.clone();
        stored.resource_version = stored.resource_version.next();
        self.status_writes.fetch_add(1, Ordering::Relaxed);
        trace!(
            budget = %budget.reference,
            version = %stored.resource_version,
            "Persisted budget status"
        );

        Ok(stored.clone())
    }
}

/// The store is its own, always up-to-date, secondary view.
#[async_trait]
impl SecondaryCache for InMemoryBudgetStore {
    async fn get(&self, budget: &BudgetRef) -> Result<Option<UnavailableBudget>, ReadError> {
        Ok(self.snapshot(budget))
    }
}
