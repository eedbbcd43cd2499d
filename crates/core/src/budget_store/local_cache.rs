// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::cmp::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use pubguard_types::budget::UnavailableBudget;
use pubguard_types::identifiers::BudgetRef;

use super::{CacheError, LocalCache};

#[derive(Debug)]
struct CachedBudget {
    budget: UnavailableBudget,
    inserted_at: Instant,
}

/// Write-back cache of the budgets persisted by this process. Entries expire after `ttl` so a
/// budget which is only modified by other processes falls back to the secondary cache.
#[derive(Debug)]
pub struct LocalBudgetCache {
    entries: DashMap<BudgetRef, CachedBudget>,
    ttl: Duration,
}

impl LocalBudgetCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::default(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LocalCache for LocalBudgetCache {
    fn get(&self, budget: &BudgetRef) -> Result<Option<UnavailableBudget>, CacheError> {
        match self.entries.get(budget) {
            None => return Ok(None),
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                return Ok(Some(entry.budget.clone()));
            }
            Some(_) => {}
        }

        trace!(%budget, "Evicting expired budget from local cache");
        self.entries
            .remove_if(budget, |_, entry| entry.inserted_at.elapsed() >= self.ttl);
        Ok(None)
    }

    fn put(&self, budget: UnavailableBudget) -> Result<(), CacheError> {
        let now = Instant::now();
        self.entries
            .entry(budget.reference.clone())
            .and_modify(|cached| {
                // never go back to an older version of the same budget
                if cached
                    .budget
                    .resource_version
                    .compare(&budget.resource_version)
                    != Some(Ordering::Greater)
                {
                    cached.budget = budget.clone();
                    cached.inserted_at = now;
                }
            })
            .or_insert_with(|| CachedBudget {
                budget,
                inserted_at: now,
            });
        Ok(())
    }
}
