// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Ports to the three sources a budget snapshot can be read from: the authoritative store,
//! the watch-fed secondary cache and the local write-back cache.

mod local_cache;
mod memory;

pub use local_cache::LocalBudgetCache;
pub use memory::InMemoryBudgetStore;

use async_trait::async_trait;

use pubguard_types::budget::UnavailableBudget;
use pubguard_types::errors::{
    BoxedMaybeRetryableError, GenericError, IntoMaybeRetryable, MaybeRetryableError,
};
use pubguard_types::identifiers::BudgetRef;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("budget '{0}' not found")]
    NotFound(BudgetRef),
    #[error("other error: {0}")]
    Other(BoxedMaybeRetryableError),
}

impl ReadError {
    pub fn retryable<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Other(Box::new(error.into_retryable()))
    }

    pub fn terminal<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Other(Box::new(error.into_terminal()))
    }
}

impl MaybeRetryableError for ReadError {
    fn retryable(&self) -> bool {
        match self {
            ReadError::NotFound(_) => false,
            ReadError::Other(err) => err.retryable(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The stored budget has a different resource version than the one written.
    #[error("version conflict: {0}")]
    VersionConflict(String),
    #[error("budget '{0}' not found")]
    NotFound(BudgetRef),
    #[error("other error: {0}")]
    Other(BoxedMaybeRetryableError),
}

impl WriteError {
    pub fn retryable<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Other(Box::new(error.into_retryable()))
    }

    pub fn terminal<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Other(Box::new(error.into_terminal()))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, WriteError::VersionConflict(_))
    }
}

impl MaybeRetryableError for WriteError {
    fn retryable(&self) -> bool {
        match self {
            WriteError::VersionConflict(_) => true,
            WriteError::NotFound(_) => false,
            WriteError::Other(err) => err.retryable(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache error: {0}")]
    Other(GenericError),
}

/// Authoritative store of budget objects. Implementations need to support linearizable reads
/// and compare-and-swap writes keyed on the resource version.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Reads the current budget, bypassing any cache.
    async fn get(&self, budget: &BudgetRef) -> Result<UnavailableBudget, ReadError>;

    /// Writes the status of the given budget if its resource version still matches the stored
    /// one, otherwise fails with [`WriteError::VersionConflict`]. Returns the persisted budget
    /// carrying its new resource version.
    async fn update_status(
        &self,
        budget: &UnavailableBudget,
    ) -> Result<UnavailableBudget, WriteError>;
}

/// Eventually consistent, watch-fed view of the authoritative store.
#[async_trait]
pub trait SecondaryCache: Send + Sync {
    async fn get(&self, budget: &BudgetRef) -> Result<Option<UnavailableBudget>, ReadError>;
}

/// Process-local cache holding the budgets this process persisted last.
pub trait LocalCache: Send + Sync {
    fn get(&self, budget: &BudgetRef) -> Result<Option<UnavailableBudget>, CacheError>;

    fn put(&self, budget: UnavailableBudget) -> Result<(), CacheError>;
}
