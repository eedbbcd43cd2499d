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
use std::sync::Arc;

use tracing::{error, trace, warn};

use pubguard_types::budget::UnavailableBudget;
use pubguard_types::errors::MaybeRetryableError;
use pubguard_types::identifiers::BudgetRef;

use crate::budget_store::{BudgetStore, LocalCache, ReadError, SecondaryCache};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("failed reading budget '{budget}' from the store: {source}")]
    StoreRead {
        budget: BudgetRef,
        #[source]
        source: ReadError,
    },
}

impl MaybeRetryableError for ResolveError {
    fn retryable(&self) -> bool {
        match self {
            ResolveError::StoreRead { source, .. } => source.retryable(),
        }
    }
}

/// Where a resolved snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SnapshotSource {
    /// The copy the caller presented, used when the local cache has no entry.
    #[display("request")]
    Request,
    #[display("local-cache")]
    LocalCache,
    #[display("secondary-cache")]
    SecondaryCache,
    #[display("store")]
    Store,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub budget: UnavailableBudget,
    pub source: SnapshotSource,
}

/// Produces the freshest known snapshot of a budget.
#[derive(Clone)]
pub struct FreshnessResolver {
    local: Arc<dyn LocalCache>,
    secondary: Arc<dyn SecondaryCache>,
    store: Arc<dyn BudgetStore>,
}

impl FreshnessResolver {
    pub fn new(
        local: Arc<dyn LocalCache>,
        secondary: Arc<dyn SecondaryCache>,
        store: Arc<dyn BudgetStore>,
    ) -> Self {
        Self {
            local,
            secondary,
            store,
        }
    }

    /// Resolves the snapshot to decrement.
    ///
    /// Without `force_authoritative` the local cache (or `requested` on a miss) is compared
    /// against the secondary cache and the one with the greater resource version wins; cache
    /// failures only get logged. With `force_authoritative` the store is read directly and
    /// neither cache is consulted.
    pub async fn resolve(
        &self,
        requested: &UnavailableBudget,
        force_authoritative: bool,
    ) -> Result<Resolved, ResolveError> {
        let reference = &requested.reference;

        if force_authoritative {
            return match self.store.get(reference).await {
                Ok(budget) => Ok(Resolved {
                    budget,
                    source: SnapshotSource::Store,
                }),
                Err(err) => {
                    error!(budget = %reference, %err, "Failed reading budget from the store");
                    Err(ResolveError::StoreRead {
                        budget: reference.clone(),
                        source: err,
                    })
                }
            };
        }

        let local = match self.local.get(reference) {
            Ok(Some(cached)) => Resolved {
                budget: cached,
                source: SnapshotSource::LocalCache,
            },
            Ok(None) => Resolved {
                budget: requested.clone(),
                source: SnapshotSource::Request,
            },
            Err(err) => {
                warn!(budget = %reference, %err, "Failed reading budget from the local cache");
                Resolved {
                    budget: requested.clone(),
                    source: SnapshotSource::Request,
                }
            }
        };

        let secondary = match self.secondary.get(reference).await {
            Ok(secondary) => secondary,
            Err(err) => {
                warn!(budget = %reference, %err, "Failed reading budget from the secondary cache");
                None
            }
        };

        let resolved = select_fresher(local, secondary);
        trace!(
            budget = %reference,
            source = %resolved.source,
            version = %resolved.budget.resource_version,
            "Resolved budget snapshot"
        );
        Ok(resolved)
    }
}

/// Picks the secondary snapshot only if its resource version is numerically greater than the
/// local one. Equal or incomparable versions keep the local snapshot.
fn select_fresher(local: Resolved, secondary: Option<UnavailableBudget>) -> Resolved {
    match secondary {
        Some(secondary)
            if secondary
                .resource_version
                .compare(&local.budget.resource_version)
                == Some(Ordering::Greater) =>
        {
            Resolved {
                budget: secondary,
                source: SnapshotSource::SecondaryCache,
            }
        }
        _ => local,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use googletest::prelude::*;
    use test_log::test;

    use pubguard_types::budget::BudgetStatus;
    use pubguard_types::ResourceVersion;

    use super::*;
    use crate::budget_store::{InMemoryBudgetStore, LocalBudgetCache};
    use crate::test_util::{FailingStore, LaggingCache};

    fn budget(version: u64, allowed: i32) -> UnavailableBudget {
        let mut budget = UnavailableBudget::new(
            BudgetRef::new("default", "web", "uid-1"),
            BudgetStatus {
                unavailable_allowed: allowed,
                ..Default::default()
            },
        );
        budget.resource_version = ResourceVersion::from(version);
        budget
    }

    fn resolver(
        local: Arc<LocalBudgetCache>,
        secondary: Arc<LaggingCache>,
        store: Arc<dyn BudgetStore>,
    ) -> FreshnessResolver {
        FreshnessResolver::new(local, secondary, store)
    }

    #[test(tokio::test)]
    async fn newer_secondary_snapshot_wins() -> googletest::Result<()> {
        let local = Arc::new(LocalBudgetCache::new(Duration::from_secs(60)));
        local.put(budget(5, 2))?;
        let secondary = Arc::new(LaggingCache::with(budget(7, 1)));
        let resolver = resolver(local, secondary, Arc::new(InMemoryBudgetStore::default()));

        let resolved = resolver.resolve(&budget(1, 3), false).await?;

        assert_that!(resolved.source, eq(SnapshotSource::SecondaryCache));
        assert_eq!(ResourceVersion::from(7), resolved.budget.resource_version);
        assert_that!(resolved.budget.status.unavailable_allowed, eq(1));
        Ok(())
    }

    #[test(tokio::test)]
    async fn local_snapshot_wins_ties_and_older_secondaries() -> googletest::Result<()> {
        let local = Arc::new(LocalBudgetCache::new(Duration::from_secs(60)));
        local.put(budget(5, 2))?;

        for secondary_version in [5, 4] {
            let secondary = Arc::new(LaggingCache::with(budget(secondary_version, 9)));
            let resolver = resolver(
                Arc::clone(&local),
                secondary,
                Arc::new(InMemoryBudgetStore::default()),
            );

            let resolved = resolver.resolve(&budget(1, 3), false).await?;
            assert_that!(resolved.source, eq(SnapshotSource::LocalCache));
            assert_that!(resolved.budget.status.unavailable_allowed, eq(2));
        }
        Ok(())
    }

    #[test(tokio::test)]
    async fn incomparable_versions_keep_local_snapshot() -> googletest::Result<()> {
        let local = Arc::new(LocalBudgetCache::new(Duration::from_secs(60)));
        let mut opaque = budget(0, 2);
        opaque.resource_version = ResourceVersion::new("opaque-token");
        local.put(opaque)?;
        let secondary = Arc::new(LaggingCache::with(budget(100, 0)));
        let resolver = resolver(local, secondary, Arc::new(InMemoryBudgetStore::default()));

        let resolved = resolver.resolve(&budget(1, 3), false).await?;
        assert_that!(resolved.source, eq(SnapshotSource::LocalCache));
        Ok(())
    }

    #[test(tokio::test)]
    async fn falls_back_to_request_on_cache_misses_and_failures() -> googletest::Result<()> {
        let local = Arc::new(LocalBudgetCache::new(Duration::from_secs(60)));
        let secondary = Arc::new(LaggingCache::failing());
        let resolver = resolver(local, secondary, Arc::new(InMemoryBudgetStore::default()));

        let resolved = resolver.resolve(&budget(3, 3), false).await?;
        assert_that!(resolved.source, eq(SnapshotSource::Request));
        assert_that!(resolved.budget.status.unavailable_allowed, eq(3));
        Ok(())
    }

    #[test(tokio::test)]
    async fn forced_read_bypasses_caches() -> googletest::Result<()> {
        let store = Arc::new(InMemoryBudgetStore::default());
        let stored = store.insert(budget(0, 0));
        let local = Arc::new(LocalBudgetCache::new(Duration::from_secs(60)));
        local.put(budget(50, 4))?;
        let secondary = Arc::new(LaggingCache::with(budget(60, 4)));
        let resolver = resolver(local, secondary, store);

        let resolved = resolver.resolve(&budget(1, 3), true).await?;
        assert_that!(resolved.source, eq(SnapshotSource::Store));
        assert_eq!(stored, resolved.budget);
        Ok(())
    }

    #[test(tokio::test)]
    async fn forced_read_failure_is_an_error() {
        let resolver = resolver(
            Arc::new(LocalBudgetCache::new(Duration::from_secs(60))),
            Arc::new(LaggingCache::empty()),
            Arc::new(FailingStore::retryable()),
        );

        let err = resolver.resolve(&budget(1, 3), true).await.unwrap_err();
        assert!(matches!(err, ResolveError::StoreRead { .. }));
        assert!(err.retryable());

        let resolver = resolver_with_store(Arc::new(InMemoryBudgetStore::default()));
        let err = resolver.resolve(&budget(1, 3), true).await.unwrap_err();
        assert!(!err.retryable());
    }

    fn resolver_with_store(store: Arc<dyn BudgetStore>) -> FreshnessResolver {
        resolver(
            Arc::new(LocalBudgetCache::new(Duration::from_secs(60))),
            Arc::new(LaggingCache::empty()),
            store,
        )
    }
}
