// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, warn};

use pubguard_types::budget::{DisruptionKind, OperationKind, UnavailableBudget};
use pubguard_types::config::AdmissionOptions;
use pubguard_types::errors::MaybeRetryableError;
use pubguard_types::identifiers::{BudgetRef, BudgetUid, SubjectId};
use pubguard_types::retries::RetryPolicy;
use pubguard_types::time::MillisSinceEpoch;

use crate::budget_store::{BudgetStore, LocalCache, SecondaryCache, WriteError};
use crate::decrement::{DecrementEngine, DecrementError};
use crate::freshness::{FreshnessResolver, ResolveError};
use crate::keyed_mutex::KeyedMutex;
use crate::metric_definitions::{
    ADMISSION_CONFLICTS_TOTAL, ADMISSION_GET_DURATION, ADMISSION_PERSIST_DURATION,
};
use crate::retry::{AttemptOutcome, AttemptState, Step};

#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error(transparent)]
    Denied(#[from] DecrementError),
    #[error("timeout: couldn't update budget '{budget}' due to conflicts")]
    RetriesExhausted { budget: BudgetRef },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("failed persisting budget '{budget}': {source}")]
    Persist {
        budget: BudgetRef,
        #[source]
        source: WriteError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admitted {
    /// The decremented budget was persisted; carries the stored version.
    Persisted(UnavailableBudget),
    /// Dry run; carries the budget as it would have been persisted.
    DryRun(UnavailableBudget),
    /// The resolved snapshot already tracks the subject, nothing was charged.
    AlreadyRecorded(UnavailableBudget),
}

/// Cost accounting of one admission.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdmitStats {
    pub attempts: usize,
    pub conflicts: usize,
    pub get_cost: Duration,
    pub persist_cost: Duration,
}

#[derive(Debug)]
pub struct AdmitOutcome {
    pub result: Result<Admitted, AdmitError>,
    pub stats: AdmitStats,
}

enum AttemptError {
    Denied(DecrementError),
    Resolve(ResolveError),
    Conflict(WriteError),
    Persist(WriteError),
}

impl AttemptError {
    fn outcome(&self) -> AttemptOutcome {
        match self {
            AttemptError::Conflict(_) => AttemptOutcome::Conflict,
            AttemptError::Resolve(err) if err.retryable() => AttemptOutcome::TransientReadFailure,
            AttemptError::Denied(_) | AttemptError::Resolve(_) | AttemptError::Persist(_) => {
                AttemptOutcome::Terminal
            }
        }
    }

    fn into_admit_error(self, budget: &BudgetRef, state: AttemptState) -> AdmitError {
        match self {
            AttemptError::Denied(err) => AdmitError::Denied(err),
            AttemptError::Resolve(err) => AdmitError::Resolve(err),
            AttemptError::Conflict(_) if state == AttemptState::Exhausted => {
                AdmitError::RetriesExhausted {
                    budget: budget.clone(),
                }
            }
            AttemptError::Conflict(source) | AttemptError::Persist(source) => {
                AdmitError::Persist {
                    budget: budget.clone(),
                    source,
                }
            }
        }
    }
}

/// Charges subjects against budgets, retrying on version conflicts.
///
/// Attempts against the same budget uid are serialized through a [`KeyedMutex`]; the store's
/// version check catches writers in other processes. The first attempt reads its snapshot from
/// the caches, every attempt after a conflict reads it from the store.
pub struct ConflictRetryOrchestrator {
    locks: KeyedMutex<BudgetUid>,
    resolver: FreshnessResolver,
    engine: DecrementEngine,
    store: Arc<dyn BudgetStore>,
    local: Arc<dyn LocalCache>,
    retry_policy: RetryPolicy,
}

impl ConflictRetryOrchestrator {
    pub fn new(
        options: &AdmissionOptions,
        locks: KeyedMutex<BudgetUid>,
        store: Arc<dyn BudgetStore>,
        secondary: Arc<dyn SecondaryCache>,
        local: Arc<dyn LocalCache>,
    ) -> Self {
        Self {
            locks,
            resolver: FreshnessResolver::new(Arc::clone(&local), secondary, Arc::clone(&store)),
            engine: DecrementEngine::new(options.max_tracked_subjects()),
            store,
            local,
            retry_policy: options.conflict_retry.clone(),
        }
    }

    pub async fn admit_and_persist(
        &self,
        budget: &UnavailableBudget,
        subject: &SubjectId,
        operation: OperationKind,
        dry_run: bool,
    ) -> AdmitOutcome {
        let mut stats = AdmitStats::default();
        let mut delays = self.retry_policy.iter();
        let mut state = AttemptState::FirstAttempt;

        let result = loop {
            stats.attempts += 1;
            let result = self
                .attempt(state, budget, subject, operation, dry_run, &mut stats)
                .await;

            let outcome = match &result {
                Ok(_) => AttemptOutcome::Succeeded,
                Err(err) => err.outcome(),
            };
            let backoff = if outcome.is_retryable() {
                delays.next()
            } else {
                None
            };

            match state.step(outcome, backoff) {
                Step::Finish => break result,
                Step::GiveUp { next } => {
                    state = next;
                    break result;
                }
                Step::Retry { next, backoff } => {
                    debug!(
                        budget = %budget.reference,
                        %subject,
                        attempt = next.attempt(),
                        "Budget changed concurrently; retrying from the store in '{}'",
                        humantime::format_duration(backoff)
                    );
                    tokio::time::sleep(backoff).await;
                    state = next;
                }
            }
        };

        if state == AttemptState::Exhausted {
            warn!(
                budget = %budget.reference,
                %subject,
                attempts = stats.attempts,
                "Giving up, retry attempts exhausted"
            );
        }
        let result = result.map_err(|err| err.into_admit_error(&budget.reference, state));

        histogram!(ADMISSION_GET_DURATION).record(stats.get_cost);
        histogram!(ADMISSION_PERSIST_DURATION).record(stats.persist_cost);
        debug!(
            budget = %budget.reference,
            %subject,
            attempts = stats.attempts,
            conflicts = stats.conflicts,
            get_cost = ?stats.get_cost,
            persist_cost = ?stats.persist_cost,
            "Admission finished"
        );

        AdmitOutcome { result, stats }
    }

    async fn attempt(
        &self,
        state: AttemptState,
        requested: &UnavailableBudget,
        subject: &SubjectId,
        operation: OperationKind,
        dry_run: bool,
        stats: &mut AdmitStats,
    ) -> Result<Admitted, AttemptError> {
        let reference = &requested.reference;
        let _guard = self.locks.lock(reference.uid.clone()).await;

        let start = Instant::now();
        let resolved = self
            .resolver
            .resolve(requested, state.force_authoritative())
            .await;
        stats.get_cost += start.elapsed();
        let resolved = resolved.map_err(AttemptError::Resolve)?;

        if resolved.budget.is_recorded(subject) {
            debug!(
                budget = %reference,
                %subject,
                source = %resolved.source,
                "Subject is already recorded"
            );
            return Ok(Admitted::AlreadyRecorded(resolved.budget));
        }

        let decremented = self
            .engine
            .apply(resolved.budget, subject, operation, MillisSinceEpoch::now())
            .map_err(AttemptError::Denied)?;

        if dry_run {
            debug!(budget = %reference, %subject, "Operation is a dry run");
            return Ok(Admitted::DryRun(decremented));
        }

        let status = &decremented.status;
        debug!(
            budget = %reference,
            disrupted = status.tracked.count_of(DisruptionKind::DisruptedByOther),
            unavailable = status.tracked.count_of(DisruptionKind::UnavailableByUpdate),
            total_replicas = status.total_replicas,
            desired_available = status.desired_available,
            current_available = status.current_available,
            unavailable_allowed = status.unavailable_allowed,
            "Updating budget status"
        );

        let start = Instant::now();
        let persisted = self.store.update_status(&decremented).await;
        stats.persist_cost += start.elapsed();

        match persisted {
            Ok(persisted) => {
                if let Err(err) = self.local.put(persisted.clone()) {
                    warn!(budget = %reference, %err, "Failed adding budget to the local cache");
                }
                Ok(Admitted::Persisted(persisted))
            }
            Err(err) if err.is_conflict() => {
                stats.conflicts += 1;
                counter!(ADMISSION_CONFLICTS_TOTAL).increment(1);
                debug!(budget = %reference, %err, "Concurrent budget update");
                Err(AttemptError::Conflict(err))
            }
            Err(err) => Err(AttemptError::Persist(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use googletest::prelude::*;
    use test_log::test;

    use pubguard_types::budget::BudgetStatus;
    use pubguard_types::config::AdmissionOptionsBuilder;
    use pubguard_types::ResourceVersion;

    use super::*;
    use crate::budget_store::{InMemoryBudgetStore, LocalBudgetCache};
    use crate::test_util::{ConflictingStore, FailingStore, LaggingCache};

    fn options(max_attempts: usize) -> AdmissionOptions {
        AdmissionOptionsBuilder::default()
            .conflict_retry(RetryPolicy::fixed_delay(
                Duration::from_millis(500),
                0.1,
                Some(max_attempts),
            ))
            .build()
            .unwrap()
    }

    fn budget(allowed: i32) -> UnavailableBudget {
        UnavailableBudget::new(
            BudgetRef::new("default", "web", "uid-1"),
            BudgetStatus {
                total_replicas: 4,
                desired_available: 2,
                current_available: 4,
                unavailable_allowed: allowed,
                ..Default::default()
            },
        )
    }

    fn orchestrator(
        options: &AdmissionOptions,
        store: Arc<dyn BudgetStore>,
        secondary: Arc<dyn SecondaryCache>,
        local: Arc<LocalBudgetCache>,
    ) -> ConflictRetryOrchestrator {
        ConflictRetryOrchestrator::new(options, KeyedMutex::default(), store, secondary, local)
    }

    #[test(tokio::test(start_paused = true))]
    async fn persists_and_writes_back() -> googletest::Result<()> {
        let store = Arc::new(InMemoryBudgetStore::default());
        let stored = store.insert(budget(2));
        let local = Arc::new(LocalBudgetCache::new(Duration::from_secs(5)));
        let orchestrator = orchestrator(
            &options(4),
            store.clone(),
            store.clone(),
            Arc::clone(&local),
        );

        let outcome = orchestrator
            .admit_and_persist(&stored, &"pod-a".into(), OperationKind::Update, false)
            .await;

        let Ok(Admitted::Persisted(persisted)) = outcome.result else {
            panic!("expected persisted admission, got {:?}", outcome.result);
        };
        assert_that!(persisted.status.unavailable_allowed, eq(1));
        assert_eq!(ResourceVersion::from(2), persisted.resource_version);
        assert_eq!(Some(persisted.clone()), store.snapshot(&stored.reference));
        assert_eq!(Some(persisted), local.get(&stored.reference)?);
        assert_that!(outcome.stats.attempts, eq(1));
        assert_that!(outcome.stats.conflicts, eq(0));
        Ok(())
    }

    #[test(tokio::test(start_paused = true))]
    async fn denial_is_terminal() {
        let store = Arc::new(InMemoryBudgetStore::default());
        let stored = store.insert(budget(0));
        let orchestrator = orchestrator(
            &options(4),
            store.clone(),
            store.clone(),
            Arc::new(LocalBudgetCache::new(Duration::from_secs(5))),
        );

        let outcome = orchestrator
            .admit_and_persist(&stored, &"pod-a".into(), OperationKind::Delete, false)
            .await;

        assert!(matches!(
            outcome.result,
            Err(AdmitError::Denied(DecrementError::BudgetExhausted { .. }))
        ));
        assert_eq!(1, outcome.stats.attempts);
        assert_eq!(0, store.status_writes());
    }

    #[test(tokio::test(start_paused = true))]
    async fn conflict_retries_from_the_store() {
        let inner = Arc::new(InMemoryBudgetStore::default());
        let stored = inner.insert(budget(3));
        // another writer charges a subject right before our first write
        let store = Arc::new(ConflictingStore::new(Arc::clone(&inner), 1, |status| {
            status.unavailable_allowed -= 1;
        }));
        let orchestrator = orchestrator(
            &options(4),
            store.clone(),
            Arc::new(LaggingCache::empty()),
            Arc::new(LocalBudgetCache::new(Duration::from_secs(5))),
        );

        let outcome = orchestrator
            .admit_and_persist(&stored, &"pod-a".into(), OperationKind::Update, false)
            .await;

        let Ok(Admitted::Persisted(persisted)) = outcome.result else {
            panic!("expected persisted admission, got {:?}", outcome.result);
        };
        // 3 - 1 (concurrent writer) - 1 (us)
        assert_eq!(1, persisted.status.unavailable_allowed);
        assert_eq!(2, outcome.stats.attempts);
        assert_eq!(1, outcome.stats.conflicts);
        assert_eq!(1, store.forced_reads());
    }

    #[test(tokio::test(start_paused = true))]
    async fn exhausted_retries_time_out() {
        let inner = Arc::new(InMemoryBudgetStore::default());
        let stored = inner.insert(budget(100));
        let store = Arc::new(ConflictingStore::new(Arc::clone(&inner), usize::MAX, |_| {}));
        let orchestrator = orchestrator(
            &options(4),
            store,
            Arc::new(LaggingCache::empty()),
            Arc::new(LocalBudgetCache::new(Duration::from_secs(5))),
        );

        let started = Instant::now();
        let outcome = orchestrator
            .admit_and_persist(&stored, &"pod-a".into(), OperationKind::Update, false)
            .await;

        assert!(matches!(
            outcome.result,
            Err(AdmitError::RetriesExhausted { .. })
        ));
        assert_eq!(4, outcome.stats.attempts);
        assert_eq!(4, outcome.stats.conflicts);
        // three fixed, jittered backoffs without growth
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1500), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(1650), "waited {waited:?}");
    }

    #[test(tokio::test(start_paused = true))]
    async fn dry_run_does_not_persist() {
        let store = Arc::new(InMemoryBudgetStore::default());
        let stored = store.insert(budget(1));
        let local = Arc::new(LocalBudgetCache::new(Duration::from_secs(5)));
        let orchestrator = orchestrator(
            &options(4),
            store.clone(),
            store.clone(),
            Arc::clone(&local),
        );

        let outcome = orchestrator
            .admit_and_persist(&stored, &"pod-a".into(), OperationKind::Update, true)
            .await;

        let Ok(Admitted::DryRun(would_persist)) = outcome.result else {
            panic!("expected dry run admission, got {:?}", outcome.result);
        };
        assert_eq!(0, would_persist.status.unavailable_allowed);
        assert_eq!(Some(stored.clone()), store.snapshot(&stored.reference));
        assert_eq!(0, store.status_writes());
        assert!(local.is_empty());
    }

    #[test(tokio::test(start_paused = true))]
    async fn recorded_in_fresher_snapshot_is_not_charged_again() {
        let store = Arc::new(InMemoryBudgetStore::default());
        let stale = store.insert(budget(2));
        let orchestrator = orchestrator(
            &options(4),
            store.clone(),
            store.clone(),
            Arc::new(LocalBudgetCache::new(Duration::from_secs(5))),
        );

        let first = orchestrator
            .admit_and_persist(&stale, &"pod-a".into(), OperationKind::Update, false)
            .await;
        assert!(matches!(first.result, Ok(Admitted::Persisted(_))));

        let second = orchestrator
            .admit_and_persist(&stale, &"pod-a".into(), OperationKind::Update, false)
            .await;
        assert!(matches!(second.result, Ok(Admitted::AlreadyRecorded(_))));
        assert_eq!(1, store.status_writes());
        assert_eq!(
            1,
            store
                .snapshot(&stale.reference)
                .unwrap()
                .status
                .unavailable_allowed
        );
    }

    #[test(tokio::test(start_paused = true))]
    async fn transient_store_failures_consume_attempts() {
        let inner = Arc::new(InMemoryBudgetStore::default());
        let stored = inner.insert(budget(5));
        // the first write conflicts, every forced read afterwards fails
        let conflicting = Arc::new(ConflictingStore::new(Arc::clone(&inner), 1, |_| {}));
        let store = Arc::new(FailingStore::retryable_reads_of(conflicting));
        let orchestrator = orchestrator(
            &options(3),
            store,
            Arc::new(LaggingCache::empty()),
            Arc::new(LocalBudgetCache::new(Duration::from_secs(5))),
        );

        let outcome = orchestrator
            .admit_and_persist(&stored, &"pod-a".into(), OperationKind::Update, false)
            .await;

        assert!(matches!(outcome.result, Err(AdmitError::Resolve(_))));
        assert_eq!(3, outcome.stats.attempts);
        assert_eq!(1, outcome.stats.conflicts);
    }

    #[test(tokio::test(start_paused = true))]
    async fn other_persist_failures_are_terminal() {
        let stored = budget(5);
        let orchestrator = orchestrator(
            &options(4),
            Arc::new(FailingStore::retryable()),
            Arc::new(LaggingCache::empty()),
            Arc::new(LocalBudgetCache::new(Duration::from_secs(5))),
        );

        let outcome = orchestrator
            .admit_and_persist(&stored, &"pod-a".into(), OperationKind::Update, false)
            .await;

        assert!(matches!(outcome.result, Err(AdmitError::Persist { .. })));
        assert_eq!(1, outcome.stats.attempts);
    }
}
