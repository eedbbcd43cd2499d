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

use metrics::counter;
use tracing::{debug, info, warn};

use pubguard_types::budget::{OperationKind, Subject, UnavailableBudget};
use pubguard_types::config::AdmissionOptions;
use pubguard_types::identifiers::BudgetUid;

use crate::budget_store::{BudgetStore, LocalBudgetCache, LocalCache, SecondaryCache};
use crate::decrement::DecrementError;
use crate::keyed_mutex::KeyedMutex;
use crate::metric_definitions::{ADMISSION_DECISIONS_TOTAL, DECISION_ALLOWED, DECISION_DENIED};
use crate::orchestrator::{AdmitError, Admitted, ConflictRetryOrchestrator};

/// Tells whether a subject currently counts as available.
pub trait ReadinessSource: Send + Sync {
    fn is_ready(&self, subject: &Subject) -> bool;
}

/// Trusts the readiness the subject was submitted with.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubjectReadiness;

impl ReadinessSource for SubjectReadiness {
    fn is_ready(&self, subject: &Subject) -> bool {
        subject.ready
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// Empty when allowed.
    pub reason: String,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reason {
    NotReady,
    Recorded,
    NoProtect,
    Admitted,
    DryRun,
    BudgetExhausted,
    TrackingSetTooLarge,
    Conflict,
    Error,
}

impl Reason {
    fn as_str(self) -> &'static str {
        match self {
            Reason::NotReady => "not-ready",
            Reason::Recorded => "recorded",
            Reason::NoProtect => "no-protect",
            Reason::Admitted => "admitted",
            Reason::DryRun => "dry-run",
            Reason::BudgetExhausted => "budget-exhausted",
            Reason::TrackingSetTooLarge => "tracking-set-too-large",
            Reason::Conflict => "conflict",
            Reason::Error => "error",
        }
    }
}

/// Decides whether a subject may become unavailable without violating its disruption budget.
///
/// Denials are regular decisions, never errors. Infrastructure failures degrade to denials
/// carrying the failure as reason.
pub struct AdmissionController {
    orchestrator: ConflictRetryOrchestrator,
    readiness: Arc<dyn ReadinessSource>,
    no_protect_annotation: String,
}

impl AdmissionController {
    pub fn new(
        options: &AdmissionOptions,
        locks: KeyedMutex<BudgetUid>,
        store: Arc<dyn BudgetStore>,
        secondary: Arc<dyn SecondaryCache>,
        local: Arc<dyn LocalCache>,
        readiness: Arc<dyn ReadinessSource>,
    ) -> Self {
        Self {
            orchestrator: ConflictRetryOrchestrator::new(options, locks, store, secondary, local),
            readiness,
            no_protect_annotation: options.no_protect_annotation.clone(),
        }
    }

    /// Creates a controller with its own lock registry and a [`LocalBudgetCache`] expiring
    /// entries after the configured TTL.
    pub fn with_local_cache(
        options: &AdmissionOptions,
        store: Arc<dyn BudgetStore>,
        secondary: Arc<dyn SecondaryCache>,
        readiness: Arc<dyn ReadinessSource>,
    ) -> Self {
        let local = Arc::new(LocalBudgetCache::new(options.local_cache_ttl.into()));
        Self::new(
            options,
            KeyedMutex::default(),
            store,
            secondary,
            local,
            readiness,
        )
    }

    /// Charges `subject` against `budget` unless it is exempt.
    ///
    /// `budget` is the caller's, possibly stale, view of the budget. Subjects which are not
    /// ready, carry the no-protect annotation or are already tracked by `budget` are allowed
    /// without touching the budget. With `dry_run` the budget is checked but never persisted.
    pub async fn check_admission(
        &self,
        budget: &UnavailableBudget,
        subject: &Subject,
        operation: OperationKind,
        dry_run: bool,
    ) -> AdmissionDecision {
        let reference = &budget.reference;
        let id = &subject.id;

        if !self.readiness.is_ready(subject) {
            debug!(budget = %reference, subject = %id, "Subject is not ready, skipping budget check");
            return record(AdmissionDecision::allow(), Reason::NotReady);
        }

        if subject.annotation(&self.no_protect_annotation) == Some("true") {
            debug!(budget = %reference, subject = %id, "Subject is not protected");
            return record(AdmissionDecision::allow(), Reason::NoProtect);
        }

        if budget.is_recorded(id) {
            debug!(budget = %reference, subject = %id, "Subject is already recorded");
            return record(AdmissionDecision::allow(), Reason::Recorded);
        }

        let outcome = self
            .orchestrator
            .admit_and_persist(budget, id, operation, dry_run)
            .await;

        let (decision, reason) = report(outcome.result);
        match reason {
            Reason::Admitted | Reason::DryRun | Reason::Recorded => {
                debug!(
                    budget = %reference,
                    subject = %id,
                    namespace = %subject.namespace,
                    %operation,
                    "Admitted subject"
                );
            }
            Reason::Conflict | Reason::Error => {
                warn!(
                    budget = %reference,
                    subject = %id,
                    namespace = %subject.namespace,
                    reason = %decision.reason,
                    "Denied subject"
                );
            }
            _ => {
                info!(
                    budget = %reference,
                    subject = %id,
                    namespace = %subject.namespace,
                    reason = %decision.reason,
                    "Denied subject"
                );
            }
        }
        record(decision, reason)
    }
}

/// Maps the orchestrator's result to the decision surfaced to callers and its metric label.
fn report(result: Result<Admitted, AdmitError>) -> (AdmissionDecision, Reason) {
    match result {
        Ok(Admitted::Persisted(_)) => (AdmissionDecision::allow(), Reason::Admitted),
        Ok(Admitted::DryRun(_)) => (AdmissionDecision::allow(), Reason::DryRun),
        Ok(Admitted::AlreadyRecorded(_)) => (AdmissionDecision::allow(), Reason::Recorded),
        Err(err @ AdmitError::Denied(DecrementError::BudgetExhausted { .. })) => {
            (AdmissionDecision::deny(err.to_string()), Reason::BudgetExhausted)
        }
        Err(err @ AdmitError::Denied(DecrementError::TrackingSetTooLarge { .. })) => {
            (AdmissionDecision::deny(err.to_string()), Reason::TrackingSetTooLarge)
        }
        Err(err @ AdmitError::RetriesExhausted { .. }) => {
            (AdmissionDecision::deny(err.to_string()), Reason::Conflict)
        }
        Err(err @ (AdmitError::Resolve(_) | AdmitError::Persist { .. })) => {
            (AdmissionDecision::deny(err.to_string()), Reason::Error)
        }
    }
}

fn record(decision: AdmissionDecision, reason: Reason) -> AdmissionDecision {
    let label = if decision.allowed {
        DECISION_ALLOWED
    } else {
        DECISION_DENIED
    };
    counter!(ADMISSION_DECISIONS_TOTAL, "decision" => label, "reason" => reason.as_str())
        .increment(1);
    decision
}
