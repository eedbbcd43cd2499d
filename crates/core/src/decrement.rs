// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use tracing::debug;

use pubguard_types::budget::{OperationKind, UnavailableBudget};
use pubguard_types::identifiers::{BudgetRef, SubjectId};
use pubguard_types::time::MillisSinceEpoch;

/// Reasons for refusing to charge a subject against a budget. These are expected denials,
/// not failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecrementError {
    #[error("budget '{budget}' is forbidden: unavailable allowed is exhausted")]
    BudgetExhausted { budget: BudgetRef },
    #[error(
        "budget '{budget}' is forbidden: {tracked} disrupted and unavailable subjects reached the \
         limit of {limit}, too many unavailable subjects not yet confirmed by the budget controller"
    )]
    TrackingSetTooLarge {
        budget: BudgetRef,
        tracked: usize,
        limit: usize,
    },
}

/// Validates a budget snapshot and charges one subject against it.
#[derive(Debug, Clone, Copy)]
pub struct DecrementEngine {
    max_tracked_subjects: usize,
}

impl DecrementEngine {
    pub fn new(max_tracked_subjects: usize) -> Self {
        Self {
            max_tracked_subjects,
        }
    }

    /// Decrements `unavailable_allowed` and records `subject` as of `now`, into the unavailable
    /// set for updates and into the disrupted set otherwise. The first failing check wins:
    /// an exhausted budget, then a full tracking set.
    pub fn apply(
        &self,
        mut snapshot: UnavailableBudget,
        subject: &SubjectId,
        operation: OperationKind,
        now: MillisSinceEpoch,
    ) -> Result<UnavailableBudget, DecrementError> {
        if snapshot.status.unavailable_allowed <= 0 {
            return Err(DecrementError::BudgetExhausted {
                budget: snapshot.reference,
            });
        }

        let tracked = snapshot.status.tracked.len();
        if tracked >= self.max_tracked_subjects {
            return Err(DecrementError::TrackingSetTooLarge {
                budget: snapshot.reference,
                tracked,
                limit: self.max_tracked_subjects,
            });
        }

        snapshot.status.unavailable_allowed -= 1;
        let kind = operation.disruption_kind();
        snapshot.status.tracked.record(subject.clone(), kind, now);
        debug!(
            budget = %snapshot.reference,
            %subject,
            "Subject is recorded as {kind}"
        );

        Ok(snapshot)
    }
}
