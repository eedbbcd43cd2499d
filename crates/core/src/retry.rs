// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry policy of the admission path, free of any I/O.

use std::time::Duration;

/// Position of an admission in its retry cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Nothing has conflicted yet; snapshots come from the caches.
    FirstAttempt,
    /// A previous attempt conflicted; snapshots must be read from the store. `attempt` counts
    /// from 2.
    Refreshing { attempt: usize },
    /// The attempt budget is used up.
    Exhausted,
}

/// Result of a single attempt as seen by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Persisted, or validated in dry-run mode.
    Succeeded,
    /// Denied or failed for a reason that retrying cannot fix.
    Terminal,
    /// The write lost against a concurrent writer.
    Conflict,
    /// The snapshot could not be read, but reading again may succeed.
    TransientReadFailure,
}

impl AttemptOutcome {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            AttemptOutcome::Conflict | AttemptOutcome::TransientReadFailure
        )
    }
}

/// What to do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Stop and report the outcome of the last attempt.
    Finish,
    /// Wait for `backoff`, then run another attempt in state `next`.
    Retry { next: AttemptState, backoff: Duration },
    /// Stop, the retry budget is exhausted. `next` is always [`AttemptState::Exhausted`].
    GiveUp { next: AttemptState },
}

impl AttemptState {
    /// Whether the snapshot of this attempt must bypass the caches.
    pub fn force_authoritative(self) -> bool {
        matches!(self, AttemptState::Refreshing { .. })
    }

    /// 1-based number of the attempt in this state, 0 once exhausted.
    pub fn attempt(self) -> usize {
        match self {
            AttemptState::FirstAttempt => 1,
            AttemptState::Refreshing { attempt } => attempt,
            AttemptState::Exhausted => 0,
        }
    }

    /// Transition after an attempt finished with `outcome`. `backoff` is the delay the retry
    /// policy grants for another attempt, [`None`] if it grants none.
    pub fn step(self, outcome: AttemptOutcome, backoff: Option<Duration>) -> Step {
        if !outcome.is_retryable() || self == AttemptState::Exhausted {
            return Step::Finish;
        }

        match backoff {
            Some(backoff) => Step::Retry {
                next: AttemptState::Refreshing {
                    attempt: self.attempt() + 1,
                },
                backoff,
            },
            None => Step::GiveUp {
                next: AttemptState::Exhausted,
            },
        }
    }
}
