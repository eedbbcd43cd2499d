// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Admission-control core of the unavailable budget mechanism.
//!
//! [`AdmissionController::check_admission`] decides whether a subject may become unavailable
//! without exceeding the budget it belongs to and, if so, records the decision in the
//! authoritative store using optimistic concurrency.

mod admission;
pub mod budget_store;
mod decrement;
mod freshness;
mod keyed_mutex;
pub mod metric_definitions;
mod orchestrator;
mod retry;
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use admission::{AdmissionController, AdmissionDecision, ReadinessSource, SubjectReadiness};
pub use decrement::{DecrementEngine, DecrementError};
pub use freshness::{FreshnessResolver, ResolveError, Resolved, SnapshotSource};
pub use keyed_mutex::{KeyedMutex, KeyedMutexGuard};
pub use orchestrator::{AdmitError, AdmitOutcome, AdmitStats, Admitted, ConflictRetryOrchestrator};
pub use retry::{AttemptOutcome, AttemptState, Step};
