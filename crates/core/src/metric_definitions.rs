// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{Unit, describe_counter, describe_histogram};

// values of label `decision` in ADMISSION_DECISIONS_TOTAL
pub const DECISION_ALLOWED: &str = "allowed";
pub const DECISION_DENIED: &str = "denied";

pub(crate) const ADMISSION_DECISIONS_TOTAL: &str = "pubguard.admission.decisions.total";
pub(crate) const ADMISSION_CONFLICTS_TOTAL: &str = "pubguard.admission.conflicts.total";
pub(crate) const ADMISSION_GET_DURATION: &str = "pubguard.admission.get_duration.seconds";
pub(crate) const ADMISSION_PERSIST_DURATION: &str = "pubguard.admission.persist_duration.seconds";

pub fn describe_metrics() {
    describe_counter!(
        ADMISSION_DECISIONS_TOTAL,
        Unit::Count,
        "Admission decisions, labelled by decision and reason"
    );

    describe_counter!(
        ADMISSION_CONFLICTS_TOTAL,
        Unit::Count,
        "Version conflicts observed while persisting budgets"
    );

    describe_histogram!(
        ADMISSION_GET_DURATION,
        Unit::Seconds,
        "Time spent resolving budget snapshots per admission in seconds"
    );

    describe_histogram!(
        ADMISSION_PERSIST_DURATION,
        Unit::Seconds,
        "Time spent persisting budgets per admission in seconds"
    );
}
