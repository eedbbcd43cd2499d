// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::budget::MAX_UNAVAILABLE_POD_SIZE;
use crate::retries::RetryPolicy;

/// Annotation which exempts a subject from budget protection, e.g. for forced deletions.
pub const NO_PROTECT_ANNOTATION: &str = "pub.kruise.io/no-protect";

/// # Admission options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct AdmissionOptions {
    /// # Max tracked subjects
    ///
    /// Upper bound of disrupted plus unavailable subjects a budget may track. Admissions
    /// are denied once a budget tracks this many subjects.
    max_tracked_subjects: NonZeroUsize,

    /// # Conflict retry policy
    ///
    /// Policy used when persisting a decremented budget fails because of a concurrent write.
    pub conflict_retry: RetryPolicy,

    /// # Local cache TTL
    ///
    /// Entries of the local write-back cache older than this are ignored. Can be configured
    /// using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub local_cache_ttl: humantime::Duration,

    /// # No-protect annotation
    ///
    /// Subjects carrying this annotation with value `"true"` bypass the budget.
    pub no_protect_annotation: String,
}

impl AdmissionOptions {
    pub fn max_tracked_subjects(&self) -> usize {
        self.max_tracked_subjects.get()
    }
}

impl Default for AdmissionOptions {
    fn default() -> Self {
        Self {
            max_tracked_subjects: NonZeroUsize::new(MAX_UNAVAILABLE_POD_SIZE)
                .expect("non-zero tracking bound"),
            conflict_retry: RetryPolicy::fixed_delay(Duration::from_millis(500), 0.1, Some(4)),
            local_cache_ttl: Duration::from_secs(5).into(),
            no_protect_annotation: NO_PROTECT_ANNOTATION.to_owned(),
        }
    }
}
