// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod admission;

pub use admission::*;

use serde::{Deserialize, Serialize};

use crate::retries::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum InvalidConfigurationError {
    #[error("conflict-retry jitter must be within [0, 1], got {0}")]
    Jitter(f32),
    #[error("conflict-retry interval must not be zero when retries are enabled")]
    ZeroInterval,
    #[error("no-protect-annotation must not be empty")]
    EmptyAnnotation,
}

/// Configuration of the admission components.
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct Configuration {
    pub admission: AdmissionOptions,

    /// # Logging Filter
    ///
    /// Log filter configuration. Can be overridden by the `RUST_LOG` environment variable.
    pub log_filter: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            admission: AdmissionOptions::default(),
            log_filter: "warn,pubguard=info".to_owned(),
        }
    }
}

impl Configuration {
    pub fn validate(&self) -> Result<(), InvalidConfigurationError> {
        if let RetryPolicy::FixedDelay {
            interval,
            jitter,
            max_attempts,
        } = &self.admission.conflict_retry
        {
            if !(0.0..=1.0).contains(jitter) {
                return Err(InvalidConfigurationError::Jitter(*jitter));
            }
            if interval.is_zero() && max_attempts.is_none_or(|max| max.get() > 1) {
                return Err(InvalidConfigurationError::ZeroInterval);
            }
        }

        if self.admission.no_protect_annotation.is_empty() {
            return Err(InvalidConfigurationError::EmptyAnnotation);
        }

        Ok(())
    }
}
