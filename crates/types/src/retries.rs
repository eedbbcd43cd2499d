// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry policies for operations racing other writers of the same object.

use std::num::NonZeroUsize;
use std::time::Duration;

use rand::Rng;
use serde_with::serde_as;

const DEFAULT_JITTER_MULTIPLIER: f32 = 0.1;

/// This struct represents the policy to execute retries.
///
/// Unlike a plain backoff iterator, `max_attempts` counts *all* attempts including the first
/// one, so a policy with `max_attempts = 4` yields three delays:
///
/// ```rust
/// use std::time::Duration;
/// use pubguard_types::retries::RetryPolicy;
///
/// let policy = RetryPolicy::fixed_delay(Duration::from_millis(100), 0.0, Some(4));
/// let delays: Vec<_> = policy.iter().collect();
/// assert_eq!(vec![Duration::from_millis(100); 3], delays);
/// ```
#[serde_as]
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case"
)]
pub enum RetryPolicy {
    /// # None
    ///
    /// A single attempt, no retries.
    #[default]
    None,
    /// # Fixed delay
    ///
    /// Retry with a fixed, jittered delay. Delays never grow.
    FixedDelay {
        /// # Interval
        ///
        /// Interval between attempts. Can be configured using the
        /// [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
        #[serde_as(as = "serde_with::DisplayFromStr")]
        interval: humantime::Duration,
        /// # Jitter
        ///
        /// Up to `jitter * interval` is added to every delay.
        #[serde(default = "default_jitter")]
        jitter: f32,
        /// # Max attempts
        ///
        /// Number of attempts, including the first one, before giving up. Infinite if unset.
        max_attempts: Option<NonZeroUsize>,
    },
}

fn default_jitter() -> f32 {
    DEFAULT_JITTER_MULTIPLIER
}

impl RetryPolicy {
    /// `Some(0)` attempts is treated as a single attempt, [`None`] retries forever.
    pub fn fixed_delay(interval: Duration, jitter: f32, max_attempts: Option<usize>) -> Self {
        Self::FixedDelay {
            interval: interval.into(),
            jitter,
            max_attempts: max_attempts
                .map(|max| NonZeroUsize::new(max).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Total number of attempts allowed, [`None`] if unbounded.
    pub fn max_attempts(&self) -> Option<NonZeroUsize> {
        match self {
            RetryPolicy::None => NonZeroUsize::new(1),
            RetryPolicy::FixedDelay { max_attempts, .. } => *max_attempts,
        }
    }

    pub fn iter(&self) -> RetryIter<'_> {
        RetryIter {
            policy: self,
            attempts: 1,
        }
    }
}

/// Yields the delay to wait before each further attempt.
#[derive(Debug)]
pub struct RetryIter<'a> {
    policy: &'a RetryPolicy,
    attempts: usize,
}

impl RetryIter<'_> {
    /// The number of attempts accounted for so far, including the first one.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Remaining attempts, [`None`] if unbounded.
    pub fn remaining_attempts(&self) -> Option<usize> {
        self.policy
            .max_attempts()
            .map(|max| max.get().saturating_sub(self.attempts))
    }
}

impl Iterator for RetryIter<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        match self.policy {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay {
                interval,
                jitter,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|limit| self.attempts >= limit.get()) {
                    None
                } else {
                    self.attempts += 1;
                    Some(with_jitter(**interval, *jitter))
                }
            }
        }
    }
}

/// Adds a random jitter in `[0, max_multiplier * duration]` to the given duration.
pub fn with_jitter(duration: Duration, max_multiplier: f32) -> Duration {
    if max_multiplier <= 0.0 {
        return duration;
    }
    let max_jitter = duration.mul_f32(max_multiplier);
    if max_jitter.is_zero() {
        duration
    } else {
        duration + rand::rng().random_range(Duration::ZERO..=max_jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within_jitter(expected: Duration, actual: Duration, max_multiplier: f32) -> bool {
        actual >= expected && actual <= expected + expected.mul_f32(max_multiplier)
    }

    #[test]
    fn no_retry_policy() {
        assert_eq!(0, RetryPolicy::None.iter().count());
        assert_eq!(Some(1), RetryPolicy::None.max_attempts().map(NonZeroUsize::get));
    }

    #[test]
    fn fixed_delay_counts_the_first_attempt() {
        let policy = RetryPolicy::fixed_delay(Duration::from_millis(500), 0.1, Some(4));
        let delays: Vec<_> = policy.iter().collect();

        assert_eq!(3, delays.len());
        for delay in delays {
            assert!(within_jitter(Duration::from_millis(500), delay, 0.1));
        }
    }

    #[test]
    fn remaining_attempts() {
        let policy = RetryPolicy::fixed_delay(Duration::from_millis(10), 0.0, Some(3));
        let mut iter = policy.iter();
        assert_eq!(Some(2), iter.remaining_attempts());
        iter.next();
        assert_eq!(Some(1), iter.remaining_attempts());
        iter.next();
        assert_eq!(Some(0), iter.remaining_attempts());
        assert_eq!(None, iter.next());
        assert_eq!(3, iter.attempts());
    }

    #[test]
    fn zero_attempts_mean_no_retries() {
        let policy = RetryPolicy::fixed_delay(Duration::from_millis(10), 0.0, Some(0));
        assert_eq!(Some(1), policy.max_attempts().map(NonZeroUsize::get));
        assert_eq!(0, policy.iter().count());
    }

    #[test]
    fn unbounded_policy() {
        let policy = RetryPolicy::fixed_delay(Duration::from_millis(10), 0.0, None);
        assert_eq!(None, policy.max_attempts());
        assert_eq!(100, policy.iter().take(100).count());
    }

    #[test]
    fn zero_jitter_is_exact() {
        assert_eq!(
            Duration::from_millis(500),
            with_jitter(Duration::from_millis(500), 0.0)
        );
    }

    #[test]
    fn deserialize_humantime_interval() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"type": "fixed-delay", "interval": "250ms", "max-attempts": 2}"#,
        )
        .unwrap();
        assert_eq!(
            RetryPolicy::fixed_delay(Duration::from_millis(250), DEFAULT_JITTER_MULTIPLIER, Some(2)),
            policy
        );
    }
}
