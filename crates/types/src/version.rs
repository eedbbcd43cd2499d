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
use std::fmt;

/// Opaque optimistic-concurrency token assigned by the authoritative store.
///
/// Tokens are strings on the wire. They are totally ordered only when both sides
/// parse as unsigned integers, which is the case for every store this crate talks to,
/// but callers must not rely on it: [`ResourceVersion::compare`] returns [`None`] when
/// the tokens are not comparable.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    derive_more::From,
)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    /// The version of an object that was never persisted.
    pub const EMPTY: ResourceVersion = ResourceVersion(String::new());

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Numeric value of the token, if it has one.
    pub fn as_numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    /// Compares two tokens numerically. Returns [`None`] if either token is not numeric.
    pub fn compare(&self, other: &ResourceVersion) -> Option<Ordering> {
        Some(self.as_numeric()?.cmp(&other.as_numeric()?))
    }

    /// Returns the token which follows this one. Non-numeric tokens restart at `1`.
    pub fn next(&self) -> ResourceVersion {
        let next = self.as_numeric().map(|v| v.saturating_add(1)).unwrap_or(1);
        ResourceVersion(next.to_string())
    }
}

impl From<u64> for ResourceVersion {
    fn from(value: u64) -> Self {
        ResourceVersion(value.to_string())
    }
}

impl From<&str> for ResourceVersion {
    fn from(value: &str) -> Self {
        ResourceVersion(value.to_owned())
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<none>")
        } else {
            f.write_str(&self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_comparison() {
        let five = ResourceVersion::from(5);
        let seven = ResourceVersion::from("7");

        assert_eq!(Some(Ordering::Less), five.compare(&seven));
        assert_eq!(Some(Ordering::Equal), seven.compare(&ResourceVersion::from(7)));
        // lexicographic order would get this wrong
        assert_eq!(
            Some(Ordering::Greater),
            ResourceVersion::from(10).compare(&ResourceVersion::from(9))
        );
    }

    #[test]
    fn opaque_tokens_are_not_comparable() {
        let opaque = ResourceVersion::new("a1b2");
        assert_eq!(None, opaque.compare(&ResourceVersion::from(1)));
        assert_eq!(None, ResourceVersion::EMPTY.compare(&ResourceVersion::from(1)));
    }

    #[test]
    fn next_version() {
        assert_eq!(ResourceVersion::from(1), ResourceVersion::EMPTY.next());
        assert_eq!(ResourceVersion::from(43), ResourceVersion::from(42).next());
    }
}
