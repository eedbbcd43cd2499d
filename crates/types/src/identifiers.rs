// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

/// Immutable unique id of a budget object. A deleted and re-created budget gets a new uid
/// even if namespace and name stay the same.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    derive_more::Display,
    derive_more::From,
)]
#[serde(transparent)]
pub struct BudgetUid(String);

impl BudgetUid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BudgetUid {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Reference to a budget object.
///
/// Equality and hashing only consider `namespace` and `name`, which is what stores and caches
/// are keyed by. The `uid` is used for lock striping.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BudgetRef {
    pub namespace: String,
    pub name: String,
    pub uid: BudgetUid,
}

impl BudgetRef {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<BudgetUid>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }
}

impl PartialEq for BudgetRef {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl Eq for BudgetRef {}

impl std::hash::Hash for BudgetRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for BudgetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of a subject (a pod) within the namespace of its budget.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    derive_more::Display,
    derive_more::From,
)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubjectId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}
