// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The unavailable budget object and the subjects it accounts for.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::identifiers::{BudgetRef, SubjectId};
use crate::time::MillisSinceEpoch;
use crate::ResourceVersion;

/// Max number of subjects a budget may track as disrupted or unavailable before further
/// admissions are refused. Entries are only removed by the budget reconciler.
pub const MAX_UNAVAILABLE_POD_SIZE: usize = 2000;

/// The kind of operation which is about to make a subject unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    #[display("UPDATE")]
    Update,
    #[display("DELETE")]
    Delete,
    #[display("EVICT")]
    Evict,
}

impl OperationKind {
    /// Tracking set a subject is recorded in when admitted for this operation.
    pub fn disruption_kind(self) -> DisruptionKind {
        match self {
            OperationKind::Update => DisruptionKind::UnavailableByUpdate,
            OperationKind::Delete | OperationKind::Evict => DisruptionKind::DisruptedByOther,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "kebab-case")]
pub enum DisruptionKind {
    /// Made unavailable by a non-update operation (delete, eviction).
    #[display("disrupted")]
    DisruptedByOther,
    /// Made unavailable by an in-place update.
    #[display("unavailable")]
    UnavailableByUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedSubject {
    pub kind: DisruptionKind,
    pub since: MillisSinceEpoch,
}

/// Subjects which have already been charged against a budget.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackedSubjects(HashMap<SubjectId, TrackedSubject>);

impl TrackedSubjects {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, subject: &SubjectId) -> bool {
        self.0.contains_key(subject)
    }

    pub fn get(&self, subject: &SubjectId) -> Option<&TrackedSubject> {
        self.0.get(subject)
    }

    /// Records a subject, replacing and returning a previous entry.
    pub fn record(
        &mut self,
        subject: SubjectId,
        kind: DisruptionKind,
        since: MillisSinceEpoch,
    ) -> Option<TrackedSubject> {
        self.0.insert(subject, TrackedSubject { kind, since })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SubjectId, &TrackedSubject)> {
        self.0.iter()
    }

    pub fn of_kind(
        &self,
        kind: DisruptionKind,
    ) -> impl Iterator<Item = (&SubjectId, MillisSinceEpoch)> {
        self.0
            .iter()
            .filter(move |(_, tracked)| tracked.kind == kind)
            .map(|(id, tracked)| (id, tracked.since))
    }

    pub fn count_of(&self, kind: DisruptionKind) -> usize {
        self.of_kind(kind).count()
    }
}

/// Quota state of a budget. Everything but `unavailable_allowed` and `tracked` is computed
/// by the budget reconciler and only read by the admission path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BudgetStatus {
    pub total_replicas: i32,
    pub desired_available: i32,
    pub current_available: i32,
    pub unavailable_allowed: i32,
    #[serde(default)]
    pub tracked: TrackedSubjects,
}

/// Snapshot of a budget object as stored by the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UnavailableBudget {
    pub reference: BudgetRef,
    pub resource_version: ResourceVersion,
    pub status: BudgetStatus,
}

impl UnavailableBudget {
    pub fn new(reference: BudgetRef, status: BudgetStatus) -> Self {
        Self {
            reference,
            resource_version: ResourceVersion::EMPTY,
            status,
        }
    }

    /// Whether the subject has already been charged against this budget.
    pub fn is_recorded(&self, subject: &SubjectId) -> bool {
        self.status.tracked.contains(subject)
    }
}

/// The entity whose availability is about to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub namespace: String,
    pub ready: bool,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Subject {
    pub fn new(namespace: impl Into<String>, id: impl Into<SubjectId>, ready: bool) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            ready,
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_kinds_map_to_tracking_sets() {
        assert_eq!(
            DisruptionKind::UnavailableByUpdate,
            OperationKind::Update.disruption_kind()
        );
        assert_eq!(
            DisruptionKind::DisruptedByOther,
            OperationKind::Delete.disruption_kind()
        );
        assert_eq!(
            DisruptionKind::DisruptedByOther,
            OperationKind::Evict.disruption_kind()
        );
    }

    #[test]
    fn tracked_subjects_by_kind() {
        let mut tracked = TrackedSubjects::default();
        let now = MillisSinceEpoch::new(1_000);
        tracked.record("a".into(), DisruptionKind::UnavailableByUpdate, now);
        tracked.record("b".into(), DisruptionKind::DisruptedByOther, now);
        tracked.record("c".into(), DisruptionKind::DisruptedByOther, now);

        assert_eq!(3, tracked.len());
        assert_eq!(1, tracked.count_of(DisruptionKind::UnavailableByUpdate));
        assert_eq!(2, tracked.count_of(DisruptionKind::DisruptedByOther));
        assert!(tracked.contains(&"b".into()));
        assert!(!tracked.contains(&"d".into()));
    }

    #[test]
    fn budget_serde() {
        let mut budget = UnavailableBudget::new(
            BudgetRef::new("default", "web", "uid"),
            BudgetStatus {
                total_replicas: 3,
                desired_available: 2,
                current_available: 3,
                unavailable_allowed: 1,
                tracked: TrackedSubjects::default(),
            },
        );
        budget.resource_version = ResourceVersion::from(4);
        budget.status.tracked.record(
            "pod-a".into(),
            DisruptionKind::DisruptedByOther,
            MillisSinceEpoch::new(7),
        );

        let json = serde_json::to_string(&budget).unwrap();
        let decoded: UnavailableBudget = serde_json::from_str(&json).unwrap();
        assert_eq!(budget, decoded);
        assert!(decoded.is_recorded(&"pod-a".into()));
    }
}
