//! Directed dependency relation between manifests.
//!
//! `add(dependent, dependency)` records that the dependent protection's
//! output is nested inside the dependency's scope, so coverage flows from
//! the dependency to the dependent during propagation. The relation may
//! contain cycles (mutually nested protections); propagation tolerates them.

use std::collections::{BTreeMap, BTreeSet};

use weave_graph::manifest::ManifestId;

/// A directed, possibly cyclic relation over manifest identities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDependencies {
    depends_on: BTreeMap<ManifestId, BTreeSet<ManifestId>>,
}

impl ManifestDependencies {
    /// Creates an empty relation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `dependent` depends on `dependency`.
    pub fn add(&mut self, dependent: ManifestId, dependency: ManifestId) {
        self.depends_on.entry(dependent).or_default().insert(dependency);
    }

    /// The manifests `dependent` depends on.
    pub fn dependencies_of(
        &self,
        dependent: ManifestId,
    ) -> impl Iterator<Item = ManifestId> + '_ {
        self.depends_on
            .get(&dependent)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// All `(dependent, dependency)` pairs, in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = (ManifestId, ManifestId)> + '_ {
        self.depends_on
            .iter()
            .flat_map(|(&dependent, deps)| deps.iter().map(move |&d| (dependent, d)))
    }

    /// Number of recorded pairs.
    pub fn len(&self) -> usize {
        self.depends_on.values().map(BTreeSet::len).sum()
    }

    /// Returns `true` if no pair is recorded.
    pub fn is_empty(&self) -> bool {
        self.depends_on.is_empty()
    }
}
