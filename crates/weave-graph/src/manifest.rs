//! Manifests: one applied protection instance each.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::element::ElementId;
use crate::layout::ProgramLayout;

/// Identity of one applied protection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ManifestId(pub u64);

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The record of one applied protection instance.
///
/// `name` is the protection kind (statistics group by it, and several
/// instances of the same kind share it); `coverage` is the set of
/// instructions the protection directly touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Unique identity, assigned by the registry.
    pub id: ManifestId,
    /// Protection kind name.
    pub name: String,
    /// Instructions this protection directly covers.
    pub coverage: BTreeSet<ElementId>,
}

impl Manifest {
    /// Creates a manifest record.
    pub fn new(id: ManifestId, name: impl Into<String>, coverage: BTreeSet<ElementId>) -> Self {
        Manifest {
            id,
            name: name.into(),
            coverage,
        }
    }

    /// The basic blocks this manifest's coverage touches, per the layout.
    /// Instructions the layout does not know contribute nothing.
    pub fn block_coverage(&self, layout: &ProgramLayout) -> BTreeSet<ElementId> {
        self.coverage
            .iter()
            .filter_map(|&i| layout.block_of(i))
            .collect()
    }

    /// The functions this manifest's coverage touches, per the layout.
    pub fn function_coverage(&self, layout: &ProgramLayout) -> BTreeSet<ElementId> {
        self.coverage
            .iter()
            .filter_map(|&i| layout.function_of(i))
            .collect()
    }
}
