//! Vertices wrap program elements and carry the constraints attached to them.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::constraint::{Constraint, RegistrationId};
use crate::element::ElementHandle;

/// Dense vertex index.
///
/// Stable for the lifetime of the engine: once assigned to an element it is
/// never reassigned to a different one, even after the vertex is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VertexId(pub u64);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fold of all Present (or Preserved) constraints attached to one vertex.
///
/// `Conflict` means the attached constraints cannot be satisfied together:
/// some assert the requirement and others assert its inverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintFold {
    /// No constraint of the folded variant is attached.
    None,
    /// Every attached constraint asserts the requirement.
    Must,
    /// Every attached constraint asserts the inverse.
    MustNot,
    /// Both directions are asserted for the same target.
    Conflict,
}

/// A vertex wrapping one program element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vertex {
    /// Dense, never-reused index.
    pub index: VertexId,
    /// The wrapped element handle.
    pub element: ElementHandle,
    /// Display name, used in diagnostics and DOT export.
    pub name: String,
    /// Constraints attached to this vertex, keyed by registration index.
    /// Insertion-ordered so scans are deterministic.
    pub constraints: IndexMap<RegistrationId, Constraint>,
}

impl Vertex {
    /// Creates a vertex for `element` with no constraints attached.
    pub fn new(index: VertexId, element: ElementHandle) -> Self {
        Vertex {
            index,
            element,
            name: element.display_name(),
            constraints: IndexMap::new(),
        }
    }

    /// Folds all attached `Present` constraints.
    pub fn present_state(&self) -> ConstraintFold {
        fold(self.constraints.values().filter_map(|c| match c {
            Constraint::Present { inverse, .. } => Some(*inverse),
            _ => None,
        }))
    }

    /// Folds all attached `Preserved` constraints.
    pub fn preserved_state(&self) -> ConstraintFold {
        fold(self.constraints.values().filter_map(|c| match c {
            Constraint::Preserved { inverse, .. } => Some(*inverse),
            _ => None,
        }))
    }

    /// Returns `true` if the attached `Present` constraints conflict.
    pub fn has_present_conflict(&self) -> bool {
        self.present_state() == ConstraintFold::Conflict
    }

    /// Returns `true` if the attached `Preserved` constraints conflict.
    pub fn has_preserved_conflict(&self) -> bool {
        self.preserved_state() == ConstraintFold::Conflict
    }
}

/// Folds a sequence of `inverse` flags into a single satisfiability state.
fn fold(inverses: impl Iterator<Item = bool>) -> ConstraintFold {
    let mut state = ConstraintFold::None;
    for inverse in inverses {
        let this = if inverse {
            ConstraintFold::MustNot
        } else {
            ConstraintFold::Must
        };
        state = match state {
            ConstraintFold::None => this,
            s if s == this => s,
            _ => return ConstraintFold::Conflict,
        };
    }
    state
}
