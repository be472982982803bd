//! The closed constraint vocabulary protections attach to the graph.
//!
//! Constraints come in exactly three variants. `Dependency` is edge-scoped
//! and materializes as a dependency edge between its endpoints;
//! `Present`/`Preserved` are vertex-scoped and attach to their target's
//! vertex. Conflict detection is exhaustive pattern matching over the
//! variants, so adding one is a compile-visible change.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::element::ElementHandle;

/// Global registration index handed out for every control-flow edge and
/// constraint added to the protection graph.
///
/// Monotonically increasing and never reused; the [`ProtectionRegistry`]
/// maps it back to the owning manifest.
///
/// [`ProtectionRegistry`]: crate::registry::ProtectionRegistry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A requirement attached to a vertex or edge, owned by exactly one manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Constraint {
    /// Edge-scoped ordering requirement: `from` must be processed relative
    /// to `to`. Weak dependencies are advisory; cycle detection ignores
    /// them.
    Dependency {
        from: ElementHandle,
        to: ElementHandle,
        weak: bool,
    },
    /// Vertex-scoped: the target must (or, if `inverse`, must not) remain
    /// present once other protections have been applied.
    Present {
        target: ElementHandle,
        inverse: bool,
    },
    /// Vertex-scoped: the target's semantic value must (or, if `inverse`,
    /// must not) be preserved.
    Preserved {
        target: ElementHandle,
        inverse: bool,
    },
}

impl Constraint {
    /// The vertex the constraint attaches to, for vertex-scoped variants.
    pub fn target(&self) -> Option<ElementHandle> {
        match self {
            Constraint::Dependency { .. } => None,
            Constraint::Present { target, .. } | Constraint::Preserved { target, .. } => {
                Some(*target)
            }
        }
    }

    /// Returns `true` for the edge-scoped `Dependency` variant.
    pub fn is_edge_scoped(&self) -> bool {
        matches!(self, Constraint::Dependency { .. })
    }

    /// Returns `true` for the vertex-scoped `Present`/`Preserved` variants.
    pub fn is_vertex_scoped(&self) -> bool {
        !self.is_edge_scoped()
    }
}
