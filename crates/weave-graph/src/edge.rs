//! Edges of the protection graph.
//!
//! Structural control flow (supplied by the front end) and
//! protection-induced dependencies share one edge type, distinguished by
//! [`EdgeKind`]. A dependency edge is the materialized form of a
//! `Dependency` constraint and keeps the constraint's declared endpoints:
//! granularity rewrites move the edge between vertices, and the declared
//! handles are what lets a reduction find its way back.
//!
//! The graph is a multigraph: parallel edges between the same vertex pair
//! are permitted and common, e.g. after an expansion fans one edge out over
//! many instruction vertices.

use serde::{Deserialize, Serialize};

use crate::constraint::RegistrationId;
use crate::element::ElementHandle;

/// Edge kinds in the protection graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Structural control flow between program elements.
    ControlFlow,
    /// Protection-induced ordering dependency, carrying the constraint's
    /// declared endpoints. Weak dependencies are advisory: cycle detection
    /// and manifest ordering ignore them.
    Dependency {
        from: ElementHandle,
        to: ElementHandle,
        weak: bool,
    },
}

/// An edge between two vertices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// The registration index under which the edge was added. For
    /// dependency edges this is also the owning constraint's index.
    pub index: RegistrationId,
    /// Display name, used in diagnostics and DOT export.
    pub name: String,
    /// Whether the edge is structural or protection-induced.
    pub kind: EdgeKind,
}

impl GraphEdge {
    /// A structural control-flow edge.
    pub fn control_flow(index: RegistrationId) -> Self {
        GraphEdge {
            index,
            name: "cfg".to_string(),
            kind: EdgeKind::ControlFlow,
        }
    }

    /// A protection-induced dependency edge with its declared endpoints.
    pub fn dependency(
        index: RegistrationId,
        from: ElementHandle,
        to: ElementHandle,
        weak: bool,
    ) -> Self {
        GraphEdge {
            index,
            name: "dependency".to_string(),
            kind: EdgeKind::Dependency { from, to, weak },
        }
    }

    /// Returns `true` for dependency edges, weak or not.
    pub fn is_dependency(&self) -> bool {
        matches!(self.kind, EdgeKind::Dependency { .. })
    }

    /// Returns `true` for non-weak dependency edges -- the ones cycle
    /// detection and manifest ordering consider.
    pub fn is_strong_dependency(&self) -> bool {
        matches!(self.kind, EdgeKind::Dependency { weak: false, .. })
    }

    /// Returns `true` for structural control-flow edges.
    pub fn is_control_flow(&self) -> bool {
        matches!(self.kind, EdgeKind::ControlFlow)
    }

    /// The declared endpoints, for dependency edges.
    pub fn declared_endpoints(&self) -> Option<(ElementHandle, ElementHandle)> {
        match self.kind {
            EdgeKind::Dependency { from, to, .. } => Some((from, to)),
            EdgeKind::ControlFlow => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_flow_edge_kind() {
        let e = GraphEdge::control_flow(RegistrationId(0));
        assert!(e.is_control_flow());
        assert!(!e.is_dependency());
        assert!(!e.is_strong_dependency());
        assert_eq!(e.declared_endpoints(), None);
    }

    #[test]
    fn strong_dependency_edge_kind() {
        let from = ElementHandle::instruction(1);
        let to = ElementHandle::instruction(2);
        let e = GraphEdge::dependency(RegistrationId(1), from, to, false);
        assert!(e.is_dependency());
        assert!(e.is_strong_dependency());
        assert!(!e.is_control_flow());
        assert_eq!(e.declared_endpoints(), Some((from, to)));
    }

    #[test]
    fn weak_dependency_is_not_strong() {
        let e = GraphEdge::dependency(
            RegistrationId(2),
            ElementHandle::basic_block(1),
            ElementHandle::basic_block(2),
            true,
        );
        assert!(e.is_dependency());
        assert!(!e.is_strong_dependency());
    }
}
