//! Error types for the protection graph engine.
//!
//! Uses `thiserror` for structured, matchable variants. Caller-contract
//! violations fail fast; resolvable conflicts are handled inside the
//! resolution loop and never surface here.

use thiserror::Error;

use crate::element::ElementId;
use crate::manifest::ManifestId;

/// Errors produced by the protection graph engine.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The reserved null element handle was passed to a graph-construction
    /// operation.
    #[error("null element handle")]
    NullElement,

    /// A manifest ID was not found in the protection registry.
    #[error("manifest not registered: ManifestId({id})", id = id.0)]
    UnknownManifest { id: ManifestId },

    /// The containment layout has no entry for an element a granularity
    /// rewrite needs.
    #[error("element not in containment layout: ElementId({id})", id = id.0)]
    UnknownElement { id: ElementId },

    /// `topological_sort_manifests` was asked to order a subset whose
    /// dependency subgraph still contains a cycle.
    #[error("dependency subgraph still contains a cycle")]
    CyclicManifests,
}
