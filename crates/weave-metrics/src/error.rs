//! Error types for coverage propagation and statistics.
//!
//! Internal-consistency failures (`SelfDependency`, `CoverageMismatch`)
//! indicate a violated invariant in upstream graph construction, not a
//! normal runtime condition; callers are expected to abort on them.

use thiserror::Error;

use weave_graph::manifest::ManifestId;

/// Errors produced by the coverage/statistics crate.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A manifest depends on itself in the dependency relation.
    #[error("self-referential dependency on manifest ManifestId({id})", id = manifest.0)]
    SelfDependency { manifest: ManifestId },

    /// Two different dependency edges reported different coverage sizes for
    /// the same protecting manifest.
    #[error(
        "conflicting coverage sizes for ManifestId({id}): {expected} vs {found}",
        id = manifest.0
    )]
    CoverageMismatch {
        manifest: ManifestId,
        expected: usize,
        found: usize,
    },

    /// The dependency relation references a manifest that was not supplied.
    #[error("dependency relation references unknown manifest ManifestId({id})", id = id.0)]
    UnknownManifest { id: ManifestId },

    /// Statistics (de)serialization failed.
    #[error("statistics serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// Statistics I/O failed.
    #[error("statistics I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
