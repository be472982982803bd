pub mod connectivity;
pub mod coverage;
pub mod dependency;
pub mod error;
pub mod stats;

// Re-export commonly used types
pub use connectivity::Connectivity;
pub use coverage::{propagate, propagate_edges, EdgeSummary, ImplicitEdge};
pub use dependency::ManifestDependencies;
pub use error::MetricsError;
pub use stats::Stats;
