pub mod constraint;
pub mod edge;
pub mod element;
pub mod error;
pub mod graph;
pub mod layout;
pub mod manifest;
pub mod registry;
pub mod vertex;

// Re-export commonly used types
pub use constraint::{Constraint, RegistrationId};
pub use edge::{EdgeKind, GraphEdge};
pub use element::{ElementHandle, ElementId, ElementKind};
pub use error::GraphError;
pub use graph::ProtectionGraph;
pub use layout::ProgramLayout;
pub use manifest::{Manifest, ManifestId};
pub use registry::ProtectionRegistry;
pub use vertex::{ConstraintFold, Vertex, VertexId};
