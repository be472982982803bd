//! Program-element handles and their classification.
//!
//! The graph never owns program elements. The front end supplies opaque
//! handles whose identity mirrors the compiler's own element identity
//! (pointer identity in practice), classified into exactly one of four
//! kinds. The graph stores handles, never the elements themselves.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identity of a caller-owned program element.
///
/// `ElementId(0)` is reserved as the null handle; every graph-construction
/// operation rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId(pub u64);

impl ElementId {
    /// Returns `true` for the reserved null handle.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification of a program element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    /// A single machine-level instruction.
    Instruction,
    /// A basic block of instructions.
    BasicBlock,
    /// A whole function.
    Function,
    /// Any other value (globals, arguments, ...).
    Value,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElementKind::Instruction => "instruction",
            ElementKind::BasicBlock => "block",
            ElementKind::Function => "function",
            ElementKind::Value => "value",
        };
        write!(f, "{s}")
    }
}

/// A classified element handle: identity plus kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle {
    /// Caller-supplied identity.
    pub id: ElementId,
    /// Which kind of element the handle refers to.
    pub kind: ElementKind,
}

impl ElementHandle {
    /// Creates a handle from an identity and a kind.
    pub fn new(id: ElementId, kind: ElementKind) -> Self {
        ElementHandle { id, kind }
    }

    /// Convenience: an instruction handle from a raw identity.
    pub fn instruction(raw: u64) -> Self {
        ElementHandle::new(ElementId(raw), ElementKind::Instruction)
    }

    /// Convenience: a basic-block handle from a raw identity.
    pub fn basic_block(raw: u64) -> Self {
        ElementHandle::new(ElementId(raw), ElementKind::BasicBlock)
    }

    /// Convenience: a function handle from a raw identity.
    pub fn function(raw: u64) -> Self {
        ElementHandle::new(ElementId(raw), ElementKind::Function)
    }

    /// Convenience: an opaque value handle from a raw identity.
    pub fn value(raw: u64) -> Self {
        ElementHandle::new(ElementId(raw), ElementKind::Value)
    }

    /// The display name used for the vertex wrapping this element.
    pub fn display_name(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}
