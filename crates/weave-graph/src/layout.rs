//! Authoritative instruction/block/function containment mapping.
//!
//! [`ProgramLayout`] is supplied by the front end at the ingestion boundary.
//! Granularity rewrites and statistics aggregation both consult it; the
//! graph itself stores no containment knowledge.

use std::collections::{BTreeMap, HashMap};

use crate::element::ElementId;

/// Which instructions live in which blocks, and which blocks live in which
/// functions.
///
/// Built incrementally via [`register_instruction`](Self::register_instruction);
/// every query returns `None` for elements the front end never registered.
#[derive(Debug, Clone, Default)]
pub struct ProgramLayout {
    /// Instruction -> enclosing basic block.
    block_of: HashMap<ElementId, ElementId>,
    /// Instruction or basic block -> enclosing function.
    function_of: HashMap<ElementId, ElementId>,
    /// Basic block -> contained instructions, in registration order.
    block_instructions: BTreeMap<ElementId, Vec<ElementId>>,
    /// Function -> contained instructions, in registration order.
    function_instructions: BTreeMap<ElementId, Vec<ElementId>>,
    /// Function -> contained basic blocks, in first-seen order.
    function_blocks: BTreeMap<ElementId, Vec<ElementId>>,
}

impl ProgramLayout {
    /// Creates an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `instruction` lives in `block`, which lives in `function`.
    pub fn register_instruction(
        &mut self,
        instruction: ElementId,
        block: ElementId,
        function: ElementId,
    ) {
        self.block_of.insert(instruction, block);
        self.function_of.insert(instruction, function);
        self.function_of.insert(block, function);
        self.block_instructions.entry(block).or_default().push(instruction);
        self.function_instructions
            .entry(function)
            .or_default()
            .push(instruction);
        let blocks = self.function_blocks.entry(function).or_default();
        if !blocks.contains(&block) {
            blocks.push(block);
        }
    }

    /// The basic block containing `instruction`.
    pub fn block_of(&self, instruction: ElementId) -> Option<ElementId> {
        self.block_of.get(&instruction).copied()
    }

    /// The function containing `element` (an instruction or a basic block).
    pub fn function_of(&self, element: ElementId) -> Option<ElementId> {
        self.function_of.get(&element).copied()
    }

    /// The instructions contained in `block`.
    pub fn instructions_of_block(&self, block: ElementId) -> Option<&[ElementId]> {
        self.block_instructions.get(&block).map(Vec::as_slice)
    }

    /// The instructions contained in `function`.
    pub fn instructions_of_function(&self, function: ElementId) -> Option<&[ElementId]> {
        self.function_instructions.get(&function).map(Vec::as_slice)
    }

    /// The instructions contained in `element`, whichever granularity it is.
    pub fn instructions_of(&self, element: ElementId) -> Option<&[ElementId]> {
        self.instructions_of_block(element)
            .or_else(|| self.instructions_of_function(element))
    }

    /// The basic blocks contained in `function`.
    pub fn blocks_of_function(&self, function: ElementId) -> Option<&[ElementId]> {
        self.function_blocks.get(&function).map(Vec::as_slice)
    }

    /// All registered basic blocks.
    pub fn blocks(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.block_instructions.keys().copied()
    }

    /// All registered functions.
    pub fn functions(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.function_instructions.keys().copied()
    }
}
