//! Aggregate protection statistics and their persisted JSON document.
//!
//! [`Stats::collect`] consumes the final instruction set, the surviving
//! manifests, the manifest dependency relation, and the containment layout,
//! and fills in totals, per-protection-kind breakdowns, and connectivity
//! distributions. The document serializes to camelCase JSON and round-trips
//! exactly: deserializing and re-serializing yields the same document.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use weave_graph::element::ElementId;
use weave_graph::layout::ProgramLayout;
use weave_graph::manifest::{Manifest, ManifestId};

use crate::connectivity::Connectivity;
use crate::coverage;
use crate::dependency::ManifestDependencies;
use crate::error::MetricsError;

/// The aggregate statistics document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Number of manifests the report covers.
    pub number_of_manifests: usize,
    /// Size of the full instruction set supplied by the front end.
    pub number_of_all_instructions: usize,
    /// Sum over manifests of the functions their coverage touches.
    pub number_of_protected_functions: usize,
    /// Sum over manifests of their direct coverage sizes. Instructions
    /// covered by several manifests count once per manifest.
    pub number_of_protected_instructions: usize,
    /// Size of the union of all direct coverage.
    pub number_of_protected_distinct_instructions: usize,
    /// Sum over manifests of their implicit coverage sizes.
    pub number_of_implicitly_protected_instructions: usize,
    /// Size of the union of all implicit coverage.
    pub number_of_distinct_implicitly_protected_instructions: usize,
    /// Distinct instructions covered, per protection kind.
    pub number_of_protected_instructions_by_type: BTreeMap<String, usize>,
    /// Distinct functions touched, per protection kind.
    pub number_of_protected_functions_by_type: BTreeMap<String, usize>,
    /// Number of basic blocks in the supplied instruction set.
    pub number_of_blocks: usize,
    /// Number of blocks the block-connectivity distribution was computed
    /// over.
    pub number_of_protected_blocks: usize,
    /// Distinct blocks touched, per protection kind.
    pub number_of_protected_blocks_by_type: BTreeMap<String, usize>,
    /// Distribution of per-instruction protection counts.
    pub instruction_connectivity: Connectivity,
    /// Distribution of per-block protection counts.
    pub block_connectivity: Connectivity,
    /// Distribution of per-function protection counts (max over the
    /// function's instructions).
    pub function_connectivity: Connectivity,
    /// Per protection kind: (instruction, function) connectivity pair.
    pub protection_connectivity: BTreeMap<String, (Connectivity, Connectivity)>,
}

impl Stats {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a previously dumped document.
    pub fn from_reader(reader: impl Read) -> Result<Self, MetricsError> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Writes the document as pretty-printed JSON.
    pub fn dump(&self, mut writer: impl Write) -> Result<(), MetricsError> {
        serde_json::to_writer_pretty(&mut writer, self)?;
        writeln!(writer)?;
        Ok(())
    }

    /// Fills in every field from the final program state.
    pub fn collect(
        &mut self,
        all_instructions: &BTreeSet<ElementId>,
        manifests: &[Manifest],
        deps: &ManifestDependencies,
        layout: &ProgramLayout,
    ) -> Result<(), MetricsError> {
        self.number_of_manifests = manifests.len();
        self.number_of_all_instructions = all_instructions.len();

        tracing::debug!(manifests = manifests.len(), "collecting explicit coverage");
        let mut distinct: BTreeSet<ElementId> = BTreeSet::new();
        let mut instructions_by_kind: BTreeMap<String, BTreeSet<ElementId>> = BTreeMap::new();
        let mut functions_by_kind: BTreeMap<String, BTreeSet<ElementId>> = BTreeMap::new();
        for m in manifests {
            self.number_of_protected_instructions += m.coverage.len();
            distinct.extend(m.coverage.iter().copied());
            instructions_by_kind
                .entry(m.name.clone())
                .or_default()
                .extend(m.coverage.iter().copied());

            let functions = m.function_coverage(layout);
            self.number_of_protected_functions += functions.len();
            functions_by_kind
                .entry(m.name.clone())
                .or_default()
                .extend(functions);
        }
        self.number_of_protected_distinct_instructions = distinct.len();
        for (kind, set) in &instructions_by_kind {
            self.number_of_protected_instructions_by_type
                .insert(kind.clone(), set.len());
        }
        for (kind, set) in &functions_by_kind {
            self.number_of_protected_functions_by_type
                .insert(kind.clone(), set.len());
        }

        tracing::debug!("collecting implicit coverage");
        let implicit = coverage::propagate(manifests, deps)?;
        let mut implicit_union: BTreeSet<ElementId> = BTreeSet::new();
        for set in implicit.values() {
            self.number_of_implicitly_protected_instructions += set.len();
            implicit_union.extend(set.iter().copied());
        }
        self.number_of_distinct_implicitly_protected_instructions = implicit_union.len();

        tracing::debug!("computing connectivities");
        // Per instruction: how many distinct manifests cover it. Covered
        // instructions outside the supplied set still enter the
        // distribution.
        let mut instruction_counts: BTreeMap<ElementId, usize> =
            all_instructions.iter().map(|&i| (i, 0)).collect();
        for m in manifests {
            for &i in &m.coverage {
                *instruction_counts.entry(i).or_insert(0) += 1;
            }
        }
        let (instr, func) = instruction_function_connectivity(&instruction_counts, layout);
        self.instruction_connectivity = instr;
        self.function_connectivity = func;

        // Per block: how many distinct manifests touch it.
        let blocks: BTreeSet<ElementId> = all_instructions
            .iter()
            .filter_map(|&i| layout.block_of(i))
            .collect();
        self.number_of_blocks = blocks.len();
        let mut block_manifests: BTreeMap<ElementId, BTreeSet<ManifestId>> =
            blocks.iter().map(|&b| (b, BTreeSet::new())).collect();
        let mut blocks_by_kind: BTreeMap<String, BTreeSet<ElementId>> = BTreeMap::new();
        for m in manifests {
            for b in m.block_coverage(layout) {
                block_manifests.entry(b).or_default().insert(m.id);
                blocks_by_kind.entry(m.name.clone()).or_default().insert(b);
            }
        }
        let block_counts: Vec<usize> = block_manifests.values().map(BTreeSet::len).collect();
        self.number_of_protected_blocks = block_counts.len();
        self.block_connectivity = Connectivity::new(&block_counts);
        for (kind, set) in &blocks_by_kind {
            self.number_of_protected_blocks_by_type
                .insert(kind.clone(), set.len());
        }

        // Per protection kind: counts per instruction, over that kind's
        // manifests only.
        let mut counts_by_kind: BTreeMap<String, BTreeMap<ElementId, usize>> = BTreeMap::new();
        for m in manifests {
            let counts = counts_by_kind.entry(m.name.clone()).or_default();
            for &i in &m.coverage {
                *counts.entry(i).or_insert(0) += 1;
            }
        }
        for (kind, counts) in &counts_by_kind {
            self.protection_connectivity
                .insert(kind.clone(), instruction_function_connectivity(counts, layout));
        }
        Ok(())
    }
}

/// Builds the instruction-level distribution and, from the same counts,
/// the function-level distribution (each function's connectivity is the
/// maximum over its instructions). Instructions the layout cannot place in
/// a function contribute to the instruction distribution only.
fn instruction_function_connectivity(
    counts: &BTreeMap<ElementId, usize>,
    layout: &ProgramLayout,
) -> (Connectivity, Connectivity) {
    let mut function_counts: BTreeMap<ElementId, usize> = BTreeMap::new();
    let mut sequence = Vec::with_capacity(counts.len());
    for (&instruction, &count) in counts {
        sequence.push(count);
        if let Some(function) = layout.function_of(instruction) {
            let entry = function_counts.entry(function).or_insert(0);
            *entry = (*entry).max(count);
        }
    }
    let instruction_connectivity = Connectivity::new(&sequence);
    let function_sequence: Vec<usize> = function_counts.values().copied().collect();
    (instruction_connectivity, Connectivity::new(&function_sequence))
}
