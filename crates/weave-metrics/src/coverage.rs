//! SCC-aware propagation of coverage along the manifest dependency relation.
//!
//! A protection implicitly covers the instructions of every protection it
//! transitively depends on. The relation may contain cycles (mutually
//! nested protections), so each multi-node strongly connected component is
//! first collapsed into a single logical unit: all members take the union
//! of the component's direct coverage. Nodes are then walked in topological
//! order of the condensation, unioning each node's in-arc sources into it,
//! so every predecessor is finalized before it is consumed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use weave_graph::element::ElementId;
use weave_graph::manifest::{Manifest, ManifestId};

use crate::dependency::ManifestDependencies;
use crate::error::MetricsError;

/// One implicit-coverage fact: `dependent` is implicitly covered through
/// the arc from `dependency`, which contributes `coverage` instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplicitEdge {
    /// Index of this fact in discovery order.
    pub index: u64,
    /// The manifest receiving implicit coverage.
    pub dependent: ManifestId,
    /// The manifest providing the coverage.
    pub dependency: ManifestId,
    /// Size of the providing manifest's (component-unified) coverage.
    pub coverage: usize,
}

/// Per protecting manifest: the implicit edges it contributes to and the
/// coverage size each of them reported. The size is expected to be
/// constant across a manifest's edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeSummary {
    /// Indices of the [`ImplicitEdge`]s this manifest provides.
    pub edges: BTreeSet<u64>,
    /// The coverage size all of them reported.
    pub coverage: usize,
}

/// Computes, for each manifest, the set of instructions it is implicitly
/// covered by: everything accumulated through the dependency relation,
/// minus its own direct coverage.
pub fn propagate(
    manifests: &[Manifest],
    deps: &ManifestDependencies,
) -> Result<BTreeMap<ManifestId, BTreeSet<ElementId>>, MetricsError> {
    let (graph, nodes, mut coverage) = build(manifests, deps)?;
    unify_components(&graph, &mut coverage);

    for &n in &propagation_order(&graph) {
        let mut gathered: BTreeSet<ElementId> = BTreeSet::new();
        for e in graph.edges_directed(n, Direction::Incoming) {
            let source = e.source();
            if source == n {
                return Err(MetricsError::SelfDependency { manifest: graph[n] });
            }
            gathered.extend(coverage[source.index()].iter().copied());
        }
        coverage[n.index()].extend(gathered);
    }

    let mut result = BTreeMap::new();
    for m in manifests {
        // A manifest cannot protect itself: subtract its direct coverage.
        let n = nodes[&m.id];
        let implicit: BTreeSet<ElementId> = coverage[n.index()]
            .difference(&m.coverage)
            .copied()
            .collect();
        result.insert(m.id, implicit);
    }
    Ok(result)
}

/// Companion of [`propagate`]: yields one [`ImplicitEdge`] per in-arc in
/// propagation order, plus a per-protector summary of edges and the
/// coverage size they reported.
///
/// The reported size is the protector's component-unified direct coverage;
/// observing two different sizes for the same protector means the upstream
/// graph construction violated an invariant and is fatal.
pub fn propagate_edges(
    manifests: &[Manifest],
    deps: &ManifestDependencies,
) -> Result<(Vec<ImplicitEdge>, BTreeMap<ManifestId, EdgeSummary>), MetricsError> {
    let (graph, _nodes, mut coverage) = build(manifests, deps)?;
    unify_components(&graph, &mut coverage);

    let mut edges = Vec::new();
    let mut per_protector: BTreeMap<ManifestId, EdgeSummary> = BTreeMap::new();
    let mut next_index = 0u64;

    for &n in &propagation_order(&graph) {
        for e in graph.edges_directed(n, Direction::Incoming) {
            let source = e.source();
            if source == n {
                return Err(MetricsError::SelfDependency { manifest: graph[n] });
            }
            let size = coverage[source.index()].len();
            edges.push(ImplicitEdge {
                index: next_index,
                dependent: graph[n],
                dependency: graph[source],
                coverage: size,
            });
            let summary = per_protector.entry(graph[source]).or_default();
            if !summary.edges.is_empty() && summary.coverage != size {
                return Err(MetricsError::CoverageMismatch {
                    manifest: graph[source],
                    expected: summary.coverage,
                    found: size,
                });
            }
            summary.coverage = size;
            summary.edges.insert(next_index);
            next_index += 1;
        }
    }
    Ok((edges, per_protector))
}

/// Builds the manifest graph: one node per manifest (annotated with its
/// direct coverage), one arc dependency -> dependent per relation pair.
fn build(
    manifests: &[Manifest],
    deps: &ManifestDependencies,
) -> Result<
    (
        DiGraph<ManifestId, ()>,
        HashMap<ManifestId, NodeIndex>,
        Vec<BTreeSet<ElementId>>,
    ),
    MetricsError,
> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    let mut coverage = Vec::with_capacity(manifests.len());
    for m in manifests {
        let n = graph.add_node(m.id);
        nodes.insert(m.id, n);
        coverage.push(m.coverage.clone());
    }
    for (dependent, dependency) in deps.iter() {
        let d = *nodes
            .get(&dependent)
            .ok_or(MetricsError::UnknownManifest { id: dependent })?;
        let p = *nodes
            .get(&dependency)
            .ok_or(MetricsError::UnknownManifest { id: dependency })?;
        graph.add_edge(p, d, ());
    }
    tracing::trace!(
        nodes = graph.node_count(),
        arcs = graph.edge_count(),
        "built manifest dependency graph"
    );
    Ok((graph, nodes, coverage))
}

/// Mutual dependents protect each other's instructions identically: every
/// member of a multi-node component takes the union of the component's
/// coverage.
fn unify_components(graph: &DiGraph<ManifestId, ()>, coverage: &mut [BTreeSet<ElementId>]) {
    for component in tarjan_scc(graph) {
        if component.len() < 2 {
            continue;
        }
        let mut union: BTreeSet<ElementId> = BTreeSet::new();
        for &n in &component {
            union.extend(coverage[n.index()].iter().copied());
        }
        tracing::trace!(members = component.len(), coverage = union.len(), "unified component");
        for &n in &component {
            coverage[n.index()] = union.clone();
        }
    }
}

/// Nodes in topological order of the condensation: predecessors first.
/// Tarjan emits components in reverse topological order, so flattening the
/// reversed list gives the walk order propagation needs.
fn propagation_order(graph: &DiGraph<ManifestId, ()>) -> Vec<NodeIndex> {
    let mut components = tarjan_scc(graph);
    components.reverse();
    components.into_iter().flatten().collect()
}
