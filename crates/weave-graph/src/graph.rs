//! ProtectionGraph: the protection graph engine.
//!
//! [`ProtectionGraph`] owns the element graph (a directed multigraph over
//! program elements), the protection registry, and every operation the
//! front end drives: constraint registration, granularity rewrites between
//! instruction/block/function views, topological manifest ordering, and the
//! randomized conflict-resolution loop.
//!
//! # Lifecycle
//!
//! The front end registers control-flow edges and per-manifest constraints,
//! then calls [`resolve_conflicts`](ProtectionGraph::resolve_conflicts)
//! once. Afterwards the graph contains no dependency cycle and no
//! Present/Preserved conflict, and
//! [`topological_sort_manifests`](ProtectionGraph::topological_sort_manifests)
//! yields the order in which the surviving protections must be applied.
//!
//! Resolution removes manifests; the front end can observe removals through
//! [`on_manifest_removed`](ProtectionGraph::on_manifest_removed) or the
//! [`removed_manifests`](ProtectionGraph::removed_manifests) log and discard
//! materialized artifacts for the losers.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::stable_graph::StableGraph;
use petgraph::visit::{EdgeFiltered, EdgeRef};
use petgraph::{Directed, Direction};
use rand::Rng;
use smallvec::SmallVec;

use crate::constraint::{Constraint, RegistrationId};
use crate::edge::{EdgeKind, GraphEdge};
use crate::element::{ElementHandle, ElementId, ElementKind};
use crate::error::GraphError;
use crate::layout::ProgramLayout;
use crate::manifest::{Manifest, ManifestId};
use crate::registry::ProtectionRegistry;
use crate::vertex::{Vertex, VertexId};

/// Callback invoked for every manifest the engine removes.
pub type RemovalObserver = Box<dyn FnMut(&Manifest)>;

/// Scratch list for edge rewiring during granularity rewrites.
type EdgeScratch = SmallVec<[(NodeIndex<u32>, GraphEdge); 8]>;

/// The protection graph engine.
pub struct ProtectionGraph {
    /// The element graph. Stable indices: removing a vertex never shifts
    /// the others.
    graph: StableGraph<Vertex, GraphEdge, Directed, u32>,
    /// Content addressing: one vertex per distinct element.
    vertices_by_element: HashMap<ElementId, NodeIndex<u32>>,
    /// Manifests and the registration indices they own.
    registry: ProtectionRegistry,
    /// Counter backing [`VertexId`]; never reused.
    next_vertex: u64,
    /// Manifests removed so far, in removal order.
    removed: Vec<ManifestId>,
    removal_observer: Option<RemovalObserver>,
}

impl Default for ProtectionGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtectionGraph {
    /// Creates an empty engine.
    pub fn new() -> Self {
        ProtectionGraph {
            graph: StableGraph::new(),
            vertices_by_element: HashMap::new(),
            registry: ProtectionRegistry::new(),
            next_vertex: 0,
            removed: Vec::new(),
            removal_observer: None,
        }
    }

    // -----------------------------------------------------------------------
    // Read-only accessors
    // -----------------------------------------------------------------------

    /// The protection registry.
    pub fn registry(&self) -> &ProtectionRegistry {
        &self.registry
    }

    /// Looks up a live manifest.
    pub fn manifest(&self, id: ManifestId) -> Option<&Manifest> {
        self.registry.manifest(id)
    }

    /// Number of vertices currently in the graph.
    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges currently in the graph.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// The vertex wrapping `element`, if one exists.
    pub fn vertex(&self, element: ElementId) -> Option<&Vertex> {
        let idx = self.vertices_by_element.get(&element)?;
        self.graph.node_weight(*idx)
    }

    /// All vertices, in slot order.
    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.graph.node_indices().filter_map(|n| self.graph.node_weight(n))
    }

    /// Manifests removed by the engine so far, in removal order.
    pub fn removed_manifests(&self) -> &[ManifestId] {
        &self.removed
    }

    /// Subscribes to manifest removals. The observer runs for every
    /// subsequent removal, whether explicit or from conflict resolution.
    pub fn on_manifest_removed(&mut self, observer: impl FnMut(&Manifest) + 'static) {
        self.removal_observer = Some(Box::new(observer));
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Registers a new manifest with the given protection kind name and
    /// direct instruction coverage.
    pub fn add_manifest(
        &mut self,
        name: impl Into<String>,
        coverage: BTreeSet<ElementId>,
    ) -> ManifestId {
        self.registry.add_manifest(name, coverage)
    }

    /// Inserts a structural control-flow edge from `parent` to `child`.
    ///
    /// Vertices are inserted idempotently: repeated references to the same
    /// element reuse its vertex. Returns the fresh registration index of
    /// the edge. Fails only on a null handle.
    pub fn add_control_flow_edge(
        &mut self,
        parent: ElementHandle,
        child: ElementHandle,
    ) -> Result<RegistrationId, GraphError> {
        if parent.id.is_null() || child.id.is_null() {
            return Err(GraphError::NullElement);
        }
        let src = self.ensure_vertex(parent);
        let dst = self.ensure_vertex(child);
        let index = self.registry.register_unowned();
        self.graph.add_edge(src, dst, GraphEdge::control_flow(index));
        Ok(index)
    }

    /// Registers `constraint` under `manifest` and materializes it in the
    /// graph.
    ///
    /// A `Dependency` constraint becomes a dependency edge between its
    /// endpoints' vertices; `Present`/`Preserved` attach to their target's
    /// vertex constraint map, keyed by the returned registration index.
    pub fn add_constraint(
        &mut self,
        manifest: ManifestId,
        constraint: Constraint,
    ) -> Result<RegistrationId, GraphError> {
        check_handles(&constraint)?;
        let index = self.registry.register_for(manifest)?;
        match constraint {
            Constraint::Dependency { from, to, weak } => {
                let src = self.ensure_vertex(from);
                let dst = self.ensure_vertex(to);
                self.graph
                    .add_edge(src, dst, GraphEdge::dependency(index, from, to, weak));
            }
            Constraint::Present { target, inverse } => {
                let idx = self.ensure_vertex(target);
                self.graph[idx]
                    .constraints
                    .insert(index, Constraint::Present { target, inverse });
            }
            Constraint::Preserved { target, inverse } => {
                let idx = self.ensure_vertex(target);
                self.graph[idx]
                    .constraints
                    .insert(index, Constraint::Preserved { target, inverse });
            }
        }
        Ok(index)
    }

    /// Removes every edge and constraint registered to `manifest`, then
    /// prunes vertices nothing references any more. Vertices other
    /// manifests still touch are retained with this manifest's entries
    /// stripped. Idempotent: removing an unknown manifest is a no-op.
    pub fn remove_manifest(&mut self, id: ManifestId) {
        let Some((manifest, owned)) = self.registry.remove_manifest(id) else {
            return;
        };

        let doomed: Vec<EdgeIndex<u32>> = self
            .graph
            .edge_indices()
            .filter(|&e| owned.contains(&self.graph[e].index))
            .collect();
        for e in doomed {
            self.graph.remove_edge(e);
        }

        let nodes: Vec<NodeIndex<u32>> = self.graph.node_indices().collect();
        for n in nodes {
            self.graph[n].constraints.retain(|reg, _| !owned.contains(reg));
        }

        let orphaned: Vec<NodeIndex<u32>> = self
            .graph
            .node_indices()
            .filter(|&n| {
                self.graph[n].constraints.is_empty()
                    && self.graph.edges_directed(n, Direction::Incoming).next().is_none()
                    && self.graph.edges_directed(n, Direction::Outgoing).next().is_none()
            })
            .collect();
        for n in orphaned {
            self.remove_vertex(n);
        }

        tracing::debug!(manifest = manifest.id.0, name = %manifest.name, "removed manifest");
        self.removed.push(id);
        if let Some(observer) = self.removal_observer.as_mut() {
            observer(&manifest);
        }
    }

    // -----------------------------------------------------------------------
    // Granularity rewrites
    // -----------------------------------------------------------------------

    /// Rewrites every BasicBlock/Function vertex down to vertices for the
    /// instructions it contains.
    ///
    /// All constraints are re-attached (under their original registration
    /// indices) to every instruction vertex, and all incident edges are
    /// rewired to every instruction vertex. Used when protections declared
    /// at different granularities must be compared.
    pub fn expand_to_instructions(&mut self, layout: &ProgramLayout) -> Result<(), GraphError> {
        let coarse: Vec<NodeIndex<u32>> = self
            .graph
            .node_indices()
            .filter(|&n| {
                matches!(
                    self.graph[n].element.kind,
                    ElementKind::BasicBlock | ElementKind::Function
                )
            })
            .collect();
        for n in coarse {
            let still_coarse = matches!(
                self.graph.node_weight(n).map(|v| v.element.kind),
                Some(ElementKind::BasicBlock | ElementKind::Function)
            );
            if still_coarse {
                self.expand_vertex_to_instructions(n, layout)?;
            }
        }
        Ok(())
    }

    /// Inverse of [`expand_to_instructions`](Self::expand_to_instructions).
    ///
    /// Every vertex-scoped constraint returns to the vertex of its declared
    /// target element (the handle a constraint carries keeps the original
    /// granularity), per-instruction copies merge back into one logical
    /// attachment, and every dependency edge is re-pointed at its declared
    /// endpoints. Duplicate edges produced by the merge are dropped, as are
    /// self-edges and orphaned instruction vertices. Vertex indices may
    /// differ from the pre-expansion graph; constraint ownership does not.
    pub fn reduce_to_instructions(&mut self) {
        self.rehome_constraints();
        self.rehome_dependency_edges();
        self.drop_duplicate_edges();
        self.prune_bare_instruction_vertices();
    }

    /// Rewrites every Instruction/BasicBlock vertex up to its enclosing
    /// Function vertex: constraints merge into the function vertex, edges
    /// are redirected, self-edges are dropped.
    ///
    /// Fails if the layout does not know an element's enclosing function.
    pub fn expand_to_functions(&mut self, layout: &ProgramLayout) -> Result<(), GraphError> {
        let fine: Vec<NodeIndex<u32>> = self
            .graph
            .node_indices()
            .filter(|&n| {
                matches!(
                    self.graph[n].element.kind,
                    ElementKind::Instruction | ElementKind::BasicBlock
                )
            })
            .collect();
        for n in fine {
            if self.graph.node_weight(n).is_none() {
                continue;
            }
            let element = self.graph[n].element;
            let function = layout
                .function_of(element.id)
                .ok_or(GraphError::UnknownElement { id: element.id })?;
            self.collapse_into_function(n, function);
        }
        Ok(())
    }

    /// Collapses all vertices mapping into the same enclosing function into
    /// that function's vertex, merging constraint maps and redirecting
    /// edges; duplicate and self-edges are dropped.
    ///
    /// Lenient counterpart of [`expand_to_functions`](Self::expand_to_functions):
    /// vertices the layout does not know (e.g. `Value` vertices) are left
    /// untouched.
    pub fn reduce_to_functions(&mut self, layout: &ProgramLayout) -> Result<(), GraphError> {
        let fine: Vec<NodeIndex<u32>> = self
            .graph
            .node_indices()
            .filter(|&n| {
                matches!(
                    self.graph[n].element.kind,
                    ElementKind::Instruction | ElementKind::BasicBlock
                )
            })
            .collect();
        for n in fine {
            if self.graph.node_weight(n).is_none() {
                continue;
            }
            let element = self.graph[n].element;
            let Some(function) = layout.function_of(element.id) else {
                continue;
            };
            self.collapse_into_function(n, function);
        }
        self.drop_duplicate_edges();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    /// Orders `manifests` consistently with the direction of the (already
    /// conflict-free) graph's non-weak dependency edges.
    ///
    /// Walks vertices in topological order and emits each requested
    /// manifest at its first touch (constraint attachment or outgoing
    /// dependency edge); manifests with no graph presence keep their given
    /// relative order at the end. Errors if the dependency subgraph still
    /// contains a cycle.
    pub fn topological_sort_manifests(
        &self,
        manifests: &[ManifestId],
    ) -> Result<Vec<ManifestId>, GraphError> {
        let filtered = EdgeFiltered::from_fn(&self.graph, |e| e.weight().is_strong_dependency());
        let order = toposort(&filtered, None).map_err(|_| GraphError::CyclicManifests)?;

        let requested: HashSet<ManifestId> = manifests.iter().copied().collect();
        let mut sorted = Vec::with_capacity(manifests.len());
        let mut seen: HashSet<ManifestId> = HashSet::new();
        let mut push = |m: ManifestId, sorted: &mut Vec<ManifestId>, seen: &mut HashSet<ManifestId>| {
            if requested.contains(&m) && seen.insert(m) {
                sorted.push(m);
            }
        };

        for n in order {
            let Some(vertex) = self.graph.node_weight(n) else {
                continue;
            };
            for reg in vertex.constraints.keys() {
                if let Some(m) = self.registry.owner_of(*reg) {
                    push(m, &mut sorted, &mut seen);
                }
            }
            for e in self.graph.edges_directed(n, Direction::Outgoing) {
                if !e.weight().is_dependency() {
                    continue;
                }
                if let Some(m) = self.registry.owner_of(e.weight().index) {
                    push(m, &mut sorted, &mut seen);
                }
            }
        }

        for &m in manifests {
            if seen.insert(m) {
                sorted.push(m);
            }
        }
        Ok(sorted)
    }

    // -----------------------------------------------------------------------
    // Conflict resolution
    // -----------------------------------------------------------------------

    /// Resolves dependency cycles and Present/Preserved conflicts by
    /// repeatedly removing manifests until the graph is clean.
    ///
    /// Candidate selection is uniformly random over `rng`; pass a seeded
    /// generator for reproducible outcomes. Terminates because every
    /// resolution step removes at least one manifest from a finite set.
    /// Invoking it on an empty graph is a no-op.
    pub fn resolve_conflicts<R: Rng>(&mut self, rng: &mut R) {
        tracing::debug!("step 1: removing dependency cycles");
        loop {
            let components = self.dependency_components();
            if components.is_empty() {
                break;
            }
            let mut removed_any = false;
            for (i, component) in components.iter().enumerate() {
                // Earlier removals in this pass may have dissolved the
                // component; keep only vertices that still exist.
                let members: Vec<NodeIndex<u32>> = component
                    .iter()
                    .copied()
                    .filter(|&n| self.graph.node_weight(n).is_some())
                    .collect();
                if members.len() < 2 {
                    continue;
                }
                tracing::debug!(component = i, members = members.len(), "component contains cycle");
                if tracing::enabled!(tracing::Level::TRACE) {
                    tracing::trace!(dot = %self.component_dot(&members), "cyclic component");
                }
                if self.break_cycle(&members, rng) {
                    removed_any = true;
                }
            }
            if !removed_any {
                // Nothing removable remained (e.g. only unowned edges);
                // recomputing would loop forever.
                break;
            }
        }

        tracing::debug!("step 2: removing remaining present/preserved conflicts");
        loop {
            let (present, preserved) = self.conflicting_manifests(None);
            let merged: Vec<ManifestId> = present.union(&preserved).copied().collect();
            if merged.is_empty() {
                break;
            }
            let pick = merged[rng.gen_range(0..merged.len())];
            tracing::debug!(candidates = merged.len(), manifest = pick.0, "handling conflict");
            self.remove_manifest(pick);
        }
    }

    /// Returns `true` if no multi-vertex dependency component and no
    /// Present/Preserved conflict remains -- the postcondition of
    /// [`resolve_conflicts`](Self::resolve_conflicts).
    pub fn is_conflict_free(&self) -> bool {
        if !self.dependency_components().is_empty() {
            return false;
        }
        let (present, preserved) = self.conflicting_manifests(None);
        present.is_empty() && preserved.is_empty()
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Renders the whole graph as a DOT document for offline inspection.
    pub fn to_dot(&self) -> String {
        let members: Vec<NodeIndex<u32>> = self.graph.node_indices().collect();
        self.component_dot(&members)
    }

    /// Renders the subgraph induced by `members` as a DOT document.
    pub fn component_dot(&self, members: &[NodeIndex<u32>]) -> String {
        let set: HashSet<NodeIndex<u32>> = members.iter().copied().collect();
        let mut out = String::from("digraph {\n");
        for &n in members {
            if let Some(v) = self.graph.node_weight(n) {
                let _ = writeln!(out, "  v{} [label=\"{}\"];", v.index, v.name);
            }
        }
        for &n in members {
            if self.graph.node_weight(n).is_none() {
                continue;
            }
            for e in self.graph.edges_directed(n, Direction::Outgoing) {
                if !set.contains(&e.target()) {
                    continue;
                }
                let (src, dst) = (&self.graph[e.source()], &self.graph[e.target()]);
                let _ = writeln!(
                    out,
                    "  v{} -> v{} [label=\"{}\"];",
                    src.index,
                    dst.index,
                    e.weight().name
                );
            }
        }
        out.push_str("}\n");
        out
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Inserts a vertex for `element` or returns the existing one.
    fn ensure_vertex(&mut self, element: ElementHandle) -> NodeIndex<u32> {
        if let Some(&idx) = self.vertices_by_element.get(&element.id) {
            return idx;
        }
        let vertex = Vertex::new(VertexId(self.next_vertex), element);
        self.next_vertex += 1;
        let idx = self.graph.add_node(vertex);
        self.vertices_by_element.insert(element.id, idx);
        idx
    }

    /// Removes a vertex and its lookup entry. The freed [`VertexId`] is
    /// never handed out again.
    fn remove_vertex(&mut self, idx: NodeIndex<u32>) {
        if let Some(vertex) = self.graph.remove_node(idx) {
            self.vertices_by_element.remove(&vertex.element.id);
        }
    }

    /// Multi-vertex strongly connected components over the non-weak
    /// dependency subgraph.
    fn dependency_components(&self) -> Vec<Vec<NodeIndex<u32>>> {
        let filtered = EdgeFiltered::from_fn(&self.graph, |e| e.weight().is_strong_dependency());
        tarjan_scc(&filtered)
            .into_iter()
            .filter(|component| component.len() > 1)
            .collect()
    }

    /// Breaks one cycle. Prefers resolving a Present/Preserved conflict
    /// found inside the component; otherwise evicts the manifest owning a
    /// uniformly random component-internal dependency edge. Returns whether
    /// a manifest was removed.
    fn break_cycle<R: Rng>(&mut self, members: &[NodeIndex<u32>], rng: &mut R) -> bool {
        let (present, preserved) = self.conflicting_manifests(Some(members));
        let merged: Vec<ManifestId> = present.union(&preserved).copied().collect();
        if !merged.is_empty() {
            let pick = merged[rng.gen_range(0..merged.len())];
            tracing::debug!(manifest = pick.0, "resolving constraint conflict inside cycle");
            self.remove_manifest(pick);
            return true;
        }

        let member_set: HashSet<NodeIndex<u32>> = members.iter().copied().collect();
        let mut owners: Vec<ManifestId> = Vec::new();
        for &n in members {
            for e in self.graph.edges_directed(n, Direction::Outgoing) {
                if !e.weight().is_strong_dependency() || !member_set.contains(&e.target()) {
                    continue;
                }
                if let Some(owner) = self.registry.owner_of(e.weight().index) {
                    owners.push(owner);
                }
            }
        }
        if owners.is_empty() {
            tracing::debug!("cycle has no owned internal edges; skipping");
            return false;
        }
        let pick = owners[rng.gen_range(0..owners.len())];
        tracing::debug!(manifest = pick.0, "breaking cycle by removing manifest");
        self.remove_manifest(pick);
        true
    }

    /// Collects the manifests responsible for Present conflicts and for
    /// Preserved conflicts, either across the whole graph or scoped to the
    /// given vertices.
    fn conflicting_manifests(
        &self,
        scope: Option<&[NodeIndex<u32>]>,
    ) -> (BTreeSet<ManifestId>, BTreeSet<ManifestId>) {
        let nodes: Vec<NodeIndex<u32>> = match scope {
            Some(members) => members.to_vec(),
            None => self.graph.node_indices().collect(),
        };
        let mut present = BTreeSet::new();
        let mut preserved = BTreeSet::new();
        for n in nodes {
            let Some(vertex) = self.graph.node_weight(n) else {
                continue;
            };
            if vertex.has_present_conflict() {
                for (reg, constraint) in &vertex.constraints {
                    if matches!(constraint, Constraint::Present { .. }) {
                        if let Some(m) = self.registry.owner_of(*reg) {
                            present.insert(m);
                        }
                    }
                }
            }
            if vertex.has_preserved_conflict() {
                for (reg, constraint) in &vertex.constraints {
                    if matches!(constraint, Constraint::Preserved { .. }) {
                        if let Some(m) = self.registry.owner_of(*reg) {
                            preserved.insert(m);
                        }
                    }
                }
            }
        }
        (present, preserved)
    }

    /// Replaces one coarse vertex by vertices for each contained
    /// instruction, duplicating constraints and incident edges.
    fn expand_vertex_to_instructions(
        &mut self,
        coarse: NodeIndex<u32>,
        layout: &ProgramLayout,
    ) -> Result<(), GraphError> {
        let element = self.graph[coarse].element;
        let instructions: Vec<ElementId> = layout
            .instructions_of(element.id)
            .ok_or(GraphError::UnknownElement { id: element.id })?
            .to_vec();

        let constraints: Vec<(RegistrationId, Constraint)> = self.graph[coarse]
            .constraints
            .iter()
            .map(|(reg, c)| (*reg, c.clone()))
            .collect();
        let incoming: EdgeScratch = self
            .graph
            .edges_directed(coarse, Direction::Incoming)
            .map(|e| (e.source(), e.weight().clone()))
            .collect();
        let outgoing: EdgeScratch = self
            .graph
            .edges_directed(coarse, Direction::Outgoing)
            .map(|e| (e.target(), e.weight().clone()))
            .collect();

        self.remove_vertex(coarse);

        for &instruction in &instructions {
            let handle = ElementHandle::new(instruction, ElementKind::Instruction);
            let idx = self.ensure_vertex(handle);
            for (reg, c) in &constraints {
                self.graph[idx].constraints.insert(*reg, c.clone());
            }
            for (src, weight) in &incoming {
                if *src != coarse && *src != idx {
                    self.graph.add_edge(*src, idx, weight.clone());
                }
            }
            for (dst, weight) in &outgoing {
                if *dst != coarse && *dst != idx {
                    self.graph.add_edge(idx, *dst, weight.clone());
                }
            }
        }
        Ok(())
    }

    /// Re-points every dependency edge at the vertices of its declared
    /// endpoints, re-creating those vertices if needed.
    fn rehome_dependency_edges(&mut self) {
        let edges: Vec<EdgeIndex<u32>> = self.graph.edge_indices().collect();
        for e in edges {
            let Some((src, dst)) = self.graph.edge_endpoints(e) else {
                continue;
            };
            let EdgeKind::Dependency { from, to, .. } = self.graph[e].kind else {
                continue;
            };
            if self.graph[src].element.id == from.id && self.graph[dst].element.id == to.id {
                continue;
            }
            let weight = self.graph[e].clone();
            self.graph.remove_edge(e);
            let s = self.ensure_vertex(from);
            let d = self.ensure_vertex(to);
            self.graph.add_edge(s, d, weight);
        }
    }

    /// Moves every vertex-scoped constraint to the vertex of its declared
    /// target element, re-creating that vertex if needed.
    fn rehome_constraints(&mut self) {
        let mut moves: Vec<(NodeIndex<u32>, RegistrationId, Constraint)> = Vec::new();
        for n in self.graph.node_indices() {
            let vertex = &self.graph[n];
            for (reg, c) in &vertex.constraints {
                if let Some(target) = c.target() {
                    if target.id != vertex.element.id {
                        moves.push((n, *reg, c.clone()));
                    }
                }
            }
        }
        for (n, reg, c) in moves {
            let Some(target) = c.target() else { continue };
            self.graph[n].constraints.shift_remove(&reg);
            let idx = self.ensure_vertex(target);
            self.graph[idx].constraints.insert(reg, c);
        }
    }

    /// Merges one vertex into its enclosing function's vertex.
    fn collapse_into_function(&mut self, n: NodeIndex<u32>, function: ElementId) {
        let f_idx = self.ensure_vertex(ElementHandle::new(function, ElementKind::Function));
        if f_idx == n {
            return;
        }
        let constraints: Vec<(RegistrationId, Constraint)> = self.graph[n]
            .constraints
            .iter()
            .map(|(reg, c)| (*reg, c.clone()))
            .collect();
        for (reg, c) in constraints {
            self.graph[f_idx].constraints.insert(reg, c);
        }
        self.redirect_edges(n, f_idx);
        self.remove_vertex(n);
    }

    /// Re-attaches all of `from`'s incident edges to `to`, dropping edges
    /// that would become self-edges. `from` keeps its (now dangling) edges;
    /// callers remove the vertex afterwards.
    fn redirect_edges(&mut self, from: NodeIndex<u32>, to: NodeIndex<u32>) {
        let incoming: EdgeScratch = self
            .graph
            .edges_directed(from, Direction::Incoming)
            .map(|e| (e.source(), e.weight().clone()))
            .collect();
        let outgoing: EdgeScratch = self
            .graph
            .edges_directed(from, Direction::Outgoing)
            .map(|e| (e.target(), e.weight().clone()))
            .collect();
        for (src, weight) in incoming {
            if src != from && src != to {
                self.graph.add_edge(src, to, weight);
            }
        }
        for (dst, weight) in outgoing {
            if dst != from && dst != to {
                self.graph.add_edge(to, dst, weight);
            }
        }
    }

    /// Drops self-edges and all but one of any edges sharing source,
    /// target, and registration index. Granularity merges fan edges out and
    /// back in; the survivors are indistinguishable.
    fn drop_duplicate_edges(&mut self) {
        let mut seen: HashSet<(NodeIndex<u32>, NodeIndex<u32>, RegistrationId)> = HashSet::new();
        let mut doomed: Vec<EdgeIndex<u32>> = Vec::new();
        let edges: Vec<EdgeIndex<u32>> = self.graph.edge_indices().collect();
        for e in edges {
            let Some((src, dst)) = self.graph.edge_endpoints(e) else {
                continue;
            };
            let key = (src, dst, self.graph[e].index);
            if src == dst || !seen.insert(key) {
                doomed.push(e);
            }
        }
        for e in doomed {
            self.graph.remove_edge(e);
        }
    }

    /// Removes instruction vertices with no constraints and no edges.
    fn prune_bare_instruction_vertices(&mut self) {
        let bare: Vec<NodeIndex<u32>> = self
            .graph
            .node_indices()
            .filter(|&n| {
                self.graph[n].element.kind == ElementKind::Instruction
                    && self.graph[n].constraints.is_empty()
                    && self.graph.edges_directed(n, Direction::Incoming).next().is_none()
                    && self.graph.edges_directed(n, Direction::Outgoing).next().is_none()
            })
            .collect();
        for n in bare {
            self.remove_vertex(n);
        }
    }
}

/// Rejects constraints referencing the reserved null handle.
fn check_handles(constraint: &Constraint) -> Result<(), GraphError> {
    let ok = match constraint {
        Constraint::Dependency { from, to, .. } => !from.id.is_null() && !to.id.is_null(),
        Constraint::Present { target, .. } | Constraint::Preserved { target, .. } => {
            !target.id.is_null()
        }
    };
    if ok {
        Ok(())
    } else {
        Err(GraphError::NullElement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementHandle;

    fn two_block_layout() -> ProgramLayout {
        let mut layout = ProgramLayout::new();
        // function 100: block 10 {1, 2}, block 11 {3, 4}
        layout.register_instruction(ElementId(1), ElementId(10), ElementId(100));
        layout.register_instruction(ElementId(2), ElementId(10), ElementId(100));
        layout.register_instruction(ElementId(3), ElementId(11), ElementId(100));
        layout.register_instruction(ElementId(4), ElementId(11), ElementId(100));
        layout
    }

    #[test]
    fn control_flow_edges_reuse_vertices() {
        let mut pg = ProtectionGraph::new();
        let a = ElementHandle::basic_block(10);
        let b = ElementHandle::basic_block(11);

        let r1 = pg.add_control_flow_edge(a, b).unwrap();
        let r2 = pg.add_control_flow_edge(a, b).unwrap();

        assert_eq!(pg.vertex_count(), 2);
        assert_eq!(pg.edge_count(), 2); // multigraph: both edges exist
        assert_ne!(r1, r2);
    }

    #[test]
    fn null_handles_are_rejected() {
        let mut pg = ProtectionGraph::new();
        let null = ElementHandle::instruction(0);
        let ok = ElementHandle::instruction(1);

        assert!(matches!(
            pg.add_control_flow_edge(null, ok),
            Err(GraphError::NullElement)
        ));
        let m = pg.add_manifest("vm", BTreeSet::new());
        assert!(matches!(
            pg.add_constraint(
                m,
                Constraint::Present {
                    target: null,
                    inverse: false
                }
            ),
            Err(GraphError::NullElement)
        ));
        assert_eq!(pg.vertex_count(), 0);
    }

    #[test]
    fn constraint_for_unknown_manifest_errors() {
        let mut pg = ProtectionGraph::new();
        let result = pg.add_constraint(
            ManifestId(7),
            Constraint::Present {
                target: ElementHandle::instruction(1),
                inverse: false,
            },
        );
        assert!(matches!(result, Err(GraphError::UnknownManifest { .. })));
        assert_eq!(pg.vertex_count(), 0);
    }

    #[test]
    fn dependency_constraint_creates_edge() {
        let mut pg = ProtectionGraph::new();
        let m = pg.add_manifest("vm", BTreeSet::new());
        pg.add_constraint(
            m,
            Constraint::Dependency {
                from: ElementHandle::instruction(1),
                to: ElementHandle::instruction(2),
                weak: false,
            },
        )
        .unwrap();

        assert_eq!(pg.vertex_count(), 2);
        assert_eq!(pg.edge_count(), 1);
    }

    #[test]
    fn present_constraint_attaches_to_vertex() {
        let mut pg = ProtectionGraph::new();
        let m = pg.add_manifest("vm", BTreeSet::new());
        let target = ElementHandle::instruction(1);
        let reg = pg
            .add_constraint(
                m,
                Constraint::Present {
                    target,
                    inverse: false,
                },
            )
            .unwrap();

        let vertex = pg.vertex(ElementId(1)).unwrap();
        assert_eq!(vertex.constraints.len(), 1);
        assert!(vertex.constraints.contains_key(&reg));
    }

    #[test]
    fn remove_manifest_is_idempotent_and_keeps_shared_vertices() {
        let mut pg = ProtectionGraph::new();
        let m1 = pg.add_manifest("vm", BTreeSet::new());
        let m2 = pg.add_manifest("cfi", BTreeSet::new());
        let target = ElementHandle::instruction(1);

        pg.add_constraint(
            m1,
            Constraint::Present {
                target,
                inverse: false,
            },
        )
        .unwrap();
        pg.add_constraint(
            m2,
            Constraint::Preserved {
                target,
                inverse: false,
            },
        )
        .unwrap();
        // A vertex only m1 references.
        pg.add_constraint(
            m1,
            Constraint::Present {
                target: ElementHandle::instruction(2),
                inverse: false,
            },
        )
        .unwrap();

        pg.remove_manifest(m1);
        // Shared vertex survives with m1's entry stripped; exclusive vertex
        // is gone.
        let shared = pg.vertex(ElementId(1)).unwrap();
        assert_eq!(shared.constraints.len(), 1);
        assert!(pg.vertex(ElementId(2)).is_none());
        assert_eq!(pg.removed_manifests(), &[m1]);

        let count = pg.vertex_count();
        pg.remove_manifest(m1);
        assert_eq!(pg.vertex_count(), count);
        assert_eq!(pg.removed_manifests(), &[m1]);
    }

    #[test]
    fn removal_observer_fires() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut pg = ProtectionGraph::new();
        let m = pg.add_manifest("vm", BTreeSet::new());
        let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        pg.on_manifest_removed(move |manifest| {
            sink.borrow_mut().push(manifest.name.clone());
        });

        pg.remove_manifest(m);
        assert_eq!(log.borrow().as_slice(), &["vm".to_string()]);
    }

    #[test]
    fn expand_to_instructions_rewrites_block_vertices() {
        let mut pg = ProtectionGraph::new();
        let layout = two_block_layout();
        let m = pg.add_manifest("vm", BTreeSet::new());
        pg.add_constraint(
            m,
            Constraint::Present {
                target: ElementHandle::basic_block(10),
                inverse: false,
            },
        )
        .unwrap();

        pg.expand_to_instructions(&layout).unwrap();

        assert!(pg.vertex(ElementId(10)).is_none());
        for instr in [1, 2] {
            let v = pg.vertex(ElementId(instr)).unwrap();
            assert_eq!(v.element.kind, ElementKind::Instruction);
            assert_eq!(v.constraints.len(), 1);
        }
    }

    #[test]
    fn expand_rewires_edges_to_instructions() {
        let mut pg = ProtectionGraph::new();
        let layout = two_block_layout();
        let m = pg.add_manifest("vm", BTreeSet::new());
        pg.add_constraint(
            m,
            Constraint::Dependency {
                from: ElementHandle::basic_block(10),
                to: ElementHandle::basic_block(11),
                weak: false,
            },
        )
        .unwrap();

        pg.expand_to_instructions(&layout).unwrap();

        // One block-to-block edge fans out over 2x2 instruction pairs.
        assert_eq!(pg.edge_count(), 4);
        assert_eq!(pg.vertex_count(), 4);
    }

    #[test]
    fn granularity_roundtrip_restores_constraint_attachments() {
        let mut pg = ProtectionGraph::new();
        let layout = two_block_layout();
        let m = pg.add_manifest("vm", BTreeSet::new());
        let reg = pg
            .add_constraint(
                m,
                Constraint::Present {
                    target: ElementHandle::basic_block(10),
                    inverse: false,
                },
            )
            .unwrap();
        pg.add_constraint(
            m,
            Constraint::Dependency {
                from: ElementHandle::basic_block(10),
                to: ElementHandle::basic_block(11),
                weak: false,
            },
        )
        .unwrap();

        pg.expand_to_instructions(&layout).unwrap();
        pg.reduce_to_instructions();

        // The block vertex is back and owns the same logical constraint.
        let block = pg.vertex(ElementId(10)).unwrap();
        assert!(block.constraints.contains_key(&reg));
        // The fanned-out dependency edges merged back into one.
        assert_eq!(pg.edge_count(), 1);
        let leftover: Vec<_> = pg
            .vertices()
            .filter(|v| v.element.kind == ElementKind::Instruction)
            .collect();
        assert!(leftover.is_empty(), "instruction vertices should be pruned");
    }

    #[test]
    fn expand_to_functions_merges_fine_vertices() {
        let mut pg = ProtectionGraph::new();
        let layout = two_block_layout();
        let m = pg.add_manifest("vm", BTreeSet::new());
        pg.add_constraint(
            m,
            Constraint::Present {
                target: ElementHandle::instruction(1),
                inverse: false,
            },
        )
        .unwrap();
        pg.add_constraint(
            m,
            Constraint::Preserved {
                target: ElementHandle::basic_block(11),
                inverse: false,
            },
        )
        .unwrap();

        pg.expand_to_functions(&layout).unwrap();

        assert_eq!(pg.vertex_count(), 1);
        let f = pg.vertex(ElementId(100)).unwrap();
        assert_eq!(f.element.kind, ElementKind::Function);
        assert_eq!(f.constraints.len(), 2);
    }

    #[test]
    fn reduce_to_functions_drops_self_edges() {
        let mut pg = ProtectionGraph::new();
        let layout = two_block_layout();
        let m = pg.add_manifest("vm", BTreeSet::new());
        // Dependency between two instructions of the same function becomes
        // a self-edge on the function vertex and must be dropped.
        pg.add_constraint(
            m,
            Constraint::Dependency {
                from: ElementHandle::instruction(1),
                to: ElementHandle::instruction(3),
                weak: false,
            },
        )
        .unwrap();

        pg.reduce_to_functions(&layout).unwrap();

        assert_eq!(pg.vertex_count(), 1);
        assert_eq!(pg.edge_count(), 0);
    }

    #[test]
    fn expand_to_functions_unknown_element_errors() {
        let mut pg = ProtectionGraph::new();
        let layout = ProgramLayout::new();
        let m = pg.add_manifest("vm", BTreeSet::new());
        pg.add_constraint(
            m,
            Constraint::Present {
                target: ElementHandle::instruction(1),
                inverse: false,
            },
        )
        .unwrap();

        assert!(matches!(
            pg.expand_to_functions(&layout),
            Err(GraphError::UnknownElement { id: ElementId(1) })
        ));
    }

    #[test]
    fn topological_sort_orders_manifests_by_dependency() {
        let mut pg = ProtectionGraph::new();
        let m1 = pg.add_manifest("vm", BTreeSet::new());
        let m2 = pg.add_manifest("cfi", BTreeSet::new());
        pg.add_constraint(
            m1,
            Constraint::Dependency {
                from: ElementHandle::value(1),
                to: ElementHandle::value(2),
                weak: false,
            },
        )
        .unwrap();
        pg.add_constraint(
            m2,
            Constraint::Dependency {
                from: ElementHandle::value(2),
                to: ElementHandle::value(3),
                weak: false,
            },
        )
        .unwrap();

        let order = pg.topological_sort_manifests(&[m2, m1]).unwrap();
        assert_eq!(order, vec![m1, m2]);
    }

    #[test]
    fn topological_sort_on_cycle_errors() {
        let mut pg = ProtectionGraph::new();
        let m1 = pg.add_manifest("vm", BTreeSet::new());
        let m2 = pg.add_manifest("cfi", BTreeSet::new());
        pg.add_constraint(
            m1,
            Constraint::Dependency {
                from: ElementHandle::value(1),
                to: ElementHandle::value(2),
                weak: false,
            },
        )
        .unwrap();
        pg.add_constraint(
            m2,
            Constraint::Dependency {
                from: ElementHandle::value(2),
                to: ElementHandle::value(1),
                weak: false,
            },
        )
        .unwrap();

        assert!(matches!(
            pg.topological_sort_manifests(&[m1, m2]),
            Err(GraphError::CyclicManifests)
        ));
    }

    #[test]
    fn manifests_without_graph_presence_keep_given_order() {
        let mut pg = ProtectionGraph::new();
        let m1 = pg.add_manifest("vm", BTreeSet::new());
        let m2 = pg.add_manifest("cfi", BTreeSet::new());

        let order = pg.topological_sort_manifests(&[m2, m1]).unwrap();
        assert_eq!(order, vec![m2, m1]);
    }

    #[test]
    fn dot_export_lists_vertices_and_edges() {
        let mut pg = ProtectionGraph::new();
        let m = pg.add_manifest("vm", BTreeSet::new());
        pg.add_constraint(
            m,
            Constraint::Dependency {
                from: ElementHandle::value(1),
                to: ElementHandle::value(2),
                weak: false,
            },
        )
        .unwrap();

        let dot = pg.to_dot();
        assert!(dot.starts_with("digraph {"));
        assert!(dot.contains("value:1"));
        assert!(dot.contains("dependency"));
    }
}
