//! The dependency graph over build targets.
//!
//! Structure (nodes and edges) is immutable once [`BuildGraph::validate`]
//! succeeds; during execution only each node's status, retry count, output
//! hash, and pending-dependency counter mutate, all through atomics or a
//! short-lived lock. Back-edges are stored as ids rather than references so
//! the node map remains the single owner of every node.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        RwLock,
        atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering},
    },
};

use color_eyre::Result;
use itertools::Itertools;
use tracing::{instrument, trace};

use crate::{
    codec::{Reader, Writer},
    error::{BuildError, ErrorKind},
    hash::Blake3,
    target::{Target, TargetId, TargetKind},
};

/// Node execution state.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, derive_more::Display)]
pub enum NodeStatus {
    #[display("pending")]
    Pending,
    #[display("building")]
    Building,
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
    #[display("cached")]
    Cached,
}

impl NodeStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Building => 1,
            Self::Success => 2,
            Self::Failed => 3,
            Self::Cached => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Building),
            2 => Some(Self::Success),
            3 => Some(Self::Failed),
            4 => Some(Self::Cached),
            _ => None,
        }
    }

    /// Whether this status satisfies dependents.
    pub fn is_complete_ok(self) -> bool {
        matches!(self, Self::Success | Self::Cached)
    }

    /// Whether this node has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cached)
    }
}

/// A graph vertex, 1:1 with a [`Target`].
#[derive(Debug)]
pub struct BuildNode {
    target: Target,
    dependents: Vec<TargetId>,
    status: AtomicU8,
    output_hash: RwLock<Option<Blake3>>,
    retry_count: AtomicU32,
    pending_deps: AtomicUsize,
}

impl BuildNode {
    fn new(target: Target) -> Self {
        Self {
            target,
            dependents: Vec::new(),
            status: AtomicU8::new(NodeStatus::Pending.as_u8()),
            output_hash: RwLock::new(None),
            retry_count: AtomicU32::new(0),
            pending_deps: AtomicUsize::new(0),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn id(&self) -> &TargetId {
        &self.target.id
    }

    /// Ids of the targets this node depends on.
    pub fn deps(&self) -> &[TargetId] {
        &self.target.deps
    }

    /// Ids of the targets that depend on this node.
    pub fn dependents(&self) -> &[TargetId] {
        &self.dependents
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::Acquire))
            .unwrap_or(NodeStatus::Pending)
    }

    /// Unconditionally set the status.
    pub fn set_status(&self, status: NodeStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// Transition `Pending -> Building`. Returns whether this caller won the
    /// transition, ensuring each node is dispatched exactly once.
    pub fn try_start(&self) -> bool {
        self.status
            .compare_exchange(
                NodeStatus::Pending.as_u8(),
                NodeStatus::Building.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Conditionally transition between statuses.
    pub fn transition(&self, from: NodeStatus, to: NodeStatus) -> bool {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn output_hash(&self) -> Option<Blake3> {
        self.output_hash.read().expect("output hash lock poisoned").clone()
    }

    pub fn set_output_hash(&self, hash: Blake3) {
        *self.output_hash.write().expect("output hash lock poisoned") = Some(hash);
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    pub fn bump_retry(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Remaining unfinished dependencies.
    pub fn pending_deps(&self) -> usize {
        self.pending_deps.load(Ordering::Acquire)
    }

    /// Decrement the pending-dependency counter. Returns whether the node
    /// just became ready. Release on the decrement pairs with the acquire in
    /// the ready check, establishing happens-before between a dependency's
    /// completion and the dependent's dispatch.
    pub fn resolve_dep(&self) -> bool {
        self.pending_deps.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn reset_for_execution(&self) {
        self.pending_deps
            .store(self.target.deps.len(), Ordering::Release);
    }
}

/// When cycle checking happens.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum ValidationMode {
    /// Check for a cycle on every edge add (`O(V^2)` worst case overall).
    Immediate,
    /// Accumulate edges unchecked, then run one `O(V + E)` check in
    /// [`BuildGraph::validate`].
    #[default]
    Deferred,
}

/// Container mapping [`TargetId`] to [`BuildNode`].
#[derive(Debug)]
pub struct BuildGraph {
    nodes: HashMap<TargetId, BuildNode>,
    mode: ValidationMode,
    /// Longest path to a terminal node, memoized by `validate`.
    depths: HashMap<TargetId, u64>,
}

impl BuildGraph {
    pub fn new(mode: ValidationMode) -> Self {
        Self {
            nodes: HashMap::new(),
            mode,
            depths: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &TargetId) -> Option<&BuildNode> {
        self.nodes.get(id)
    }

    pub fn must_node(&self, id: &TargetId) -> Result<&BuildNode> {
        self.nodes.get(id).ok_or_else(|| {
            BuildError::new(ErrorKind::NodeNotFound, format!("no node for {id}")).into()
        })
    }

    pub fn nodes(&self) -> impl Iterator<Item = &BuildNode> {
        self.nodes.values()
    }

    /// Ids in lexicographic order, for deterministic output.
    pub fn sorted_ids(&self) -> Vec<TargetId> {
        self.nodes.keys().cloned().sorted().collect()
    }

    /// Add a target as a new node.
    #[instrument(name = "BuildGraph::add_target", skip_all, fields(id = %target.id))]
    pub fn add_target(&mut self, target: Target) -> Result<()> {
        if self.nodes.contains_key(&target.id) {
            return Err(BuildError::new(
                ErrorKind::DuplicateTarget,
                format!("target {} declared twice", target.id),
            )
            .into());
        }

        // Declared deps become edges when both endpoints exist; callers add
        // targets first, then edges.
        let mut target = target;
        let declared = std::mem::take(&mut target.deps);
        let id = target.id.clone();
        self.nodes.insert(id.clone(), BuildNode::new(target));
        for dep in declared {
            self.add_dependency(&id, &dep)?;
        }
        Ok(())
    }

    /// Add an edge: `from` depends on `to`.
    #[instrument(name = "BuildGraph::add_dependency", skip(self))]
    pub fn add_dependency(&mut self, from: &TargetId, to: &TargetId) -> Result<()> {
        if !self.nodes.contains_key(to) {
            return Err(BuildError::new(
                ErrorKind::NodeNotFound,
                format!("{from} depends on undeclared target {to}"),
            )
            .into());
        }
        if !self.nodes.contains_key(from) {
            return Err(BuildError::new(
                ErrorKind::NodeNotFound,
                format!("undeclared target {from}"),
            )
            .into());
        }
        if from == to {
            return Err(cycle_error(vec![from.clone(), to.clone()]));
        }

        if self.mode == ValidationMode::Immediate
            && let Some(mut path) = self.path_between(to, from)
        {
            // Adding from -> to would close the loop.
            path.insert(0, from.clone());
            return Err(cycle_error(path));
        }

        let node = self.nodes.get_mut(from).expect("checked above");
        if !node.target.deps.contains(to) {
            node.target.deps.push(to.clone());
        }
        let node = self.nodes.get_mut(to).expect("checked above");
        if !node.dependents.contains(from) {
            node.dependents.push(from.clone());
        }
        trace!(%from, %to, "edge added");
        Ok(())
    }

    /// DFS over dependency edges from `start`, returning a path to `goal`.
    fn path_between(&self, start: &TargetId, goal: &TargetId) -> Option<Vec<TargetId>> {
        let mut stack = vec![vec![start.clone()]];
        let mut seen = HashSet::new();

        while let Some(path) = stack.pop() {
            let current = path.last().expect("paths are non-empty");
            if current == goal {
                return Some(path);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(current) {
                for dep in node.deps() {
                    let mut next = path.clone();
                    next.push(dep.clone());
                    stack.push(next);
                }
            }
        }
        None
    }

    /// Check the DAG invariant and memoize critical-path depths.
    ///
    /// Uses Kahn's algorithm; if any node remains unprocessed, a concrete
    /// cycle path is extracted for diagnostics.
    #[instrument(name = "BuildGraph::validate", skip_all, fields(nodes = self.nodes.len()))]
    pub fn validate(&mut self) -> Result<()> {
        let mut in_degree: HashMap<&TargetId, usize> = self
            .nodes
            .values()
            .map(|node| (node.id(), node.deps().len()))
            .collect();

        let mut queue: VecDeque<&TargetId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut processed = 0;
        while let Some(id) = queue.pop_front() {
            processed += 1;
            for dependent in self.nodes[id].dependents() {
                let degree = in_degree.get_mut(dependent).expect("dependent is a node");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if processed != self.nodes.len() {
            let cycle = self.find_cycle().expect("unprocessed nodes imply a cycle");
            return Err(cycle_error(cycle));
        }

        self.depths = self.compute_depths();
        Ok(())
    }

    /// Locate one cycle for diagnostics, as a closed path `[a, .., a]`.
    pub fn find_cycle(&self) -> Option<Vec<TargetId>> {
        #[derive(Copy, Clone, Eq, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: HashMap<&TargetId, Color> =
            self.nodes.keys().map(|id| (id, Color::White)).collect();

        // Deterministic start order so diagnostics are stable.
        for start in self.nodes.keys().sorted() {
            if color[start] != Color::White {
                continue;
            }

            let mut path: Vec<&TargetId> = Vec::new();
            let mut stack: Vec<(&TargetId, usize)> = vec![(start, 0)];

            while let Some((id, next_dep)) = stack.pop() {
                if next_dep == 0 {
                    color.insert(id, Color::Gray);
                    path.push(id);
                }

                let deps = self.nodes[id].deps();
                if next_dep < deps.len() {
                    stack.push((id, next_dep + 1));
                    let dep = &deps[next_dep];
                    match color[dep] {
                        Color::Gray => {
                            // Found: close the loop from dep around to dep.
                            let from = path.iter().position(|p| *p == dep).expect("gray on path");
                            let mut cycle: Vec<TargetId> =
                                path[from..].iter().map(|id| (*id).clone()).collect();
                            cycle.push(dep.clone());
                            return Some(cycle);
                        }
                        Color::White => stack.push((dep, 0)),
                        Color::Black => {}
                    }
                } else {
                    color.insert(id, Color::Black);
                    path.pop();
                }
            }
        }
        None
    }

    /// Longest path to a terminal node, per node.
    ///
    /// `depth(n) = 1 + max(depth(d))` over `n`'s dependents; terminals have
    /// depth 1. High depth means a long chain of downstream work, so the
    /// scheduler starts those nodes first.
    fn compute_depths(&self) -> HashMap<TargetId, u64> {
        let mut depths: HashMap<TargetId, u64> = HashMap::with_capacity(self.nodes.len());
        // Process in reverse topological order over dependents: repeatedly
        // relax from nodes whose dependents are all resolved.
        let mut remaining: HashMap<&TargetId, usize> = self
            .nodes
            .values()
            .map(|node| (node.id(), node.dependents().len()))
            .collect();
        let mut queue: VecDeque<&TargetId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();

        while let Some(id) = queue.pop_front() {
            let node = &self.nodes[id];
            let depth = 1 + node
                .dependents()
                .iter()
                .map(|dep| depths.get(dep).copied().unwrap_or(0))
                .max()
                .unwrap_or(0);
            depths.insert(id.clone(), depth);

            for dep in node.deps() {
                let count = remaining.get_mut(dep).expect("dep is a node");
                *count -= 1;
                if *count == 0 {
                    queue.push_back(dep);
                }
            }
        }
        depths
    }

    /// The memoized critical-path length for a node. Zero before `validate`.
    pub fn depth(&self, id: &TargetId) -> u64 {
        self.depths.get(id).copied().unwrap_or(0)
    }

    /// Execution order: a linear extension of the dependency order.
    ///
    /// Ties are broken by critical-path length descending, then id, so
    /// high-fan-out targets are scheduled earlier and the order is stable.
    #[instrument(name = "BuildGraph::topological_sort", skip_all)]
    pub fn topological_sort(&self) -> Result<Vec<TargetId>> {
        let mut in_degree: HashMap<&TargetId, usize> = self
            .nodes
            .values()
            .map(|node| (node.id(), node.deps().len()))
            .collect();

        let mut ready: Vec<&TargetId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while !ready.is_empty() {
            // Highest priority last for a cheap pop: deepest first, then
            // lexicographically smallest id on ties.
            ready.sort_by(|a, b| self.depth(a).cmp(&self.depth(b)).then_with(|| b.cmp(a)));
            let id = ready.pop().expect("non-empty");
            order.push(id.clone());

            for dependent in self.nodes[id].dependents() {
                let degree = in_degree.get_mut(dependent).expect("dependent is a node");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(self.nodes[dependent].id());
                }
            }
        }

        if order.len() != self.nodes.len() {
            let cycle = self.find_cycle().expect("unprocessed nodes imply a cycle");
            return Err(cycle_error(cycle));
        }
        Ok(order)
    }

    /// The longest dependency chain, optionally rooted at `from`.
    ///
    /// Returned in execution order (dependencies before dependents is not
    /// implied; this is the chain from `from` through its dependents).
    pub fn critical_path(&self, from: Option<&TargetId>) -> Vec<TargetId> {
        let start = match from {
            Some(id) => id.clone(),
            None => match self
                .depths
                .iter()
                .max_by_key(|(id, depth)| (**depth, std::cmp::Reverse((*id).clone())))
            {
                Some((id, _)) => id.clone(),
                None => return Vec::new(),
            },
        };

        let mut path = vec![start.clone()];
        let mut current = start;
        while let Some(node) = self.nodes.get(&current) {
            let next = node
                .dependents()
                .iter()
                .max_by_key(|dep| (self.depth(dep), std::cmp::Reverse((*dep).clone())));
            match next {
                Some(dep) => {
                    path.push(dep.clone());
                    current = dep.clone();
                }
                None => break,
            }
        }
        path
    }

    /// Initialize per-node pending-dependency counters before execution.
    pub fn reset_for_execution(&self) {
        for node in self.nodes.values() {
            node.reset_for_execution();
        }
    }

    /// All transitive dependents of `id`, in BFS order.
    pub fn transitive_dependents(&self, id: &TargetId) -> Vec<TargetId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<TargetId> = self
            .nodes
            .get(id)
            .map(|node| node.dependents().to_vec())
            .unwrap_or_default()
            .into();
        let mut result = Vec::new();

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                queue.extend(node.dependents().iter().cloned());
            }
            result.push(current);
        }
        result
    }

    /// Human-readable rendering with status glyphs.
    pub fn print(&self) -> String {
        let mut out = String::new();
        for id in self.sorted_ids() {
            let node = &self.nodes[&id];
            let glyph = match node.status() {
                NodeStatus::Pending => " ",
                NodeStatus::Building => "*",
                NodeStatus::Success => "+",
                NodeStatus::Failed => "!",
                NodeStatus::Cached => "=",
            };
            out.push_str(&format!("[{glyph}] {id} (depth {})\n", self.depth(&id)));
            for dep in node.deps().iter().sorted() {
                out.push_str(&format!("      -> {dep}\n"));
            }
        }
        out
    }

    /// Encode the graph structure (targets and edges; no execution state).
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32(self.nodes.len() as u32);
        for id in self.sorted_ids() {
            let target = self.nodes[&id].target();
            encode_target(&mut w, target);
        }
        w.finish()
    }

    /// Decode a graph previously produced by [`BuildGraph::serialize`].
    ///
    /// The result is validated, with depths memoized; all nodes start
    /// `Pending`.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let count = r.u32()? as usize;

        let mut graph = Self::new(ValidationMode::Deferred);
        let mut targets = Vec::with_capacity(count);
        for _ in 0..count {
            targets.push(decode_target(&mut r)?);
        }
        for target in targets {
            graph.add_target(target)?;
        }
        graph.validate()?;
        Ok(graph)
    }
}

fn cycle_error(path: Vec<TargetId>) -> color_eyre::Report {
    let rendered = path.iter().map(ToString::to_string).join(" -> ");
    BuildError::new(ErrorKind::GraphCycle, format!("dependency cycle: {rendered}"))
        .suggest("break the cycle by removing one of the listed dependencies")
        .into()
}

fn encode_target(w: &mut Writer, target: &Target) {
    encode_target_id(w, &target.id);
    w.put_u8(target.kind.as_u8());
    w.put_str(&target.language);
    w.put_u32(target.sources.len() as u32);
    for source in &target.sources {
        w.put_str(&source.to_string_lossy());
    }
    w.put_u32(target.deps.len() as u32);
    for dep in &target.deps {
        encode_target_id(w, dep);
    }
    w.put_u32(target.env.len() as u32);
    for (key, value) in &target.env {
        w.put_str(key).put_str(value);
    }
    match &target.output_hint {
        Some(hint) => w.put_bool(true).put_str(&hint.to_string_lossy()),
        None => w.put_bool(false),
    };
    w.put_u32(target.config.len() as u32);
    for (key, value) in &target.config {
        w.put_str(key).put_str(value);
    }
}

pub(crate) fn encode_target_id(w: &mut Writer, id: &TargetId) {
    w.put_str(&id.workspace).put_str(&id.path).put_str(&id.name);
}

pub(crate) fn decode_target_id(r: &mut Reader<'_>) -> Result<TargetId> {
    let workspace = r.str()?.to_string();
    let path = r.str()?.to_string();
    let name = r.str()?.to_string();
    Ok(TargetId {
        workspace,
        path,
        name,
    })
}

fn decode_target(r: &mut Reader<'_>) -> Result<Target> {
    let id = decode_target_id(r)?;
    let kind = TargetKind::from_u8(r.u8()?).ok_or_else(|| {
        BuildError::new(ErrorKind::CacheCorrupted, "unknown target kind in graph record")
    })?;
    let mut target = Target::new(id, kind, r.str()?.to_string());

    let sources = r.u32()?;
    for _ in 0..sources {
        target.sources.push(r.str()?.into());
    }
    let deps = r.u32()?;
    for _ in 0..deps {
        target.deps.push(decode_target_id(r)?);
    }
    let envs = r.u32()?;
    for _ in 0..envs {
        let key = r.str()?.to_string();
        let value = r.str()?.to_string();
        target.env.insert(key, value);
    }
    if r.bool()? {
        target.output_hint = Some(r.str()?.into());
    }
    let configs = r.u32()?;
    for _ in 0..configs {
        let key = r.str()?.to_string();
        let value = r.str()?.to_string();
        target.config.insert(key, value);
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(name: &str) -> TargetId {
        TargetId::new("test", "pkg", name)
    }

    fn target(name: &str, deps: &[&str]) -> Target {
        let mut t = Target::new(id(name), TargetKind::Library, "c");
        t.deps = deps.iter().map(|d| id(d)).collect();
        t
    }

    fn diamond() -> BuildGraph {
        // top depends on left and right; both depend on base.
        let mut graph = BuildGraph::new(ValidationMode::Deferred);
        graph.add_target(target("base", &[])).unwrap();
        graph.add_target(target("left", &["base"])).unwrap();
        graph.add_target(target("right", &["base"])).unwrap();
        graph.add_target(target("top", &["left", "right"])).unwrap();
        graph.validate().unwrap();
        graph
    }

    #[test]
    fn duplicate_target_is_rejected() {
        let mut graph = BuildGraph::new(ValidationMode::Deferred);
        graph.add_target(target("a", &[])).unwrap();
        let err = graph.add_target(target("a", &[])).unwrap_err();
        assert_eq!(
            BuildError::from_report(&err).unwrap().kind(),
            ErrorKind::DuplicateTarget,
        );
    }

    #[test]
    fn edge_to_unknown_node_is_rejected() {
        let mut graph = BuildGraph::new(ValidationMode::Deferred);
        let err = graph.add_target(target("a", &["ghost"])).unwrap_err();
        assert_eq!(
            BuildError::from_report(&err).unwrap().kind(),
            ErrorKind::NodeNotFound,
        );
    }

    #[test]
    fn immediate_mode_rejects_cycle_on_edge_add() {
        let mut graph = BuildGraph::new(ValidationMode::Immediate);
        graph.add_target(target("x", &[])).unwrap();
        graph.add_target(target("y", &["x"])).unwrap();

        let err = graph.add_dependency(&id("x"), &id("y")).unwrap_err();
        assert_eq!(
            BuildError::from_report(&err).unwrap().kind(),
            ErrorKind::GraphCycle,
        );
    }

    #[test]
    fn deferred_mode_finds_cycle_at_validate() {
        let mut graph = BuildGraph::new(ValidationMode::Deferred);
        graph.add_target(target("x", &[])).unwrap();
        graph.add_target(target("y", &[])).unwrap();
        graph.add_target(target("z", &[])).unwrap();
        graph.add_dependency(&id("x"), &id("y")).unwrap();
        graph.add_dependency(&id("y"), &id("z")).unwrap();
        graph.add_dependency(&id("z"), &id("x")).unwrap();

        let err = graph.validate().unwrap_err();
        let err = BuildError::from_report(&err).unwrap();
        assert_eq!(err.kind(), ErrorKind::GraphCycle);

        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.len(), 4, "closed path: {cycle:?}");
        assert_eq!(cycle.first(), cycle.last());
        // Every consecutive pair is a real dependency edge.
        for pair in cycle.windows(2) {
            assert!(graph.node(&pair[0]).unwrap().deps().contains(&pair[1]));
        }
    }

    #[test]
    fn toposort_is_a_linear_extension() {
        let graph = diamond();
        let order = graph.topological_sort().unwrap();
        assert_eq!(order.len(), 4);

        let position: HashMap<&TargetId, usize> =
            order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        for node in graph.nodes() {
            for dep in node.deps() {
                assert!(
                    position[dep] < position[node.id()],
                    "{dep} must precede {}",
                    node.id(),
                );
            }
        }
    }

    #[test]
    fn depths_prioritize_high_fanout() {
        let graph = diamond();
        // base -> left -> top is the longest chain: depth(base) = 3.
        assert_eq!(graph.depth(&id("base")), 3);
        assert_eq!(graph.depth(&id("left")), 2);
        assert_eq!(graph.depth(&id("top")), 1);

        let order = graph.topological_sort().unwrap();
        assert_eq!(order[0], id("base"));
    }

    #[test]
    fn critical_path_walks_longest_chain() {
        let graph = diamond();
        let path = graph.critical_path(None);
        assert_eq!(path.len(), 3);
        assert_eq!(path[0], id("base"));
        assert_eq!(path[2], id("top"));

        let from_left = graph.critical_path(Some(&id("left")));
        assert_eq!(from_left, vec![id("left"), id("top")]);
    }

    #[test]
    fn single_node_is_immediately_ready() {
        let mut graph = BuildGraph::new(ValidationMode::Deferred);
        graph.add_target(target("solo", &[])).unwrap();
        graph.validate().unwrap();
        graph.reset_for_execution();

        let node = graph.node(&id("solo")).unwrap();
        assert_eq!(node.pending_deps(), 0);
        assert!(node.try_start());
        // Exactly once: the second dispatch attempt loses the race.
        assert!(!node.try_start());
    }

    #[test]
    fn resolve_dep_marks_ready_exactly_once() {
        let graph = diamond();
        graph.reset_for_execution();

        let top = graph.node(&id("top")).unwrap();
        assert_eq!(top.pending_deps(), 2);
        assert!(!top.resolve_dep());
        assert!(top.resolve_dep());
    }

    #[test]
    fn transitive_dependents_cover_failure_propagation() {
        let graph = diamond();
        let mut affected = graph.transitive_dependents(&id("base"));
        affected.sort();
        assert_eq!(affected, vec![id("left"), id("right"), id("top")]);
    }

    #[test]
    fn serialize_round_trips_structure() {
        let graph = diamond();
        let bytes = graph.serialize();
        let restored = BuildGraph::deserialize(&bytes).unwrap();

        assert_eq!(restored.len(), graph.len());
        for node in graph.nodes() {
            let restored_node = restored.node(node.id()).unwrap();
            assert_eq!(restored_node.target(), node.target());
            assert_eq!(restored_node.status(), NodeStatus::Pending);
            assert_eq!(restored_node.dependents().len(), node.dependents().len());
        }
    }
}
