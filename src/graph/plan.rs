//! Topological planning.
//!
//! Turns the set of keys touched by a transaction into an ordered list of
//! descriptor operations. All deletions run before all creations:
//!
//! - deletions remove dependents before their dependencies and derived
//!   values before their parent;
//! - creations add dependencies before dependents and a parent before its
//!   derived values.
//!
//! Values are grouped into units (a parent plus the derived values planned
//! in the same phase) so that derived operations sit next to their parent's
//! operation whenever dependencies allow. Ties are broken by the order in
//! which keys were touched, then by graph insertion order.
//!
//! Planning never mutates the graph; the engine records the outcome.

use super::node::{Node, NodeState};
use super::store::Graph;
use crate::core::error::ErrorKind;
use crate::descriptor::registry::DescriptorRegistry;
use crate::descriptor::value::Key;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Descriptor operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Add,
    Update,
    Delete,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Why an operation was planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpReason {
    /// The key's own change.
    Requested,
    /// One half of a Delete + Add re-creation.
    Recreate,
    /// A dependency or parent is being removed or re-created.
    Cascade,
    /// A pending value whose dependencies are now met, or a removed value
    /// whose dependents are now going away.
    Unblocked,
}

/// One planned operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOp {
    pub key: Key,
    pub op: OpKind,
    pub reason: OpReason,
}

/// Ordered operations plus the keys rejected for cycles.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub ops: Vec<PlannedOp>,
    /// Dependency cycles among values to be created; no operation is
    /// planned for their members.
    pub cycles: Vec<Vec<Key>>,
    /// Touched keys whose desired value is equivalent to the applied one.
    pub unchanged: Vec<Key>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Position of an operation in the plan.
    pub fn position(&self, key: &str, op: OpKind) -> Option<usize> {
        self.ops.iter().position(|o| o.key == key && o.op == op)
    }
}

/// Compute the operation plan for `change_set`, given in staging order.
pub fn topological_plan(
    graph: &Graph,
    registry: &DescriptorRegistry,
    change_set: &[Key],
) -> Plan {
    Planner::new(graph, registry, change_set).run()
}

/// Tie-break rank: touched keys by staging order, then all others by seq.
type Rank = (u8, u64);

type SortKey = (Rank, usize, Rank);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Deletion,
    Creation,
}

struct Planner<'a> {
    graph: &'a Graph,
    registry: &'a DescriptorRegistry,
    change_set: &'a [Key],
    touched: HashMap<&'a str, u64>,
}

impl<'a> Planner<'a> {
    fn new(graph: &'a Graph, registry: &'a DescriptorRegistry, change_set: &'a [Key]) -> Self {
        let mut touched = HashMap::new();
        for (idx, key) in change_set.iter().enumerate() {
            touched.entry(key.as_str()).or_insert(idx as u64);
        }
        Self {
            graph,
            registry,
            change_set,
            touched,
        }
    }

    fn rank(&self, key: &str) -> Rank {
        if let Some(idx) = self.touched.get(key) {
            return (0, *idx);
        }
        self.graph.get(key).map_or((2, 0), |n| (1, n.seq))
    }

    fn run(self) -> Plan {
        let mut delete: HashMap<&'a str, OpReason> = HashMap::new();
        let mut update: HashSet<&'a str> = HashSet::new();
        let mut unchanged = Vec::new();

        for key in self.change_set {
            let Some(node) = self.graph.get(key) else {
                continue;
            };
            let Some(descriptor) = self.registry.get(&node.descriptor) else {
                continue;
            };
            match (&node.desired, &node.applied) {
                (None, Some(_)) => {
                    delete.insert(node.key.as_str(), OpReason::Requested);
                }
                (Some(desired), Some(applied)) => {
                    if descriptor.equivalent_values(key, applied, desired) {
                        unchanged.push(key.clone());
                    } else if descriptor.supports_update()
                        && !descriptor.recreate_on_update(
                            key,
                            applied,
                            desired,
                            node.metadata.as_ref(),
                        )
                    {
                        update.insert(node.key.as_str());
                    } else {
                        delete.insert(node.key.as_str(), OpReason::Recreate);
                    }
                }
                _ => {}
            }
        }

        let mut excluded: HashSet<&'a str> = HashSet::new();
        let mut cycles = Vec::new();
        loop {
            loop {
                let known = delete.len();
                self.resume_deletes(&mut delete);
                self.cascade(&mut delete);
                if delete.len() == known {
                    break;
                }
            }
            let create = self.creatable(&delete, &update, &excluded);

            // An in-place update needs its new dependencies too; otherwise
            // the old value is removed and the new one waits.
            let blocked: Vec<&'a str> = update
                .iter()
                .copied()
                .filter(|key| !self.deps_met(key, &delete, &create, &update))
                .collect();
            if !blocked.is_empty() {
                for key in blocked {
                    update.remove(key);
                    delete.insert(key, OpReason::Recreate);
                }
                continue;
            }

            let found = self.find_cycles(&create, &update);
            if found.is_empty() {
                let ops = self.order(&delete, &create, &update);
                return Plan {
                    ops,
                    cycles,
                    unchanged,
                };
            }
            for cycle in found {
                for &key in &cycle {
                    excluded.insert(key);
                    update.remove(key);
                }
                cycles.push(cycle.into_iter().map(str::to_string).collect());
            }
        }
    }

    /// Extend deletions to applied dependents, transitively.
    fn cascade(&self, delete: &mut HashMap<&'a str, OpReason>) {
        let mut stack: Vec<&'a str> = delete.keys().copied().collect();
        while let Some(key) = stack.pop() {
            for dependent in self.graph.dependents_of(key) {
                let Some(node) = self.graph.get(dependent) else {
                    continue;
                };
                if node.applied.is_none() || delete.contains_key(node.key.as_str()) {
                    continue;
                }
                delete.insert(node.key.as_str(), OpReason::Cascade);
                stack.push(node.key.as_str());
            }
        }
    }

    /// Pick up dependencies of touched or deleted keys whose own delete was
    /// held back by a dependent still in the dataplane. Removed values are
    /// deleted; desired ones are re-created.
    fn resume_deletes(&self, delete: &mut HashMap<&'a str, OpReason>) {
        let mut stack: Vec<&'a str> = delete.keys().copied().collect();
        stack.extend(self.change_set.iter().map(String::as_str));
        while let Some(key) = stack.pop() {
            let Some(node) = self.graph.get(key) else {
                continue;
            };
            for dep in &node.dependencies {
                let Some(dep) = self.graph.get(&dep.key) else {
                    continue;
                };
                let held = dep.applied.is_some()
                    && matches!(
                        dep.state,
                        NodeState::Pending | NodeState::Failed(ErrorKind::DependencyFailed)
                    );
                if !held || delete.contains_key(dep.key.as_str()) {
                    continue;
                }
                let reason = match dep.desired {
                    Some(_) => OpReason::Recreate,
                    None => OpReason::Unblocked,
                };
                delete.insert(dep.key.as_str(), reason);
                stack.push(dep.key.as_str());
            }
        }
    }

    /// Largest set of candidates whose dependencies are applied or
    /// themselves in the set. Cycles survive here and are found later.
    fn creatable(
        &self,
        delete: &HashMap<&'a str, OpReason>,
        update: &HashSet<&'a str>,
        excluded: &HashSet<&'a str>,
    ) -> HashSet<&'a str> {
        let mut create: HashSet<&'a str> = self
            .graph
            .nodes()
            .into_iter()
            .filter(|n| self.is_candidate(n, delete, update, excluded))
            .map(|n| n.key.as_str())
            .collect();
        loop {
            let blocked: Vec<&'a str> = create
                .iter()
                .copied()
                .filter(|key| !self.deps_met(key, delete, &create, update))
                .collect();
            if blocked.is_empty() {
                return create;
            }
            for key in blocked {
                create.remove(key);
            }
        }
    }

    fn is_candidate(
        &self,
        node: &Node,
        delete: &HashMap<&'a str, OpReason>,
        update: &HashSet<&'a str>,
        excluded: &HashSet<&'a str>,
    ) -> bool {
        let key = node.key.as_str();
        if node.desired.is_none() || excluded.contains(key) || update.contains(key) {
            return false;
        }
        if node.applied.is_some() && !delete.contains_key(key) {
            return false;
        }
        self.touched.contains_key(key)
            || matches!(node.state, NodeState::Pending | NodeState::Applied)
            || node.state.is_recoverable_failure()
    }

    fn deps_met(
        &self,
        key: &str,
        delete: &HashMap<&'a str, OpReason>,
        create: &HashSet<&'a str>,
        update: &HashSet<&'a str>,
    ) -> bool {
        let Some(node) = self.graph.get(key) else {
            return false;
        };
        node.dependencies.iter().all(|dep| {
            let dep = dep.key.as_str();
            if create.contains(dep) || update.contains(dep) {
                return true;
            }
            self.graph
                .get(dep)
                .map_or(false, |n| n.satisfies_dependents() && !delete.contains_key(dep))
        })
    }

    /// Strongly connected components of the creation set with more than one
    /// member, plus self-dependent keys.
    fn find_cycles(
        &self,
        create: &HashSet<&'a str>,
        update: &HashSet<&'a str>,
    ) -> Vec<Vec<&'a str>> {
        let mut members: Vec<&'a str> = create.iter().chain(update.iter()).copied().collect();
        members.sort_by_key(|key| self.rank(key));
        let set: HashSet<&'a str> = members.iter().copied().collect();

        let mut edges: HashMap<&'a str, Vec<&'a str>> = HashMap::new();
        let mut self_loops = Vec::new();
        for &key in &members {
            let Some(node) = self.graph.get(key) else {
                continue;
            };
            for dep in &node.dependencies {
                if dep.key == key {
                    self_loops.push(key);
                } else if let Some(&dep) = set.get(dep.key.as_str()) {
                    edges.entry(dep).or_default().push(key);
                }
            }
        }

        let mut tarjan = Tarjan::new(&edges);
        for &key in &members {
            if !tarjan.index.contains_key(key) {
                tarjan.visit(key);
            }
        }
        let mut cycles: Vec<Vec<&'a str>> = tarjan
            .components
            .into_iter()
            .filter(|c| c.len() > 1)
            .collect();
        for key in self_loops {
            if !cycles.iter().any(|c| c.contains(&key)) {
                cycles.push(vec![key]);
            }
        }
        for cycle in &mut cycles {
            cycle.sort_by_key(|key| self.rank(key));
        }
        cycles.sort_by_key(|c| c.first().map(|key| self.rank(key)));
        cycles
    }

    fn order(
        &self,
        delete: &HashMap<&'a str, OpReason>,
        create: &HashSet<&'a str>,
        update: &HashSet<&'a str>,
    ) -> Vec<PlannedOp> {
        let mut ops = Vec::new();

        let deletions: HashSet<&'a str> = delete.keys().copied().collect();
        for key in self.sort_phase(&deletions, Phase::Deletion) {
            ops.push(PlannedOp {
                key: key.to_string(),
                op: OpKind::Delete,
                reason: delete.get(key).copied().unwrap_or(OpReason::Requested),
            });
        }

        let creations: HashSet<&'a str> = create.union(update).copied().collect();
        for key in self.sort_phase(&creations, Phase::Creation) {
            let (op, reason) = if update.contains(key) {
                (OpKind::Update, OpReason::Requested)
            } else if let Some(reason) = delete.get(key) {
                match reason {
                    OpReason::Cascade => (OpKind::Add, OpReason::Cascade),
                    _ => (OpKind::Add, OpReason::Recreate),
                }
            } else if self.touched.contains_key(key) {
                (OpKind::Add, OpReason::Requested)
            } else {
                (OpKind::Add, OpReason::Unblocked)
            };
            ops.push(PlannedOp {
                key: key.to_string(),
                op,
                reason,
            });
        }
        ops
    }

    /// Kahn's algorithm over one phase, preferring the lowest sort key.
    ///
    /// A stalled deletion phase (only possible through a cycle) continues
    /// with the lowest remaining key.
    fn sort_phase(&self, set: &HashSet<&'a str>, phase: Phase) -> Vec<&'a str> {
        let sort_keys = self.unit_sort_keys(set, phase);
        let sort_key = |key: &str| sort_keys.get(key).copied().unwrap_or(((2, 0), 0, (2, 0)));

        let mut indegree: HashMap<&'a str, usize> = set.iter().map(|k| (*k, 0)).collect();
        let mut successors: HashMap<&'a str, Vec<&'a str>> = HashMap::new();
        for &key in set {
            let Some(node) = self.graph.get(key) else {
                continue;
            };
            for dep in &node.dependencies {
                let Some(&dep) = set.get(dep.key.as_str()) else {
                    continue;
                };
                if dep == key {
                    continue;
                }
                let (from, to) = match phase {
                    Phase::Creation => (dep, key),
                    Phase::Deletion => (key, dep),
                };
                successors.entry(from).or_default().push(to);
                if let Some(n) = indegree.get_mut(to) {
                    *n += 1;
                }
            }
        }

        let mut remaining: BTreeSet<(SortKey, &'a str)> =
            set.iter().map(|k| (sort_key(*k), *k)).collect();
        let mut ready: BTreeSet<(SortKey, &'a str)> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(k, _)| (sort_key(*k), *k))
            .collect();
        let mut emitted: HashSet<&'a str> = HashSet::new();
        let mut order = Vec::with_capacity(set.len());

        while let Some(entry) = ready.pop_first().or_else(|| remaining.first().copied()) {
            let key = entry.1;
            remaining.remove(&entry);
            ready.remove(&entry);
            emitted.insert(key);
            order.push(key);
            for &next in successors.get(key).into_iter().flatten() {
                if let Some(n) = indegree.get_mut(next) {
                    *n = n.saturating_sub(1);
                    if *n == 0 && !emitted.contains(next) {
                        ready.insert((sort_key(next), next));
                    }
                }
            }
        }
        order
    }

    /// Sort keys placing each derived value inside its parent's unit:
    /// pre-order for creation, post-order for deletion.
    fn unit_sort_keys(
        &self,
        set: &HashSet<&'a str>,
        phase: Phase,
    ) -> HashMap<&'a str, SortKey> {
        let mut children: HashMap<&'a str, Vec<&'a str>> = HashMap::new();
        let mut roots = Vec::new();
        for &key in set {
            let parent = self
                .graph
                .get(key)
                .and_then(|n| n.derived_from.as_deref())
                .and_then(|p| set.get(p).copied());
            match parent {
                Some(parent) => children.entry(parent).or_default().push(key),
                None => roots.push(key),
            }
        }
        for list in children.values_mut() {
            list.sort_by_key(|key| self.rank(key));
        }

        let mut keys = HashMap::new();
        for root in roots {
            let root_rank = self.rank(root);
            let mut walk = Vec::new();
            Self::walk_unit(root, &children, phase, &mut walk);
            for (ordinal, key) in walk.into_iter().enumerate() {
                keys.insert(key, (root_rank, ordinal, self.rank(key)));
            }
        }
        keys
    }

    fn walk_unit(
        key: &'a str,
        children: &HashMap<&'a str, Vec<&'a str>>,
        phase: Phase,
        out: &mut Vec<&'a str>,
    ) {
        if phase == Phase::Creation {
            out.push(key);
        }
        for &child in children.get(key).into_iter().flatten() {
            Self::walk_unit(child, children, phase, out);
        }
        if phase == Phase::Deletion {
            out.push(key);
        }
    }
}

/// Tarjan's strongly connected components.
struct Tarjan<'g, 'a> {
    edges: &'g HashMap<&'a str, Vec<&'a str>>,
    index: HashMap<&'a str, usize>,
    lowlink: HashMap<&'a str, usize>,
    on_stack: HashSet<&'a str>,
    stack: Vec<&'a str>,
    next: usize,
    components: Vec<Vec<&'a str>>,
}

impl<'g, 'a> Tarjan<'g, 'a> {
    fn new(edges: &'g HashMap<&'a str, Vec<&'a str>>) -> Self {
        Self {
            edges,
            index: HashMap::new(),
            lowlink: HashMap::new(),
            on_stack: HashSet::new(),
            stack: Vec::new(),
            next: 0,
            components: Vec::new(),
        }
    }

    /// Iterative depth-first walk; `work` holds each open vertex with the
    /// position of its next unvisited edge.
    fn visit(&mut self, root: &'a str) {
        let edges = self.edges;
        let mut work: Vec<(&'a str, usize)> = vec![(root, 0)];
        self.open(root);

        while let Some((v, next_edge)) = work.last().copied() {
            let successors = edges.get(v).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(&w) = successors.get(next_edge) {
                if let Some(frame) = work.last_mut() {
                    frame.1 += 1;
                }
                if !self.index.contains_key(w) {
                    self.open(w);
                    work.push((w, 0));
                } else if self.on_stack.contains(w) {
                    let low = self.lowlink[v].min(self.index[w]);
                    self.lowlink.insert(v, low);
                }
                continue;
            }

            work.pop();
            if let Some(&(parent, _)) = work.last() {
                let low = self.lowlink[parent].min(self.lowlink[v]);
                self.lowlink.insert(parent, low);
            }
            if self.lowlink[v] == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack.remove(w);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    fn open(&mut self, v: &'a str) {
        self.index.insert(v, self.next);
        self.lowlink.insert(v, self.next);
        self.next += 1;
        self.stack.push(v);
        self.on_stack.insert(v);
    }
}
