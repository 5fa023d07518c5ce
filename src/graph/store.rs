//! Node storage with a reverse dependency index.

use super::node::Node;
use crate::descriptor::value::{Dependency, Key};
use std::collections::{BTreeSet, HashMap};

/// The dependency graph.
///
/// Edges are declared by dependents (`node.dependencies`); `dependents`
/// indexes them in reverse. Edges may point at keys that have no node yet.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: HashMap<Key, Node>,
    dependents: HashMap<Key, BTreeSet<Key>>,
    next_seq: u64,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.seq);
        nodes
    }

    /// Nodes owned by a descriptor, in insertion order.
    pub fn nodes_by_descriptor(&self, descriptor: &str) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| n.descriptor == descriptor)
            .collect();
        nodes.sort_by_key(|n| n.seq);
        nodes
    }

    /// Get the node for `key`, creating an empty one if absent.
    pub fn entry(&mut self, key: &str, descriptor: &str) -> &mut Node {
        let next_seq = &mut self.next_seq;
        self.nodes.entry(key.to_string()).or_insert_with(|| {
            let seq = *next_seq;
            *next_seq += 1;
            Node::new(key, descriptor, seq)
        })
    }

    /// Insert a node, replacing any node with the same key.
    pub fn insert_node(&mut self, mut node: Node) {
        if let Some(old) = self.remove_node(&node.key) {
            node.seq = old.seq;
        } else {
            node.seq = self.next_seq;
            self.next_seq += 1;
        }
        for dep in &node.dependencies {
            self.dependents
                .entry(dep.key.clone())
                .or_default()
                .insert(node.key.clone());
        }
        self.nodes.insert(node.key.clone(), node);
    }

    /// Remove a node and its outgoing edges.
    ///
    /// Edges of other nodes pointing at `key` stay in place.
    pub fn remove_node(&mut self, key: &str) -> Option<Node> {
        let node = self.nodes.remove(key)?;
        for dep in &node.dependencies {
            self.unindex(&dep.key, key);
        }
        Some(node)
    }

    /// Add an edge "`from` requires `dep.key`".
    pub fn add_edge(&mut self, from: &str, dep: Dependency) {
        let Some(node) = self.nodes.get_mut(from) else {
            return;
        };
        if node.dependencies.iter().any(|d| d.key == dep.key) {
            return;
        }
        self.dependents
            .entry(dep.key.clone())
            .or_default()
            .insert(from.to_string());
        node.dependencies.push(dep);
    }

    /// Remove the edge "`from` requires `to`".
    pub fn remove_edge(&mut self, from: &str, to: &str) {
        let Some(node) = self.nodes.get_mut(from) else {
            return;
        };
        node.dependencies.retain(|d| d.key != to);
        self.unindex(to, from);
    }

    /// Replace all outgoing edges of a node.
    pub fn set_dependencies(&mut self, key: &str, deps: Vec<Dependency>) {
        let Some(node) = self.nodes.get_mut(key) else {
            return;
        };
        let old = std::mem::take(&mut node.dependencies);
        for dep in &old {
            self.unindex(&dep.key, key);
        }
        for dep in deps {
            self.add_edge(key, dep);
        }
    }

    /// Keys of nodes that declare a dependency on `key`.
    pub fn dependents_of(&self, key: &str) -> impl Iterator<Item = &Key> {
        self.dependents.get(key).into_iter().flatten()
    }

    fn unindex(&mut self, dep: &str, dependent: &str) {
        if let Some(set) = self.dependents.get_mut(dep) {
            set.remove(dependent);
            if set.is_empty() {
                self.dependents.remove(dep);
            }
        }
    }
}
