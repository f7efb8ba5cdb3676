//! Resource dependency graph built on `petgraph`.
//!
//! Edges point from a dependency to its dependent, so a topological walk
//! yields creation order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{ConfigError, ConvergeError, Result};

use super::node::ResourceNode;

/// Validated, acyclic graph of desired resources.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    graph: DiGraph<String, ()>,
    index_map: HashMap<String, NodeIndex>,
    nodes: BTreeMap<String, ResourceNode>,
}

impl ResourceGraph {
    /// Creates a graph with no resources.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a graph from nodes whose dependency sets are already populated.
    ///
    /// # Errors
    ///
    /// Returns `DanglingReference` if a dependency names no node and
    /// `CircularDependency` if the edges form a cycle.
    pub fn from_nodes(nodes: impl IntoIterator<Item = ResourceNode>) -> Result<Self> {
        let nodes: BTreeMap<String, ResourceNode> = nodes.into_iter().map(|n| (n.name.clone(), n)).collect();

        let mut graph = DiGraph::new();
        let mut index_map = HashMap::new();
        for name in nodes.keys() {
            let idx = graph.add_node(name.clone());
            index_map.insert(name.clone(), idx);
        }

        for node in nodes.values() {
            let to_idx = index_map[&node.name];
            for dep in &node.dependencies {
                if dep == &node.name {
                    return Err(ConvergeError::Config(ConfigError::CircularDependency {
                        cycle: format!("{0} -> {0}", node.name),
                    }));
                }
                let from_idx = index_map.get(dep).ok_or_else(|| {
                    ConvergeError::Config(ConfigError::DanglingReference {
                        resource: node.name.clone(),
                        target: dep.clone(),
                    })
                })?;
                graph.add_edge(*from_idx, to_idx, ());
            }
        }

        let built = Self {
            graph,
            index_map,
            nodes,
        };

        if let Some(cycle) = built.find_cycle() {
            return Err(ConvergeError::Config(ConfigError::CircularDependency {
                cycle: cycle.join(" -> "),
            }));
        }

        Ok(built)
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true if a resource with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Gets a node by logical name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&ResourceNode> {
        self.nodes.get(name)
    }

    /// Iterates nodes in name order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Records the provider-assigned identifier of an existing resource.
    pub fn set_physical_id(&mut self, name: &str, physical_id: impl Into<String>) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.physical_id = Some(physical_id.into());
        }
    }

    /// Returns true if the graph contains no cycle.
    #[must_use]
    pub fn is_acyclic(&self) -> bool {
        !algo::is_cyclic_directed(&self.graph)
    }

    /// Direct dependencies of a node, sorted by name.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Direct dependents of a node, sorted by name.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Everything `name` depends on, directly or not.
    #[must_use]
    pub fn transitive_dependencies(&self, name: &str) -> BTreeSet<String> {
        self.reachable(name, Direction::Incoming)
    }

    /// Everything that depends on `name`, directly or not.
    #[must_use]
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        self.reachable(name, Direction::Outgoing)
    }

    /// Dependency-respecting order, ties broken by logical name.
    #[must_use]
    pub fn topological_order(&self) -> Vec<String> {
        let names: BTreeSet<String> = self.nodes.keys().cloned().collect();
        let edges: Vec<(String, String)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(from, to)| (self.graph[from].clone(), self.graph[to].clone()))
            .collect();
        stable_topological_order(&names, &edges)
    }

    /// Groups nodes into levels; every node's dependencies sit in earlier levels.
    #[must_use]
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
            .collect();

        let mut levels = Vec::new();
        while !in_degree.is_empty() {
            let mut current: Vec<NodeIndex> = in_degree
                .iter()
                .filter(|&(_, deg)| *deg == 0)
                .map(|(idx, _)| *idx)
                .collect();
            if current.is_empty() {
                break;
            }
            current.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

            for idx in &current {
                in_degree.remove(idx);
                for next in self.graph.neighbors_directed(*idx, Direction::Outgoing) {
                    if let Some(deg) = in_degree.get_mut(&next) {
                        *deg = deg.saturating_sub(1);
                    }
                }
            }

            levels.push(current.into_iter().map(|idx| self.graph[idx].clone()).collect());
        }
        levels
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.index_map.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<&str> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|i| self.graph[i].as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    fn reachable(&self, name: &str, direction: Direction) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let Some(&start) = self.index_map.get(name) else {
            return found;
        };
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, direction) {
                if found.insert(self.graph[next].clone()) {
                    queue.push_back(next);
                }
            }
        }
        found
    }

    /// Finds one cycle, returned as a closed path of names.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let component = algo::tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .min_by(|a, b| self.min_name(a).cmp(self.min_name(b)))?;

        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let start = *component.iter().min_by(|a, b| self.graph[**a].cmp(&self.graph[**b]))?;

        // Breadth-first search inside the component for the shortest way back to `start`.
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut last = None;
        'search: while let Some(idx) = queue.pop_front() {
            let mut successors: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .filter(|n| members.contains(n))
                .collect();
            successors.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
            for next in successors {
                if next == start {
                    last = Some(idx);
                    break 'search;
                }
                if !parent.contains_key(&next) {
                    parent.insert(next, idx);
                    queue.push_back(next);
                }
            }
        }

        let mut path = vec![self.graph[start].clone()];
        let mut cursor = last?;
        let mut tail = Vec::new();
        while cursor != start {
            tail.push(self.graph[cursor].clone());
            cursor = *parent.get(&cursor)?;
        }
        tail.reverse();
        path.extend(tail);
        path.push(self.graph[start].clone());
        Some(path)
    }

    fn min_name(&self, component: &[NodeIndex]) -> &str {
        component
            .iter()
            .map(|idx| self.graph[*idx].as_str())
            .min()
            .unwrap_or_default()
    }
}

/// Kahn's algorithm over named nodes with `(before, after)` edges.
///
/// Ready nodes are taken in name order. Nodes caught in a cycle are appended
/// in name order so none are lost.
#[must_use]
pub fn stable_topological_order(names: &BTreeSet<String>, edges: &[(String, String)]) -> Vec<String> {
    let mut in_degree: BTreeMap<&str, usize> = names.iter().map(|n| (n.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

    for (before, after) in edges {
        if !names.contains(before) || !names.contains(after) {
            continue;
        }
        successors.entry(before.as_str()).or_default().push(after.as_str());
        if let Some(deg) = in_degree.get_mut(after.as_str()) {
            *deg += 1;
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(names.len());

    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        in_degree.remove(name);
        for &next in successors.get(name).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(next) {
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    order.extend(in_degree.keys().map(|n| (*n).to_string()));
    order
}
