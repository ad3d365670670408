//! Project graph
//!
//! [`NodeManager`] owns every [`Node`] of a run and answers graph queries:
//! descendants, ancestors, selection resolution and topological order over a
//! region. It is built once; afterwards the only mutation is attaching each
//! modified node's classification.

use colci_core::{
    Classification, CyclicGraphError, Node, NodeId, ResourceType, UnresolvedSelectionError,
};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use tracing::debug;

use crate::manifest::Manifest;
use crate::selection::{SelectionCriteria, SelectorAtom, SelectorError, SelectorMethod};

static NO_EDGES: BTreeSet<NodeId> = BTreeSet::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Downstream,
    Upstream,
}

/// Graph errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error(transparent)]
    Cycle(#[from] CyclicGraphError),

    #[error(transparent)]
    UnresolvedSelection(#[from] UnresolvedSelectionError),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Node {0} is already classified")]
    AlreadyClassified(NodeId),

    #[error("Invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: SelectorError },
}

/// Owner of all nodes of a run and their adjacency
#[derive(Debug, Clone, Default)]
pub struct NodeManager {
    nodes: BTreeMap<NodeId, Node>,
}

impl NodeManager {
    /// Build the graph from raw nodes
    ///
    /// Edges are made symmetric: if A lists B downstream, B lists A upstream.
    /// Identifiers referenced by an edge but missing from `nodes` become
    /// external roots.
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut map: BTreeMap<NodeId, Node> = nodes
            .into_iter()
            .map(|node| (node.unique_id.clone(), node))
            .collect();

        let mut edges: Vec<(NodeId, NodeId)> = Vec::new();
        for node in map.values() {
            for parent in &node.upstream {
                edges.push((parent.clone(), node.unique_id.clone()));
            }
            for child in &node.downstream {
                edges.push((node.unique_id.clone(), child.clone()));
            }
        }

        for (parent, child) in edges {
            for id in [&parent, &child] {
                if !map.contains_key(id) {
                    debug!(node = %id, "Adding external node");
                    map.insert(id.clone(), Node::external(id.clone()));
                }
            }

            if let Some(node) = map.get_mut(&parent) {
                node.downstream.insert(child.clone());
            }
            if let Some(node) = map.get_mut(&child) {
                node.upstream.insert(parent);
            }
        }

        Self { nodes: map }
    }

    /// Build the graph of the current state of a manifest
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self::new(manifest.to_nodes())
    }

    pub fn get(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// All nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of nodes flagged as modified
    pub fn modified_ids(&self) -> BTreeSet<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.modified)
            .map(|node| node.unique_id.clone())
            .collect()
    }

    /// Immediate children of a node
    pub fn children(&self, node_id: &str) -> &BTreeSet<NodeId> {
        self.edges(node_id, Direction::Downstream)
    }

    /// Immediate parents of a node
    pub fn parents(&self, node_id: &str) -> &BTreeSet<NodeId> {
        self.edges(node_id, Direction::Upstream)
    }

    /// Attach the run's classification to a node
    pub fn annotate(&mut self, node_id: &str, classification: Classification) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| GraphError::UnknownNode(node_id.to_string()))?;

        if node.annotate(classification) {
            Ok(())
        } else {
            Err(GraphError::AlreadyClassified(node_id.to_string()))
        }
    }

    /// All nodes transitively reachable downstream (the blast radius)
    ///
    /// Fails with a [`CyclicGraphError`] if a cycle is reachable from the node.
    pub fn get_descendants(&self, node_id: &str) -> Result<BTreeSet<NodeId>, GraphError> {
        self.reachable(node_id, Direction::Downstream)
    }

    /// All nodes transitively reachable upstream
    pub fn get_ancestors(&self, node_id: &str) -> Result<BTreeSet<NodeId>, GraphError> {
        self.reachable(node_id, Direction::Upstream)
    }

    /// Resolve selection criteria to a node set
    pub fn resolve_selection(&self, criteria: &str) -> Result<BTreeSet<NodeId>, GraphError> {
        let parsed = SelectionCriteria::parse(criteria).map_err(|reason| GraphError::InvalidSelector {
            selector: criteria.to_string(),
            reason,
        })?;

        let mut selected = BTreeSet::new();
        for term in &parsed.terms {
            let mut term_nodes: Option<BTreeSet<NodeId>> = None;

            for atom in &term.atoms {
                let atom_nodes = self.resolve_atom(atom, &parsed.raw)?;
                term_nodes = Some(match term_nodes {
                    Some(current) => current.intersection(&atom_nodes).cloned().collect(),
                    None => atom_nodes,
                });
            }

            selected.extend(term_nodes.unwrap_or_default());
        }

        debug!(criteria = %criteria, selected = selected.len(), "Resolved selection");
        Ok(selected)
    }

    /// Nodes of `region` ordered so every node comes after its parents in the region
    ///
    /// Ties are broken by id, so the order is stable across runs.
    pub fn topological_order(&self, region: &BTreeSet<NodeId>) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for id in region {
            if !self.contains(id) {
                return Err(GraphError::UnknownNode(id.clone()));
            }
            let degree = self.parents(id).iter().filter(|p| region.contains(*p)).count();
            in_degree.insert(id.as_str(), degree);
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(region.len());
        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());

            for child in self.children(id) {
                if let Some(degree) = in_degree.get_mut(child.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(child.as_str());
                    }
                }
            }
        }

        if order.len() == region.len() {
            return Ok(order);
        }

        let emitted: HashSet<&str> = order.iter().map(String::as_str).collect();
        let stuck = region.iter().find(|id| !emitted.contains(id.as_str()));
        let cycle = stuck
            .and_then(|id| self.find_cycle(id, Direction::Downstream))
            .unwrap_or_else(|| region.iter().filter(|id| !emitted.contains(id.as_str())).cloned().collect());

        Err(CyclicGraphError { cycle }.into())
    }

    fn edges(&self, node_id: &str, direction: Direction) -> &BTreeSet<NodeId> {
        match (self.nodes.get(node_id), direction) {
            (Some(node), Direction::Downstream) => &node.downstream,
            (Some(node), Direction::Upstream) => &node.upstream,
            (None, _) => &NO_EDGES,
        }
    }

    fn reachable(&self, node_id: &str, direction: Direction) -> Result<BTreeSet<NodeId>, GraphError> {
        if !self.contains(node_id) {
            return Err(GraphError::UnknownNode(node_id.to_string()));
        }

        if let Some(cycle) = self.find_cycle(node_id, direction) {
            return Err(CyclicGraphError { cycle }.into());
        }

        let mut visited = BTreeSet::new();
        let mut queue: VecDeque<&NodeId> = self.edges(node_id, direction).iter().collect();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }

            for next in self.edges(current, direction) {
                if !visited.contains(next) {
                    queue.push_back(next);
                }
            }
        }

        Ok(visited)
    }

    /// Depth-first search for a cycle reachable from `start`
    ///
    /// Returns the nodes along the cycle with the first node repeated at the end.
    fn find_cycle(&self, start: &str, direction: Direction) -> Option<Vec<NodeId>> {
        let (start, _) = self.nodes.get_key_value(start)?;

        let mut on_path: HashSet<&str> = HashSet::new();
        let mut finished: HashSet<&str> = HashSet::new();
        let mut path: Vec<&str> = vec![start.as_str()];
        let mut stack = vec![self.edges(start, direction).iter()];
        on_path.insert(start.as_str());

        while let Some(children) = stack.last_mut() {
            match children.next() {
                Some(next) => {
                    let next = next.as_str();
                    if on_path.contains(next) {
                        let from = path.iter().position(|id| *id == next).unwrap_or(0);
                        let mut cycle: Vec<NodeId> = path[from..].iter().map(|id| id.to_string()).collect();
                        cycle.push(next.to_string());
                        return Some(cycle);
                    }
                    if finished.contains(next) {
                        continue;
                    }

                    on_path.insert(next);
                    path.push(next);
                    stack.push(self.edges(next, direction).iter());
                }
                None => {
                    stack.pop();
                    if let Some(done) = path.pop() {
                        on_path.remove(done);
                        finished.insert(done);
                    }
                }
            }
        }

        None
    }

    fn resolve_atom(&self, atom: &SelectorAtom, raw: &str) -> Result<BTreeSet<NodeId>, GraphError> {
        let project_nodes = || self.nodes.values().filter(|node| !node.is_external());

        let mut matched: BTreeSet<NodeId> = match &atom.method {
            SelectorMethod::Wildcard => project_nodes().map(|n| n.unique_id.clone()).collect(),
            SelectorMethod::ResourceType(resource_type) => project_nodes()
                .filter(|n| n.resource_type == *resource_type)
                .map(|n| n.unique_id.clone())
                .collect(),
            SelectorMethod::StateModified => self.modified_ids(),
            SelectorMethod::Identifier(identifier) => {
                let found = self.lookup(identifier);
                if found.is_empty() {
                    return Err(UnresolvedSelectionError {
                        selector: raw.to_string(),
                        identifier: identifier.clone(),
                    }
                    .into());
                }
                found
            }
        };

        let seeds: Vec<NodeId> = matched.iter().cloned().collect();
        for id in &seeds {
            if atom.ancestors {
                matched.extend(self.get_ancestors(id)?);
            }
            if atom.descendants {
                matched.extend(self.get_descendants(id)?);
            }
        }

        Ok(matched)
    }

    /// Nodes matching a unique id, a name, or a `package.name` pair
    fn lookup(&self, identifier: &str) -> BTreeSet<NodeId> {
        if self.nodes.contains_key(identifier) {
            return BTreeSet::from([identifier.to_string()]);
        }

        let by_name: BTreeSet<NodeId> = self
            .nodes
            .values()
            .filter(|node| node.name == identifier)
            .map(|node| node.unique_id.clone())
            .collect();
        if !by_name.is_empty() {
            return by_name;
        }

        match identifier.split_once('.') {
            Some((package, name)) => self
                .nodes
                .values()
                .filter(|node| node.name == name)
                .filter(|node| node.unique_id.split('.').nth(1) == Some(package))
                .map(|node| node.unique_id.clone())
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// Unique ids of nodes of a resource type
    pub fn ids_of_type(&self, resource_type: ResourceType) -> BTreeSet<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.resource_type == resource_type)
            .map(|node| node.unique_id.clone())
            .collect()
    }
}
