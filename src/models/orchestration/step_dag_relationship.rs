//! # Step DAG Relationships
//!
//! Parent/child views derived from a task's edge set. The edge set is the
//! only source of truth; nothing here is stored.
//!
//! All traversals are iterative with an explicit visited set and a hard
//! depth cap. The graph is acyclic by construction (edges are validated when
//! created), so hitting a cycle or the depth cap at read time means the
//! stored data is corrupt and is reported as a data-integrity fault.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TaskerError};
use crate::models::WorkflowStepEdge;

/// Adjacency index over one task's steps and edges
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<Uuid>,
    parents: HashMap<Uuid, Vec<Uuid>>,
    children: HashMap<Uuid, Vec<Uuid>>,
}

impl DependencyGraph {
    /// Index `edges` over `step_uuids`. Edges naming an unknown step, self
    /// loops and duplicate edges are integrity faults.
    pub fn build(
        step_uuids: impl IntoIterator<Item = Uuid>,
        edges: &[WorkflowStepEdge],
    ) -> Result<Self> {
        let nodes: Vec<Uuid> = step_uuids.into_iter().collect();
        let mut parents: HashMap<Uuid, Vec<Uuid>> =
            nodes.iter().map(|uuid| (*uuid, Vec::new())).collect();
        let mut children: HashMap<Uuid, Vec<Uuid>> =
            nodes.iter().map(|uuid| (*uuid, Vec::new())).collect();
        let mut seen = HashSet::with_capacity(edges.len());

        for edge in edges {
            if edge.is_self_loop() {
                return Err(TaskerError::DataIntegrityError(format!(
                    "Step {} depends on itself",
                    edge.from_step_uuid
                )));
            }
            if !seen.insert((edge.from_step_uuid, edge.to_step_uuid)) {
                return Err(TaskerError::DataIntegrityError(format!(
                    "Duplicate edge {} -> {}",
                    edge.from_step_uuid, edge.to_step_uuid
                )));
            }
            if !parents.contains_key(&edge.from_step_uuid) {
                return Err(TaskerError::DataIntegrityError(format!(
                    "Edge references unknown step {}",
                    edge.from_step_uuid
                )));
            }
            let Some(step_parents) = parents.get_mut(&edge.to_step_uuid) else {
                return Err(TaskerError::DataIntegrityError(format!(
                    "Edge references unknown step {}",
                    edge.to_step_uuid
                )));
            };
            step_parents.push(edge.from_step_uuid);
            if let Some(step_children) = children.get_mut(&edge.from_step_uuid) {
                step_children.push(edge.to_step_uuid);
            }
        }

        Ok(Self {
            nodes,
            parents,
            children,
        })
    }

    pub fn parents(&self, step_uuid: &Uuid) -> &[Uuid] {
        self.parents.get(step_uuid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn children(&self, step_uuid: &Uuid) -> &[Uuid] {
        self.children.get(step_uuid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn roots(&self) -> impl Iterator<Item = &Uuid> {
        self.nodes.iter().filter(|uuid| self.parents(uuid).is_empty())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Kahn ordering: every step appears after all of its parents.
    ///
    /// Fails if a cycle leaves steps unvisited, or if the longest dependency
    /// chain exceeds `max_depth`.
    pub fn topological_order(&self, max_depth: usize) -> Result<Vec<Uuid>> {
        let mut remaining: HashMap<Uuid, usize> = self
            .nodes
            .iter()
            .map(|uuid| (*uuid, self.parents(uuid).len()))
            .collect();
        let mut depth: HashMap<Uuid, usize> = HashMap::with_capacity(self.nodes.len());
        let mut queue: VecDeque<Uuid> = self.roots().copied().collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        for root in &queue {
            depth.insert(*root, 0);
        }

        while let Some(uuid) = queue.pop_front() {
            let level = depth.get(&uuid).copied().unwrap_or(0);
            if level > max_depth {
                return Err(TaskerError::DataIntegrityError(format!(
                    "Dependency chain through step {uuid} exceeds max depth {max_depth}"
                )));
            }
            order.push(uuid);

            for child in self.children(&uuid) {
                let child_depth = depth.entry(*child).or_insert(0);
                *child_depth = (*child_depth).max(level + 1);
                if let Some(count) = remaining.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(TaskerError::DataIntegrityError(format!(
                "Dependency cycle detected among {} steps",
                self.nodes.len() - order.len()
            )));
        }

        Ok(order)
    }

    /// Shortest distance from any root, by breadth-first search
    pub fn min_depths(&self, max_depth: usize) -> HashMap<Uuid, usize> {
        let mut depths = HashMap::with_capacity(self.nodes.len());
        let mut queue = VecDeque::new();

        for root in self.roots() {
            depths.insert(*root, 0);
            queue.push_back(*root);
        }

        while let Some(uuid) = queue.pop_front() {
            let level = depths[&uuid];
            if level >= max_depth {
                continue;
            }
            for child in self.children(&uuid) {
                if !depths.contains_key(child) {
                    depths.insert(*child, level + 1);
                    queue.push_back(*child);
                }
            }
        }

        depths
    }

    /// Whether `from` can reach `to` by following child edges
    pub fn reaches(&self, from: Uuid, to: Uuid) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];

        while let Some(uuid) = stack.pop() {
            if uuid == to {
                return true;
            }
            if visited.insert(uuid) {
                stack.extend(self.children(&uuid).iter().copied());
            }
        }

        false
    }
}

/// Check that adding `from -> to` to `edges` keeps the graph acyclic
pub fn validate_acyclic(edges: &[WorkflowStepEdge], from: Uuid, to: Uuid) -> Result<()> {
    if from == to {
        return Err(TaskerError::ValidationError(format!(
            "Step {from} cannot depend on itself"
        )));
    }

    let mut nodes: HashSet<Uuid> = HashSet::new();
    for edge in edges {
        nodes.insert(edge.from_step_uuid);
        nodes.insert(edge.to_step_uuid);
    }
    nodes.insert(from);
    nodes.insert(to);

    let graph = DependencyGraph::build(nodes, edges)?;
    if graph.reaches(to, from) {
        return Err(TaskerError::ValidationError(format!(
            "Edge {from} -> {to} would create a cycle"
        )));
    }

    Ok(())
}

/// Parent/child view of a single step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDagRelationship {
    pub workflow_step_uuid: Uuid,
    pub parent_step_uuids: Vec<Uuid>,
    pub child_step_uuids: Vec<Uuid>,
    pub parent_count: usize,
    pub child_count: usize,
    /// No parents - workflow entry point
    pub is_root_step: bool,
    /// No children - workflow exit point
    pub is_leaf_step: bool,
    /// `None` for steps unreachable from a root within the depth cap
    pub min_depth_from_root: Option<usize>,
}

impl StepDagRelationship {
    /// Relationships for every step in the graph, in graph order
    pub fn for_graph(graph: &DependencyGraph, max_depth: usize) -> Vec<Self> {
        let depths = graph.min_depths(max_depth);

        graph
            .nodes
            .iter()
            .map(|uuid| {
                let parents = graph.parents(uuid).to_vec();
                let children = graph.children(uuid).to_vec();
                Self {
                    workflow_step_uuid: *uuid,
                    parent_count: parents.len(),
                    child_count: children.len(),
                    is_root_step: parents.is_empty(),
                    is_leaf_step: children.is_empty(),
                    parent_step_uuids: parents,
                    child_step_uuids: children,
                    min_depth_from_root: depths.get(uuid).copied(),
                }
            })
            .collect()
    }

    pub fn can_execute_immediately(&self) -> bool {
        self.is_root_step
    }

    pub fn is_workflow_exit(&self) -> bool {
        self.is_leaf_step
    }

    /// Root and leaf at once: no edges touch this step
    pub fn is_orphaned(&self) -> bool {
        self.is_root_step && self.is_leaf_step
    }
}
