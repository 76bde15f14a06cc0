// src/dag/graph.rs

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::errors::{ChunkdagError, Result};
use crate::pipeline::Pipeline;
use crate::types::NodeName;

/// One vertex of the computation DAG: the pipeline that produces an array.
///
/// Nodes without a pipeline are inputs that already exist in storage.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub name: NodeName,
    pub pipeline: Option<Pipeline>,
    /// Set by whoever built the DAG when the node's output is known to be
    /// present already (e.g. when resuming).
    pub computed: bool,
}

impl DagNode {
    pub fn new(name: impl Into<NodeName>, pipeline: Pipeline) -> Self {
        Self {
            name: name.into(),
            pipeline: Some(pipeline),
            computed: false,
        }
    }

    /// A node with nothing to run.
    pub fn source(name: impl Into<NodeName>) -> Self {
        Self {
            name: name.into(),
            pipeline: None,
            computed: false,
        }
    }

    pub fn with_computed(mut self, computed: bool) -> Self {
        self.computed = computed;
        self
    }

    pub fn num_tasks(&self) -> usize {
        self.pipeline.as_ref().map_or(0, Pipeline::num_tasks)
    }
}

/// Dependency graph of pipelines keyed by node name.
///
/// Edges point from a dependency to its dependent. Acyclicity is not
/// enforced while building; [`Dag::topological_order`] reports cycles.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    graph: DiGraph<DagNode, ()>,
    index: HashMap<NodeName, NodeIndex>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: DagNode) -> Result<()> {
        if self.index.contains_key(&node.name) {
            return Err(ChunkdagError::DuplicateNode(node.name));
        }
        let name = node.name.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(name, idx);
        Ok(())
    }

    /// Record that `dependent` reads the output of `dependency`.
    pub fn add_dependency(&mut self, dependency: &str, dependent: &str) -> Result<()> {
        let from = self.index_of(dependency)?;
        let to = self.index_of(dependent)?;
        self.graph.update_edge(from, to, ());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, name: &str) -> Option<&DagNode> {
        self.index.get(name).map(|&idx| &self.graph[idx])
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut DagNode> {
        let idx = *self.index.get(name)?;
        Some(&mut self.graph[idx])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.graph.node_weights()
    }

    /// Immediate dependencies of a node.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Immediate dependents of a node.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Every node, dependencies before dependents.
    ///
    /// Fails with [`ChunkdagError::DagCycle`] if the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<&DagNode>> {
        match toposort(&self.graph, None) {
            Ok(order) => Ok(order.into_iter().map(|idx| &self.graph[idx]).collect()),
            Err(cycle) => {
                let node = &self.graph[cycle.node_id()];
                Err(ChunkdagError::DagCycle(format!(
                    "cycle detected in DAG involving node '{}'",
                    node.name
                )))
            }
        }
    }

    fn index_of(&self, name: &str) -> Result<NodeIndex> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| ChunkdagError::NodeNotFound(name.to_string()))
    }

    fn neighbors(&self, name: &str, dir: Direction) -> Vec<&str> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, dir)
            .map(|n| self.graph[n].name.as_str())
            .collect()
    }
}
