// src/dag/executor.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::dag::graph::{Dag, DagNode};
use crate::dispatch::DispatchOptions;
use crate::errors::Result;
use crate::events::{Callback, ComputeStart};
use crate::pipeline::Pipeline;
use crate::stage::{build_stage_task, StageExecutor};
use crate::types::NodeName;

/// Lifecycle of one node during a single DAG execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    NotStarted,
    Running,
    Finished,
}

/// What a DAG execution did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DagReport {
    /// Nodes whose pipelines ran, in execution order.
    pub executed: Vec<NodeName>,
    /// Nodes skipped because their output already existed.
    pub skipped: Vec<NodeName>,
    pub stages_run: usize,
    pub tasks_completed: usize,
    pub states: BTreeMap<NodeName, NodeState>,
}

/// Decides whether a node's output is already materialised.
pub trait ComputedCheck: Send + Sync {
    fn already_computed(&self, node: &DagNode) -> bool;

    /// Called after a node's pipeline finished successfully.
    fn record_computed(&self, _node: &DagNode) -> Result<()> {
        Ok(())
    }
}

/// Trusts the flag stored on the node. Nodes with no pipeline are inputs and
/// always count as computed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeFlag;

impl ComputedCheck for NodeFlag {
    fn already_computed(&self, node: &DagNode) -> bool {
        node.computed || node.pipeline.is_none()
    }
}

/// Runs a [`Dag`] node by node in topological order.
///
/// Stages of one pipeline run strictly in series, and so do independent
/// nodes.
#[derive(Clone)]
pub struct DagExecutor {
    options: DispatchOptions,
    callbacks: Vec<Arc<dyn Callback>>,
    computed: Arc<dyn ComputedCheck>,
}

impl Default for DagExecutor {
    fn default() -> Self {
        Self::new(DispatchOptions::default())
    }
}

impl DagExecutor {
    pub fn new(options: DispatchOptions) -> Self {
        Self {
            options,
            callbacks: Vec::new(),
            computed: Arc::new(NodeFlag),
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn with_computed_check(mut self, check: Arc<dyn ComputedCheck>) -> Self {
        self.computed = check;
        self
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Execute every node that is not already computed.
    ///
    /// A cyclic graph or invalid options fail before any stage runs.
    pub async fn execute_dag<E>(&self, dag: &Dag, executor: &mut E) -> Result<DagReport>
    where
        E: StageExecutor + ?Sized,
    {
        self.options.validate()?;
        let order = dag.topological_order()?;

        let mut report = DagReport {
            states: order
                .iter()
                .map(|node| (node.name.clone(), NodeState::NotStarted))
                .collect(),
            ..DagReport::default()
        };

        let num_tasks = order
            .iter()
            .filter(|node| !self.computed.already_computed(node))
            .map(|node| node.num_tasks())
            .sum();
        let start = ComputeStart {
            num_nodes: order.len(),
            num_tasks,
        };
        for callback in &self.callbacks {
            callback.on_compute_start(&start);
        }

        for node in order {
            let pipeline = match &node.pipeline {
                Some(pipeline) if !self.computed.already_computed(node) => pipeline,
                _ => {
                    debug!(node = %node.name, "skipping already computed node");
                    report.skipped.push(node.name.clone());
                    report.states.insert(node.name.clone(), NodeState::Finished);
                    continue;
                }
            };

            report.states.insert(node.name.clone(), NodeState::Running);
            info!(node = %node.name, stages = pipeline.stages.len(), "executing node");

            let (stages, tasks) = self.run_pipeline(&node.name, pipeline, executor).await?;
            report.stages_run += stages;
            report.tasks_completed += tasks;

            self.computed.record_computed(node)?;
            report.executed.push(node.name.clone());
            report.states.insert(node.name.clone(), NodeState::Finished);
        }

        for callback in &self.callbacks {
            callback.on_compute_end(&report);
        }
        Ok(report)
    }

    /// Run a flat list of pipelines in order, without a dependency graph.
    ///
    /// Pipeline `i` is reported under the name `pipeline-{i}`.
    pub async fn execute_pipelines<E>(
        &self,
        pipelines: &[Pipeline],
        executor: &mut E,
    ) -> Result<DagReport>
    where
        E: StageExecutor + ?Sized,
    {
        let mut dag = Dag::new();
        let mut previous: Option<String> = None;
        for (i, pipeline) in pipelines.iter().enumerate() {
            let name = format!("pipeline-{i}");
            dag.add_node(DagNode::new(name.clone(), pipeline.clone()))?;
            if let Some(prev) = &previous {
                dag.add_dependency(prev, &name)?;
            }
            previous = Some(name);
        }
        self.execute_dag(&dag, executor).await
    }

    async fn run_pipeline<E>(
        &self,
        name: &str,
        pipeline: &Pipeline,
        executor: &mut E,
    ) -> Result<(usize, usize)>
    where
        E: StageExecutor + ?Sized,
    {
        let mut tasks = 0;
        for stage in &pipeline.stages {
            let task = build_stage_task(stage, &pipeline.config, name, self.options);
            tasks += task.run(executor, &self.callbacks).await?;
        }
        Ok((pipeline.stages.len(), tasks))
    }
}
