// src/dag/build.rs

use serde_json::Value;
use tracing::debug;

use crate::config::{ConfigFile, StageConfig};
use crate::dag::graph::{Dag, DagNode};
use crate::errors::Result;
use crate::exec::shell_stage_fn;
use crate::pipeline::{Pipeline, Stage, WorkItem};

/// Build the DAG described by a validated config.
///
/// Every node becomes one pipeline of shell-command stages sharing
/// `[params]` as their config. `computed = true` in the file sets the node's
/// computed flag.
pub fn build_dag(config: &ConfigFile) -> Result<Dag> {
    let params = Value::Object(config.params().clone());
    let mut dag = Dag::new();

    for (name, node) in config.nodes() {
        let stages = node
            .stages
            .iter()
            .map(|stage| build_stage(name, stage))
            .collect();
        let pipeline = Pipeline::new(stages, params.clone());
        debug!(node = %name, tasks = pipeline.num_tasks(), "adding node");
        dag.add_node(DagNode::new(name.clone(), pipeline).with_computed(node.computed))?;
    }

    for (name, node) in config.nodes() {
        for dep in &node.after {
            dag.add_dependency(dep, name)?;
        }
    }

    Ok(dag)
}

fn build_stage(node: &str, stage: &StageConfig) -> Stage {
    let function = shell_stage_fn(node, &stage.name, &stage.cmd);
    match (&stage.items, &stage.grid) {
        (Some(items), _) => Stage::mappable(stage.name.clone(), function, items.clone()),
        (None, Some(grid)) => Stage::mappable(stage.name.clone(), function, grid_items(grid)),
        (None, None) => Stage::single(stage.name.clone(), function),
    }
}

/// Every block index of a chunk grid, row-major, as JSON arrays.
pub fn grid_items(grid: &[u64]) -> Vec<WorkItem> {
    let mut indices: Vec<Vec<u64>> = vec![Vec::new()];
    for &extent in grid {
        indices = indices
            .into_iter()
            .flat_map(|prefix| {
                (0..extent).map(move |i| {
                    let mut next = prefix.clone();
                    next.push(i);
                    next
                })
            })
            .collect();
    }
    indices.into_iter().map(Value::from).collect()
}
