// src/dag/mod.rs

//! The computation DAG and its executor.
//!
//! - [`graph`] holds the dependency graph of pipelines.
//! - [`executor`] walks it in topological order, skipping computed nodes.
//! - [`build`] turns a validated config file into a DAG of shell stages.

pub mod build;
pub mod executor;
pub mod graph;

pub use build::build_dag;
pub use executor::{ComputedCheck, DagExecutor, DagReport, NodeFlag, NodeState};
pub use graph::{Dag, DagNode};
