// src/pipeline.rs

//! Pipelines and stages as the engine consumes them.
//!
//! A pipeline is an ordered list of stages plus one shared, immutable config
//! value. A stage with a mappable is a parallel stage (one call per work
//! item); a stage without one is run as a single call.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::remote::{CallFuture, TaskError};

/// Opaque work-item descriptor, typically the coordinates of one output chunk.
pub type WorkItem = Value;

/// Shared configuration handed to every stage function of a pipeline.
pub type PipelineConfig = Arc<Value>;

/// A stage function.
///
/// Receives `Some(item)` for each work item of a mappable stage and `None`
/// when the stage is singular. The returned future is the call; dropping it
/// stops the work.
pub type StageFn =
    Arc<dyn Fn(Option<WorkItem>, PipelineConfig) -> CallFuture<()> + Send + Sync>;

/// Wrap a synchronous function as a [`StageFn`].
pub fn sync_stage_fn<F>(function: F) -> StageFn
where
    F: Fn(Option<&WorkItem>, &Value) -> Result<(), TaskError> + Send + Sync + 'static,
{
    let function = Arc::new(function);
    Arc::new(move |item: Option<WorkItem>, config: PipelineConfig| -> CallFuture<()> {
        let function = Arc::clone(&function);
        Box::pin(async move { function(item.as_ref(), &*config) })
    })
}

#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub function: StageFn,
    pub mappable: Option<Vec<WorkItem>>,
}

impl Stage {
    /// A stage that runs `function` once.
    pub fn single(name: impl Into<String>, function: StageFn) -> Self {
        Self {
            name: name.into(),
            function,
            mappable: None,
        }
    }

    /// A stage that runs `function` once per item.
    pub fn mappable(name: impl Into<String>, function: StageFn, items: Vec<WorkItem>) -> Self {
        Self {
            name: name.into(),
            function,
            mappable: Some(items),
        }
    }

    pub fn is_mappable(&self) -> bool {
        self.mappable.is_some()
    }

    /// Number of calls this stage makes.
    pub fn num_tasks(&self) -> usize {
        self.mappable.as_ref().map_or(1, Vec::len)
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("mappable", &self.mappable.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
    pub config: PipelineConfig,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>, config: Value) -> Self {
        Self {
            stages,
            config: Arc::new(config),
        }
    }

    pub fn num_tasks(&self) -> usize {
        self.stages.iter().map(Stage::num_tasks).sum()
    }
}
