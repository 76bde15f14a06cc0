// src/stage/mod.rs

//! Running one pipeline stage on a remote executor.
//!
//! - Mappable stages go through [`map_unordered`] with stats enabled; every
//!   completed item produces a [`TaskEndEvent`] for the callbacks.
//! - Singular stages are one call, waited on directly, with no retries and
//!   no backups.
//!
//! [`memory`] measures peak memory around the stage function so events can
//! report it even when the backend does not.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::dispatch::{map_unordered, DispatchOptions};
use crate::errors::{ChunkdagError, Result};
use crate::events::{Callback, TaskEndEvent};
use crate::pipeline::{PipelineConfig, Stage, StageFn, WorkItem};
use crate::remote::{CallFuture, RemoteExecutor, RemoteFn, WaitMode};

pub use memory::peak_memory;

/// Item type submitted for stage calls: `None` for singular stages.
pub type StageItem = Option<WorkItem>;

/// What a stage call reports back besides success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    pub peak_memory_start: u64,
    pub peak_memory_end: u64,
}

/// Any executor able to run stage calls.
pub trait StageExecutor: RemoteExecutor<StageItem, StageReport> {}

impl<T> StageExecutor for T where T: RemoteExecutor<StageItem, StageReport> + ?Sized {}

/// A stage bound to its pipeline config, ready to run.
pub enum StageTask {
    Mappable {
        array_name: String,
        stage_name: String,
        function: RemoteFn<StageItem, StageReport>,
        items: Vec<StageItem>,
        options: DispatchOptions,
    },
    Single {
        array_name: String,
        stage_name: String,
        function: RemoteFn<StageItem, StageReport>,
    },
}

impl fmt::Debug for StageTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageTask::Mappable {
                array_name,
                stage_name,
                items,
                ..
            } => f
                .debug_struct("Mappable")
                .field("array_name", array_name)
                .field("stage_name", stage_name)
                .field("items", &items.len())
                .finish_non_exhaustive(),
            StageTask::Single {
                array_name,
                stage_name,
                ..
            } => f
                .debug_struct("Single")
                .field("array_name", array_name)
                .field("stage_name", stage_name)
                .finish_non_exhaustive(),
        }
    }
}

/// Build the runnable form of `stage`.
///
/// `array_name` identifies the array the stage writes; it is copied into
/// every [`TaskEndEvent`].
pub fn build_stage_task(
    stage: &Stage,
    config: &PipelineConfig,
    array_name: &str,
    options: DispatchOptions,
) -> StageTask {
    let function = measured(Arc::clone(&stage.function), Arc::clone(config));

    match &stage.mappable {
        Some(items) => StageTask::Mappable {
            array_name: array_name.to_string(),
            stage_name: stage.name.clone(),
            function,
            items: items.iter().cloned().map(Some).collect(),
            options: DispatchOptions {
                return_stats: true,
                ..options
            },
        },
        None => StageTask::Single {
            array_name: array_name.to_string(),
            stage_name: stage.name.clone(),
            function,
        },
    }
}

/// Wrap a stage function so each call also reports peak memory.
fn measured(function: StageFn, config: PipelineConfig) -> RemoteFn<StageItem, StageReport> {
    Arc::new(move |item: StageItem| -> CallFuture<StageReport> {
        let call = function(item, Arc::clone(&config));
        Box::pin(async move {
            let peak_memory_start = peak_memory();
            call.await?;
            let peak_memory_end = peak_memory();
            Ok(StageReport {
                peak_memory_start,
                peak_memory_end,
            })
        })
    })
}

impl StageTask {
    /// Run the stage to completion. Returns the number of calls that
    /// completed successfully.
    pub async fn run<E>(&self, executor: &mut E, callbacks: &[Arc<dyn Callback>]) -> Result<usize>
    where
        E: StageExecutor + ?Sized,
    {
        match self {
            StageTask::Mappable {
                array_name,
                stage_name,
                function,
                items,
                options,
            } => {
                info!(
                    array = %array_name,
                    stage = %stage_name,
                    tasks = items.len(),
                    "running mappable stage"
                );
                run_mappable(executor, array_name, function, items, *options, callbacks).await
            }
            StageTask::Single {
                array_name,
                stage_name,
                function,
            } => {
                info!(array = %array_name, stage = %stage_name, "running single stage");
                run_single(executor, function).await?;
                Ok(1)
            }
        }
    }
}

async fn run_mappable<E>(
    executor: &mut E,
    array_name: &str,
    function: &RemoteFn<StageItem, StageReport>,
    items: &[StageItem],
    options: DispatchOptions,
    callbacks: &[Arc<dyn Callback>],
) -> Result<usize>
where
    E: StageExecutor + ?Sized,
{
    let mut results = map_unordered(executor, Arc::clone(function), items.to_vec(), options);
    let mut completed = 0;

    while let Some(next) = results.next().await {
        let completion = next?;
        completed += 1;

        if callbacks.is_empty() {
            continue;
        }
        let stats = completion.stats.unwrap_or_default();
        let event = TaskEndEvent::from_stats(array_name, &stats, &completion.value);
        for callback in callbacks {
            callback.on_task_end(&event);
        }
    }

    let counters = results.counters();
    debug!(
        array = %array_name,
        completed,
        failures = counters.failures,
        backups = counters.backups_launched,
        "mappable stage finished"
    );
    Ok(completed)
}

async fn run_single<E>(executor: &mut E, function: &RemoteFn<StageItem, StageReport>) -> Result<()>
where
    E: StageExecutor + ?Sized,
{
    let handles = executor.submit(Arc::clone(function), vec![None]).await?;
    let handle = *handles
        .first()
        .ok_or_else(|| ChunkdagError::Executor("executor returned no handle".to_string()))?;

    let mut pending = vec![handle];
    while !pending.is_empty() {
        pending = executor.wait(pending, WaitMode::AnyCompleted).await?.pending;
    }

    let record = executor.take_result(handle).ok_or_else(|| {
        ChunkdagError::Executor(format!("no result reported for finished call {handle}"))
    })?;
    record.outcome.map_err(ChunkdagError::TaskFailed)?;
    Ok(())
}
