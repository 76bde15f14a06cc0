// src/events.rs

//! Completion events and the callbacks that receive them.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};

use crate::dag::DagReport;
use crate::remote::TaskStats;
use crate::stage::StageReport;

/// Record of one completed mappable work item.
///
/// Built once from the backend's timing stats and the memory readings taken
/// around the work function; callbacks only ever see it by reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEndEvent {
    pub array_name: String,
    pub task_create_tstamp: f64,
    pub function_start_tstamp: f64,
    pub function_end_tstamp: f64,
    pub task_result_tstamp: f64,
    pub peak_memory_start: u64,
    pub peak_memory_end: u64,
}

impl TaskEndEvent {
    pub fn from_stats(array_name: &str, stats: &TaskStats, report: &StageReport) -> Self {
        Self {
            array_name: array_name.to_string(),
            task_create_tstamp: stats.submit_tstamp,
            function_start_tstamp: stats.worker_start_tstamp,
            function_end_tstamp: stats.worker_end_tstamp,
            task_result_tstamp: stats.fetch_tstamp,
            peak_memory_start: report.peak_memory_start,
            peak_memory_end: report.peak_memory_end,
        }
    }
}

/// Summary passed to [`Callback::on_compute_start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeStart {
    pub num_nodes: usize,
    pub num_tasks: usize,
}

/// Observer of a computation.
///
/// `on_task_end` fires once per successfully completed mappable work item;
/// never for failed, retried or discarded backup calls.
pub trait Callback: Send + Sync {
    fn on_compute_start(&self, _event: &ComputeStart) {}

    fn on_task_end(&self, _event: &TaskEndEvent) {}

    fn on_compute_end(&self, _report: &DagReport) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCallback;

impl Callback for LoggingCallback {
    fn on_compute_start(&self, event: &ComputeStart) {
        info!(nodes = event.num_nodes, tasks = event.num_tasks, "compute started");
    }

    fn on_task_end(&self, event: &TaskEndEvent) {
        info!(
            array = %event.array_name,
            duration = event.function_end_tstamp - event.function_start_tstamp,
            peak_memory = event.peak_memory_end,
            "task finished"
        );
    }

    fn on_compute_end(&self, report: &DagReport) {
        info!(
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            stages = report.stages_run,
            "compute finished"
        );
    }
}

/// Appends each [`TaskEndEvent`] to a file as one JSON object per line.
pub struct JsonLinesCallback {
    out: Mutex<BufWriter<File>>,
}

impl fmt::Debug for JsonLinesCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesCallback").finish_non_exhaustive()
    }
}

impl JsonLinesCallback {
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("creating events file {:?}", path))?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write_line(&self, event: &TaskEndEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| anyhow::anyhow!("events writer lock poisoned"))?;
        writeln!(out, "{line}")?;
        Ok(())
    }
}

impl Callback for JsonLinesCallback {
    fn on_task_end(&self, event: &TaskEndEvent) {
        if let Err(err) = self.write_line(event) {
            warn!(error = %err, "failed to write task event");
        }
    }

    fn on_compute_end(&self, _report: &DagReport) {
        if let Ok(mut out) = self.out.lock() {
            if let Err(err) = out.flush() {
                warn!(error = %err, "failed to flush events file");
            }
        }
    }
}
