use std::sync::Mutex;

use chunkdag::dag::DagReport;
use chunkdag::events::{Callback, ComputeStart, TaskEndEvent};

/// Callback that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    starts: Mutex<Vec<ComputeStart>>,
    task_ends: Mutex<Vec<TaskEndEvent>>,
    ends: Mutex<Vec<DagReport>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starts(&self) -> Vec<ComputeStart> {
        self.starts.lock().unwrap().clone()
    }

    pub fn task_ends(&self) -> Vec<TaskEndEvent> {
        self.task_ends.lock().unwrap().clone()
    }

    pub fn ends(&self) -> Vec<DagReport> {
        self.ends.lock().unwrap().clone()
    }
}

impl Callback for RecordingCallback {
    fn on_compute_start(&self, event: &ComputeStart) {
        self.starts.lock().unwrap().push(event.clone());
    }

    fn on_task_end(&self, event: &TaskEndEvent) {
        self.task_ends.lock().unwrap().push(event.clone());
    }

    fn on_compute_end(&self, report: &DagReport) {
        self.ends.lock().unwrap().push(report.clone());
    }
}
