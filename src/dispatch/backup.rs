// src/dispatch/backup.rs

//! Straggler detection for speculative backup tasks.
//!
//! A pending task is a straggler when it has been running much longer than
//! the tasks that already finished in the same dispatch. The baseline is the
//! median duration of completed tasks, and nothing is flagged until enough
//! tasks exist and enough of them have completed for that median to mean
//! something.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::errors::{ChunkdagError, Result};

/// Tunables for [`should_launch_backup`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackupPolicy {
    /// Minimum number of tasks started in the dispatch before any backup.
    pub min_tasks: usize,
    /// Fraction of started tasks that must have completed.
    pub min_completed_fraction: f64,
    /// How many times the median completed duration a task may run before
    /// it is treated as a straggler. Must be greater than 1.
    pub slow_factor: f64,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            min_tasks: 10,
            min_completed_fraction: 0.5,
            slow_factor: 3.0,
        }
    }
}

impl BackupPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(self.slow_factor > 1.0) {
            return Err(ChunkdagError::ConfigError(format!(
                "backup slow_factor must be > 1 (got {})",
                self.slow_factor
            )));
        }
        if !(self.min_completed_fraction > 0.0 && self.min_completed_fraction <= 1.0) {
            return Err(ChunkdagError::ConfigError(format!(
                "backup min_completed_fraction must be in (0, 1] (got {})",
                self.min_completed_fraction
            )));
        }
        Ok(())
    }
}

/// Straggler threshold for one poll of a dispatch.
///
/// Built once from the start and end times, then queried per pending task,
/// so a poll costs one sort of the completed durations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackupBaseline {
    /// Elapsed seconds beyond which a task is a straggler. `None` while
    /// too few tasks exist or have completed.
    threshold: Option<f64>,
}

impl BackupBaseline {
    pub fn new<K: Eq + Hash>(
        start_times: &HashMap<K, Instant>,
        end_times: &HashMap<K, Instant>,
        policy: &BackupPolicy,
    ) -> Self {
        let n_tasks = start_times.len();
        let n_completed = end_times.len();
        let enough = n_completed > 0
            && n_tasks >= policy.min_tasks
            && (n_completed as f64) / (n_tasks as f64) >= policy.min_completed_fraction;
        if !enough {
            return Self { threshold: None };
        }

        let mut durations: Vec<Duration> = end_times
            .iter()
            .filter_map(|(k, end)| start_times.get(k).map(|s| end.saturating_duration_since(*s)))
            .collect();

        Self {
            threshold: median(&mut durations).map(|m| m * policy.slow_factor),
        }
    }

    /// Whether `task` has outrun the threshold at `now`.
    pub fn is_straggler<K: Eq + Hash>(
        &self,
        task: &K,
        now: Instant,
        start_times: &HashMap<K, Instant>,
        end_times: &HashMap<K, Instant>,
    ) -> bool {
        let Some(threshold) = self.threshold else {
            return false;
        };
        if end_times.contains_key(task) {
            return false;
        }
        match start_times.get(task) {
            Some(started) => now.saturating_duration_since(*started).as_secs_f64() > threshold,
            None => false,
        }
    }
}

/// Decide whether `task` should get a speculative duplicate at `now`.
///
/// `start_times` holds every task submitted in this dispatch, `end_times`
/// every task observed to complete successfully. When checking many tasks
/// at once, build one [`BackupBaseline`] instead.
pub fn should_launch_backup<K: Eq + Hash>(
    task: &K,
    now: Instant,
    start_times: &HashMap<K, Instant>,
    end_times: &HashMap<K, Instant>,
    policy: &BackupPolicy,
) -> bool {
    BackupBaseline::new(start_times, end_times, policy).is_straggler(
        task,
        now,
        start_times,
        end_times,
    )
}

/// Median of `values` in seconds. Sorts in place.
fn median(values: &mut [Duration]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort();
    let mid = values.len() / 2;
    let m = if values.len() % 2 == 0 {
        (values[mid - 1].as_secs_f64() + values[mid].as_secs_f64()) / 2.0
    } else {
        values[mid].as_secs_f64()
    };
    Some(m)
}
