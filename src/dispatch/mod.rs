// src/dispatch/mod.rs

//! Unordered dispatch with retries and speculative backups.
//!
//! [`map_unordered`] submits every item to a [`RemoteExecutor`] and hands
//! results back as they complete, which is usually not submission order.
//!
//! - Failed calls are resubmitted until the total number of failures in the
//!   dispatch exceeds `max_failures`; the failure that crosses the ceiling
//!   is returned to the caller unchanged.
//! - With `use_backups`, slow calls get a duplicate (see [`backup`]); the
//!   first of the pair to succeed wins and the other is abandoned.
//! - Every item yields exactly one result, or the whole dispatch fails.
//!
//! [`state`] holds the per-call arena the control loop owns.

pub mod backup;
mod state;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{ChunkdagError, Result};
use crate::remote::{
    CallRecord, RemoteExecutor, RemoteFn, TaskError, TaskHandle, TaskStats, WaitMode, WaitResult,
};

pub use backup::{should_launch_backup, BackupBaseline, BackupPolicy};
use state::DispatchState;

/// Default delay between status polls when backups are enabled.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Knobs for a single [`map_unordered`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchOptions {
    /// Failures tolerated across the whole dispatch before it aborts.
    pub max_failures: usize,
    /// Launch backup copies of straggling calls.
    pub use_backups: bool,
    /// Attach [`TaskStats`] to each completion.
    pub return_stats: bool,
    /// Throttle between polls while backups are enabled.
    pub poll_interval: Duration,
    /// When a pending call counts as a straggler.
    pub backup: BackupPolicy,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_failures: 3,
            use_backups: false,
            return_stats: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            backup: BackupPolicy::default(),
        }
    }
}

impl DispatchOptions {
    pub fn validate(&self) -> Result<()> {
        if self.use_backups {
            self.backup.validate()?;
            if self.poll_interval.is_zero() {
                return Err(ChunkdagError::ConfigError(
                    "poll_interval must be non-zero when backups are enabled".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// One successful result.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion<O> {
    pub value: O,
    /// Present when `return_stats` was requested.
    pub stats: Option<TaskStats>,
}

/// Running totals for a dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounters {
    /// Calls handed to the executor, including retries and backups.
    pub submitted: usize,
    pub failures: usize,
    pub backups_launched: usize,
    /// Calls abandoned because their twin won.
    pub abandoned: usize,
}

/// How a finished call is treated.
enum Attempt<O> {
    Succeeded(O, TaskStats),
    Retry(TaskError),
    Fatal(TaskError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Running,
    Done,
}

/// Apply `function` to every item, yielding results as they complete.
///
/// Nothing is submitted until the first call to [`MapUnordered::next`].
pub fn map_unordered<'a, I, O, E>(
    executor: &'a mut E,
    function: RemoteFn<I, O>,
    items: Vec<I>,
    options: DispatchOptions,
) -> MapUnordered<'a, I, O, E>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
    E: RemoteExecutor<I, O> + ?Sized,
{
    MapUnordered {
        executor,
        function,
        options,
        state: DispatchState::new(items),
        ready: VecDeque::new(),
        counters: DispatchCounters::default(),
        phase: Phase::NotStarted,
        ticks: 0,
    }
}

/// Lazy, unordered sequence of results produced by [`map_unordered`].
///
/// Dropping it before it is exhausted abandons every call still pending.
pub struct MapUnordered<'a, I, O, E>
where
    E: RemoteExecutor<I, O> + ?Sized,
{
    executor: &'a mut E,
    function: RemoteFn<I, O>,
    options: DispatchOptions,
    state: DispatchState<I>,
    ready: VecDeque<Completion<O>>,
    counters: DispatchCounters,
    phase: Phase,
    ticks: u64,
}

impl<I, O, E> MapUnordered<'_, I, O, E>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
    E: RemoteExecutor<I, O> + ?Sized,
{
    /// Next completed result, `None` once every item has produced one.
    ///
    /// After an error the sequence is finished; results that were buffered
    /// but not yet returned are discarded.
    pub async fn next(&mut self) -> Option<Result<Completion<O>>> {
        loop {
            if let Some(completion) = self.ready.pop_front() {
                return Some(Ok(completion));
            }

            match self.phase {
                Phase::Done => return None,
                Phase::NotStarted => {
                    self.phase = Phase::Running;
                    if let Err(err) = self.start().await {
                        return Some(Err(self.abort(err)));
                    }
                }
                Phase::Running => {
                    if self.state.remaining() == 0 {
                        self.finish();
                        return None;
                    }
                    if let Err(err) = self.tick().await {
                        return Some(Err(self.abort(err)));
                    }
                }
            }
        }
    }

    /// Drive the dispatch to completion and gather every result.
    pub async fn collect_all(mut self) -> Result<Vec<Completion<O>>> {
        let mut out = Vec::with_capacity(self.state.len());
        while let Some(next) = self.next().await {
            out.push(next?);
        }
        Ok(out)
    }

    pub fn counters(&self) -> DispatchCounters {
        self.counters
    }

    async fn start(&mut self) -> Result<()> {
        self.options.validate()?;

        info!(
            items = self.state.len(),
            use_backups = self.options.use_backups,
            max_failures = self.options.max_failures,
            "dispatching work items"
        );

        let all: Vec<usize> = (0..self.state.len()).collect();
        if !all.is_empty() {
            self.submit(all).await?;
        }
        Ok(())
    }

    /// One poll of the executor and everything that follows from it.
    async fn tick(&mut self) -> Result<()> {
        let mode = if self.options.use_backups {
            if self.ticks > 0 {
                tokio::time::sleep(self.options.poll_interval).await;
            }
            WaitMode::Always
        } else {
            WaitMode::AnyCompleted
        };
        self.ticks += 1;

        let WaitResult { done, .. } = self
            .executor
            .wait(self.state.pending_handles(), mode)
            .await?;

        let mut retry = Vec::new();
        for handle in done {
            if let Some(idx) = self.handle_finished(handle)? {
                retry.push(idx);
            }
        }

        if !retry.is_empty() {
            debug!(count = retry.len(), "resubmitting failed items");
            self.submit(retry).await?;
        }

        if self.options.use_backups && self.state.remaining() > 0 {
            self.launch_backups().await?;
        }

        Ok(())
    }

    /// Process one finished handle. Returns the item index if it must be
    /// resubmitted.
    fn handle_finished(&mut self, handle: TaskHandle) -> Result<Option<usize>> {
        if !self.state.remove_pending(handle) {
            // Abandoned earlier in this batch.
            return Ok(None);
        }
        let Some(idx) = self.state.item_of(handle) else {
            return Ok(None);
        };
        let twin = self.state.unpair(handle);

        let record = self.executor.take_result(handle).ok_or_else(|| {
            ChunkdagError::Executor(format!("no result reported for finished call {handle}"))
        })?;

        if self.state.is_item_done(idx) {
            debug!(%handle, item = idx, "ignoring result for already completed item");
            return Ok(None);
        }

        match self.classify(record) {
            Attempt::Succeeded(value, stats) => {
                self.state.complete_item(idx, handle, Instant::now());
                if let Some(twin) = twin {
                    self.discard(twin);
                }
                self.ready.push_back(Completion {
                    value,
                    stats: self.options.return_stats.then_some(stats),
                });
                Ok(None)
            }
            Attempt::Retry(error) => {
                warn!(
                    %handle,
                    item = idx,
                    failures = self.counters.failures,
                    max_failures = self.options.max_failures,
                    error = %error,
                    "work item failed"
                );
                match twin {
                    Some(twin) => {
                        debug!(%handle, %twin, "twin still running; not resubmitting");
                        Ok(None)
                    }
                    None => Ok(Some(idx)),
                }
            }
            Attempt::Fatal(error) => {
                warn!(
                    %handle,
                    item = idx,
                    failures = self.counters.failures,
                    error = %error,
                    "failure ceiling exceeded; aborting dispatch"
                );
                Err(ChunkdagError::TaskFailed(error))
            }
        }
    }

    fn classify(&mut self, record: CallRecord<O>) -> Attempt<O> {
        match record.outcome {
            Ok(value) => Attempt::Succeeded(value, record.stats),
            Err(error) => {
                self.counters.failures += 1;
                if self.counters.failures > self.options.max_failures {
                    Attempt::Fatal(error)
                } else {
                    Attempt::Retry(error)
                }
            }
        }
    }

    /// Stop waiting on the losing member of a backup pair.
    fn discard(&mut self, handle: TaskHandle) {
        if self.state.remove_pending(handle) {
            debug!(%handle, "discarding slower twin");
            self.executor.abandon(handle);
            self.counters.abandoned += 1;
        }
    }

    async fn submit(&mut self, indices: Vec<usize>) -> Result<Vec<TaskHandle>> {
        let items: Vec<I> = indices.iter().map(|&i| self.state.item(i).clone()).collect();
        let handles = self
            .executor
            .submit(Arc::clone(&self.function), items)
            .await?;

        if handles.len() != indices.len() {
            return Err(ChunkdagError::Executor(format!(
                "executor returned {} handles for {} items",
                handles.len(),
                indices.len()
            )));
        }

        let now = Instant::now();
        for (&idx, &handle) in indices.iter().zip(&handles) {
            self.state.track(handle, idx, now);
        }
        self.counters.submitted += handles.len();
        Ok(handles)
    }

    async fn launch_backups(&mut self) -> Result<()> {
        let now = Instant::now();
        let starts = self.state.start_times();
        let ends = self.state.end_times();
        let baseline = BackupBaseline::new(starts, ends, &self.options.backup);
        let candidates: Vec<TaskHandle> = self
            .state
            .pending_handles()
            .into_iter()
            .filter(|&h| !self.state.has_twin(h) && baseline.is_straggler(&h, now, starts, ends))
            .collect();

        for original in candidates {
            let Some(idx) = self.state.item_of(original) else {
                continue;
            };
            info!(%original, item = idx, "launching backup task");

            let handles = self.submit(vec![idx]).await?;
            if let Some(&backup) = handles.first() {
                self.state.pair(original, backup);
                self.counters.backups_launched += 1;
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.phase = Phase::Done;
        self.abandon_pending();
        debug!(
            submitted = self.counters.submitted,
            failures = self.counters.failures,
            backups = self.counters.backups_launched,
            "dispatch finished"
        );
    }

    fn abort(&mut self, err: ChunkdagError) -> ChunkdagError {
        self.phase = Phase::Done;
        self.ready.clear();
        self.abandon_pending();
        err
    }

    fn abandon_pending(&mut self) {
        for handle in self.state.drain_pending() {
            self.executor.abandon(handle);
        }
    }
}

impl<I, O, E> Drop for MapUnordered<'_, I, O, E>
where
    E: RemoteExecutor<I, O> + ?Sized,
{
    fn drop(&mut self) {
        for handle in self.state.drain_pending() {
            self.executor.abandon(handle);
        }
    }
}
