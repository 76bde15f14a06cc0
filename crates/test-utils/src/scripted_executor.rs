use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use chunkdag::errors::{ChunkdagError, Result};
use chunkdag::remote::{
    BoxFuture, CallRecord, RemoteExecutor, RemoteFn, TaskError, TaskHandle, TaskStats, WaitMode,
    WaitResult,
};
use tokio::time::Instant;
use tracing::debug;

/// What one scripted call does: how long it "runs" and whether it fails.
#[derive(Debug, Clone, PartialEq)]
pub struct CallPlan {
    pub latency: Duration,
    pub failure: Option<TaskError>,
}

impl CallPlan {
    /// Succeed after `latency` of virtual time.
    pub fn after(latency: Duration) -> Self {
        Self {
            latency,
            failure: None,
        }
    }

    /// Fail with `kind: message` instead of running the function.
    pub fn failing(mut self, kind: &str, message: &str) -> Self {
        self.failure = Some(TaskError::new(kind, message));
        self
    }
}

type Planner<I> = Arc<dyn Fn(&I, usize) -> CallPlan + Send + Sync>;

struct ScheduledCall<O> {
    ready_at: Instant,
    record: CallRecord<O>,
}

/// A [`RemoteExecutor`] driven by tokio's clock.
///
/// Each call is planned by a closure receiving the item and its attempt
/// number (0 for the first submission of that item, counting retries and
/// backups). The call runs to completion at submit time; the result becomes visible
/// once `latency` has elapsed. Run tests with `start_paused = true` so the
/// latencies cost no real time.
///
/// Items are told apart by their `Debug` rendering.
pub struct ScriptedExecutor<I, O> {
    planner: Planner<I>,
    origin: Instant,
    next_id: u64,
    calls: HashMap<TaskHandle, ScheduledCall<O>>,
    attempts: HashMap<String, usize>,
    submissions: Vec<(String, usize)>,
    abandoned: Vec<TaskHandle>,
}

impl<I, O> ScriptedExecutor<I, O>
where
    I: Debug + Send + 'static,
    O: Send + 'static,
{
    pub fn new(planner: impl Fn(&I, usize) -> CallPlan + Send + Sync + 'static) -> Self {
        Self {
            planner: Arc::new(planner),
            origin: Instant::now(),
            next_id: 0,
            calls: HashMap::new(),
            attempts: HashMap::new(),
            submissions: Vec::new(),
            abandoned: Vec::new(),
        }
    }

    /// Every call succeeds after the same latency.
    pub fn uniform(latency: Duration) -> Self {
        Self::new(move |_, _| CallPlan::after(latency))
    }

    /// Total calls submitted, including retries and backups.
    pub fn submitted(&self) -> usize {
        self.submissions.len()
    }

    /// `(item, attempt)` for every submission, in order.
    pub fn submissions(&self) -> &[(String, usize)] {
        &self.submissions
    }

    /// Number of times `item` was submitted.
    pub fn attempts_of(&self, item: &I) -> usize {
        self.attempts.get(&key(item)).copied().unwrap_or(0)
    }

    pub fn abandoned(&self) -> &[TaskHandle] {
        &self.abandoned
    }

    /// Calls submitted but neither fetched nor abandoned.
    pub fn outstanding(&self) -> usize {
        self.calls.len()
    }

    fn seconds(&self, at: Instant) -> f64 {
        at.duration_since(self.origin).as_secs_f64()
    }
}

fn key<I: Debug>(item: &I) -> String {
    format!("{item:?}")
}

impl<I, O> RemoteExecutor<I, O> for ScriptedExecutor<I, O>
where
    I: Debug + Send + 'static,
    O: Send + 'static,
{
    fn submit(
        &mut self,
        function: RemoteFn<I, O>,
        items: Vec<I>,
    ) -> BoxFuture<'_, Result<Vec<TaskHandle>>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut handles = Vec::with_capacity(items.len());

            for item in items {
                let item_key = key(&item);
                let attempt = self.attempts.entry(item_key.clone()).or_insert(0);
                let plan = (self.planner)(&item, *attempt);
                self.submissions.push((item_key, *attempt));
                *attempt += 1;

                let outcome = match plan.failure {
                    Some(err) => Err(err),
                    None => function(item).await,
                };
                let ready_at = now + plan.latency;
                let record = CallRecord {
                    outcome,
                    stats: TaskStats {
                        submit_tstamp: self.seconds(now),
                        worker_start_tstamp: self.seconds(now),
                        worker_end_tstamp: self.seconds(ready_at),
                        fetch_tstamp: 0.0,
                    },
                };

                let handle = TaskHandle::new(self.next_id);
                self.next_id += 1;
                self.calls.insert(handle, ScheduledCall { ready_at, record });
                handles.push(handle);
            }

            debug!(count = handles.len(), "scripted submit");
            Ok(handles)
        })
    }

    fn wait(
        &mut self,
        handles: Vec<TaskHandle>,
        mode: WaitMode,
    ) -> BoxFuture<'_, Result<WaitResult>> {
        Box::pin(async move {
            if mode == WaitMode::AnyCompleted && !handles.is_empty() {
                let earliest = handles
                    .iter()
                    .filter_map(|h| self.calls.get(h).map(|c| c.ready_at))
                    .min()
                    .ok_or_else(|| {
                        ChunkdagError::Executor("wait called with no known handles".to_string())
                    })?;
                tokio::time::sleep_until(earliest).await;
            }

            let now = Instant::now();
            let (done, pending): (Vec<_>, Vec<_>) = handles
                .into_iter()
                .partition(|h| self.calls.get(h).is_some_and(|c| c.ready_at <= now));
            Ok(WaitResult { done, pending })
        })
    }

    fn take_result(&mut self, handle: TaskHandle) -> Option<CallRecord<O>> {
        let now = Instant::now();
        if self.calls.get(&handle)?.ready_at > now {
            return None;
        }
        let mut record = self.calls.remove(&handle)?.record;
        record.stats.fetch_tstamp = self.seconds(now);
        Some(record)
    }

    fn abandon(&mut self, handle: TaskHandle) {
        if self.calls.remove(&handle).is_some() {
            self.abandoned.push(handle);
        }
    }
}
