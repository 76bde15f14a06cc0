// src/remote/local.rs

//! In-process backend.
//!
//! Each submitted call becomes a Tokio task that waits for a worker permit
//! and then runs the call future in a task of its own, so a panic surfaces
//! as a join error. Finished calls report back over an unbounded channel,
//! which `wait` drains.
//!
//! Abandoning a call closes its cancel channel. The owning task then aborts
//! the call, waits for it to be dropped, and only then returns the permit.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, trace};

use crate::errors::{ChunkdagError, Result};

use super::{
    unix_timestamp, BoxFuture, CallRecord, RemoteExecutor, RemoteFn, TaskError, TaskHandle,
    TaskStats, WaitMode, WaitResult,
};

/// Default number of calls allowed to run at the same time.
pub const DEFAULT_MAX_WORKERS: usize = 4;

type Completion<O> = (TaskHandle, CallRecord<O>);

/// Backend that runs calls on the local machine.
///
/// At most `max_workers` work functions run concurrently; the rest queue up
/// behind a semaphore, the same way calls queue on a remote substrate with a
/// fixed worker pool.
pub struct LocalExecutor<I, O> {
    next_id: u64,
    permits: Arc<Semaphore>,
    done_tx: mpsc::UnboundedSender<Completion<O>>,
    done_rx: mpsc::UnboundedReceiver<Completion<O>>,
    /// Dropping the sender cancels the call.
    running: HashMap<TaskHandle, oneshot::Sender<()>>,
    finished: HashMap<TaskHandle, CallRecord<O>>,
    _item: PhantomData<fn(I)>,
}

impl<I, O> fmt::Debug for LocalExecutor<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("running", &self.running.len())
            .field("finished", &self.finished.len())
            .finish_non_exhaustive()
    }
}

impl<I, O: Send + 'static> LocalExecutor<I, O> {
    pub fn new(max_workers: usize) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            next_id: 0,
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            done_tx,
            done_rx,
            running: HashMap::new(),
            finished: HashMap::new(),
            _item: PhantomData,
        }
    }

    /// Number of calls submitted but not yet reported back.
    pub fn running(&self) -> usize {
        self.running.len()
    }

    fn next_handle(&mut self) -> TaskHandle {
        self.next_id += 1;
        TaskHandle::new(self.next_id)
    }

    fn is_known(&self, handle: &TaskHandle) -> bool {
        self.running.contains_key(handle) || self.finished.contains_key(handle)
    }

    /// Move a completion into `finished`, unless the handle was abandoned.
    fn record(&mut self, handle: TaskHandle, record: CallRecord<O>) {
        if self.running.remove(&handle).is_some() {
            trace!(%handle, error = record.is_error(), "local call finished");
            self.finished.insert(handle, record);
        } else {
            debug!(%handle, "dropping result of abandoned call");
        }
    }

    fn drain_completions(&mut self) {
        while let Ok((handle, record)) = self.done_rx.try_recv() {
            self.record(handle, record);
        }
    }
}

impl<I, O> Default for LocalExecutor<I, O>
where
    O: Send + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

impl<I, O> RemoteExecutor<I, O> for LocalExecutor<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn submit(
        &mut self,
        function: RemoteFn<I, O>,
        items: Vec<I>,
    ) -> BoxFuture<'_, Result<Vec<TaskHandle>>> {
        let mut handles = Vec::with_capacity(items.len());

        for item in items {
            let handle = self.next_handle();
            let function = Arc::clone(&function);
            let permits = Arc::clone(&self.permits);
            let done_tx = self.done_tx.clone();
            let submit_tstamp = unix_timestamp();

            let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

            tokio::spawn(async move {
                let permit = tokio::select! {
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = &mut cancel_rx => return,
                };

                let start = unix_timestamp();
                let mut call = tokio::spawn(async move { function(item).await });

                let joined = tokio::select! {
                    joined = &mut call => joined,
                    _ = &mut cancel_rx => {
                        call.abort();
                        let _ = call.await;
                        drop(permit);
                        trace!(%handle, "local call stopped");
                        return;
                    }
                };
                let end = unix_timestamp();
                drop(permit);

                let record = match joined {
                    Ok(outcome) => CallRecord {
                        outcome,
                        stats: TaskStats {
                            submit_tstamp,
                            worker_start_tstamp: start,
                            worker_end_tstamp: end,
                            fetch_tstamp: 0.0,
                        },
                    },
                    Err(err) => {
                        let kind = if err.is_panic() { "panic" } else { "cancelled" };
                        CallRecord {
                            outcome: Err(TaskError::new(kind, err.to_string())),
                            stats: TaskStats {
                                submit_tstamp,
                                ..TaskStats::default()
                            },
                        }
                    }
                };

                // The receiver lives as long as the executor.
                let _ = done_tx.send((handle, record));
            });

            self.running.insert(handle, cancel_tx);
            handles.push(handle);
        }

        debug!(count = handles.len(), "submitted local calls");
        Box::pin(async move { Ok(handles) })
    }

    fn wait(
        &mut self,
        handles: Vec<TaskHandle>,
        mode: WaitMode,
    ) -> BoxFuture<'_, Result<WaitResult>> {
        Box::pin(async move {
            self.drain_completions();

            if mode == WaitMode::AnyCompleted && !handles.is_empty() {
                if !handles.iter().any(|h| self.is_known(h)) {
                    return Err(ChunkdagError::Executor(
                        "wait called with no known handles".to_string(),
                    ));
                }

                while !handles.iter().any(|h| self.finished.contains_key(h)) {
                    match self.done_rx.recv().await {
                        Some((handle, record)) => self.record(handle, record),
                        None => {
                            return Err(ChunkdagError::Executor(
                                "local completion channel closed".to_string(),
                            ));
                        }
                    }
                }
            }

            let (done, pending): (Vec<_>, Vec<_>) = handles
                .into_iter()
                .partition(|h| self.finished.contains_key(h));

            Ok(WaitResult { done, pending })
        })
    }

    fn take_result(&mut self, handle: TaskHandle) -> Option<CallRecord<O>> {
        let mut record = self.finished.remove(&handle)?;
        record.stats.fetch_tstamp = unix_timestamp();
        Some(record)
    }

    fn abandon(&mut self, handle: TaskHandle) {
        if self.running.remove(&handle).is_some() {
            debug!(%handle, "abandoning local call");
        }
        self.finished.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{sync_fn, CallFuture};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn double() -> RemoteFn<u32, u32> {
        sync_fn(|x: u32| Ok(x * 2))
    }

    /// Counts calls currently running and the most seen at once.
    #[derive(Default)]
    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    struct Entered(Arc<Gauge>);

    impl Gauge {
        fn enter(self: &Arc<Self>) -> Entered {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            Entered(Arc::clone(self))
        }
    }

    impl Drop for Entered {
        fn drop(&mut self) {
            self.0.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Item 0 sleeps for a minute; every other item returns at once.
    fn gauged(gauge: &Arc<Gauge>) -> RemoteFn<u32, u32> {
        let gauge = Arc::clone(gauge);
        Arc::new(move |x: u32| -> CallFuture<u32> {
            let gauge = Arc::clone(&gauge);
            Box::pin(async move {
                let _entered = gauge.enter();
                if x == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(x)
            })
        })
    }

    async fn until_active(gauge: &Gauge, n: usize) {
        while gauge.active.load(Ordering::SeqCst) != n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn runs_every_submitted_call() {
        let mut exec = LocalExecutor::new(2);
        let handles = exec.submit(double(), vec![1, 2, 3]).await.unwrap();
        assert_eq!(handles.len(), 3);

        let mut pending = handles.clone();
        let mut values = Vec::new();
        while !pending.is_empty() {
            let res = exec.wait(pending, WaitMode::AnyCompleted).await.unwrap();
            for h in res.done {
                let record = exec.take_result(h).unwrap();
                assert!(record.stats.fetch_tstamp >= record.stats.worker_end_tstamp);
                values.push(record.outcome.unwrap());
            }
            pending = res.pending;
        }

        values.sort();
        assert_eq!(values, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn panics_become_task_errors() {
        let mut exec: LocalExecutor<u32, u32> = LocalExecutor::new(1);
        let boom: RemoteFn<u32, u32> = sync_fn(|_| panic!("boom"));
        let handles = exec.submit(boom, vec![0]).await.unwrap();

        let res = exec.wait(handles.clone(), WaitMode::AnyCompleted).await.unwrap();
        assert_eq!(res.done, handles);

        let record = exec.take_result(handles[0]).unwrap();
        let err = record.outcome.unwrap_err();
        assert_eq!(err.kind, "panic");
    }

    #[tokio::test]
    async fn wait_on_unknown_handles_is_an_error() {
        let mut exec: LocalExecutor<u32, u32> = LocalExecutor::new(1);
        let res = exec
            .wait(vec![TaskHandle::new(99)], WaitMode::AnyCompleted)
            .await;
        assert!(matches!(res, Err(ChunkdagError::Executor(_))));
    }

    #[tokio::test]
    async fn abandoned_result_is_never_returned() {
        let mut exec = LocalExecutor::new(1);
        let handles = exec.submit(double(), vec![5]).await.unwrap();
        exec.wait(handles.clone(), WaitMode::AnyCompleted).await.unwrap();

        exec.abandon(handles[0]);

        assert!(exec.take_result(handles[0]).is_none());
        assert_eq!(exec.running(), 0);
    }

    #[tokio::test]
    async fn abandoning_a_running_call_stops_it_before_freeing_its_worker() {
        let gauge = Arc::new(Gauge::default());
        let mut exec = LocalExecutor::new(1);
        let handles = exec.submit(gauged(&gauge), vec![0, 1]).await.unwrap();
        until_active(&gauge, 1).await;

        exec.abandon(handles[0]);
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            exec.wait(vec![handles[1]], WaitMode::AnyCompleted),
        )
        .await
        .expect("queued call never got the worker")
        .unwrap();

        assert_eq!(res.done, vec![handles[1]]);
        assert_eq!(exec.take_result(handles[1]).unwrap().outcome, Ok(1));
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
        assert_eq!(gauge.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropping_the_executor_stops_running_calls() {
        let gauge = Arc::new(Gauge::default());
        let mut exec = LocalExecutor::new(2);
        exec.submit(gauged(&gauge), vec![0]).await.unwrap();
        until_active(&gauge, 1).await;

        drop(exec);

        tokio::time::timeout(Duration::from_secs(5), until_active(&gauge, 0))
            .await
            .expect("call kept running after the executor was dropped");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abandoned_shell_stage_does_not_finish_its_command() {
        use crate::exec::command::shell_stage_fn;
        use serde_json::json;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let stage = shell_stage_fn("a", "slow", &format!("sleep 1; touch {}", marker.display()));
        let f: RemoteFn<u32, ()> = Arc::new(move |_: u32| stage(None, Arc::new(json!({}))));

        let mut exec = LocalExecutor::new(1);
        let handles = exec.submit(f, vec![0]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        exec.abandon(handles[0]);
        drop(exec);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
