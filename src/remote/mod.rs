// src/remote/mod.rs

//! Remote execution capability.
//!
//! Everything above this module talks to a [`RemoteExecutor`] and never to a
//! concrete backend. A backend only has to offer "submit many independent
//! calls, get a handle per call, wait for some subset to finish, fetch the
//! result or error per handle".
//!
//! - [`local`] runs calls in-process as Tokio tasks.
//! - Test code provides scripted backends with virtual latencies.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::errors::Result;

pub mod local;

pub use local::LocalExecutor;

/// Boxed future returned by executor methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Output of one call of a [`RemoteFn`].
pub type CallFuture<O> = BoxFuture<'static, std::result::Result<O, TaskError>>;

/// The function a backend runs once per submitted item.
///
/// Calling it only builds the work; dropping the returned future stops it.
pub type RemoteFn<I, O> = Arc<dyn Fn(I) -> CallFuture<O> + Send + Sync>;

/// Wrap a synchronous function as a [`RemoteFn`].
///
/// The function runs when the call is first polled, on whichever task polls
/// it, so keep it cheap.
pub fn sync_fn<I, O, F>(function: F) -> RemoteFn<I, O>
where
    F: Fn(I) -> std::result::Result<O, TaskError> + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
    let function = Arc::new(function);
    Arc::new(move |item: I| -> CallFuture<O> {
        let function = Arc::clone(&function);
        Box::pin(async move { function(item) })
    })
}

/// Opaque reference to one in-flight remote invocation.
///
/// Handles are allocated by the backend and are unique for the lifetime of
/// that backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

impl TaskHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How [`RemoteExecutor::wait`] should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Suspend until at least one of the given handles has finished.
    AnyCompleted,
    /// Return immediately with the current status of every given handle.
    Always,
}

/// Handles split by status after a wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitResult {
    pub done: Vec<TaskHandle>,
    pub pending: Vec<TaskHandle>,
}

/// Timing of a single remote call, in seconds since the Unix epoch.
///
/// - `submit_tstamp`: the call was handed to the backend.
/// - `worker_start_tstamp` / `worker_end_tstamp`: the work function ran.
/// - `fetch_tstamp`: the result was retrieved by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskStats {
    pub submit_tstamp: f64,
    pub worker_start_tstamp: f64,
    pub worker_end_tstamp: f64,
    pub fetch_tstamp: f64,
}

/// Error raised by a work function (or by the worker running it).
///
/// `kind` names the failure class (for example `"CommandFailed"` or
/// `"panic"`); `message` is the human-readable detail. Neither is rewritten
/// on its way to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture any error value, using its type name as the kind.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let kind = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error");
        Self::new(kind, err.to_string())
    }
}

/// Result of one remote call as reported by the backend.
#[derive(Debug, Clone)]
pub struct CallRecord<O> {
    pub outcome: std::result::Result<O, TaskError>,
    pub stats: TaskStats,
}

impl<O> CallRecord<O> {
    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }
}

/// Trait abstracting a remote execution substrate.
///
/// Production code uses [`LocalExecutor`]; tests provide their own
/// implementation with scripted latencies and failures.
pub trait RemoteExecutor<I, O>: Send {
    /// Submit one call of `function` per item. Returns one handle per item,
    /// in item order.
    fn submit(
        &mut self,
        function: RemoteFn<I, O>,
        items: Vec<I>,
    ) -> BoxFuture<'_, Result<Vec<TaskHandle>>>;

    /// Split `handles` into finished and still-running ones.
    fn wait(
        &mut self,
        handles: Vec<TaskHandle>,
        mode: WaitMode,
    ) -> BoxFuture<'_, Result<WaitResult>>;

    /// Retrieve (and forget) the record of a finished call.
    ///
    /// Returns `None` if the handle is unknown or still running.
    fn take_result(&mut self, handle: TaskHandle) -> Option<CallRecord<O>>;

    /// Stop tracking a call whose result is no longer wanted.
    ///
    /// Backends that can stop the computation should; remote substrates
    /// may let it run to completion and drop the result.
    fn abandon(&mut self, _handle: TaskHandle) {}
}

/// Current wall-clock time in seconds since the Unix epoch.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
