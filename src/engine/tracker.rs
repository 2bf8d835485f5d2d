use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of one handler invocation. Handler errors never escape as `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult<T> {
    Success(T),
    Error { error: String, traceback: String },
    Cancelled,
}

impl<T> TaskResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success(_))
    }
}

/// Bounds how many step handlers run at once in this process.
pub struct WorkerTracker {
    slots: Arc<Semaphore>,
    capacity: usize,
    tasks: Mutex<HashMap<String, CancellationToken>>,
}

impl WorkerTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Capacity from `DYNSCHED_WORKER_SLOTS`, falling back to the number of CPUs.
    pub fn from_env() -> Self {
        let capacity = std::env::var("DYNSCHED_WORKER_SLOTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(num_cpus::get);
        Self::new(capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Advisory: true when a `handle_run` issued now would not queue for a slot.
    pub fn has_free_slots(&self) -> bool {
        self.slots.available_permits() > 0
    }

    /// Number of handlers currently registered as in flight.
    pub fn tracked_count(&self) -> usize {
        self.lock_tasks().len()
    }

    pub fn is_tracked(&self, task_uid: &str) -> bool {
        self.lock_tasks().contains_key(task_uid)
    }

    /// Run `handler(context, token)` under a slot, tracked as `task_uid`.
    ///
    /// Errors and panics become `TaskResult::Error`. A timeout or `cancel_run` aborts
    /// the handler and yields `TaskResult::Cancelled`, unless the handler already
    /// finished, in which case its own outcome wins.
    pub async fn handle_run<C, F, Fut, T>(
        &self,
        task_uid: &str,
        context: C,
        timeout: Duration,
        handler: F,
    ) -> TaskResult<T>
    where
        F: FnOnce(C, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.run_tracked(task_uid, context, timeout, CancellationToken::new(), handler).await
    }

    /// Like [`handle_run`](Self::handle_run), but also cancelled through `parent`.
    ///
    /// A cancelled `parent` yields `TaskResult::Cancelled` without running the handler,
    /// including while the task still waits for a free slot.
    pub async fn handle_run_linked<C, F, Fut, T>(
        &self,
        task_uid: &str,
        context: C,
        timeout: Duration,
        parent: &CancellationToken,
        handler: F,
    ) -> TaskResult<T>
    where
        F: FnOnce(C, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.run_tracked(task_uid, context, timeout, parent.child_token(), handler).await
    }

    async fn run_tracked<C, F, Fut, T>(
        &self,
        task_uid: &str,
        context: C,
        timeout: Duration,
        token: CancellationToken,
        handler: F,
    ) -> TaskResult<T>
    where
        F: FnOnce(C, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(task_uid = %task_uid, "Task cancelled before it got a slot");
                return TaskResult::Cancelled;
            }
            acquired = self.slots.clone().acquire_owned() => match acquired {
                Ok(permit) => permit,
                Err(_) => return TaskResult::Cancelled,
            },
        };

        self.lock_tasks().insert(task_uid.to_string(), token.clone());
        debug!(task_uid = %task_uid, "Tracking task");

        let mut handle = tokio::spawn(handler(context, token.clone()));

        let result = tokio::select! {
            biased;
            joined = &mut handle => match joined {
                Ok(Ok(value)) => TaskResult::Success(value),
                Ok(Err(e)) => TaskResult::Error {
                    error: format!("{:#}", e),
                    traceback: format!("{:?}", e),
                },
                Err(join_err) if join_err.is_panic() => {
                    let message = panic_message(join_err.into_panic());
                    TaskResult::Error {
                        error: format!("handler panicked: {}", message),
                        traceback: message,
                    }
                }
                Err(_) => TaskResult::Cancelled,
            },
            _ = token.cancelled() => {
                handle.abort();
                debug!(task_uid = %task_uid, "Task cancelled");
                TaskResult::Cancelled
            }
            _ = tokio::time::sleep(timeout) => {
                handle.abort();
                token.cancel();
                warn!(task_uid = %task_uid, timeout_s = timeout.as_secs_f64(), "Task timed out");
                TaskResult::Cancelled
            }
        };

        self.lock_tasks().remove(task_uid);
        result
    }

    /// Request cancellation of an in-flight task. False when `task_uid` is unknown.
    pub fn cancel_run(&self, task_uid: &str) -> bool {
        match self.lock_tasks().get(task_uid) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
