//! Worker-thread bridge for blocking Git work.
//!
//! Resolution flows are async, but every Git invocation is a blocking
//! subprocess call. [`TaskRunner`] ships those closures to the blocking
//! thread pool and hands back a [`TaskHandle`] that delivers the result
//! exactly once. The spawned worker owns the result slot, so a job keeps
//! running and its result stays deliverable even when the caller drops the
//! handle immediately.

use std::any::Any;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use crate::errors::TaskError;

/// Uniform result type delivered by task handles.
pub type TaskResult<T> = Result<T, TaskError>;

/// Dispatches blocking jobs to `tokio::task::spawn_blocking` workers.
///
/// Cloning is cheap; clones share the in-flight gauge.
#[derive(Clone, Default)]
pub struct TaskRunner {
    in_flight: Arc<AtomicUsize>,
    next_job_id: Arc<AtomicU64>,
}

struct Slot<T> {
    value: Mutex<Option<TaskResult<T>>>,
    ready: Notify,
}

/// Awaitable handle for one job. Dropping it does not cancel the job.
pub struct TaskHandle<T> {
    slot: Arc<Slot<T>>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs whose results have not been stored yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run a blocking job on the worker pool.
    ///
    /// The job's error is stringified at the delivery boundary; a panic in
    /// the job is contained and delivered as [`TaskError::Panicked`].
    pub fn run<T, E, F>(&self, job: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        E: Display,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            value: Mutex::new(None),
            ready: Notify::new(),
        });

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let worker_slot = Arc::clone(&slot);
        let in_flight = Arc::clone(&self.in_flight);

        tokio::task::spawn_blocking(move || {
            debug!(job_id, "task started");
            let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(TaskError::Failed(e.to_string())),
                Err(panic) => Err(TaskError::Panicked(panic_message(&panic))),
            };
            let failed = outcome.is_err();

            // The worker holds its own Arc, so the store succeeds even when
            // the caller already dropped the handle.
            *lock_slot(&worker_slot.value) = Some(outcome);
            in_flight.fetch_sub(1, Ordering::SeqCst);
            worker_slot.ready.notify_one();
            debug!(job_id, failed, "task finished");
        });

        TaskHandle { slot }
    }

    /// Run a blocking job and await its result in one step.
    pub async fn call<T, E, F>(&self, job: F) -> TaskResult<T>
    where
        T: Send + 'static,
        E: Display,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.run(job).join().await
    }
}

impl<T> TaskHandle<T> {
    /// Wait for the job and take its result.
    pub async fn join(self) -> TaskResult<T> {
        loop {
            if let Some(result) = lock_slot(&self.slot.value).take() {
                return result;
            }
            // notify_one stores a permit when no waiter is registered, so a
            // store that lands between the check above and this await still
            // wakes us.
            self.slot.ready.notified().await;
        }
    }
}

fn lock_slot<T>(slot: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn test_delivers_value() {
        let runner = TaskRunner::new();
        let result = runner
            .run(|| Ok::<_, std::io::Error>(42))
            .join()
            .await
            .unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn test_stringifies_job_error() {
        let runner = TaskRunner::new();
        let result: TaskResult<()> = runner.call(|| Err("boom")).await;
        match result {
            Err(TaskError::Failed(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_contains_panic() {
        let runner = TaskRunner::new();
        let result: TaskResult<()> = runner.call(|| -> Result<(), String> {
            panic!("worker exploded")
        })
        .await;
        match result {
            Err(TaskError::Panicked(msg)) => assert!(msg.contains("worker exploded")),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_handle_still_runs_exactly_once() {
        let runner = TaskRunner::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_job = Arc::clone(&calls);

        let handle = runner.run(move || {
            calls_in_job.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        });
        drop(handle);

        let gauge = runner.clone();
        wait_until(|| gauge.in_flight() == 0).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_flight_gauge() {
        let runner = TaskRunner::new();
        assert_eq!(runner.in_flight(), 0);

        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let handle = runner.run(move || {
            rx.recv().ok();
            Ok::<_, String>(())
        });
        assert_eq!(runner.in_flight(), 1);

        tx.send(()).unwrap();
        handle.join().await.unwrap();
        assert_eq!(runner.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_join_after_completion() {
        let runner = TaskRunner::new();
        let handle = runner.run(|| Ok::<_, String>("late"));
        let gauge = runner.clone();
        wait_until(|| gauge.in_flight() == 0).await;
        // Result must still be there after the worker finished long ago.
        assert_eq!(handle.join().await.unwrap(), "late");
    }
}
