//! FIFO serialization of asynchronous operations against one resource
//!
//! At most one operation runs at a time. Operations are spawned onto the
//! ambient tokio runtime rather than executed in the caller's stack frame,
//! and every operation must signal completion before the next one starts.

use cachestorage_core::{Error, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A deferred action producing the future that performs the operation
pub type Operation = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>;

/// Serializes operations in submission order
#[derive(Clone, Default)]
pub struct OperationScheduler {
    inner: Arc<Mutex<SchedulerState>>,
}

#[derive(Default)]
struct SchedulerState {
    pending: VecDeque<Operation>,
    running: bool,
}

impl OperationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `operation`, starting it right away if nothing is running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, operation: Operation) {
        let mut state = self.inner.lock();
        state.pending.push_back(operation);
        if !state.running {
            Self::run_next(&mut state);
        }
    }

    /// Called exactly once by the running operation when all of its work is done
    pub fn complete_and_run_next(&self) {
        let mut state = self.inner.lock();
        debug_assert!(state.running, "completion signalled with nothing running");
        state.running = false;
        Self::run_next(&mut state);
    }

    /// True if an operation is running or queued
    pub fn has_scheduled_operations(&self) -> bool {
        let state = self.inner.lock();
        state.running || !state.pending.is_empty()
    }

    /// Schedule `operation` now and return a future resolving to its result.
    ///
    /// Scheduling happens synchronously, before the returned future is
    /// polled, so dropping the future does not cancel the operation. The
    /// scheduler is released when the operation finishes or unwinds.
    pub fn submit<F, T>(&self, operation: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let scheduler = self.clone();
        self.schedule(Box::new(move || {
            Box::pin(async move {
                let guard = CompletionGuard(scheduler);
                let result = operation.await;
                drop(guard);
                // The caller may have stopped waiting; the work still counts.
                let _ = tx.send(result);
            })
        }));

        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::storage(
                    "scheduled operation",
                    "operation was dropped before it completed",
                )),
            }
        }
    }

    /// Schedule `operation` and wait for its result
    pub async fn run<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(operation).await
    }

    fn run_next(state: &mut SchedulerState) {
        if let Some(operation) = state.pending.pop_front() {
            state.running = true;
            tokio::spawn(async move { operation().await });
        }
    }
}

impl std::fmt::Debug for OperationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("OperationScheduler")
            .field("running", &state.running)
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// Releases the scheduler when dropped, including on panic
struct CompletionGuard(OperationScheduler);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.complete_and_run_next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_operations_run_in_submission_order() {
        let scheduler = OperationScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut waits = Vec::new();
        for i in 0..5u64 {
            let order = Arc::clone(&order);
            waits.push(scheduler.submit(async move {
                // Earlier operations sleep longer; FIFO must still hold.
                tokio::time::sleep(Duration::from_millis(25 - i * 5)).await;
                order.lock().push(i);
                Ok(i)
            }));
        }

        let results = futures::future::join_all(waits).await;
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_at_most_one_operation_in_flight() {
        let scheduler = OperationScheduler::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut waits = Vec::new();
        for _ in 0..8 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            waits.push(scheduler.submit(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        for wait in futures::future::join_all(waits).await {
            wait.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!scheduler.has_scheduled_operations());
    }

    #[tokio::test]
    async fn test_manual_completion_gates_next_operation() {
        let scheduler = OperationScheduler::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let second_ran = Arc::new(AtomicUsize::new(0));

        let first = scheduler.clone();
        scheduler.schedule(Box::new(move || {
            Box::pin(async move {
                let _ = release_rx.await;
                first.complete_and_run_next();
            })
        }));

        let counter = Arc::clone(&second_ran);
        let second = scheduler.submit(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(second_ran.load(Ordering::SeqCst), 0);
        assert!(scheduler.has_scheduled_operations());

        release_tx.send(()).unwrap();
        second.await.unwrap();
        assert_eq!(second_ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_operation_does_not_starve_queue() {
        let scheduler = OperationScheduler::new();

        let failed = scheduler.submit(async {
            if true {
                panic!("operation blew up");
            }
            Ok(())
        });
        let next = scheduler.submit(async { Ok(42) });

        let err = failed.await.unwrap_err();
        assert_eq!(err.kind(), cachestorage_core::ErrorKind::Storage);
        assert_eq!(next.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_dropped_waiter_still_runs_operation() {
        let scheduler = OperationScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        drop(scheduler.submit(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        scheduler.run(async { Ok(()) }).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_completion_order_matches_submission(
            delays in proptest::collection::vec(0u64..4, 1..12)
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            let finished = runtime.block_on(async {
                let scheduler = OperationScheduler::new();
                let finished = Arc::new(Mutex::new(Vec::new()));
                let waits: Vec<_> = delays
                    .iter()
                    .enumerate()
                    .map(|(i, delay)| {
                        let finished = Arc::clone(&finished);
                        let delay = *delay;
                        scheduler.submit(async move {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            finished.lock().push(i);
                            Ok(())
                        })
                    })
                    .collect();
                futures::future::join_all(waits).await;
                let out = finished.lock().clone();
                out
            });
            prop_assert_eq!(finished, (0..delays.len()).collect::<Vec<_>>());
        }
    }
}
