//! The event loop as an explicit object.
//!
//! One cooperative scheduler runs on a dedicated background thread and owns
//! all socket create/accept/read/write work. The rest of the process (which
//! may be heavily multi-threaded) crosses into the loop only through the
//! two submission primitives on [`ReactorHandle`].
//!
//! Lifecycle is explicit: [`Reactor::spawn`] starts the thread,
//! [`Reactor::shutdown`] stops it and joins. There is no process-wide
//! singleton; constructors that need the loop take a handle.

use crate::error::{NetError, Result};
use std::future::Future;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Owns the loop thread. Dropping (or calling [`Reactor::shutdown`]) stops
/// the loop; tasks still pending on it are dropped, never completed.
pub struct Reactor {
    handle: ReactorHandle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Thread-safe entry point into the loop. Cheap to clone.
#[derive(Clone)]
pub struct ReactorHandle {
    runtime: tokio::runtime::Handle,
    jobs: mpsc::UnboundedSender<Job>,
}

impl Reactor {
    /// Start the loop on a dedicated thread.
    pub fn spawn() -> Result<Reactor> {
        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<Job>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread = thread::Builder::new()
            .name("strata-reactor".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async move {
                    loop {
                        tokio::select! {
                            _ = &mut shutdown_rx => break,
                            job = jobs_rx.recv() => match job {
                                Some(job) => job(),
                                None => break,
                            },
                        }
                    }
                });
            })
            .map_err(|e| NetError::io("failed to spawn reactor thread", e))?;

        let runtime = ready_rx
            .recv()
            .map_err(|_| NetError::internal("reactor thread exited during startup"))?
            .map_err(|e| NetError::io("failed to build reactor runtime", e))?;

        Ok(Reactor {
            handle: ReactorHandle {
                runtime,
                jobs: jobs_tx,
            },
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &ReactorHandle {
        &self.handle
    }

    /// Stop the loop and join its thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("reactor thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

impl ReactorHandle {
    /// Run `f` on the loop soon, fire-and-forget. Submissions from one
    /// thread run in submission order; no ordering holds across threads.
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.jobs.send(Box::new(f)).is_err() {
            debug!("submit after reactor shutdown, job dropped");
        }
    }

    /// Spawn a long-lived task on the loop.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Submit `future` and block the calling thread for its result, bounded
    /// by `timeout`. Used only for connection/listener establishment.
    ///
    /// On expiry the loop-side operation is NOT cancelled; anything run
    /// through here must be idempotent or self-cleaning. Calling this from
    /// the loop thread would deadlock, so it is rejected outright.
    pub fn run_with_timeout<F>(
        &self,
        operation: &str,
        timeout: Duration,
        future: F,
    ) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if tokio::runtime::Handle::try_current()
            .map(|current| current.id() == self.runtime.id())
            .unwrap_or(false)
        {
            return Err(NetError::internal(
                "run_with_timeout called from the reactor thread",
            ));
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        self.runtime.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.recv_timeout(timeout)
            .map_err(|_| NetError::timeout(operation, timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn run_with_timeout_returns_the_result() {
        let reactor = Reactor::spawn().unwrap();
        let value = reactor
            .handle()
            .run_with_timeout("double", Duration::from_secs(1), async { 21 * 2 })
            .unwrap();
        assert_eq!(value, 42);
        reactor.shutdown();
    }

    #[test]
    fn run_with_timeout_expires_without_cancelling() {
        let reactor = Reactor::spawn().unwrap();
        let err = reactor
            .handle()
            .run_with_timeout("stall", Duration::from_millis(50), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .unwrap_err();
        assert!(matches!(err, NetError::Timeout { .. }));
        reactor.shutdown();
    }

    #[test]
    fn submissions_from_one_thread_run_in_order() {
        let reactor = Reactor::spawn().unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));

        for i in 0..100 {
            let seen = seen.clone();
            let count = count.clone();
            reactor.handle().submit(move || {
                seen.lock().push(i);
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) < 100 {
            assert!(std::time::Instant::now() < deadline, "jobs never drained");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
        reactor.shutdown();
    }

    #[test]
    fn shutdown_joins_the_loop_thread() {
        let reactor = Reactor::spawn().unwrap();
        let handle = reactor.handle().clone();
        reactor.shutdown();
        // The loop is gone; a bounded wait can only time out.
        let err = handle
            .run_with_timeout("after-shutdown", Duration::from_millis(50), async { 1 })
            .unwrap_err();
        assert!(matches!(err, NetError::Timeout { .. }));
    }
}
