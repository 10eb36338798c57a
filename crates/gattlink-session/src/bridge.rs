//! Synchronous, thread-safe access to the single radio worker.
//!
//! The worker is one named OS thread driving a current-thread tokio runtime.
//! All host-stack interaction happens there; other threads hand it futures
//! through [`EventLoopBridge::submit`] and block until a result or a timeout.

use std::future::Future;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SessionError};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Worker {
    handle: Handle,
    thread_id: ThreadId,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// Owner of the background worker thread.
pub struct EventLoopBridge {
    name: String,
    worker: Mutex<Option<Worker>>,
}

impl EventLoopBridge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker: Mutex::new(None),
        }
    }

    /// The process-wide bridge.
    pub fn global() -> Arc<EventLoopBridge> {
        static GLOBAL: OnceLock<Arc<EventLoopBridge>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(EventLoopBridge::new("gattlink-worker"))))
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.worker().is_some()
    }

    /// Spawn the worker and wait up to `ready_timeout` for its runtime.
    /// Does nothing when already running.
    pub fn start(&self, ready_timeout: Duration) -> Result<()> {
        let mut slot = self.worker();
        if slot.is_some() {
            debug!(bridge = %self.name, "event loop already running");
            return Ok(());
        }

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let name = self.name.clone();
        let thread = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!(bridge = %name, %err, "failed to build worker runtime");
                        return;
                    }
                };
                if ready_tx
                    .send((runtime.handle().clone(), std::thread::current().id()))
                    .is_err()
                {
                    return;
                }
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!(bridge = %name, "event loop exited");
            })?;

        match ready_rx.recv_timeout(ready_timeout) {
            Ok((handle, thread_id)) => {
                *slot = Some(Worker {
                    handle,
                    thread_id,
                    shutdown: Some(shutdown_tx),
                    thread: Some(thread),
                });
                info!(bridge = %self.name, "event loop started");
                Ok(())
            }
            Err(_) => {
                // Dropping the sender lets a late worker exit on its own.
                drop(shutdown_tx);
                error!(bridge = %self.name, ?ready_timeout, "event loop did not become ready");
                Err(SessionError::BridgeNotReady(ready_timeout))
            }
        }
    }

    /// Signal the worker to exit and join it within `join_timeout`.
    ///
    /// Returns `false` (after logging) when the worker did not exit in time.
    /// Operations still pending on the worker are dropped.
    pub fn stop(&self, join_timeout: Duration) -> bool {
        let Some(mut worker) = self.worker().take() else {
            return true;
        };
        if let Some(shutdown) = worker.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(thread) = worker.thread.take() else {
            return true;
        };
        if std::thread::current().id() == worker.thread_id {
            warn!(bridge = %self.name, "stop called from the worker; not joining");
            return false;
        }

        let deadline = Instant::now() + join_timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                warn!(bridge = %self.name, ?join_timeout, "event loop did not stop in time");
                return false;
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }
        if thread.join().is_err() {
            warn!(bridge = %self.name, "event loop thread panicked");
        }
        info!(bridge = %self.name, "event loop stopped");
        true
    }

    /// Run `operation` on the worker and block until it completes or
    /// `timeout` elapses.
    ///
    /// A timeout does not cancel the operation; it may still finish later.
    pub fn submit<F, T>(&self, operation: F, timeout: Duration) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = {
            let slot = self.worker();
            let worker = slot.as_ref().ok_or(SessionError::BridgeNotRunning)?;
            if std::thread::current().id() == worker.thread_id {
                return Err(SessionError::ReentrantSubmit);
            }
            worker.handle.clone()
        };

        let (tx, rx) = mpsc::sync_channel(1);
        handle.spawn(async move {
            let _ = tx.send(operation.await);
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(bridge = %self.name, ?timeout, "submitted operation timed out");
                Err(SessionError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::OperationAborted),
        }
    }
}

impl std::fmt::Debug for EventLoopBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopBridge")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for EventLoopBridge {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker().take() {
            if let Some(shutdown) = worker.shutdown.take() {
                let _ = shutdown.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const READY: Duration = Duration::from_secs(5);

    fn started(name: &str) -> Arc<EventLoopBridge> {
        let bridge = Arc::new(EventLoopBridge::new(name));
        bridge.start(READY).unwrap();
        bridge
    }

    #[test]
    fn submit_returns_operation_result() {
        let bridge = started("bridge-result");
        let value = bridge
            .submit(async { Ok(21 * 2) }, Duration::from_secs(1))
            .unwrap();
        assert_eq!(value, 42);

        let err = bridge
            .submit(
                async { Err::<(), _>(SessionError::NoActivePeer) },
                Duration::from_secs(1),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::NoActivePeer));
        assert!(bridge.stop(READY));
    }

    #[test]
    fn start_is_idempotent() {
        let bridge = started("bridge-idem");
        bridge.start(READY).unwrap();
        assert!(bridge.is_running());
        assert!(bridge.stop(READY));
        assert!(!bridge.is_running());
        assert!(bridge.stop(READY));
    }

    #[test]
    fn timeout_leaves_bridge_usable() {
        let bridge = started("bridge-timeout");
        let err = bridge
            .submit(
                async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(())
                },
                Duration::from_millis(20),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));

        let value = bridge
            .submit(async { Ok("still alive") }, Duration::from_secs(1))
            .unwrap();
        assert_eq!(value, "still alive");
        assert!(bridge.stop(READY));
    }

    #[test]
    fn submit_without_worker_fails() {
        let bridge = EventLoopBridge::new("bridge-idle");
        let err = bridge
            .submit(async { Ok(()) }, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, SessionError::BridgeNotRunning));
    }

    #[test]
    fn submit_after_stop_fails_until_restarted() {
        let bridge = started("bridge-restart");
        assert!(bridge.stop(READY));
        let err = bridge
            .submit(async { Ok(()) }, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, SessionError::BridgeNotRunning));

        bridge.start(READY).unwrap();
        let value = bridge
            .submit(async { Ok(7) }, Duration::from_secs(1))
            .unwrap();
        assert_eq!(value, 7);
        assert!(bridge.stop(READY));
    }

    #[test]
    fn unready_worker_leaves_bridge_stopped() {
        let bridge = EventLoopBridge::new("bridge-unready");
        match bridge.start(Duration::ZERO) {
            Err(SessionError::BridgeNotReady(bound)) => {
                assert_eq!(bound, Duration::ZERO);
                assert!(!bridge.is_running());
                let err = bridge
                    .submit(async { Ok(()) }, Duration::from_millis(10))
                    .unwrap_err();
                assert!(matches!(err, SessionError::BridgeNotRunning));
            }
            // The worker won the race; nothing to check beyond a clean stop.
            Ok(()) => assert!(bridge.stop(READY)),
            Err(other) => panic!("unexpected start error: {other}"),
        }

        bridge.start(READY).unwrap();
        assert!(bridge.is_running());
        assert!(bridge.stop(READY));
    }

    #[test]
    fn reentrant_submit_is_rejected() {
        let bridge = started("bridge-reentrant");
        let inner = Arc::clone(&bridge);
        let err = bridge
            .submit(
                async move { inner.submit(async { Ok(()) }, Duration::from_millis(10)) },
                Duration::from_secs(1),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::ReentrantSubmit));
        assert!(bridge.stop(READY));
    }

    #[test]
    fn panicking_operation_is_reported_as_aborted() {
        let bridge = started("bridge-panic");
        let err = bridge
            .submit(
                async {
                    if true {
                        panic!("operation exploded");
                    }
                    Ok(())
                },
                Duration::from_secs(1),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::OperationAborted));
        assert!(bridge
            .submit(async { Ok(()) }, Duration::from_secs(1))
            .is_ok());
        assert!(bridge.stop(READY));
    }

    #[test]
    fn concurrent_submitters_all_complete() {
        let bridge = started("bridge-concurrent");
        let threads: Vec<_> = (0..8u64)
            .map(|i| {
                let bridge = Arc::clone(&bridge);
                std::thread::spawn(move || {
                    bridge.submit(
                        async move {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok(i * 10)
                        },
                        Duration::from_secs(2),
                    )
                })
            })
            .collect();
        let mut results: Vec<u64> = threads
            .into_iter()
            .map(|t| t.join().expect("submitter should not panic").unwrap())
            .collect();
        results.sort_unstable();
        assert_eq!(results, (0..8u64).map(|i| i * 10).collect::<Vec<_>>());
        assert!(bridge.stop(READY));
    }

    #[test]
    fn stop_drops_pending_operations() {
        let bridge = started("bridge-stop");
        let submitter = {
            let bridge = Arc::clone(&bridge);
            std::thread::spawn(move || {
                bridge.submit(
                    async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(())
                    },
                    Duration::from_secs(5),
                )
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(bridge.stop(READY));
        let result = submitter.join().expect("submitter should not panic");
        assert!(matches!(result, Err(SessionError::OperationAborted)));
    }
}
