//! Cooperative-cancellation task handles.
//!
//! Every long-running actor in the workspace (transport receive loops,
//! per-command workers, operator loops) runs on a [`StoppableTask`]. The
//! stop request is cooperative: the work future is handed a [`StopToken`]
//! and is expected to poll or await it at every blocking point.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cloneable view of a task's stop flag, handed to the work future.
#[derive(Clone, Debug)]
pub struct StopToken {
    token: CancellationToken,
}

impl StopToken {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// True once a stop has been requested.
    pub fn stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when a stop is requested. Already-stopped tokens resolve
    /// immediately.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    fn trigger(&self) {
        self.token.cancel();
    }
}

/// Handle to a background unit of execution with a cooperative stop flag.
///
/// Dropping the handle requests a stop but does not block: structured
/// teardown paths call [`StoppableTask::join`] explicitly before letting
/// the handle go.
pub struct StoppableTask {
    id: String,
    stop: StopToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StoppableTask {
    /// Creates a handle with no work attached yet.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stop: StopToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawns `work` on the tokio runtime and attaches it.
    pub fn spawn<F, Fut>(id: impl Into<String>, work: F) -> Arc<Self>
    where
        F: FnOnce(StopToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(Self::new(id));
        let fut = work(task.stop_token());
        task.attach(tokio::spawn(fut));
        task
    }

    /// Attaches an already-spawned join handle. Attaching twice is a
    /// programmer error.
    pub fn attach(&self, handle: JoinHandle<()>) {
        let mut slot = self.handle.lock();
        assert!(slot.is_none(), "task {} already has work attached", self.id);
        *slot = Some(handle);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token the work future should poll at every blocking point.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Requests a cooperative stop. Idempotent.
    pub fn request_stop(&self) {
        if !self.stop.stopped() {
            tracing::debug!(task = %self.id, "requesting stop");
            self.stop.trigger();
        }
    }

    /// True once a stop has been requested.
    pub fn stopped(&self) -> bool {
        self.stop.stopped()
    }

    /// Waits for the attached work to finish. Returns immediately when no
    /// work is attached or a previous join already consumed it.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                if !error.is_cancelled() {
                    tracing::error!(task = %self.id, %error, "task panicked");
                }
            }
            tracing::debug!(task = %self.id, "task joined");
        }
    }

    /// Requests a stop and waits for the work to wind down.
    pub async fn stop_and_join(&self) {
        self.request_stop();
        self.join().await;
    }
}

impl Drop for StoppableTask {
    fn drop(&mut self) {
        self.request_stop();
    }
}

impl std::fmt::Debug for StoppableTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoppableTask")
            .field("id", &self.id)
            .field("stopped", &self.stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn stop_flag_is_observed_by_worker() {
        let finished = Arc::new(AtomicBool::new(false));
        let finished_clone = finished.clone();
        let task = StoppableTask::spawn("worker", move |stop| async move {
            loop {
                if stop.stopped() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            finished_clone.store(true, Ordering::SeqCst);
        });

        assert!(!task.stopped());
        task.stop_and_join().await;
        assert!(task.stopped());
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn request_stop_is_idempotent() {
        let task = StoppableTask::spawn("idempotent", |stop| async move {
            stop.wait().await;
        });
        task.request_stop();
        task.request_stop();
        task.request_stop();
        task.join().await;
        assert!(task.stopped());
    }

    #[tokio::test]
    async fn join_without_work_returns() {
        let task = StoppableTask::new("empty");
        task.join().await;
    }

    #[tokio::test]
    async fn stop_token_wait_resolves() {
        let task = StoppableTask::new("token");
        let token = task.stop_token();
        task.request_stop();
        token.wait().await;
        assert!(token.stopped());
    }
}
