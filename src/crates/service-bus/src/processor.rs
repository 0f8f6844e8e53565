//! Bus command processors.
//!
//! A processor takes ownership of a subset of bus commands; for every
//! incoming invocation the bus materialises the processor-side proxy and
//! calls [`CommandProcessor::run_command`], which must not block the
//! receive path: it spawns a worker on a [`WorkerSet`] and returns.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use commons::{StopToken, StoppableTask};
use dashmap::DashMap;

use crate::error::BusError;
use crate::proxy::CommandProxy;
use crate::Result;

/// A bus element responsible for processing one or more bus commands.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    /// Commands this processor takes ownership of.
    fn commands(&self) -> &HashSet<String>;

    /// Empty proxy of the matching concrete type, filled by the bus from
    /// the inbound invocation.
    fn factory_empty_proxy(&self) -> Arc<dyn CommandProxy>;

    /// Called when one of the owned commands arrives. Must spawn the
    /// actual work (the worker calls `untokenize` on the proxy args
    /// before any use) and return promptly.
    async fn run_command(&self, proxy: Arc<dyn CommandProxy>) -> Result<()>;
}

/// Keyed set of command worker tasks.
///
/// Keys follow the `thread<node-id_serial>` convention; reusing a live
/// key is a hard error since it means two workers for one invocation.
#[derive(Default)]
pub struct WorkerSet {
    workers: DashMap<String, Arc<StoppableTask>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conventional worker key for a proxy invocation.
    pub fn worker_key(core: &crate::proxy::ProxyCore) -> String {
        format!("thread<{}_{}>", core.my_id(), core.serial())
    }

    /// Spawns a worker under `key`.
    pub fn spawn<F, Fut>(&self, key: impl Into<String>, work: F) -> Result<()>
    where
        F: FnOnce(StopToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        if self.workers.contains_key(&key) {
            return Err(BusError::Lifecycle(format!(
                "worker key already in use: {}",
                key
            )));
        }
        tracing::debug!(worker = %key, "spawning command worker");
        let task = StoppableTask::spawn(key.clone(), work);
        self.workers.insert(key, task);
        Ok(())
    }

    /// Forgets a finished worker.
    pub fn remove(&self, key: &str) {
        self.workers.remove(key);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Requests a stop on every worker and waits for them.
    pub async fn stop_all(&self) {
        let tasks: Vec<Arc<StoppableTask>> = self
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for task in &tasks {
            task.request_stop();
        }
        for task in tasks {
            task.join().await;
        }
        self.workers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_worker_key_is_rejected() {
        let workers = WorkerSet::new();
        workers
            .spawn("thread<n_1>", |stop| async move { stop.wait().await })
            .unwrap();
        let result = workers.spawn("thread<n_1>", |_| async {});
        assert!(matches!(result, Err(BusError::Lifecycle(_))));
        workers.stop_all().await;
        assert!(workers.is_empty());
    }

    #[tokio::test]
    async fn removed_keys_can_be_reused() {
        let workers = WorkerSet::new();
        workers.spawn("thread<n_2>", |_| async {}).unwrap();
        workers.remove("thread<n_2>");
        workers.spawn("thread<n_2>", |_| async {}).unwrap();
        workers.stop_all().await;
    }
}
