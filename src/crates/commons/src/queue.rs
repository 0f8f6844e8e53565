//! Multi-producer FIFO with a sticky "producer finished" marker.
//!
//! This is the queue behind every dataflow edge in the query element
//! graph and behind the answer stream a command proxy exposes to its
//! caller. The finished flag is terminal-state-absorbing: once set it is
//! never cleared, consumers drain the remaining items and then observe
//! `empty && finished`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::task::StopToken;

/// FIFO of `T` plus a sticky finished flag.
///
/// Pushes never block. Interleaving across producers is unspecified;
/// per-producer order is preserved. Wakeups assume a single consumer per
/// queue, which is how the dataflow graph wires them.
pub struct SharedQueue<T> {
    items: Mutex<VecDeque<T>>,
    finished: AtomicBool,
    notify: Notify,
}

impl<T> SharedQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            finished: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Appends an item. Pushing after `mark_finished` is a producer bug
    /// but is tolerated so late in-flight bundles don't corrupt anything.
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    /// Removes and returns the head, or `None` when currently empty.
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Sets the sticky finished flag. Idempotent.
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// `empty && finished`: nothing buffered and nothing more coming.
    pub fn is_drained(&self) -> bool {
        self.is_empty() && self.is_finished()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Resolves when the queue may have changed (push or finish). A
    /// wakeup permit is stored when nobody is waiting, so a change that
    /// races with the caller's state check is never lost.
    pub async fn wait_update(&self) {
        self.notify.notified().await;
    }

    /// Waits until an item is available and pops it. Returns `None` when
    /// the queue is drained or a stop was requested.
    pub async fn pop_wait(&self, stop: &StopToken) -> Option<T> {
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if self.is_finished() || stop.stopped() {
                return None;
            }
            tokio::select! {
                _ = stop.wait() => {}
                _ = self.wait_update() => {}
            }
        }
    }
}

impl<T> Default for SharedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SharedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedQueue")
            .field("len", &self.len())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order_is_preserved() {
        let queue = SharedQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn finished_flag_is_sticky_and_absorbing() {
        let queue = SharedQueue::new();
        queue.push("a");
        queue.mark_finished();
        queue.mark_finished();
        assert!(queue.is_finished());
        assert!(!queue.is_drained());
        assert_eq!(queue.pop(), Some("a"));
        assert!(queue.is_drained());
    }

    use crate::task::StoppableTask;

    #[tokio::test]
    async fn pop_wait_sees_item_pushed_later() {
        let queue = Arc::new(SharedQueue::new());
        let producer_queue = queue.clone();
        let task = StoppableTask::new("consumer");
        let stop = task.stop_token();
        let consumer = tokio::spawn(async move { queue.pop_wait(&stop).await });
        tokio::task::yield_now().await;
        producer_queue.push(42);
        assert_eq!(consumer.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn pop_wait_returns_none_on_finish() {
        let queue = Arc::new(SharedQueue::<u32>::new());
        let producer_queue = queue.clone();
        let task = StoppableTask::new("consumer");
        let stop = task.stop_token();
        let consumer = tokio::spawn(async move { queue.pop_wait(&stop).await });
        tokio::task::yield_now().await;
        producer_queue.mark_finished();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn pop_wait_honors_stop() {
        let queue = Arc::new(SharedQueue::<u32>::new());
        let task = StoppableTask::new("consumer");
        let stop = task.stop_token();
        let waiter_queue = queue.clone();
        let consumer = tokio::spawn(async move { waiter_queue.pop_wait(&stop).await });
        tokio::task::yield_now().await;
        task.request_stop();
        assert_eq!(consumer.await.unwrap(), None);
    }
}
