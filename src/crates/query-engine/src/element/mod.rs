//! Query elements: the nodes of the dataflow graph a query compiles
//! into.
//!
//! Sources produce [`QueryAnswer`] values from the atom store, operators
//! combine them, and the [`Sink`] hands the final stream to the
//! processor. Elements are connected by [`SharedQueue`] edges; each
//! element runs its own stoppable worker and declares flow completion by
//! finishing its output queues.

mod and;
mod filter;
mod or;
mod sink;
mod source;

pub use and::AndOperator;
pub use filter::UniqueAssignmentFilter;
pub use or::OrOperator;
pub use sink::Sink;
pub use source::LinkTemplateSource;

use std::sync::Arc;

use async_trait::async_trait;
use atomspace::{AtomStore, AttentionBroker, QueryAnswer};
use commons::SharedQueue;
use parking_lot::Mutex;

use crate::Result;

/// Execution environment handed to every element at start: the store
/// that resolves patterns and the broker that prices importance.
pub struct QueryRuntime {
    pub store: Arc<dyn AtomStore>,
    pub attention: Arc<dyn AttentionBroker>,
}

impl QueryRuntime {
    pub fn new(store: Arc<dyn AtomStore>, attention: Arc<dyn AttentionBroker>) -> Arc<Self> {
        Arc::new(Self { store, attention })
    }
}

/// A node in the dataflow graph.
#[async_trait]
pub trait QueryElement: Send + Sync {
    /// Stable id, also used to name the element's worker task.
    fn id(&self) -> &str;

    /// Registers a downstream subscriber of this element's output.
    /// Must be called before [`QueryElement::start`].
    fn subscribe(&self, queue: Arc<SharedQueue<QueryAnswer>>);

    /// Spawns this element's worker and recursively starts its
    /// precedents.
    fn start(self: Arc<Self>, runtime: &Arc<QueryRuntime>) -> Result<()>;

    /// Stops this element's worker, waits for it, then cascades
    /// depth-first through the precedents.
    async fn graceful_shutdown(&self);
}

/// Fan-out of one logical output stream to every subscriber.
///
/// The answer moves into the first subscriber; the remaining ones get a
/// clone (including a shallow clone of the assignment).
#[derive(Default)]
pub struct OutputFanout {
    subscribers: Mutex<Vec<Arc<SharedQueue<QueryAnswer>>>>,
}

impl OutputFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, queue: Arc<SharedQueue<QueryAnswer>>) {
        self.subscribers.lock().push(queue);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn push(&self, answer: QueryAnswer) {
        let subscribers = self.subscribers.lock();
        for queue in subscribers.iter().skip(1) {
            queue.push(answer.clone());
        }
        if let Some(first) = subscribers.first() {
            first.push(answer);
        }
    }

    /// Declares flow completion on every subscriber queue.
    pub fn finish(&self) {
        for queue in self.subscribers.lock().iter() {
            queue.mark_finished();
        }
    }
}
