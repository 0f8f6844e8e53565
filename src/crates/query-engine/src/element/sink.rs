//! The terminal consumer of a query element graph.

use std::sync::Arc;

use atomspace::QueryAnswer;
use commons::{SharedQueue, StopToken};

use super::{QueryElement, QueryRuntime};
use crate::Result;

/// Root consumer the processor drains.
///
/// Attaching a sink wires the graph (each operator subscribes its input
/// queues to its clauses' outputs) and starts every worker. The sink
/// itself is passive: it exposes the queue the compiler hands to the
/// proxy's bundler.
pub struct Sink {
    id: String,
    precedent: Arc<dyn QueryElement>,
    input: Arc<SharedQueue<QueryAnswer>>,
}

impl Sink {
    /// Wires `precedent` into this sink and starts the graph.
    pub fn attach(
        precedent: Arc<dyn QueryElement>,
        id: impl Into<String>,
        runtime: &Arc<QueryRuntime>,
    ) -> Result<Arc<Self>> {
        let id = id.into();
        tracing::debug!(sink = %id, root = %precedent.id(), "attaching sink");
        let input = Arc::new(SharedQueue::new());
        precedent.subscribe(input.clone());
        precedent.clone().start(runtime)?;
        Ok(Arc::new(Self {
            id,
            precedent,
            input,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Non-blocking pop of the next answer.
    pub fn pop(&self) -> Option<QueryAnswer> {
        self.input.pop()
    }

    /// Waits for the next answer; `None` once the flow is finished and
    /// drained, or when a stop was requested.
    pub async fn pop_wait(&self, stop: &StopToken) -> Option<QueryAnswer> {
        self.input.pop_wait(stop).await
    }

    /// Resolves when the sink's input may have changed.
    pub async fn wait_update(&self) {
        self.input.wait_update().await;
    }

    /// True once the flow finished and every answer was consumed.
    pub fn finished(&self) -> bool {
        self.input.is_drained()
    }

    /// Tears the graph down depth-first: operators stop their tasks,
    /// drain their queues and release their endpoints in reverse
    /// topological order.
    pub async fn graceful_shutdown(&self) {
        tracing::debug!(sink = %self.id, "graceful shutdown");
        self.precedent.graceful_shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::tests_support::{runtime, VectorSource};
    use atomspace::{Handle, QueryAnswer};
    use commons::StoppableTask;

    #[tokio::test]
    async fn sink_drains_and_reports_finished() {
        let answers = vec![
            QueryAnswer::with_handle(Handle::of_node("Symbol", "a"), 0.0),
            QueryAnswer::with_handle(Handle::of_node("Symbol", "b"), 0.0),
        ];
        let source = VectorSource::new("source", answers);
        let sink = Sink::attach(source, "Sink_test_1", &runtime()).unwrap();

        let consumer = StoppableTask::new("consumer");
        let stop = consumer.stop_token();
        let mut seen = 0;
        while let Some(_answer) = sink.pop_wait(&stop).await {
            seen += 1;
        }
        assert_eq!(seen, 2);
        assert!(sink.finished());
        sink.graceful_shutdown().await;
    }
}
