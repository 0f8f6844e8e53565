//! Duplicate-assignment suppression.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use atomspace::{Assignment, QueryAnswer};
use commons::{SharedQueue, StopToken, StoppableTask};
use parking_lot::Mutex;

use super::{OutputFanout, QueryElement, QueryRuntime};
use crate::Result;

/// Unary operator dropping answers whose assignment was already seen on
/// the stream; survivors pass in arrival order.
pub struct UniqueAssignmentFilter {
    id: String,
    precedent: Arc<dyn QueryElement>,
    input: Arc<SharedQueue<QueryAnswer>>,
    output: OutputFanout,
    task: Mutex<Option<Arc<StoppableTask>>>,
}

impl UniqueAssignmentFilter {
    pub fn new(input_element: Arc<dyn QueryElement>) -> Arc<Self> {
        let id = format!("UniqueAssignmentFilter({})", input_element.id());
        tracing::debug!(element = %id, "building operator");
        let input = Arc::new(SharedQueue::new());
        input_element.subscribe(input.clone());
        Arc::new(Self {
            id,
            precedent: input_element,
            input,
            output: OutputFanout::new(),
            task: Mutex::new(None),
        })
    }

    async fn filter_loop(self: Arc<Self>, stop: StopToken) {
        let mut already_used: HashSet<Assignment> = HashSet::new();
        while let Some(answer) = self.input.pop_wait(&stop).await {
            if already_used.insert(answer.assignment.clone()) {
                self.output.push(answer);
            }
            // Duplicates are dropped on the floor.
        }
        self.output.finish();
    }
}

#[async_trait]
impl QueryElement for UniqueAssignmentFilter {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe(&self, queue: Arc<SharedQueue<QueryAnswer>>) {
        self.output.subscribe(queue);
    }

    fn start(self: Arc<Self>, runtime: &Arc<QueryRuntime>) -> Result<()> {
        let filter = self.clone();
        let task = StoppableTask::spawn(self.id.clone(), move |stop| filter.filter_loop(stop));
        *self.task.lock() = Some(task);
        self.precedent.clone().start(runtime)
    }

    async fn graceful_shutdown(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop_and_join().await;
        }
        self.precedent.graceful_shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::tests_support::{drain, runtime, VectorSource};
    use atomspace::Handle;

    fn bound(name: &str, value: &str) -> QueryAnswer {
        let mut answer = QueryAnswer::with_handle(Handle::of_node("Symbol", value), 0.0);
        answer
            .assignment
            .assign(name, Handle::of_node("Symbol", value));
        answer
    }

    #[tokio::test]
    async fn duplicates_are_suppressed_in_arrival_order() {
        let source = VectorSource::new(
            "source",
            vec![
                bound("v", "human"),
                bound("v", "monkey"),
                bound("v", "human"),
                bound("v", "chimp"),
                bound("v", "monkey"),
            ],
        );
        let filter = UniqueAssignmentFilter::new(source);
        let answers = drain(filter.clone(), &runtime()).await;
        let names: Vec<&Handle> = answers.iter().map(|a| &a.handles[0]).collect();
        assert_eq!(
            names,
            vec![
                &Handle::of_node("Symbol", "human"),
                &Handle::of_node("Symbol", "monkey"),
                &Handle::of_node("Symbol", "chimp"),
            ]
        );
        filter.graceful_shutdown().await;
    }

    #[tokio::test]
    async fn distinct_assignments_all_pass() {
        let source = VectorSource::new(
            "source",
            vec![bound("v", "a"), bound("v", "b"), bound("w", "a")],
        );
        let filter = UniqueAssignmentFilter::new(source);
        let answers = drain(filter.clone(), &runtime()).await;
        assert_eq!(answers.len(), 3);
        filter.graceful_shutdown().await;
    }
}
