//! The Or operator: greedy best-importance merge of clause streams.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use atomspace::QueryAnswer;
use commons::{SharedQueue, StopToken, StoppableTask};
use futures::future::select_all;
use parking_lot::Mutex;

use super::{OutputFanout, QueryElement, QueryRuntime};
use crate::error::QueryEngineError;
use crate::{Result, MAX_OPERATOR_CLAUSES};

/// N-ary Or over clause streams.
///
/// Emits whenever every input either has a candidate buffered or is
/// finished: the highest-importance head across non-empty inputs wins,
/// ties broken by input index. This yields the best-available-now
/// property, not a globally sorted output. Flow finishes once all inputs
/// are finished and all buffers drained.
pub struct OrOperator {
    id: String,
    precedents: Vec<Arc<dyn QueryElement>>,
    inputs: Vec<Arc<SharedQueue<QueryAnswer>>>,
    output: OutputFanout,
    task: Mutex<Option<Arc<StoppableTask>>>,
}

impl OrOperator {
    pub fn new(clauses: Vec<Arc<dyn QueryElement>>) -> Result<Arc<Self>> {
        if clauses.is_empty() || clauses.len() > MAX_OPERATOR_CLAUSES {
            return Err(QueryEngineError::MalformedQuery(format!(
                "Or arity {} outside 1..={}",
                clauses.len(),
                MAX_OPERATOR_CLAUSES
            )));
        }
        let id = format!(
            "Or({})",
            clauses
                .iter()
                .map(|clause| clause.id().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        tracing::debug!(element = %id, "building operator");
        let inputs: Vec<Arc<SharedQueue<QueryAnswer>>> = clauses
            .iter()
            .map(|clause| {
                let queue = Arc::new(SharedQueue::new());
                clause.subscribe(queue.clone());
                queue
            })
            .collect();
        Ok(Arc::new(Self {
            id,
            precedents: clauses,
            inputs,
            output: OutputFanout::new(),
            task: Mutex::new(None),
        }))
    }

    async fn merge_loop(self: Arc<Self>, stop: StopToken) {
        let n = self.inputs.len();
        let mut buffers: Vec<VecDeque<QueryAnswer>> = vec![VecDeque::new(); n];
        loop {
            if stop.stopped() {
                return;
            }
            for (input, buffer) in self.inputs.iter().zip(buffers.iter_mut()) {
                while let Some(answer) = input.pop() {
                    debug_assert!(answer.importance >= 0.0);
                    buffer.push_back(answer);
                }
            }
            let ready = buffers
                .iter()
                .zip(self.inputs.iter())
                .all(|(buffer, input)| !buffer.is_empty() || input.is_finished());
            if ready {
                if buffers.iter().all(VecDeque::is_empty) {
                    if self.inputs.iter().all(|input| input.is_drained()) {
                        self.output.finish();
                        return;
                    }
                    continue;
                }
                let selected = Self::select_best(&buffers);
                let answer = buffers[selected]
                    .pop_front()
                    .expect("selected buffer is non-empty");
                self.output.push(answer);
                continue;
            }
            let updates = select_all(
                self.inputs
                    .iter()
                    .map(|input| Box::pin(input.wait_update())),
            );
            tokio::select! {
                _ = stop.wait() => return,
                _ = updates => {}
            }
        }
    }

    /// Index of the highest-importance head; ties go to the lowest
    /// input index.
    fn select_best(buffers: &[VecDeque<QueryAnswer>]) -> usize {
        let mut best_index = 0;
        let mut best_importance = -1.0;
        for (index, buffer) in buffers.iter().enumerate() {
            if let Some(head) = buffer.front() {
                if head.importance > best_importance {
                    best_importance = head.importance;
                    best_index = index;
                }
            }
        }
        best_index
    }
}

#[async_trait]
impl QueryElement for OrOperator {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe(&self, queue: Arc<SharedQueue<QueryAnswer>>) {
        self.output.subscribe(queue);
    }

    fn start(self: Arc<Self>, runtime: &Arc<QueryRuntime>) -> Result<()> {
        let operator = self.clone();
        let task = StoppableTask::spawn(self.id.clone(), move |stop| operator.merge_loop(stop));
        *self.task.lock() = Some(task);
        for precedent in &self.precedents {
            precedent.clone().start(runtime)?;
        }
        Ok(())
    }

    async fn graceful_shutdown(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop_and_join().await;
        }
        for precedent in &self.precedents {
            precedent.graceful_shutdown().await;
        }
    }
}
