//! The And operator: cartesian join under assignment consistency.

use std::sync::Arc;

use async_trait::async_trait;
use atomspace::QueryAnswer;
use commons::{SharedQueue, StopToken, StoppableTask};
use futures::future::select_all;
use parking_lot::Mutex;

use super::{OutputFanout, QueryElement, QueryRuntime};
use crate::error::QueryEngineError;
use crate::{Result, MAX_OPERATOR_CLAUSES};

/// N-ary And over clause streams.
///
/// Keeps every answer seen per input; each new arrival cross-joins
/// against the cached answers of the other inputs and every pair whose
/// assignments merge without conflict is emitted. A pair is produced
/// exactly once, when the later of its two sides arrives, so emission is
/// deterministic with respect to arrival order on each input. Flow
/// finishes once every input is drained and every candidate processed.
pub struct AndOperator {
    id: String,
    precedents: Vec<Arc<dyn QueryElement>>,
    inputs: Vec<Arc<SharedQueue<QueryAnswer>>>,
    output: OutputFanout,
    task: Mutex<Option<Arc<StoppableTask>>>,
}

impl AndOperator {
    pub fn new(clauses: Vec<Arc<dyn QueryElement>>) -> Result<Arc<Self>> {
        if clauses.is_empty() || clauses.len() > MAX_OPERATOR_CLAUSES {
            return Err(QueryEngineError::MalformedQuery(format!(
                "And arity {} outside 1..={}",
                clauses.len(),
                MAX_OPERATOR_CLAUSES
            )));
        }
        let id = format!(
            "And({})",
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

    async fn join_loop(self: Arc<Self>, stop: StopToken) {
        let n = self.inputs.len();
        let mut caches: Vec<Vec<QueryAnswer>> = vec![Vec::new(); n];
        loop {
            if stop.stopped() {
                return;
            }
            let mut progress = false;
            for i in 0..n {
                while let Some(answer) = self.inputs[i].pop() {
                    progress = true;
                    self.emit_joins(&caches, i, &answer);
                    caches[i].push(answer);
                }
            }
            if self.inputs.iter().all(|input| input.is_drained()) {
                self.output.finish();
                return;
            }
            if !progress {
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
    }

    /// Cross-joins `answer` (arrived on input `i`) against the cached
    /// answers of every other input, in clause order.
    fn emit_joins(&self, caches: &[Vec<QueryAnswer>], i: usize, answer: &QueryAnswer) {
        let mut partials = vec![QueryAnswer::new()];
        for (j, cache) in caches.iter().enumerate() {
            let pool: &[QueryAnswer] = if j == i {
                std::slice::from_ref(answer)
            } else {
                cache.as_slice()
            };
            partials = partials
                .iter()
                .flat_map(|partial| pool.iter().filter_map(|other| partial.join(other)))
                .collect();
            if partials.is_empty() {
                return;
            }
        }
        for joined in partials {
            self.output.push(joined);
        }
    }
}

#[async_trait]
impl QueryElement for AndOperator {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe(&self, queue: Arc<SharedQueue<QueryAnswer>>) {
        self.output.subscribe(queue);
    }

    fn start(self: Arc<Self>, runtime: &Arc<QueryRuntime>) -> Result<()> {
        let operator = self.clone();
        let task = StoppableTask::spawn(self.id.clone(), move |stop| operator.join_loop(stop));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::tests_support::{drain, runtime, VectorSource};
    use atomspace::{Assignment, Handle};

    fn answer(var_bindings: &[(&str, &str)], importance: f64) -> QueryAnswer {
        let mut assignment = Assignment::new();
        for (name, value) in var_bindings {
            assignment.assign(*name, Handle::of_node("Symbol", value));
        }
        let mut answer = QueryAnswer::with_handle(
            Handle::of_node("Symbol", &format!("{:?}", var_bindings)),
            importance,
        );
        answer.assignment = assignment;
        answer
    }

    #[tokio::test]
    async fn joins_only_consistent_assignments() {
        let left = VectorSource::new(
            "left",
            vec![
                answer(&[("v1", "human")], 0.0),
                answer(&[("v1", "snake")], 0.0),
            ],
        );
        let right = VectorSource::new(
            "right",
            vec![
                answer(&[("v1", "human"), ("v2", "plant")], 0.0),
                answer(&[("v1", "ent"), ("v2", "plant")], 0.0),
            ],
        );
        let and = AndOperator::new(vec![left, right]).unwrap();
        let answers = drain(and.clone(), &runtime()).await;
        assert_eq!(answers.len(), 1);
        assert_eq!(
            answers[0].assignment.get("v1"),
            Some(&Handle::of_node("Symbol", "human"))
        );
        assert_eq!(answers[0].handles.len(), 2);
        and.graceful_shutdown().await;
    }

    #[tokio::test]
    async fn every_consistent_pair_is_emitted_exactly_once() {
        let left = VectorSource::new(
            "left",
            (0..4).map(|i| answer(&[("a", &format!("x{}", i))], 0.0)).collect(),
        );
        let right = VectorSource::new(
            "right",
            (0..3).map(|i| answer(&[("b", &format!("y{}", i))], 0.0)).collect(),
        );
        let and = AndOperator::new(vec![left, right]).unwrap();
        let answers = drain(and.clone(), &runtime()).await;
        // Disjoint variables: the full 4 x 3 product is consistent.
        assert_eq!(answers.len(), 12);
        let mut seen = std::collections::HashSet::new();
        for joined in &answers {
            assert!(seen.insert(joined.assignment.clone()), "duplicate join");
        }
        and.graceful_shutdown().await;
    }

    #[tokio::test]
    async fn empty_input_produces_no_answers() {
        let left = VectorSource::new("left", vec![answer(&[("v1", "human")], 0.0)]);
        let right = VectorSource::new("right", Vec::new());
        let and = AndOperator::new(vec![left, right]).unwrap();
        let answers = drain(and.clone(), &runtime()).await;
        assert!(answers.is_empty());
        and.graceful_shutdown().await;
    }

    #[test]
    fn arity_limit_is_enforced() {
        let clauses: Vec<Arc<dyn QueryElement>> = (0..11)
            .map(|i| VectorSource::new(&format!("s{}", i), Vec::new()))
            .collect();
        assert!(AndOperator::new(clauses).is_err());
    }
}
