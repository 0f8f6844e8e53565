//! Link-template sources: the terminals that feed the dataflow graph.

use std::sync::Arc;

use async_trait::async_trait;
use atomspace::{Assignment, AtomStore, Handle, Link, LinkSchema, PatternTarget, QueryAnswer};
use commons::{SharedQueue, StopToken, StoppableTask};
use parking_lot::Mutex;

use super::{OutputFanout, QueryElement, QueryRuntime};
use crate::Result;

/// Source element matching a [`LinkSchema`] against the store.
///
/// For every candidate link the worker unifies the pattern, prices the
/// match through the attention broker (when a context is set) and emits
/// one [`QueryAnswer`]. The answer owns its handles and assignment and
/// passes downstream by move.
pub struct LinkTemplateSource {
    id: String,
    schema: LinkSchema,
    /// Attention context the importance lookup runs under; empty means
    /// no lookup and zero importance.
    context: String,
    /// Drop matches whose importance is not strictly positive.
    positive_importance_only: bool,
    output: OutputFanout,
    task: Mutex<Option<Arc<StoppableTask>>>,
}

impl LinkTemplateSource {
    pub fn new(schema: LinkSchema, context: impl Into<String>) -> Arc<Self> {
        Self::build(schema, context.into(), false)
    }

    pub fn with_positive_importance(schema: LinkSchema, context: impl Into<String>) -> Arc<Self> {
        Self::build(schema, context.into(), true)
    }

    fn build(schema: LinkSchema, context: String, positive_importance_only: bool) -> Arc<Self> {
        let id = schema.to_string();
        Arc::new(Self {
            id,
            schema,
            context,
            positive_importance_only,
            output: OutputFanout::new(),
            task: Mutex::new(None),
        })
    }

    async fn produce(self: Arc<Self>, runtime: Arc<QueryRuntime>, stop: StopToken) {
        if let Err(error) = self.produce_inner(&runtime, &stop).await {
            // Errors never cross a dataflow edge: log, finish, let the
            // sink complete.
            tracing::error!(element = %self.id, %error, "source failed");
        }
        self.output.finish();
    }

    async fn produce_inner(
        &self,
        runtime: &Arc<QueryRuntime>,
        stop: &StopToken,
    ) -> Result<()> {
        let candidates = runtime.store.query_for_pattern(&self.schema).await?;
        let importances = if self.context.is_empty() {
            vec![0.0; candidates.len()]
        } else {
            runtime
                .attention
                .get_importance(&candidates, &self.context)
                .await?
        };
        for (handle, importance) in candidates.into_iter().zip(importances) {
            if stop.stopped() {
                break;
            }
            if self.positive_importance_only && importance <= 0.0 {
                continue;
            }
            let link = match runtime.store.get_atom(&handle).await? {
                Some(atomspace::Atom::Link(link)) => link,
                _ => continue,
            };
            let assignment =
                match unify(runtime.store.as_ref(), &self.schema, &link).await? {
                    Some(assignment) => assignment,
                    None => continue,
                };
            let mut answer = QueryAnswer::with_handle(handle, importance);
            answer.assignment = assignment;
            if let Some(strength) = link.properties.get_real("strength") {
                answer.strength = strength;
            }
            self.output.push(answer);
        }
        Ok(())
    }
}

#[async_trait]
impl QueryElement for LinkTemplateSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe(&self, queue: Arc<SharedQueue<QueryAnswer>>) {
        self.output.subscribe(queue);
    }

    fn start(self: Arc<Self>, runtime: &Arc<QueryRuntime>) -> Result<()> {
        let source = self.clone();
        let runtime = runtime.clone();
        let task = StoppableTask::spawn(self.id.clone(), move |stop| {
            source.produce(runtime, stop)
        });
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn graceful_shutdown(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop_and_join().await;
        }
    }
}

/// Binds the schema's variables against a concrete link. Returns `None`
/// when a fixed position mismatches or a variable would rebind.
pub async fn unify(
    store: &dyn AtomStore,
    schema: &LinkSchema,
    link: &Link,
) -> Result<Option<Assignment>> {
    let mut assignment = Assignment::new();
    if unify_into(store, schema, link, &mut assignment).await? {
        Ok(Some(assignment))
    } else {
        Ok(None)
    }
}

fn unify_into<'a>(
    store: &'a dyn AtomStore,
    schema: &'a LinkSchema,
    link: &'a Link,
    assignment: &'a mut Assignment,
) -> futures::future::BoxFuture<'a, Result<bool>> {
    Box::pin(async move {
        if schema.link_type != link.link_type || schema.arity() != link.arity() {
            return Ok(false);
        }
        for (pattern, target) in schema.targets.iter().zip(link.targets.iter()) {
            match pattern {
                PatternTarget::Variable(name) => {
                    if !assignment.assign(name.clone(), target.clone()) {
                        return Ok(false);
                    }
                }
                PatternTarget::SubSchema(sub) => {
                    let sub_link = match store.get_atom(target).await? {
                        Some(atomspace::Atom::Link(sub_link)) => sub_link,
                        _ => return Ok(false),
                    };
                    if !unify_into(store, sub, &sub_link, assignment).await? {
                        return Ok(false);
                    }
                }
                fixed => {
                    if fixed.fixed_handle().as_ref() != Some(target) {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    })
}

/// Convenience for building schema targets from handles in tests and
/// agents.
pub fn target_of(handle: &Handle) -> PatternTarget {
    PatternTarget::Handle(handle.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomspace::{InMemoryAtomStore, Node, NullAttentionBroker};
    use commons::StoppableTask;

    async fn animal_store() -> (Arc<InMemoryAtomStore>, Handle, Handle) {
        let store = Arc::new(InMemoryAtomStore::new());
        let similarity = store
            .add_node(Node::new("Symbol", "Similarity"))
            .await
            .unwrap();
        let human = store.add_node(Node::new("Symbol", "human")).await.unwrap();
        for name in ["monkey", "chimp", "ent"] {
            let other = store.add_node(Node::new("Symbol", name)).await.unwrap();
            store
                .add_link(Link::new(
                    "Expression",
                    vec![similarity.clone(), human.clone(), other],
                ))
                .await
                .unwrap();
        }
        (store, similarity, human)
    }

    #[tokio::test]
    async fn source_emits_one_answer_per_match() {
        let (store, similarity, human) = animal_store().await;
        let runtime = QueryRuntime::new(store, Arc::new(NullAttentionBroker));

        let schema = LinkSchema::new(
            "Expression",
            vec![
                target_of(&similarity),
                target_of(&human),
                PatternTarget::Variable("v".to_string()),
            ],
        );
        let source = LinkTemplateSource::new(schema, "");
        let sink_queue = Arc::new(SharedQueue::new());
        source.subscribe(sink_queue.clone());
        source.clone().start(&runtime).unwrap();

        let consumer = StoppableTask::new("consumer");
        let stop = consumer.stop_token();
        let mut seen = Vec::new();
        while let Some(answer) = sink_queue.pop_wait(&stop).await {
            assert_eq!(answer.handles.len(), 1);
            assert!(answer.assignment.get("v").is_some());
            seen.push(answer);
        }
        assert_eq!(seen.len(), 3);
        source.graceful_shutdown().await;
    }

    #[tokio::test]
    async fn unify_rejects_conflicting_rebinding() {
        let store = InMemoryAtomStore::new();
        let a = store.add_node(Node::new("Symbol", "a")).await.unwrap();
        let b = store.add_node(Node::new("Symbol", "b")).await.unwrap();
        let link = Link::new("Pair", vec![a.clone(), b.clone()]);

        let same_var = LinkSchema::new(
            "Pair",
            vec![
                PatternTarget::Variable("x".to_string()),
                PatternTarget::Variable("x".to_string()),
            ],
        );
        assert!(unify(&store, &same_var, &link).await.unwrap().is_none());

        let twin = Link::new("Pair", vec![a.clone(), a.clone()]);
        let bound = unify(&store, &same_var, &twin).await.unwrap().unwrap();
        assert_eq!(bound.get("x"), Some(&a));
    }
}
