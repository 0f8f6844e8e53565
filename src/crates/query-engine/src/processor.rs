//! Processor of the `pattern_matching_query` bus command.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atomspace::{AtomStore, AttentionBroker, Handle, QueryAnswer};
use commons::StopToken;
use futures::future::BoxFuture;
use service_bus::{
    commands, proxy_commands, BusError, CommandProcessor, CommandProxy, WorkerSet,
};

use crate::compiler::{compile_query, CompileFlags};
use crate::element::{QueryRuntime, Sink};
use crate::error::QueryEngineError;
use crate::proxy::{params, PatternMatchingQueryProxy};
use crate::Result;

/// How long the drain loop waits before re-checking the abort flag when
/// no sink update arrives.
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bus element responsible for `pattern_matching_query` commands.
pub struct PatternMatchingQueryProcessor {
    commands: HashSet<String>,
    runtime: Arc<QueryRuntime>,
    workers: Arc<WorkerSet>,
}

impl PatternMatchingQueryProcessor {
    pub fn new(store: Arc<dyn AtomStore>, attention: Arc<dyn AttentionBroker>) -> Arc<Self> {
        Arc::new(Self {
            commands: [commands::PATTERN_MATCHING_QUERY.to_string()]
                .into_iter()
                .collect(),
            runtime: QueryRuntime::new(store, attention),
            workers: Arc::new(WorkerSet::new()),
        })
    }
}

#[async_trait]
impl CommandProcessor for PatternMatchingQueryProcessor {
    fn commands(&self) -> &HashSet<String> {
        &self.commands
    }

    fn factory_empty_proxy(&self) -> Arc<dyn CommandProxy> {
        PatternMatchingQueryProxy::empty()
    }

    async fn run_command(&self, proxy: Arc<dyn CommandProxy>) -> service_bus::Result<()> {
        let proxy = proxy
            .as_any()
            .downcast::<PatternMatchingQueryProxy>()
            .map_err(|_| {
                BusError::Lifecycle("pattern matching processor got a foreign proxy".to_string())
            })?;
        let key = WorkerSet::worker_key(proxy.core());
        let runtime = self.runtime.clone();
        let workers = self.workers.clone();
        let worker_key = key.clone();
        self.workers.spawn(key, move |stop| async move {
            if let Err(error) = process_one_query(&runtime, &proxy, &stop).await {
                proxy.core().raise_error_on_peer(error.to_string(), 0);
            }
            tracing::debug!(command = %proxy.core().command(), "command finished");
            workers.remove(&worker_key);
        })
    }
}

async fn process_one_query(
    runtime: &Arc<QueryRuntime>,
    proxy: &Arc<PatternMatchingQueryProxy>,
    stop: &StopToken,
) -> Result<()> {
    let mut tokens = proxy.core().take_args();
    proxy.untokenize(&mut tokens)?;

    let (flags, count_flag, unique_value, populate_metta, attention_update, use_metta, max_answers) = {
        let parameters = proxy.core().parameters();
        let get = |key: &str| parameters.get_boolean(key).unwrap_or(false);
        (
            CompileFlags {
                unique_assignment: get(params::UNIQUE_ASSIGNMENT_FLAG),
                positive_importance: get(params::POSITIVE_IMPORTANCE_FLAG),
            },
            get(params::COUNT_FLAG),
            get(params::UNIQUE_VALUE_FLAG),
            get(params::POPULATE_METTA_MAPPING),
            get(params::ATTENTION_UPDATE_FLAG),
            get(params::USE_METTA_AS_QUERY_TOKENS),
            parameters.get_integer(params::MAX_ANSWERS).unwrap_or(0),
        )
    };
    if use_metta {
        return Err(QueryEngineError::MalformedQuery(
            "MeTTa surface queries are not handled by this node".to_string(),
        ));
    }

    let context = proxy.stream().context();
    tracing::info!(
        serial = proxy.core().serial(),
        context = %context,
        count_flag,
        "setting up query graph"
    );
    let root = compile_query(&proxy.stream().query_tokens(), &context, flags)?;
    let sink = Sink::attach(
        root,
        format!("Sink_{}_{}", proxy.core().my_id(), proxy.core().serial()),
        runtime,
    )?;

    let mut joint_answer: HashSet<Handle> = HashSet::new();
    let mut seen_values: HashSet<Vec<Handle>> = HashSet::new();
    let mut answer_count: u32 = 0;

    loop {
        if proxy.core().is_aborting() || stop.stopped() {
            break;
        }
        match sink.pop() {
            Some(mut answer) => {
                if unique_value {
                    let mut value_key: Vec<Handle> =
                        answer.assignment.iter().map(|(_, h)| h.clone()).collect();
                    value_key.sort();
                    if !seen_values.insert(value_key) {
                        continue;
                    }
                }
                answer_count += 1;
                if attention_update {
                    update_attention_single(runtime, &context, &answer, &mut joint_answer)
                        .await?;
                }
                if !count_flag {
                    if populate_metta && answer.representations.is_empty() {
                        populate_representations(runtime.store.as_ref(), &mut answer).await?;
                    }
                    proxy.stream().push(&answer, proxy.core())?;
                }
                if max_answers > 0 && i64::from(answer_count) >= max_answers {
                    tracing::info!(max_answers, "answer budget reached");
                    proxy.stream().flush_bundle(proxy.core())?;
                    proxy.core().abort_local();
                    break;
                }
            }
            None => {
                if sink.finished() {
                    break;
                }
                tokio::select! {
                    _ = stop.wait() => {}
                    _ = sink.wait_update() => {}
                    _ = tokio::time::sleep(ABORT_POLL_INTERVAL) => {}
                }
            }
        }
    }

    proxy.stream().flush_bundle(proxy.core())?;
    if count_flag && !proxy.core().is_aborting() {
        proxy
            .core()
            .send_to_peer(proxy_commands::COUNT, vec![answer_count.to_string()])?;
    }
    proxy.stream().query_processing_finished(proxy.core())?;
    if attention_update && !joint_answer.is_empty() {
        let handle_count: HashMap<Handle, u32> = joint_answer
            .iter()
            .map(|handle| (handle.clone(), 1))
            .collect();
        runtime
            .attention
            .stimulate(&handle_count, &context)
            .await?;
    }
    tracing::info!(total = answer_count, "query answers processed");
    sink.graceful_shutdown().await;
    Ok(())
}

/// Correlates the handles of one answer (assignment values, answer
/// handles and their transitive targets) and folds them into the joint
/// set stimulated at completion.
async fn update_attention_single(
    runtime: &Arc<QueryRuntime>,
    context: &str,
    answer: &QueryAnswer,
    joint_answer: &mut HashSet<Handle>,
) -> Result<()> {
    let mut single: HashSet<Handle> = answer
        .assignment
        .iter()
        .map(|(_, handle)| handle.clone())
        .collect();
    let mut stack: Vec<Handle> = answer.handles.clone();
    while let Some(handle) = stack.pop() {
        if !single.insert(handle.clone()) {
            continue;
        }
        if let Some(targets) = runtime.store.query_for_targets(&handle).await? {
            stack.extend(targets);
        }
    }
    joint_answer.extend(single.iter().cloned());
    if single.len() > 1 {
        runtime.attention.correlate(&single, context).await?;
    } else {
        tracing::debug!(count = single.len(), "too few handles to correlate");
    }
    Ok(())
}

/// Fills the per-handle rendered representation of an answer.
async fn populate_representations(
    store: &dyn AtomStore,
    answer: &mut QueryAnswer,
) -> Result<()> {
    for handle in answer.handles.clone() {
        let rendered = render_expression(store, &handle).await?;
        answer.representations.insert(handle, rendered);
    }
    Ok(())
}

fn render_expression<'a>(
    store: &'a dyn AtomStore,
    handle: &'a Handle,
) -> BoxFuture<'a, Result<String>> {
    Box::pin(async move {
        match store.get_atom(handle).await? {
            Some(atomspace::Atom::Node(node)) => Ok(node.name),
            Some(atomspace::Atom::Link(link)) => {
                let mut parts = Vec::with_capacity(link.targets.len());
                for target in &link.targets {
                    parts.push(render_expression(store, target).await?);
                }
                Ok(format!("({})", parts.join(" ")))
            }
            None => Ok(handle.to_string()),
        }
    })
}
