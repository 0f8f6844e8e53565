//! The link creator: materialises new links from the answers of a
//! pattern query.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use atomspace::{Assignment, AtomStore, AttentionBroker, Handle, Node};
use commons::{tokens, StopToken};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use query_engine::element::{QueryRuntime, Sink};
use query_engine::{compile_query, CompileFlags};
use service_bus::{
    commands, proxy_commands, BusError, CommandProcessor, CommandProxy, ProxyCore, WorkerSet,
};

use crate::error::AgentError;
use crate::Result;

/// Piggyback command: one link could not be created.
pub const LINK_CREATION_FAILED: &str = "link_creation_failed";

/// Parameter-bag keys of the link creation command.
pub mod params {
    pub const MAX_RESULTS: &str = "max_results";
    pub const REPEAT: &str = "repeat";
    pub const TIMEOUT_SECS: &str = "timeout_secs";
}

/// Caller/processor proxy of the `link_creation` bus command.
///
/// Carries the source query, the creation template and the request
/// knobs; streams no answers, only failure notifications and the final
/// `FINISHED`.
pub struct LinkCreationRequestProxy {
    core: ProxyCore,
    context: Mutex<String>,
    query_tokens: Mutex<Vec<String>>,
    template_tokens: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

impl LinkCreationRequestProxy {
    pub fn new(
        query_tokens: Vec<String>,
        template_tokens: Vec<String>,
        context: impl Into<String>,
    ) -> Arc<Self> {
        let proxy = Self {
            core: ProxyCore::new(commands::LINK_CREATION),
            context: Mutex::new(context.into()),
            query_tokens: Mutex::new(query_tokens),
            template_tokens: Mutex::new(template_tokens),
            failures: Mutex::new(Vec::new()),
        };
        proxy.set_default_parameters();
        Arc::new(proxy)
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new(), Vec::new(), "")
    }

    fn set_default_parameters(&self) {
        let mut parameters = self.core.parameters();
        parameters.set(params::MAX_RESULTS, 10i64);
        parameters.set(params::REPEAT, 1i64);
        parameters.set(params::TIMEOUT_SECS, 0i64);
    }

    pub fn context(&self) -> String {
        self.context.lock().clone()
    }

    pub fn query_tokens(&self) -> Vec<String> {
        self.query_tokens.lock().clone()
    }

    pub fn template_tokens(&self) -> Vec<String> {
        self.template_tokens.lock().clone()
    }

    /// Failure diagnostics reported by the processor so far.
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().clone()
    }

    pub fn finished(&self) -> bool {
        self.core.finished()
    }

    pub fn abort(&self) {
        self.core.abort();
    }

    pub fn set_max_results(&self, max_results: i64) {
        self.core.parameters().set(params::MAX_RESULTS, max_results);
    }

    pub fn set_repeat(&self, repeat: i64) {
        self.core.parameters().set(params::REPEAT, repeat);
    }

    pub fn set_timeout_secs(&self, timeout_secs: i64) {
        self.core.parameters().set(params::TIMEOUT_SECS, timeout_secs);
    }
}

impl CommandProxy for LinkCreationRequestProxy {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn from_remote_peer(&self, command: &str, args: Vec<String>) -> service_bus::Result<bool> {
        if self.core.handle_base_command(command, &args)? {
            return Ok(true);
        }
        if command == LINK_CREATION_FAILED {
            self.failures.lock().push(args.join(" "));
            return Ok(true);
        }
        Ok(false)
    }

    fn tokenize(&self, out: &mut Vec<String>) {
        self.core.tokenize_base(out);
        out.push(self.context());
        let query = self.query_tokens.lock();
        out.push(query.len().to_string());
        out.extend(query.iter().cloned());
        let template = self.template_tokens.lock();
        out.push(template.len().to_string());
        out.extend(template.iter().cloned());
    }

    fn untokenize(&self, stream: &mut Vec<String>) -> service_bus::Result<()> {
        self.core.untokenize_base(stream)?;
        *self.context.lock() = tokens::take(stream)?;
        let query_count: usize = tokens::take_parse(stream)?;
        if stream.len() < query_count {
            return Err(BusError::MalformedMessage(
                "link creation query shorter than advertised".to_string(),
            ));
        }
        *self.query_tokens.lock() = stream.drain(..query_count).collect();
        let template_count: usize = tokens::take_parse(stream)?;
        if stream.len() < template_count {
            return Err(BusError::MalformedMessage(
                "link creation template shorter than advertised".to_string(),
            ));
        }
        *self.template_tokens.lock() = stream.drain(..template_count).collect();
        Ok(())
    }
}

/// Bus element responsible for `link_creation` commands.
pub struct LinkCreationProcessor {
    commands: HashSet<String>,
    runtime: Arc<QueryRuntime>,
    workers: Arc<WorkerSet>,
}

impl LinkCreationProcessor {
    pub fn new(store: Arc<dyn AtomStore>, attention: Arc<dyn AttentionBroker>) -> Arc<Self> {
        Arc::new(Self {
            commands: [commands::LINK_CREATION.to_string()].into_iter().collect(),
            runtime: QueryRuntime::new(store, attention),
            workers: Arc::new(WorkerSet::new()),
        })
    }
}

#[async_trait]
impl CommandProcessor for LinkCreationProcessor {
    fn commands(&self) -> &HashSet<String> {
        &self.commands
    }

    fn factory_empty_proxy(&self) -> Arc<dyn CommandProxy> {
        LinkCreationRequestProxy::empty()
    }

    async fn run_command(&self, proxy: Arc<dyn CommandProxy>) -> service_bus::Result<()> {
        let proxy = proxy
            .as_any()
            .downcast::<LinkCreationRequestProxy>()
            .map_err(|_| BusError::Lifecycle("link creation got a foreign proxy".to_string()))?;
        let key = WorkerSet::worker_key(proxy.core());
        let runtime = self.runtime.clone();
        let workers = self.workers.clone();
        let worker_key = key.clone();
        self.workers.spawn(key, move |stop| async move {
            if let Err(error) = create_links(&runtime, &proxy, &stop).await {
                proxy.core().raise_error_on_peer(error.to_string(), 0);
            }
            workers.remove(&worker_key);
        })
    }
}

async fn create_links(
    runtime: &Arc<QueryRuntime>,
    proxy: &Arc<LinkCreationRequestProxy>,
    stop: &StopToken,
) -> Result<()> {
    let mut request_tokens = proxy.core().take_args();
    proxy.untokenize(&mut request_tokens)?;

    let (max_results, repeat, timeout_secs) = {
        let parameters = proxy.core().parameters();
        (
            parameters.get_integer(params::MAX_RESULTS).unwrap_or(10).max(1),
            parameters.get_integer(params::REPEAT).unwrap_or(1).max(1),
            parameters.get_integer(params::TIMEOUT_SECS).unwrap_or(0),
        )
    };
    let deadline = (timeout_secs > 0)
        .then(|| Instant::now() + Duration::from_secs(timeout_secs as u64));
    let context = proxy.context();
    let template = proxy.template_tokens();
    if template.is_empty() {
        return Err(AgentError::MalformedRequest(
            "empty link creation template".to_string(),
        ));
    }
    tracing::info!(context = %context, max_results, repeat, "processing link creation request");

    'rounds: for round in 0..repeat {
        if proxy.core().is_aborting() || stop.stopped() {
            break;
        }
        let root = compile_query(&proxy.query_tokens(), &context, CompileFlags::default())?;
        let sink = Sink::attach(
            root,
            format!(
                "Sink_{}_{}_{}",
                proxy.core().my_id(),
                proxy.core().serial(),
                round
            ),
            runtime,
        )?;
        let mut created = 0i64;
        while created < max_results {
            if proxy.core().is_aborting() || stop.stopped() {
                sink.graceful_shutdown().await;
                break 'rounds;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    tracing::info!("link creation deadline reached");
                    sink.graceful_shutdown().await;
                    break 'rounds;
                }
            }
            let answer = match sink.pop_wait(stop).await {
                Some(answer) => answer,
                None => break,
            };
            match instantiate_template(
                runtime.store.as_ref(),
                &template,
                &answer.assignment,
            )
            .await
            {
                Ok(handle) => {
                    created += 1;
                    tracing::debug!(link = %handle, "link created");
                }
                Err(error) => {
                    proxy
                        .core()
                        .send_to_peer(LINK_CREATION_FAILED, vec![error.to_string()])?;
                }
            }
        }
        sink.graceful_shutdown().await;
    }
    proxy
        .core()
        .send_to_peer(proxy_commands::FINISHED, Vec::new())?;
    Ok(())
}

/// Creates the link described by the template tokens, substituting
/// variables from the assignment. Returns the new link's handle.
pub async fn instantiate_template(
    store: &dyn AtomStore,
    template: &[String],
    assignment: &Assignment,
) -> Result<Handle> {
    let mut cursor = 0usize;
    let handle = instantiate_term(store, template, &mut cursor, assignment).await?;
    if cursor != template.len() {
        return Err(AgentError::MalformedRequest(
            "trailing tokens in link creation template".to_string(),
        ));
    }
    Ok(handle)
}

fn next_template_token<'a>(template: &'a [String], cursor: &mut usize) -> Result<&'a str> {
    let token = template.get(*cursor).ok_or_else(|| {
        AgentError::MalformedRequest("truncated link creation template".to_string())
    })?;
    *cursor += 1;
    Ok(token)
}

fn instantiate_term<'a>(
    store: &'a dyn AtomStore,
    template: &'a [String],
    cursor: &'a mut usize,
    assignment: &'a Assignment,
) -> BoxFuture<'a, Result<Handle>> {
    Box::pin(async move {
        let tag = next_template_token(template, cursor)?.to_string();
        match tag.as_str() {
            "NODE" => {
                let node_type = next_template_token(template, cursor)?.to_string();
                let name = next_template_token(template, cursor)?.to_string();
                Ok(store.add_node(Node::new(node_type, name)).await?)
            }
            "VARIABLE" => {
                let name = next_template_token(template, cursor)?;
                assignment.get(name).cloned().ok_or_else(|| {
                    AgentError::MalformedRequest(format!("unbound template variable: {}", name))
                })
            }
            "ATOM" => {
                let raw = next_template_token(template, cursor)?;
                raw.parse::<Handle>()
                    .map_err(|e| AgentError::MalformedRequest(e.to_string()))
            }
            "LINK" => {
                let link_type = next_template_token(template, cursor)?.to_string();
                let arity: usize = next_template_token(template, cursor)?
                    .parse()
                    .map_err(|_| AgentError::MalformedRequest("bad template arity".to_string()))?;
                let mut targets = Vec::with_capacity(arity);
                for _ in 0..arity {
                    targets.push(instantiate_term(store, template, cursor, assignment).await?);
                }
                let link = atomspace::Link::new(link_type, targets).toplevel();
                Ok(store.add_link(link).await?)
            }
            other => Err(AgentError::MalformedRequest(format!(
                "unexpected template token: {}",
                other
            ))),
        }
    })
}
