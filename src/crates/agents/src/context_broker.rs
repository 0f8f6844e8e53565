//! The context broker: materialises attention contexts from a defining
//! query and keeps them warm through the attention broker.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atomspace::{AtomStore, AttentionBroker, Handle, QueryAnswer};
use commons::{tokens, StopToken};
use parking_lot::Mutex;
use query_engine::element::{QueryRuntime, Sink};
use query_engine::{compile_query, CompileFlags, QueryStream};
use service_bus::{
    commands, proxy_commands, BusError, CommandProcessor, CommandProxy, ProxyCore, WorkerSet,
};

use crate::error::AgentError;
use crate::Result;

/// Prefix of the per-context cache file.
pub const CACHE_FILE_NAME_PREFIX: &str = "_CONTEXT_CACHE_";

pub const DEFAULT_RENT_RATE: f64 = 0.25;
pub const DEFAULT_SPREADING_RATE_LOWERBOUND: f64 = 0.10;
pub const DEFAULT_SPREADING_RATE_UPPERBOUND: f64 = 0.90;

/// Parameter-bag keys of the context command.
pub mod params {
    pub const USE_CACHE: &str = "use_cache";
    pub const ENFORCE_CACHE_RECREATION: &str = "enforce_cache_recreation";
    pub const INITIAL_RENT_RATE: &str = "initial_rent_rate";
    pub const INITIAL_SPREADING_RATE_LOWERBOUND: &str = "initial_spreading_rate_lowerbound";
    pub const INITIAL_SPREADING_RATE_UPPERBOUND: &str = "initial_spreading_rate_upperbound";
}

/// Reference to one element of a query answer: a positional handle or a
/// variable binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerElement {
    Handle(usize),
    Variable(String),
}

impl AnswerElement {
    pub fn resolve(&self, answer: &QueryAnswer) -> Option<Handle> {
        match self {
            AnswerElement::Handle(index) => answer.handles.get(*index).cloned(),
            AnswerElement::Variable(name) => answer.assignment.get(name).cloned(),
        }
    }

    pub fn to_token(&self) -> String {
        match self {
            AnswerElement::Handle(index) => format!("_{}", index),
            AnswerElement::Variable(name) => format!("${}", name),
        }
    }

    pub fn from_token(token: &str) -> Result<Self> {
        if let Some(name) = token.strip_prefix('$') {
            return Ok(AnswerElement::Variable(name.to_string()));
        }
        if let Some(raw) = token.strip_prefix('_') {
            let index = raw.parse().map_err(|_| {
                AgentError::MalformedRequest(format!("bad answer element index: {}", token))
            })?;
            return Ok(AnswerElement::Handle(index));
        }
        Err(AgentError::MalformedRequest(format!(
            "bad answer element: {}",
            token
        )))
    }
}

/// Caller/processor proxy of the `context` bus command.
///
/// Long-lived: after `CONTEXT_CREATED` the processor side keeps serving
/// the re-entrant `ATTENTION_BROKER_SET_PARAMETERS` sub-command until
/// the caller aborts.
pub struct ContextBrokerProxy {
    core: ProxyCore,
    stream: QueryStream,
    name: Mutex<String>,
    determiner_schema: Mutex<Vec<(AnswerElement, AnswerElement)>>,
    stimulus_schema: Mutex<Vec<AnswerElement>>,
    context_created: Mutex<bool>,
    ab_parameters_finished: Mutex<bool>,
    /// Set-parameter request pending on the processor side.
    pending_parameters: Mutex<Option<(f64, f64, f64)>>,
}

impl ContextBrokerProxy {
    /// Caller-side constructor for a query-based context.
    pub fn new(
        name: impl Into<String>,
        query_tokens: Vec<String>,
        determiner_schema: Vec<(AnswerElement, AnswerElement)>,
        stimulus_schema: Vec<AnswerElement>,
    ) -> Arc<Self> {
        let name = name.into();
        let proxy = Self {
            core: ProxyCore::new(commands::CONTEXT),
            stream: QueryStream::new(query_tokens, name.clone()),
            name: Mutex::new(name),
            determiner_schema: Mutex::new(determiner_schema),
            stimulus_schema: Mutex::new(stimulus_schema),
            context_created: Mutex::new(false),
            ab_parameters_finished: Mutex::new(false),
            pending_parameters: Mutex::new(None),
        };
        proxy.set_default_parameters();
        Arc::new(proxy)
    }

    pub fn empty() -> Arc<Self> {
        Self::new("", Vec::new(), Vec::new(), Vec::new())
    }

    fn set_default_parameters(&self) {
        let mut parameters = self.core.parameters();
        parameters.set(params::USE_CACHE, true);
        parameters.set(params::ENFORCE_CACHE_RECREATION, false);
        parameters.set(params::INITIAL_RENT_RATE, DEFAULT_RENT_RATE);
        parameters.set(
            params::INITIAL_SPREADING_RATE_LOWERBOUND,
            DEFAULT_SPREADING_RATE_LOWERBOUND,
        );
        parameters.set(
            params::INITIAL_SPREADING_RATE_UPPERBOUND,
            DEFAULT_SPREADING_RATE_UPPERBOUND,
        );
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Content-addressed key the context is tracked under.
    pub fn key(&self) -> Handle {
        Handle::of_context(&self.name())
    }

    pub fn cache_file_name(&self) -> String {
        format!("{}{}.txt", CACHE_FILE_NAME_PREFIX, self.key())
    }

    pub fn stream(&self) -> &QueryStream {
        &self.stream
    }

    pub fn determiner_schema(&self) -> Vec<(AnswerElement, AnswerElement)> {
        self.determiner_schema.lock().clone()
    }

    pub fn stimulus_schema(&self) -> Vec<AnswerElement> {
        self.stimulus_schema.lock().clone()
    }

    pub fn is_context_created(&self) -> bool {
        *self.context_created.lock()
    }

    pub fn finished(&self) -> bool {
        self.core.finished()
    }

    pub fn abort(&self) {
        self.core.abort();
    }

    pub fn set_use_cache(&self, flag: bool) {
        self.core.parameters().set(params::USE_CACHE, flag);
    }

    pub fn set_enforce_cache_recreation(&self, flag: bool) {
        self.core
            .parameters()
            .set(params::ENFORCE_CACHE_RECREATION, flag);
    }

    /// Asks the processor to reconfigure the attention broker. The reply
    /// flips [`ContextBrokerProxy::attention_broker_set_parameters_finished`].
    pub fn attention_broker_set_parameters(
        &self,
        rent_rate: f64,
        spreading_rate_lowerbound: f64,
        spreading_rate_upperbound: f64,
    ) -> service_bus::Result<()> {
        *self.ab_parameters_finished.lock() = false;
        self.core.send_to_peer(
            proxy_commands::ATTENTION_BROKER_SET_PARAMETERS,
            vec![
                rent_rate.to_string(),
                spreading_rate_lowerbound.to_string(),
                spreading_rate_upperbound.to_string(),
            ],
        )
    }

    pub fn attention_broker_set_parameters_finished(&self) -> bool {
        *self.ab_parameters_finished.lock()
    }

    fn take_pending_parameters(&self) -> Option<(f64, f64, f64)> {
        self.pending_parameters.lock().take()
    }
}

impl CommandProxy for ContextBrokerProxy {
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
        if self.stream.handle_stream_command(&self.core, command, &args)? {
            return Ok(true);
        }
        match command {
            proxy_commands::CONTEXT_CREATED => {
                *self.context_created.lock() = true;
                Ok(true)
            }
            proxy_commands::ATTENTION_BROKER_SET_PARAMETERS => {
                if args.len() != 3 {
                    return Err(BusError::MalformedMessage(
                        "set_parameters expects rent, lower and upper rates".to_string(),
                    ));
                }
                let mut rates = [0.0; 3];
                for (slot, raw) in rates.iter_mut().zip(args.iter()) {
                    *slot = raw.parse().map_err(|_| {
                        BusError::MalformedMessage(format!("bad attention rate: {}", raw))
                    })?;
                }
                *self.pending_parameters.lock() = Some((rates[0], rates[1], rates[2]));
                Ok(true)
            }
            proxy_commands::ATTENTION_BROKER_SET_PARAMETERS_FINISHED => {
                *self.ab_parameters_finished.lock() = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn tokenize(&self, out: &mut Vec<String>) {
        self.core.tokenize_base(out);
        self.stream.tokenize(out);
        out.push(self.name());
        let determiners = self.determiner_schema.lock();
        out.push(determiners.len().to_string());
        for (first, second) in determiners.iter() {
            out.push(first.to_token());
            out.push(second.to_token());
        }
        let stimulus = self.stimulus_schema.lock();
        out.push(stimulus.len().to_string());
        for element in stimulus.iter() {
            out.push(element.to_token());
        }
    }

    fn untokenize(&self, stream: &mut Vec<String>) -> service_bus::Result<()> {
        let malformed = |e: AgentError| BusError::MalformedMessage(e.to_string());
        self.core.untokenize_base(stream)?;
        self.stream.untokenize(stream)?;
        *self.name.lock() = tokens::take(stream)?;
        let determiner_count: usize = tokens::take_parse(stream)?;
        let mut determiners = Vec::with_capacity(determiner_count);
        for _ in 0..determiner_count {
            let first = AnswerElement::from_token(&tokens::take(stream)?).map_err(malformed)?;
            let second = AnswerElement::from_token(&tokens::take(stream)?).map_err(malformed)?;
            determiners.push((first, second));
        }
        *self.determiner_schema.lock() = determiners;
        let stimulus_count: usize = tokens::take_parse(stream)?;
        let mut stimulus = Vec::with_capacity(stimulus_count);
        for _ in 0..stimulus_count {
            stimulus.push(AnswerElement::from_token(&tokens::take(stream)?).map_err(malformed)?);
        }
        *self.stimulus_schema.lock() = stimulus;
        Ok(())
    }
}

/// What a context evaluation produced: handles to stimulate and
/// determiner groups.
#[derive(Debug, Default, Clone, PartialEq)]
struct ContextPayload {
    to_stimulate: HashMap<Handle, u32>,
    determiner_request: Vec<Vec<Handle>>,
}

/// Bus element responsible for `context` commands.
pub struct ContextBrokerProcessor {
    commands: HashSet<String>,
    runtime: Arc<QueryRuntime>,
    cache_dir: PathBuf,
    workers: Arc<WorkerSet>,
}

impl ContextBrokerProcessor {
    pub fn new(store: Arc<dyn AtomStore>, attention: Arc<dyn AttentionBroker>) -> Arc<Self> {
        Self::with_cache_dir(store, attention, ".")
    }

    pub fn with_cache_dir(
        store: Arc<dyn AtomStore>,
        attention: Arc<dyn AttentionBroker>,
        cache_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            commands: [commands::CONTEXT.to_string()].into_iter().collect(),
            runtime: QueryRuntime::new(store, attention),
            cache_dir: cache_dir.into(),
            workers: Arc::new(WorkerSet::new()),
        })
    }
}

#[async_trait]
impl CommandProcessor for ContextBrokerProcessor {
    fn commands(&self) -> &HashSet<String> {
        &self.commands
    }

    fn factory_empty_proxy(&self) -> Arc<dyn CommandProxy> {
        ContextBrokerProxy::empty()
    }

    async fn run_command(&self, proxy: Arc<dyn CommandProxy>) -> service_bus::Result<()> {
        let proxy = proxy
            .as_any()
            .downcast::<ContextBrokerProxy>()
            .map_err(|_| {
                BusError::Lifecycle("context broker got a foreign proxy".to_string())
            })?;
        let key = WorkerSet::worker_key(proxy.core());
        let runtime = self.runtime.clone();
        let cache_dir = self.cache_dir.clone();
        let workers = self.workers.clone();
        let worker_key = key.clone();
        self.workers.spawn(key, move |stop| async move {
            if let Err(error) = serve_context(&runtime, &cache_dir, &proxy, &stop).await {
                proxy.core().raise_error_on_peer(error.to_string(), 0);
            }
            workers.remove(&worker_key);
        })
    }
}

async fn serve_context(
    runtime: &Arc<QueryRuntime>,
    cache_dir: &Path,
    proxy: &Arc<ContextBrokerProxy>,
    stop: &StopToken,
) -> Result<()> {
    let mut request_tokens = proxy.core().take_args();
    proxy.untokenize(&mut request_tokens)?;

    let name = proxy.name();
    let key = proxy.key();
    let (use_cache, enforce_recreation, rent, lo, hi) = {
        let parameters = proxy.core().parameters();
        (
            parameters.get_boolean(params::USE_CACHE).unwrap_or(true),
            parameters
                .get_boolean(params::ENFORCE_CACHE_RECREATION)
                .unwrap_or(false),
            parameters
                .get_real(params::INITIAL_RENT_RATE)
                .unwrap_or(DEFAULT_RENT_RATE),
            parameters
                .get_real(params::INITIAL_SPREADING_RATE_LOWERBOUND)
                .unwrap_or(DEFAULT_SPREADING_RATE_LOWERBOUND),
            parameters
                .get_real(params::INITIAL_SPREADING_RATE_UPPERBOUND)
                .unwrap_or(DEFAULT_SPREADING_RATE_UPPERBOUND),
        )
    };
    tracing::info!(context = %name, key = %key, use_cache, "creating context");

    let cache_path = cache_dir.join(proxy.cache_file_name());
    let payload = if use_cache && !enforce_recreation && cache_path.exists() {
        tracing::info!(file = %cache_path.display(), "reading context from cache");
        read_cache(&cache_path)?
    } else {
        let payload = evaluate_context_query(runtime, proxy, stop).await?;
        if use_cache {
            tracing::info!(file = %cache_path.display(), "caching computed context");
            write_cache(&cache_path, &payload)?;
        }
        payload
    };

    runtime.attention.set_parameters(rent, lo, hi).await?;
    if !payload.determiner_request.is_empty() {
        runtime
            .attention
            .set_determiners(&payload.determiner_request, key.as_str())
            .await?;
    }
    if !payload.to_stimulate.is_empty() {
        runtime
            .attention
            .stimulate(&payload.to_stimulate, key.as_str())
            .await?;
    }
    proxy
        .core()
        .send_to_peer(proxy_commands::CONTEXT_CREATED, vec![key.to_string()])?;

    // Stay alive to serve re-entrant parameter updates until the caller
    // lets go.
    while !proxy.core().is_aborting() && !stop.stopped() {
        if let Some((rent, lo, hi)) = proxy.take_pending_parameters() {
            tracing::info!(context = %name, rent, lo, hi, "updating attention parameters");
            runtime.attention.set_parameters(rent, lo, hi).await?;
            proxy.core().send_to_peer(
                proxy_commands::ATTENTION_BROKER_SET_PARAMETERS_FINISHED,
                Vec::new(),
            )?;
        }
        tokio::select! {
            _ = stop.wait() => {}
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
    proxy
        .core()
        .send_to_peer(proxy_commands::FINISHED, Vec::new())?;
    Ok(())
}

async fn evaluate_context_query(
    runtime: &Arc<QueryRuntime>,
    proxy: &Arc<ContextBrokerProxy>,
    stop: &StopToken,
) -> Result<ContextPayload> {
    let name = proxy.name();
    let root = compile_query(
        &proxy.stream().query_tokens(),
        &name,
        CompileFlags::default(),
    )?;
    let sink = Sink::attach(
        root,
        format!("Sink_{}_{}", proxy.core().my_id(), proxy.core().serial()),
        runtime,
    )?;
    let determiner_schema = proxy.determiner_schema();
    let stimulus_schema = proxy.stimulus_schema();
    let mut payload = ContextPayload::default();
    while let Some(answer) = sink.pop_wait(stop).await {
        if proxy.core().is_aborting() {
            break;
        }
        for element in &stimulus_schema {
            if let Some(handle) = element.resolve(&answer) {
                *payload.to_stimulate.entry(handle).or_insert(0) += 1;
            }
        }
        for (first, second) in &determiner_schema {
            if let (Some(a), Some(b)) = (first.resolve(&answer), second.resolve(&answer)) {
                payload.determiner_request.push(vec![a, b]);
            }
        }
    }
    sink.graceful_shutdown().await;
    Ok(payload)
}

fn write_cache(path: &Path, payload: &ContextPayload) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "{}", payload.to_stimulate.len())?;
    let mut stimulate: Vec<&Handle> = payload.to_stimulate.keys().collect();
    stimulate.sort();
    for handle in stimulate {
        writeln!(file, "{}", handle)?;
    }
    writeln!(file, "{}", payload.determiner_request.len())?;
    for group in &payload.determiner_request {
        writeln!(file, "{}", group.len())?;
        for handle in group {
            writeln!(file, "{}", handle)?;
        }
    }
    Ok(())
}

fn read_cache(path: &Path) -> Result<ContextPayload> {
    let file = std::fs::File::open(path)?;
    let mut lines = BufReader::new(file).lines();
    let mut next_line = move || -> Result<String> {
        lines
            .next()
            .transpose()?
            .ok_or_else(|| AgentError::Cache("unexpected end of cache file".to_string()))
    };
    let parse_count = |raw: &str| -> Result<usize> {
        raw.trim()
            .parse()
            .map_err(|_| AgentError::Cache(format!("bad count line: {}", raw)))
    };
    let parse_handle = |raw: &str| -> Result<Handle> {
        raw.trim()
            .parse()
            .map_err(|_| AgentError::Cache(format!("bad handle line: {}", raw)))
    };

    let mut payload = ContextPayload::default();
    let stimulate_count = parse_count(&next_line()?)?;
    for _ in 0..stimulate_count {
        payload.to_stimulate.insert(parse_handle(&next_line()?)?, 1);
    }
    let group_count = parse_count(&next_line()?)?;
    for _ in 0..group_count {
        let size = parse_count(&next_line()?)?;
        let mut group = Vec::with_capacity(size);
        for _ in 0..size {
            group.push(parse_handle(&next_line()?)?);
        }
        payload.determiner_request.push(group);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str) -> Handle {
        Handle::of_node("Symbol", name)
    }

    #[test]
    fn answer_element_tokens_round_trip() {
        for element in [
            AnswerElement::Handle(0),
            AnswerElement::Handle(12),
            AnswerElement::Variable("v1".to_string()),
        ] {
            let decoded = AnswerElement::from_token(&element.to_token()).unwrap();
            assert_eq!(decoded, element);
        }
        assert!(AnswerElement::from_token("nope").is_err());
        assert!(AnswerElement::from_token("_x").is_err());
    }

    #[test]
    fn answer_element_resolution() {
        let mut answer = QueryAnswer::with_handle(handle("link"), 0.0);
        answer.assignment.assign("v1", handle("human"));
        assert_eq!(
            AnswerElement::Handle(0).resolve(&answer),
            Some(handle("link"))
        );
        assert_eq!(AnswerElement::Handle(3).resolve(&answer), None);
        assert_eq!(
            AnswerElement::Variable("v1".to_string()).resolve(&answer),
            Some(handle("human"))
        );
        assert_eq!(
            AnswerElement::Variable("v9".to_string()).resolve(&answer),
            None
        );
    }

    #[test]
    fn cache_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_CONTEXT_CACHE_test.txt");
        let mut payload = ContextPayload::default();
        payload.to_stimulate.insert(handle("a"), 1);
        payload.to_stimulate.insert(handle("b"), 1);
        payload
            .determiner_request
            .push(vec![handle("link"), handle("a")]);
        payload
            .determiner_request
            .push(vec![handle("link2"), handle("b")]);

        write_cache(&path, &payload).unwrap();
        let decoded = read_cache(&path).unwrap();
        assert_eq!(decoded.to_stimulate, payload.to_stimulate);
        assert_eq!(decoded.determiner_request, payload.determiner_request);
    }

    #[test]
    fn corrupted_cache_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_CONTEXT_CACHE_bad.txt");
        std::fs::write(&path, "not-a-count\n").unwrap();
        assert!(matches!(read_cache(&path), Err(AgentError::Cache(_))));
    }

    #[test]
    fn proxy_tokens_round_trip() {
        let query: Vec<String> = "LINK_TEMPLATE Expression 2 NODE Symbol A VARIABLE v"
            .split_whitespace()
            .map(String::from)
            .collect();
        let proxy = ContextBrokerProxy::new(
            "animals",
            query.clone(),
            vec![(AnswerElement::Handle(0), AnswerElement::Variable("v".to_string()))],
            vec![AnswerElement::Variable("v".to_string())],
        );
        proxy.set_use_cache(false);

        let mut stream = Vec::new();
        proxy.tokenize(&mut stream);
        let decoded = ContextBrokerProxy::empty();
        decoded.untokenize(&mut stream).unwrap();
        assert!(stream.is_empty());
        assert_eq!(decoded.name(), "animals");
        assert_eq!(decoded.key(), Handle::of_context("animals"));
        assert_eq!(decoded.stream().query_tokens(), query);
        assert_eq!(decoded.determiner_schema(), proxy.determiner_schema());
        assert_eq!(decoded.stimulus_schema(), proxy.stimulus_schema());
        assert_eq!(
            decoded.core().parameters().get_boolean(params::USE_CACHE),
            Some(false)
        );
    }
}
