//! The inference orchestrator: turns inference requests into chained
//! evolution commands on the bus and relays the winning answers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use atomspace::Handle;
use commons::StopToken;
use service_bus::{
    commands, BusError, CommandProcessor, CommandProxy, ProxyCore, ServiceBus, WorkerSet,
};

use crate::error::AgentError;
use crate::evolution::QueryEvolutionProxy;
use crate::Result;
use query_engine::QueryStream;

/// Parameter-bag keys of the inference command.
pub mod params {
    pub const INFERENCE_REQUEST_TIMEOUT: &str = "inference_request_timeout";
    pub const UPDATE_ATTENTION_BROKER_FLAG: &str = "update_attention_broker_flag";
    pub const REPEAT_REQUEST_NUMBER: &str = "repeat_request_number";
    pub const MAX_QUERY_ANSWERS_TO_PROCESS: &str = "max_query_answers_to_process";
    pub const RUN_FULL_EVALUATION_QUERY: &str = "run_full_evaluation_query";
}

/// One inference request: a request kind plus the handles it reasons
/// over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    pub kind: String,
    pub first: Handle,
    pub second: Handle,
    pub max_proof_length: u32,
}

impl InferenceRequest {
    pub fn to_tokens(&self) -> Vec<String> {
        vec![
            self.kind.clone(),
            self.first.to_string(),
            self.second.to_string(),
            self.max_proof_length.to_string(),
        ]
    }

    pub fn from_tokens(tokens: &[String]) -> Result<Self> {
        if tokens.len() != 4 {
            return Err(AgentError::MalformedRequest(format!(
                "inference request needs kind, two handles and a length, got {} tokens",
                tokens.len()
            )));
        }
        let parse_handle = |raw: &String| {
            raw.parse::<Handle>()
                .map_err(|e| AgentError::MalformedRequest(e.to_string()))
        };
        Ok(Self {
            kind: tokens[0].clone(),
            first: parse_handle(&tokens[1])?,
            second: parse_handle(&tokens[2])?,
            max_proof_length: tokens[3]
                .parse()
                .map_err(|_| AgentError::MalformedRequest("bad proof length".to_string()))?,
        })
    }
}

/// Caller/processor proxy of the `inference` bus command.
pub struct InferenceProxy {
    core: ProxyCore,
    stream: QueryStream,
}

impl InferenceProxy {
    pub fn new(request: &InferenceRequest, context: impl Into<String>) -> Arc<Self> {
        let proxy = Self {
            core: ProxyCore::new(commands::INFERENCE),
            stream: QueryStream::new(request.to_tokens(), context),
        };
        proxy.set_default_parameters();
        Arc::new(proxy)
    }

    pub fn empty() -> Arc<Self> {
        let proxy = Self {
            core: ProxyCore::new(commands::INFERENCE),
            stream: QueryStream::empty(),
        };
        proxy.set_default_parameters();
        Arc::new(proxy)
    }

    fn set_default_parameters(&self) {
        let mut parameters = self.core.parameters();
        parameters.set(params::INFERENCE_REQUEST_TIMEOUT, 300i64);
        parameters.set(params::UPDATE_ATTENTION_BROKER_FLAG, false);
        parameters.set(params::REPEAT_REQUEST_NUMBER, 1i64);
        parameters.set(params::MAX_QUERY_ANSWERS_TO_PROCESS, 100i64);
        parameters.set(params::RUN_FULL_EVALUATION_QUERY, false);
    }

    pub fn stream(&self) -> &QueryStream {
        &self.stream
    }

    pub fn pop(&self) -> Option<atomspace::QueryAnswer> {
        self.stream.pop(&self.core)
    }

    pub fn finished(&self) -> bool {
        self.stream.finished(&self.core)
    }

    pub fn abort(&self) {
        self.core.abort();
    }

    pub fn set_timeout_secs(&self, secs: i64) {
        self.core
            .parameters()
            .set(params::INFERENCE_REQUEST_TIMEOUT, secs);
    }

    pub fn set_repeat_request_number(&self, repeat: i64) {
        self.core
            .parameters()
            .set(params::REPEAT_REQUEST_NUMBER, repeat);
    }

    pub fn set_run_full_evaluation_query(&self, flag: bool) {
        self.core
            .parameters()
            .set(params::RUN_FULL_EVALUATION_QUERY, flag);
    }
}

impl CommandProxy for InferenceProxy {
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
        self.stream.handle_stream_command(&self.core, command, &args)
    }

    fn tokenize(&self, out: &mut Vec<String>) {
        self.core.tokenize_base(out);
        self.stream.tokenize(out);
    }

    fn untokenize(&self, stream: &mut Vec<String>) -> service_bus::Result<()> {
        self.core.untokenize_base(stream)?;
        self.stream.untokenize(stream)
    }
}

/// Bus element responsible for `inference` commands. Issues the
/// evaluation work as `query_evolution` commands on the same bus.
pub struct InferenceProcessor {
    commands: HashSet<String>,
    bus: Arc<ServiceBus>,
    workers: Arc<WorkerSet>,
}

impl InferenceProcessor {
    pub fn new(bus: Arc<ServiceBus>) -> Arc<Self> {
        Arc::new(Self {
            commands: [commands::INFERENCE.to_string()].into_iter().collect(),
            bus,
            workers: Arc::new(WorkerSet::new()),
        })
    }
}

#[async_trait]
impl CommandProcessor for InferenceProcessor {
    fn commands(&self) -> &HashSet<String> {
        &self.commands
    }

    fn factory_empty_proxy(&self) -> Arc<dyn CommandProxy> {
        InferenceProxy::empty()
    }

    async fn run_command(&self, proxy: Arc<dyn CommandProxy>) -> service_bus::Result<()> {
        let proxy = proxy
            .as_any()
            .downcast::<InferenceProxy>()
            .map_err(|_| BusError::Lifecycle("inference got a foreign proxy".to_string()))?;
        let key = WorkerSet::worker_key(proxy.core());
        let bus = self.bus.clone();
        let workers = self.workers.clone();
        let worker_key = key.clone();
        self.workers.spawn(key, move |stop| async move {
            if let Err(error) = run_inference(&bus, &proxy, &stop).await {
                proxy.core().raise_error_on_peer(error.to_string(), 0);
            }
            workers.remove(&worker_key);
        })
    }
}

/// Evaluation query over the request handles: predicates touching the
/// first handle, optionally joined with predicates reaching the second.
fn evaluation_query(request: &InferenceRequest, full: bool) -> Vec<String> {
    let basic = format!(
        "LINK_TEMPLATE Expression 3 VARIABLE p ATOM {} VARIABLE t",
        request.first
    );
    let raw = if full {
        format!(
            "AND 2 {} LINK_TEMPLATE Expression 3 VARIABLE p VARIABLE s ATOM {}",
            basic, request.second
        )
    } else {
        basic
    };
    raw.split_whitespace().map(String::from).collect()
}

async fn run_inference(
    bus: &Arc<ServiceBus>,
    proxy: &Arc<InferenceProxy>,
    stop: &StopToken,
) -> Result<()> {
    let mut request_tokens = proxy.core().take_args();
    proxy.untokenize(&mut request_tokens)?;
    let request = InferenceRequest::from_tokens(&proxy.stream().query_tokens())?;
    let (timeout_secs, repeat, max_answers, full_query) = {
        let parameters = proxy.core().parameters();
        (
            parameters
                .get_integer(params::INFERENCE_REQUEST_TIMEOUT)
                .unwrap_or(300)
                .max(1) as u64,
            parameters
                .get_integer(params::REPEAT_REQUEST_NUMBER)
                .unwrap_or(1)
                .max(1),
            parameters
                .get_integer(params::MAX_QUERY_ANSWERS_TO_PROCESS)
                .unwrap_or(100)
                .max(1),
            parameters
                .get_boolean(params::RUN_FULL_EVALUATION_QUERY)
                .unwrap_or(false),
        )
    };
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    let context = proxy.stream().context();
    tracing::info!(
        kind = %request.kind,
        context = %context,
        repeat,
        "processing inference request"
    );

    let mut processed: i64 = 0;
    'requests: for _ in 0..repeat {
        if proxy.core().is_aborting() || stop.stopped() {
            break;
        }
        let evolution =
            QueryEvolutionProxy::new(evaluation_query(&request, full_query), context.clone());
        evolution.set_max_generations(request.max_proof_length.max(1) as i64);
        bus.issue_bus_command(evolution.clone() as Arc<dyn CommandProxy>)
            .await?;
        loop {
            if proxy.core().is_aborting() || stop.stopped() || Instant::now() >= deadline {
                // The deadline is the inference agent's own timeout layer.
                evolution.abort();
                break 'requests;
            }
            match evolution.pop() {
                Some(answer) => {
                    proxy.stream().push(&answer, proxy.core())?;
                    processed += 1;
                    if processed >= max_answers {
                        evolution.abort();
                        break 'requests;
                    }
                }
                None => {
                    if evolution.finished() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
    proxy.stream().query_processing_finished(proxy.core())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InferenceRequest {
        InferenceRequest {
            kind: "proof_of_implication".to_string(),
            first: Handle::of_node("Symbol", "rain"),
            second: Handle::of_node("Symbol", "wet"),
            max_proof_length: 3,
        }
    }

    #[test]
    fn request_tokens_round_trip() {
        let decoded = InferenceRequest::from_tokens(&request().to_tokens()).unwrap();
        assert_eq!(decoded, request());
        assert!(InferenceRequest::from_tokens(&["too".into(), "short".into()]).is_err());
    }

    #[test]
    fn evaluation_query_shapes() {
        let basic = evaluation_query(&request(), false);
        assert_eq!(basic[0], "LINK_TEMPLATE");
        assert!(basic.contains(&request().first.to_string()));

        let full = evaluation_query(&request(), true);
        assert_eq!(full[0], "AND");
        assert!(full.contains(&request().second.to_string()));
    }

    #[test]
    fn proxy_tokens_round_trip() {
        let proxy = InferenceProxy::new(&request(), "ctx");
        proxy.set_timeout_secs(42);
        let mut stream = Vec::new();
        proxy.tokenize(&mut stream);
        let decoded = InferenceProxy::empty();
        decoded.untokenize(&mut stream).unwrap();
        assert!(stream.is_empty());
        let decoded_request =
            InferenceRequest::from_tokens(&decoded.stream().query_tokens()).unwrap();
        assert_eq!(decoded_request, request());
        assert_eq!(
            decoded
                .core()
                .parameters()
                .get_integer(params::INFERENCE_REQUEST_TIMEOUT),
            Some(42)
        );
    }
}
