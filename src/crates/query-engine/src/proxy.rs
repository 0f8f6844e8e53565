//! Query proxies: the streaming-answer protocol and the pattern
//! matching command proxy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use atomspace::QueryAnswer;
use commons::{tokens, SharedQueue};
use parking_lot::Mutex;
use service_bus::{commands, proxy_commands, BusError, CommandProxy, ProxyCore};

use crate::error::QueryEngineError;

/// Parameter-bag keys understood by the query proxies.
pub mod params {
    pub const UNIQUE_ASSIGNMENT_FLAG: &str = "unique_assignment_flag";
    pub const ATTENTION_UPDATE_FLAG: &str = "attention_update_flag";
    pub const MAX_BUNDLE_SIZE: &str = "max_bundle_size";
    pub const POSITIVE_IMPORTANCE_FLAG: &str = "positive_importance_flag";
    pub const UNIQUE_VALUE_FLAG: &str = "unique_value_flag";
    pub const COUNT_FLAG: &str = "count_flag";
    pub const MAX_ANSWERS: &str = "max_answers";
    pub const POPULATE_METTA_MAPPING: &str = "populate_metta_mapping";
    pub const USE_METTA_AS_QUERY_TOKENS: &str = "use_metta_as_query_tokens";
}

/// Bundle flush threshold when the caller sets nothing else.
pub const DEFAULT_MAX_BUNDLE_SIZE: i64 = 1000;

/// Streaming-answer half of a query proxy.
///
/// The processor side batches serialised answers into a bundle flushed
/// at `max_bundle_size` (or explicitly); the caller side deposits
/// decoded answers into a queue drained by `pop`. The sticky `FINISHED`
/// terminal message closes the stream.
pub struct QueryStream {
    answer_queue: SharedQueue<QueryAnswer>,
    answer_count: AtomicU32,
    bundle: Mutex<Vec<String>>,
    context: Mutex<String>,
    query_tokens: Mutex<Vec<String>>,
}

impl QueryStream {
    pub fn new(query_tokens: Vec<String>, context: impl Into<String>) -> Self {
        Self {
            answer_queue: SharedQueue::new(),
            answer_count: AtomicU32::new(0),
            bundle: Mutex::new(Vec::new()),
            context: Mutex::new(context.into()),
            query_tokens: Mutex::new(query_tokens),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), "")
    }

    pub fn context(&self) -> String {
        self.context.lock().clone()
    }

    pub fn query_tokens(&self) -> Vec<String> {
        self.query_tokens.lock().clone()
    }

    /// Answers delivered so far (or the final total of a count query).
    pub fn answer_count(&self) -> u32 {
        self.answer_count.load(Ordering::SeqCst)
    }

    pub fn set_answer_count(&self, count: u32) {
        self.answer_count.store(count, Ordering::SeqCst);
    }

    // ---------------------------------------------------------------
    // Caller side

    /// Next delivered answer, or `None` when aborting or none is ready.
    pub fn pop(&self, core: &ProxyCore) -> Option<QueryAnswer> {
        if core.is_aborting() {
            return None;
        }
        self.answer_queue.pop()
    }

    /// Resolves when a new answer or the terminal message may have
    /// arrived.
    pub async fn wait_update(&self) {
        self.answer_queue.wait_update().await;
    }

    /// True once every delivered answer was iterated and no more are
    /// coming (an abort or peer error counts as completion).
    pub fn finished(&self, core: &ProxyCore) -> bool {
        if core.is_aborting() || core.error().is_some() {
            return true;
        }
        core.finished() && self.answer_queue.is_empty()
    }

    // ---------------------------------------------------------------
    // Processor side

    /// Serialises an answer into the outgoing bundle, flushing when the
    /// bundle reaches `max_bundle_size`.
    pub fn push(&self, answer: &QueryAnswer, core: &ProxyCore) -> service_bus::Result<()> {
        let max = core
            .parameters()
            .get_integer(params::MAX_BUNDLE_SIZE)
            .unwrap_or(DEFAULT_MAX_BUNDLE_SIZE)
            .max(1) as usize;
        let mut bundle = self.bundle.lock();
        bundle.push(answer.to_token());
        if bundle.len() >= max {
            Self::flush_locked(&mut bundle, core)?;
        }
        Ok(())
    }

    /// Sends the pending bundle, if any.
    pub fn flush_bundle(&self, core: &ProxyCore) -> service_bus::Result<()> {
        let mut bundle = self.bundle.lock();
        Self::flush_locked(&mut bundle, core)
    }

    fn flush_locked(bundle: &mut Vec<String>, core: &ProxyCore) -> service_bus::Result<()> {
        if bundle.is_empty() {
            return Ok(());
        }
        let outgoing = std::mem::take(bundle);
        core.send_to_peer(proxy_commands::ANSWER_BUNDLE, outgoing)
    }

    /// Flushes and emits the sticky `FINISHED` terminal message.
    pub fn query_processing_finished(&self, core: &ProxyCore) -> service_bus::Result<()> {
        self.flush_bundle(core)?;
        core.send_to_peer(proxy_commands::FINISHED, Vec::new())
    }

    // ---------------------------------------------------------------
    // Inbound piggyback commands

    /// Handles `ANSWER_BUNDLE`; anything else is not ours.
    pub fn handle_stream_command(
        &self,
        core: &ProxyCore,
        command: &str,
        args: &[String],
    ) -> service_bus::Result<bool> {
        if command != proxy_commands::ANSWER_BUNDLE {
            return Ok(false);
        }
        if core.is_aborting() {
            // Late bundles after an abort are dropped silently.
            return Ok(true);
        }
        if args.is_empty() {
            return Err(BusError::MalformedMessage(
                "empty answer bundle".to_string(),
            ));
        }
        for token in args {
            let answer = QueryAnswer::from_token(token)
                .map_err(|e| BusError::MalformedMessage(e.to_string()))?;
            self.answer_queue.push(answer);
            self.answer_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(true)
    }

    // ---------------------------------------------------------------
    // Serialisation

    /// Stream layer of the token encoding: context, token count, query
    /// tokens.
    pub fn tokenize(&self, out: &mut Vec<String>) {
        out.push(self.context());
        let query_tokens = self.query_tokens.lock();
        out.push(query_tokens.len().to_string());
        out.extend(query_tokens.iter().cloned());
    }

    pub fn untokenize(&self, stream: &mut Vec<String>) -> service_bus::Result<()> {
        let context = tokens::take(stream)?;
        let count: usize = tokens::take_parse(stream)?;
        if stream.len() < count {
            return Err(BusError::MalformedMessage(format!(
                "query advertises {} tokens but only {} remain",
                count,
                stream.len()
            )));
        }
        let query_tokens: Vec<String> = stream.drain(..count).collect();
        *self.context.lock() = context;
        *self.query_tokens.lock() = query_tokens;
        Ok(())
    }
}

/// Caller/processor proxy of the `pattern_matching_query` bus command.
pub struct PatternMatchingQueryProxy {
    core: ProxyCore,
    stream: QueryStream,
}

impl PatternMatchingQueryProxy {
    /// Caller-side constructor.
    pub fn new(query_tokens: Vec<String>, context: impl Into<String>) -> Arc<Self> {
        let proxy = Self {
            core: ProxyCore::new(commands::PATTERN_MATCHING_QUERY),
            stream: QueryStream::new(query_tokens, context),
        };
        proxy.set_default_parameters();
        Arc::new(proxy)
    }

    /// Processor-side constructor; fields arrive via `untokenize`.
    pub fn empty() -> Arc<Self> {
        let proxy = Self {
            core: ProxyCore::new(commands::PATTERN_MATCHING_QUERY),
            stream: QueryStream::empty(),
        };
        proxy.set_default_parameters();
        Arc::new(proxy)
    }

    fn set_default_parameters(&self) {
        let mut parameters = self.core.parameters();
        parameters.set(params::UNIQUE_ASSIGNMENT_FLAG, false);
        parameters.set(params::ATTENTION_UPDATE_FLAG, false);
        parameters.set(params::MAX_BUNDLE_SIZE, DEFAULT_MAX_BUNDLE_SIZE);
        parameters.set(params::POSITIVE_IMPORTANCE_FLAG, false);
        parameters.set(params::UNIQUE_VALUE_FLAG, false);
        parameters.set(params::COUNT_FLAG, false);
        parameters.set(params::MAX_ANSWERS, 0i64);
        parameters.set(params::POPULATE_METTA_MAPPING, false);
        parameters.set(params::USE_METTA_AS_QUERY_TOKENS, false);
    }

    pub fn stream(&self) -> &QueryStream {
        &self.stream
    }

    fn flag(&self, key: &str) -> bool {
        self.core.parameters().get_boolean(key).unwrap_or(false)
    }

    /// Pops the next answer. `None` does not mean the query finished,
    /// only that nothing is ready right now.
    pub fn pop(&self) -> Result<Option<QueryAnswer>, QueryEngineError> {
        if self.flag(params::COUNT_FLAG) {
            return Err(QueryEngineError::MalformedQuery(
                "count-only queries deliver no answers to pop".to_string(),
            ));
        }
        Ok(self.stream.pop(&self.core))
    }

    /// Answers delivered so far, or the total of a count-only query.
    pub fn get_count(&self) -> u32 {
        self.stream.answer_count()
    }

    /// True once all answers were delivered and iterated.
    pub fn finished(&self) -> bool {
        if self.flag(params::COUNT_FLAG) {
            self.core.finished()
        } else {
            self.stream.finished(&self.core)
        }
    }

    pub fn abort(&self) {
        self.core.abort();
    }

    pub fn is_aborting(&self) -> bool {
        self.core.is_aborting()
    }

    pub fn set_unique_assignment_flag(&self, flag: bool) {
        self.core.parameters().set(params::UNIQUE_ASSIGNMENT_FLAG, flag);
    }

    pub fn set_attention_update_flag(&self, flag: bool) {
        self.core.parameters().set(params::ATTENTION_UPDATE_FLAG, flag);
    }

    pub fn set_positive_importance_flag(&self, flag: bool) {
        self.core
            .parameters()
            .set(params::POSITIVE_IMPORTANCE_FLAG, flag);
    }

    pub fn set_unique_value_flag(&self, flag: bool) {
        self.core.parameters().set(params::UNIQUE_VALUE_FLAG, flag);
    }

    pub fn set_count_flag(&self, flag: bool) {
        self.core.parameters().set(params::COUNT_FLAG, flag);
    }

    pub fn set_max_answers(&self, max_answers: i64) {
        self.core.parameters().set(params::MAX_ANSWERS, max_answers);
    }

    pub fn set_max_bundle_size(&self, size: i64) {
        self.core.parameters().set(params::MAX_BUNDLE_SIZE, size);
    }

    pub fn set_populate_metta_mapping(&self, flag: bool) {
        self.core
            .parameters()
            .set(params::POPULATE_METTA_MAPPING, flag);
    }
}

impl CommandProxy for PatternMatchingQueryProxy {
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
        if command == proxy_commands::COUNT {
            if self.core.is_aborting() {
                return Ok(true);
            }
            if args.len() != 1 {
                return Err(BusError::MalformedMessage(
                    "count expects exactly one argument".to_string(),
                ));
            }
            if !self.flag(params::COUNT_FLAG) {
                return Err(BusError::MalformedMessage(
                    "count received but the query is not count-only".to_string(),
                ));
            }
            let count: u32 = args[0]
                .parse()
                .map_err(|_| BusError::MalformedMessage("invalid count".to_string()))?;
            self.stream.set_answer_count(count);
            return Ok(true);
        }
        Ok(false)
    }

    fn tokenize(&self, out: &mut Vec<String>) {
        self.core.tokenize_base(out);
        self.stream.tokenize(out);
    }

    fn untokenize(&self, tokens: &mut Vec<String>) -> service_bus::Result<()> {
        self.core.untokenize_base(tokens)?;
        self.stream.untokenize(tokens)
    }
}
