//! The query evolver: generations of query answers scored by a fitness
//! function, with attention feedback between generations.

mod fitness;

pub use fitness::{
    CountLetter, FitnessFunction, FitnessFunctionRegistry, MeanStrength, MultiplyStrength,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use atomspace::{AtomStore, AttentionBroker, Handle, QueryAnswer};
use commons::{tokens, StopToken};
use parking_lot::Mutex;
use query_engine::element::{QueryRuntime, Sink};
use query_engine::{compile_query, CompileFlags, QueryStream};
use rand::Rng;
use service_bus::{
    commands, BusError, CommandProcessor, CommandProxy, ProxyCore, WorkerSet,
};

use crate::Result;

/// Parameter-bag keys of the evolution command.
pub mod params {
    pub const POPULATION_SIZE: &str = "population_size";
    pub const MAX_GENERATIONS: &str = "max_generations";
    pub const ELITISM_RATE: &str = "elitism_rate";
    pub const SELECTION_RATE: &str = "selection_rate";
    pub const TOTAL_ATTENTION_TOKENS: &str = "total_attention_tokens";
    pub const FITNESS_FUNCTION: &str = "fitness_function";
    pub const UNIQUE_ASSIGNMENT_FLAG: &str = "unique_assignment_flag";
}

/// Caller/processor proxy of the `query_evolution` bus command.
///
/// Same answer-stream shape as the pattern matching proxy; the
/// parameter bag adds the population knobs and the fitness function
/// tag. An optional correlation query can replace the sampled query for
/// the attention feedback step.
pub struct QueryEvolutionProxy {
    core: ProxyCore,
    stream: QueryStream,
    correlation_tokens: Mutex<Vec<String>>,
}

impl QueryEvolutionProxy {
    pub fn new(query_tokens: Vec<String>, context: impl Into<String>) -> Arc<Self> {
        let proxy = Self {
            core: ProxyCore::new(commands::QUERY_EVOLUTION),
            stream: QueryStream::new(query_tokens, context),
            correlation_tokens: Mutex::new(Vec::new()),
        };
        proxy.set_default_parameters();
        Arc::new(proxy)
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new(), "")
    }

    fn set_default_parameters(&self) {
        let mut parameters = self.core.parameters();
        parameters.set(params::POPULATION_SIZE, 50i64);
        parameters.set(params::MAX_GENERATIONS, 10i64);
        parameters.set(params::ELITISM_RATE, 0.1);
        parameters.set(params::SELECTION_RATE, 0.5);
        parameters.set(params::TOTAL_ATTENTION_TOKENS, 100i64);
        parameters.set(params::FITNESS_FUNCTION, "multiply_strength");
        parameters.set(params::UNIQUE_ASSIGNMENT_FLAG, false);
    }

    pub fn stream(&self) -> &QueryStream {
        &self.stream
    }

    pub fn correlation_tokens(&self) -> Vec<String> {
        self.correlation_tokens.lock().clone()
    }

    pub fn set_correlation_tokens(&self, tokens: Vec<String>) {
        *self.correlation_tokens.lock() = tokens;
    }

    pub fn set_fitness_function(&self, tag: impl Into<String>) {
        self.core
            .parameters()
            .set(params::FITNESS_FUNCTION, tag.into());
    }

    pub fn set_population_size(&self, size: i64) {
        self.core.parameters().set(params::POPULATION_SIZE, size);
    }

    pub fn set_max_generations(&self, generations: i64) {
        self.core
            .parameters()
            .set(params::MAX_GENERATIONS, generations);
    }

    pub fn pop(&self) -> Option<QueryAnswer> {
        self.stream.pop(&self.core)
    }

    pub fn get_count(&self) -> u32 {
        self.stream.answer_count()
    }

    pub fn finished(&self) -> bool {
        self.stream.finished(&self.core)
    }

    pub fn abort(&self) {
        self.core.abort();
    }
}

impl CommandProxy for QueryEvolutionProxy {
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
        let correlation = self.correlation_tokens.lock();
        out.push(correlation.len().to_string());
        out.extend(correlation.iter().cloned());
    }

    fn untokenize(&self, stream: &mut Vec<String>) -> service_bus::Result<()> {
        self.core.untokenize_base(stream)?;
        self.stream.untokenize(stream)?;
        let count: usize = tokens::take_parse(stream)?;
        if stream.len() < count {
            return Err(BusError::MalformedMessage(
                "correlation query shorter than advertised".to_string(),
            ));
        }
        *self.correlation_tokens.lock() = stream.drain(..count).collect();
        Ok(())
    }
}

/// Bus element responsible for `query_evolution` commands.
pub struct QueryEvolutionProcessor {
    commands: HashSet<String>,
    runtime: Arc<QueryRuntime>,
    registry: Arc<FitnessFunctionRegistry>,
    workers: Arc<WorkerSet>,
}

impl QueryEvolutionProcessor {
    pub fn new(store: Arc<dyn AtomStore>, attention: Arc<dyn AttentionBroker>) -> Arc<Self> {
        Self::with_registry(store, attention, FitnessFunctionRegistry::with_builtins())
    }

    pub fn with_registry(
        store: Arc<dyn AtomStore>,
        attention: Arc<dyn AttentionBroker>,
        registry: FitnessFunctionRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            commands: [commands::QUERY_EVOLUTION.to_string()].into_iter().collect(),
            runtime: QueryRuntime::new(store, attention),
            registry: Arc::new(registry),
            workers: Arc::new(WorkerSet::new()),
        })
    }
}

#[async_trait]
impl CommandProcessor for QueryEvolutionProcessor {
    fn commands(&self) -> &HashSet<String> {
        &self.commands
    }

    fn factory_empty_proxy(&self) -> Arc<dyn CommandProxy> {
        QueryEvolutionProxy::empty()
    }

    async fn run_command(&self, proxy: Arc<dyn CommandProxy>) -> service_bus::Result<()> {
        let proxy = proxy
            .as_any()
            .downcast::<QueryEvolutionProxy>()
            .map_err(|_| BusError::Lifecycle("evolution got a foreign proxy".to_string()))?;
        let key = WorkerSet::worker_key(proxy.core());
        let runtime = self.runtime.clone();
        let registry = self.registry.clone();
        let workers = self.workers.clone();
        let worker_key = key.clone();
        self.workers.spawn(key, move |stop| async move {
            if let Err(error) = evolve(&runtime, &registry, &proxy, &stop).await {
                proxy.core().raise_error_on_peer(error.to_string(), 0);
            }
            workers.remove(&worker_key);
        })
    }
}

async fn evolve(
    runtime: &Arc<QueryRuntime>,
    registry: &Arc<FitnessFunctionRegistry>,
    proxy: &Arc<QueryEvolutionProxy>,
    stop: &StopToken,
) -> Result<()> {
    let mut request_tokens = proxy.core().take_args();
    proxy.untokenize(&mut request_tokens)?;

    let (population_size, max_generations, elitism_rate, selection_rate, token_budget, tag, unique) = {
        let parameters = proxy.core().parameters();
        (
            parameters.get_integer(params::POPULATION_SIZE).unwrap_or(50).max(1) as usize,
            parameters.get_integer(params::MAX_GENERATIONS).unwrap_or(10).max(1),
            parameters.get_real(params::ELITISM_RATE).unwrap_or(0.1),
            parameters.get_real(params::SELECTION_RATE).unwrap_or(0.5),
            parameters
                .get_integer(params::TOTAL_ATTENTION_TOKENS)
                .unwrap_or(100)
                .max(0) as u32,
            parameters
                .get_text(params::FITNESS_FUNCTION)
                .unwrap_or("multiply_strength")
                .to_string(),
            parameters
                .get_boolean(params::UNIQUE_ASSIGNMENT_FLAG)
                .unwrap_or(false),
        )
    };
    let fitness = registry.get(&tag)?;
    let context = proxy.stream().context();
    tracing::info!(
        context = %context,
        population_size,
        max_generations,
        fitness = %tag,
        "starting query evolution"
    );

    for generation in 0..max_generations {
        if proxy.core().is_aborting() || stop.stopped() {
            break;
        }
        let mut population =
            sample_population(runtime, proxy, generation, population_size, unique, stop).await?;
        if population.is_empty() {
            tracing::info!(generation, "population exhausted");
            break;
        }
        for answer in &mut population {
            answer.strength = fitness
                .evaluate(runtime.store.as_ref(), answer)
                .await?
                .clamp(0.0, 1.0);
        }
        population.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Elite answers stream back to the caller.
        let elite_count = ((elitism_rate * population.len() as f64).ceil() as usize)
            .clamp(1, population.len());
        for answer in &population[..elite_count] {
            proxy.stream().push(answer, proxy.core())?;
        }
        proxy.stream().flush_bundle(proxy.core())?;

        // Roulette selection drives the attention feedback.
        let selected = roulette_select(&population, selection_rate);
        apply_attention_feedback(runtime, &context, &selected, token_budget).await?;
        let correlation_tokens = proxy.correlation_tokens();
        if !correlation_tokens.is_empty() {
            correlate_query(runtime, proxy, &correlation_tokens, &context, generation, stop)
                .await?;
        }
        tracing::debug!(
            generation,
            population = population.len(),
            elite = elite_count,
            selected = selected.len(),
            "generation complete"
        );
    }
    proxy.stream().query_processing_finished(proxy.core())?;
    Ok(())
}

async fn sample_population(
    runtime: &Arc<QueryRuntime>,
    proxy: &Arc<QueryEvolutionProxy>,
    generation: i64,
    population_size: usize,
    unique_assignment: bool,
    stop: &StopToken,
) -> Result<Vec<QueryAnswer>> {
    let flags = CompileFlags {
        unique_assignment,
        ..Default::default()
    };
    let context = proxy.stream().context();
    let root = compile_query(&proxy.stream().query_tokens(), &context, flags)?;
    let sink = Sink::attach(
        root,
        format!(
            "Sink_{}_{}_{}",
            proxy.core().my_id(),
            proxy.core().serial(),
            generation
        ),
        runtime,
    )?;
    let mut population = Vec::with_capacity(population_size);
    while population.len() < population_size {
        match sink.pop_wait(stop).await {
            Some(answer) => population.push(answer),
            None => break,
        }
    }
    sink.graceful_shutdown().await;
    Ok(population)
}

/// Runs the dedicated correlation query and correlates every answer's
/// handle set under the evolution context.
async fn correlate_query(
    runtime: &Arc<QueryRuntime>,
    proxy: &Arc<QueryEvolutionProxy>,
    correlation_tokens: &[String],
    context: &str,
    generation: i64,
    stop: &StopToken,
) -> Result<()> {
    let root = compile_query(correlation_tokens, context, CompileFlags::default())?;
    let sink = Sink::attach(
        root,
        format!(
            "Sink_{}_{}_corr_{}",
            proxy.core().my_id(),
            proxy.core().serial(),
            generation
        ),
        runtime,
    )?;
    while let Some(answer) = sink.pop_wait(stop).await {
        let handles: HashSet<Handle> = answer
            .handles
            .iter()
            .chain(answer.assignment.iter().map(|(_, handle)| handle))
            .cloned()
            .collect();
        if handles.len() > 1 {
            runtime.attention.correlate(&handles, context).await?;
        }
    }
    sink.graceful_shutdown().await;
    Ok(())
}

/// Fitness-proportionate selection without replacement.
fn roulette_select(population: &[QueryAnswer], selection_rate: f64) -> Vec<QueryAnswer> {
    let target = ((selection_rate * population.len() as f64).ceil() as usize)
        .min(population.len());
    let mut pool: Vec<QueryAnswer> = population.to_vec();
    let mut selected = Vec::with_capacity(target);
    let mut rng = rand::thread_rng();
    while selected.len() < target && !pool.is_empty() {
        let total: f64 = pool.iter().map(|answer| answer.strength).sum();
        let index = if total <= f64::EPSILON {
            rng.gen_range(0..pool.len())
        } else {
            let mut spin = rng.gen_range(0.0..total);
            let mut chosen = pool.len() - 1;
            for (i, answer) in pool.iter().enumerate() {
                if spin < answer.strength {
                    chosen = i;
                    break;
                }
                spin -= answer.strength;
            }
            chosen
        };
        selected.push(pool.swap_remove(index));
    }
    selected
}

/// Correlates each selected answer and stimulates its handles with a
/// share of the attention-token budget proportional to fitness.
async fn apply_attention_feedback(
    runtime: &Arc<QueryRuntime>,
    context: &str,
    selected: &[QueryAnswer],
    token_budget: u32,
) -> Result<()> {
    if selected.is_empty() {
        return Ok(());
    }
    let total_strength: f64 = selected.iter().map(|answer| answer.strength).sum();
    let mut stimulus: HashMap<Handle, u32> = HashMap::new();
    for answer in selected {
        let handles: HashSet<Handle> = answer
            .handles
            .iter()
            .chain(answer.assignment.iter().map(|(_, handle)| handle))
            .cloned()
            .collect();
        if handles.len() > 1 {
            runtime.attention.correlate(&handles, context).await?;
        }
        let share = if total_strength <= f64::EPSILON {
            token_budget as f64 / selected.len() as f64
        } else {
            token_budget as f64 * answer.strength / total_strength
        };
        let per_handle = (share / handles.len().max(1) as f64).round() as u32;
        if per_handle == 0 {
            continue;
        }
        for handle in handles {
            *stimulus.entry(handle).or_insert(0) += per_handle;
        }
    }
    if !stimulus.is_empty() {
        runtime.attention.stimulate(&stimulus, context).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomspace::Handle;

    fn answer(name: &str, strength: f64) -> QueryAnswer {
        let mut answer = QueryAnswer::with_handle(Handle::of_node("Symbol", name), 0.0);
        answer.strength = strength;
        answer
    }

    #[test]
    fn roulette_select_respects_the_target_size() {
        let population = vec![
            answer("a", 0.9),
            answer("b", 0.5),
            answer("c", 0.1),
            answer("d", 0.0),
        ];
        let selected = roulette_select(&population, 0.5);
        assert_eq!(selected.len(), 2);
        let selected_all = roulette_select(&population, 1.0);
        assert_eq!(selected_all.len(), 4);
    }

    #[test]
    fn roulette_select_handles_zero_fitness_population() {
        let population = vec![answer("a", 0.0), answer("b", 0.0)];
        let selected = roulette_select(&population, 1.0);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn proxy_tokens_round_trip_with_correlation_query() {
        let query: Vec<String> = "LINK_TEMPLATE Expression 2 NODE Symbol A VARIABLE v"
            .split_whitespace()
            .map(String::from)
            .collect();
        let proxy = QueryEvolutionProxy::new(query.clone(), "ctx");
        proxy.set_fitness_function("mean_strength");
        proxy.set_population_size(7);
        proxy.set_correlation_tokens(vec!["LINK_TEMPLATE".into(), "X".into(), "0".into()]);

        let mut stream = Vec::new();
        proxy.tokenize(&mut stream);
        let decoded = QueryEvolutionProxy::empty();
        decoded.untokenize(&mut stream).unwrap();
        assert!(stream.is_empty());
        assert_eq!(decoded.stream().query_tokens(), query);
        assert_eq!(decoded.stream().context(), "ctx");
        assert_eq!(decoded.correlation_tokens().len(), 3);
        assert_eq!(
            decoded
                .core()
                .parameters()
                .get_text(params::FITNESS_FUNCTION),
            Some("mean_strength")
        );
        assert_eq!(
            decoded
                .core()
                .parameters()
                .get_integer(params::POPULATION_SIZE),
            Some(7)
        );
    }
}
