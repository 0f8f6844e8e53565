//! Service selection: which processors a node registers.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use agents::{
    AtomDbProcessor, ContextBrokerProcessor, InferenceProcessor, LinkCreationProcessor,
    QueryEvolutionProcessor,
};
use atomspace::{AtomStore, AttentionBroker};
use query_engine::PatternMatchingQueryProcessor;
use service_bus::{CommandProcessor, ServiceBus};

/// Services a node can provide on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    QueryEngine,
    Evolution,
    LinkCreation,
    Inference,
    ContextBroker,
    AtomDb,
    /// Everything on one node; handy for single-process deployments.
    All,
}

impl FromStr for Service {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "query-engine" => Ok(Service::QueryEngine),
            "evolution" => Ok(Service::Evolution),
            "link-creation" => Ok(Service::LinkCreation),
            "inference" => Ok(Service::Inference),
            "context-broker" => Ok(Service::ContextBroker),
            "atomdb" => Ok(Service::AtomDb),
            "all" => Ok(Service::All),
            other => Err(format!(
                "unknown service {:?} (expected query-engine, evolution, link-creation, \
                 inference, context-broker, atomdb or all)",
                other
            )),
        }
    }
}

/// Builds the processors the selected service registers.
pub fn build_processors(
    service: Service,
    bus: &Arc<ServiceBus>,
    store: &Arc<dyn AtomStore>,
    attention: &Arc<dyn AttentionBroker>,
    cache_dir: &PathBuf,
) -> Vec<Arc<dyn CommandProcessor>> {
    match service {
        Service::QueryEngine => vec![PatternMatchingQueryProcessor::new(
            store.clone(),
            attention.clone(),
        )],
        Service::Evolution => vec![QueryEvolutionProcessor::new(
            store.clone(),
            attention.clone(),
        )],
        Service::LinkCreation => vec![LinkCreationProcessor::new(
            store.clone(),
            attention.clone(),
        )],
        Service::Inference => vec![InferenceProcessor::new(bus.clone())],
        Service::ContextBroker => vec![ContextBrokerProcessor::with_cache_dir(
            store.clone(),
            attention.clone(),
            cache_dir.clone(),
        )],
        Service::AtomDb => vec![AtomDbProcessor::new(store.clone())],
        Service::All => vec![
            PatternMatchingQueryProcessor::new(store.clone(), attention.clone()),
            QueryEvolutionProcessor::new(store.clone(), attention.clone()),
            LinkCreationProcessor::new(store.clone(), attention.clone()),
            InferenceProcessor::new(bus.clone()),
            ContextBrokerProcessor::with_cache_dir(
                store.clone(),
                attention.clone(),
                cache_dir.clone(),
            ),
            AtomDbProcessor::new(store.clone()),
        ],
    }
}
