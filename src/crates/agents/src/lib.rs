//! Reasoning agents of the atombus platform.
//!
//! Each agent is a pair of a bus command proxy (issued by callers) and a
//! processor (registered by the owning node): the context broker, the
//! query evolver, the link creator, the inference orchestrator and the
//! atom-db broker.

pub mod atomdb_broker;
pub mod context_broker;
pub mod error;
pub mod evolution;
pub mod inference;
pub mod link_creation;

pub use atomdb_broker::{AtomDbProcessor, AtomDbProxy};
pub use context_broker::{AnswerElement, ContextBrokerProcessor, ContextBrokerProxy};
pub use error::AgentError;
pub use evolution::{
    FitnessFunction, FitnessFunctionRegistry, QueryEvolutionProcessor, QueryEvolutionProxy,
};
pub use inference::{InferenceProcessor, InferenceProxy};
pub use link_creation::{LinkCreationProcessor, LinkCreationRequestProxy};

pub type Result<T> = std::result::Result<T, AgentError>;
