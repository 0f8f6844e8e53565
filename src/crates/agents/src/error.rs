//! Error type shared by the agents.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Bus(#[from] service_bus::BusError),

    #[error(transparent)]
    AtomSpace(#[from] atomspace::AtomSpaceError),

    #[error(transparent)]
    QueryEngine(#[from] query_engine::QueryEngineError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown fitness function: {0}")]
    UnknownFitnessFunction(String),

    #[error("context cache corrupted: {0}")]
    Cache(String),

    #[error("malformed agent request: {0}")]
    MalformedRequest(String),
}

impl From<commons::TokenError> for AgentError {
    fn from(error: commons::TokenError) -> Self {
        AgentError::MalformedRequest(error.to_string())
    }
}
