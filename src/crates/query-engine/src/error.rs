//! Error type for query compilation and execution.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryEngineError {
    /// The token stream does not form a valid query.
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    #[error(transparent)]
    Bus(#[from] service_bus::BusError),

    #[error(transparent)]
    AtomSpace(#[from] atomspace::AtomSpaceError),
}

impl From<commons::TokenError> for QueryEngineError {
    fn from(error: commons::TokenError) -> Self {
        QueryEngineError::MalformedQuery(error.to_string())
    }
}
