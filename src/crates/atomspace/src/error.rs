//! Error type for atom space operations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AtomSpaceError>;

#[derive(Debug, Error)]
pub enum AtomSpaceError {
    /// The storage backend rejected or failed an operation.
    #[error("atom store failure: {0}")]
    Store(String),

    /// A handle did not resolve to a stored atom.
    #[error("unknown atom handle: {0}")]
    UnknownHandle(String),

    /// A handle string is not a valid fixed-width hex digest.
    #[error("malformed handle {handle:?}: {reason}")]
    MalformedHandle { handle: String, reason: String },

    /// A serialized atom or answer could not be decoded.
    #[error("malformed atom encoding: {0}")]
    Decode(String),

    /// The attention broker collaborator failed.
    #[error("attention broker failure: {0}")]
    Attention(String),
}

impl From<commons::TokenError> for AtomSpaceError {
    fn from(error: commons::TokenError) -> Self {
        AtomSpaceError::Decode(error.to_string())
    }
}
