//! Error types for the service bus.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    /// No endpoint port became free within the bounded wait.
    #[error("no endpoint port available in [{lo}..{hi}]")]
    PortExhausted { lo: u16, hi: u16 },

    /// A processor tried to take a command another node already owns.
    #[error("command '{command}' is already owned by {owner}")]
    AlreadyOwned { command: String, owner: String },

    /// The command is not in the bus service list or has no owner yet.
    #[error("unknown or unowned bus command: {0}")]
    UnknownCommand(String),

    /// An inbound bus or proxy message could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The remote side of a proxy pair raised an error.
    #[error("peer error {code}: {message}")]
    PeerError { code: u32, message: String },

    /// The transport collaborator failed to deliver or receive.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker task key was reused or a lifecycle rule was violated.
    #[error("{0}")]
    Lifecycle(String),
}

impl From<commons::TokenError> for BusError {
    fn from(error: commons::TokenError) -> Self {
        BusError::MalformedMessage(error.to_string())
    }
}

impl From<bincode::Error> for BusError {
    fn from(error: bincode::Error) -> Self {
        BusError::MalformedMessage(error.to_string())
    }
}
