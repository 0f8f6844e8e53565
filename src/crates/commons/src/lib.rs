//! Shared primitives for the atombus workspace.
//!
//! This crate holds the small pieces every other crate leans on: the
//! cooperative-cancellation task handle, the producer-finished queue used
//! for answer streaming, the typed property bag carried by bus command
//! proxies, and the token-stream helpers used by the proxy serializers.

pub mod properties;
pub mod queue;
pub mod task;
pub mod tokens;

pub use properties::{Properties, PropertyValue};
pub use queue::SharedQueue;
pub use task::{StopToken, StoppableTask};
pub use tokens::TokenError;
