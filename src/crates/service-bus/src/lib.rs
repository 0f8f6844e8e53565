//! The atombus service bus.
//!
//! Nodes join a star-shaped overlay and exchange named bus commands
//! whose lifetimes may span seconds to days. Each outstanding command is
//! represented by a pair of proxies, one at the requestor and one at the
//! processor, linked by a dedicated transport endpoint pair whose port
//! numbers come from a bounded [`PortPool`].

pub mod bus;
pub mod error;
pub mod port_pool;
pub mod processor;
pub mod proxy;
pub mod transport;

pub use bus::{ServiceBus, ServiceBusConfig};
pub use error::BusError;
pub use port_pool::{PortGuard, PortPool};
pub use processor::{CommandProcessor, WorkerSet};
pub use proxy::{CommandProxy, ProxyCore, ProxyEndpoint};
pub use transport::{MessageHandler, StarNode};

/// Result alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// The fixed set of bus commands provided by agents in the platform.
pub mod commands {
    pub const PATTERN_MATCHING_QUERY: &str = "pattern_matching_query";
    pub const QUERY_EVOLUTION: &str = "query_evolution";
    pub const LINK_CREATION: &str = "link_creation";
    pub const INFERENCE: &str = "inference";
    pub const CONTEXT: &str = "context";
    pub const ATOMDB: &str = "atomdb";

    /// Every command a bus node recognises.
    pub fn service_list() -> std::collections::HashSet<String> {
        [
            PATTERN_MATCHING_QUERY,
            QUERY_EVOLUTION,
            LINK_CREATION,
            INFERENCE,
            CONTEXT,
            ATOMDB,
        ]
        .iter()
        .map(|command| command.to_string())
        .collect()
    }
}

/// Commands reserved at the proxy level (inside the envelope).
pub mod proxy_commands {
    /// Outer envelope command; the real command rides as the last
    /// argument so the transport only needs one command name.
    pub const PROXY_ENVELOPE: &str = "bus_command_proxy";

    pub const ABORT: &str = "abort";
    pub const FINISHED: &str = "finished";
    pub const ANSWER_BUNDLE: &str = "answer_bundle";
    pub const COUNT: &str = "count";
    pub const CONTEXT_CREATED: &str = "context_created";
    pub const ATTENTION_BROKER_SET_PARAMETERS: &str = "attention_broker_set_parameters";
    pub const ATTENTION_BROKER_SET_PARAMETERS_FINISHED: &str =
        "attention_broker_set_parameters_finished";
    pub const PEER_ERROR: &str = "peer_error";
}
