//! Shared pieces of the atombus binaries: configuration loading and the
//! service factory wiring processors onto a bus node.

pub mod config;
pub mod runner;

pub use config::{NodeConfig, PortRange};
pub use runner::{build_processors, Service};
