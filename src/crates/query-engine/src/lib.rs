//! Pattern matching over the atombus service bus.
//!
//! Queries compile into a dataflow graph of query elements (sources over
//! link templates, And/Or/UniqueAssignmentFilter operators, a Sink) that
//! execute across bounded inter-task queues. The processor drains the
//! Sink into the streaming answer protocol of the query proxies.

pub mod compiler;
pub mod element;
pub mod error;
pub mod processor;
pub mod proxy;

pub use compiler::{compile_query, CompileFlags};
pub use element::{QueryElement, QueryRuntime, Sink};
pub use error::QueryEngineError;
pub use processor::PatternMatchingQueryProcessor;
pub use proxy::{params, PatternMatchingQueryProxy, QueryStream};

pub type Result<T> = std::result::Result<T, QueryEngineError>;

/// Maximum fan-in of an And/Or operator.
pub const MAX_OPERATOR_CLAUSES: usize = 10;
