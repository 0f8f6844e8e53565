//! Hypergraph data model for the atombus workspace.
//!
//! Atoms are typed nodes and links identified by content-addressed
//! handles. Pattern matching produces [`QueryAnswer`] values that flow
//! through the query element graph; the persistent store and the
//! attention broker are reached through the collaborator traits defined
//! here.

pub mod assignment;
pub mod atom;
pub mod attention;
pub mod context;
pub mod error;
pub mod handle;
pub mod memory;
pub mod query_answer;
pub mod schema;
pub mod store;

pub use assignment::Assignment;
pub use atom::{Atom, Link, Node};
pub use attention::{
    AttentionBroker, AttentionEvent, NullAttentionBroker, RecordingAttentionBroker,
};
pub use context::Context;
pub use error::AtomSpaceError;
pub use handle::Handle;
pub use memory::InMemoryAtomStore;
pub use query_answer::QueryAnswer;
pub use schema::{LinkSchema, PatternTarget};
pub use store::{AtomDocument, AtomStore, DocumentValue};
