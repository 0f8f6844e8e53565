//! The persistent atom store collaborator interface.
//!
//! The real backend is a remote key/value + document service; the core
//! only depends on this trait. [`crate::memory::InMemoryAtomStore`] is
//! the reference implementation used by tests and single-process nodes.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::atom::{Atom, Link, Node};
use crate::error::Result;
use crate::handle::Handle;
use crate::schema::LinkSchema;

/// Value of one document field.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentValue {
    Text(String),
    TextArray(Vec<String>),
}

/// Key-indexed view of a stored atom returning strings or indexed
/// string arrays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AtomDocument {
    fields: HashMap<String, DocumentValue>,
}

impl AtomDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_text(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields
            .insert(key.into(), DocumentValue::Text(value.into()));
    }

    pub fn set_array(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.fields
            .insert(key.into(), DocumentValue::TextArray(values));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(DocumentValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn get_indexed(&self, key: &str, index: usize) -> Option<&str> {
        match self.fields.get(key) {
            Some(DocumentValue::TextArray(values)) => values.get(index).map(String::as_str),
            _ => None,
        }
    }

    pub fn array_len(&self, key: &str) -> Option<usize> {
        match self.fields.get(key) {
            Some(DocumentValue::TextArray(values)) => Some(values.len()),
            _ => None,
        }
    }
}

/// Interface required of the atom store backend.
#[async_trait]
pub trait AtomStore: Send + Sync {
    async fn get_atom(&self, handle: &Handle) -> Result<Option<Atom>>;

    async fn get_atom_document(&self, handle: &Handle) -> Result<Option<AtomDocument>>;

    async fn node_exists(&self, handle: &Handle) -> Result<bool>;

    async fn link_exists(&self, handle: &Handle) -> Result<bool>;

    async fn add_node(&self, node: Node) -> Result<Handle>;

    async fn add_link(&self, link: Link) -> Result<Handle>;

    /// Batch insertion. `toplevel` marks every inserted link; `reindex`
    /// asks the backend to refresh pattern indices afterwards.
    async fn add_atoms(&self, atoms: Vec<Atom>, toplevel: bool, reindex: bool)
        -> Result<Vec<Handle>>;

    /// Returns true when the link existed. `cascade` also removes links
    /// pointing at it.
    async fn delete_link(&self, handle: &Handle, cascade: bool) -> Result<bool>;

    async fn delete_node(&self, handle: &Handle, cascade: bool) -> Result<bool>;

    /// Handles of all stored links matching the schema's type, arity and
    /// fixed positions. Variable bindings are the query engine's job;
    /// the store only narrows the candidate set.
    async fn query_for_pattern(&self, schema: &LinkSchema) -> Result<Vec<Handle>>;

    /// Targets of a link, or `None` when the handle is not a link.
    async fn query_for_targets(&self, handle: &Handle) -> Result<Option<Vec<Handle>>>;

    /// Registers a pattern index schema so the backend can precompute
    /// indices for it.
    async fn add_pattern_index_schema(&self, tokens: &[String], entries: &[String]) -> Result<()>;
}
