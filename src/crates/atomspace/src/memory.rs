//! In-memory reference implementation of [`AtomStore`].

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::atom::{Atom, Link, Node};
use crate::error::Result;
use crate::handle::Handle;
use crate::schema::{LinkSchema, PatternTarget};
use crate::store::{AtomDocument, AtomStore};

/// Process-local atom store backed by a handle-indexed map.
///
/// Pattern queries scan the link set; good enough for tests and
/// single-node deployments, not a substitute for an indexed backend.
#[derive(Default)]
pub struct InMemoryAtomStore {
    atoms: DashMap<Handle, Atom>,
    index_schemas: Mutex<Vec<(Vec<String>, Vec<String>)>>,
}

impl InMemoryAtomStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Matches a link against a schema using a pre-collected link
    /// snapshot, so no map locks are held while matching.
    fn matches_schema(
        links: &std::collections::HashMap<Handle, Link>,
        link: &Link,
        schema: &LinkSchema,
    ) -> bool {
        if link.link_type != schema.link_type || link.arity() != schema.arity() {
            return false;
        }
        link.targets
            .iter()
            .zip(schema.targets.iter())
            .all(|(target, pattern)| match pattern {
                PatternTarget::Variable(_) => true,
                PatternTarget::SubSchema(sub) => match links.get(target) {
                    Some(sub_link) => Self::matches_schema(links, sub_link, sub),
                    None => false,
                },
                fixed => fixed.fixed_handle().as_ref() == Some(target),
            })
    }

    fn link_snapshot(&self) -> std::collections::HashMap<Handle, Link> {
        self.atoms
            .iter()
            .filter_map(|entry| match entry.value() {
                Atom::Link(link) => Some((entry.key().clone(), link.clone())),
                Atom::Node(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl AtomStore for InMemoryAtomStore {
    async fn get_atom(&self, handle: &Handle) -> Result<Option<Atom>> {
        Ok(self.atoms.get(handle).map(|entry| entry.value().clone()))
    }

    async fn get_atom_document(&self, handle: &Handle) -> Result<Option<AtomDocument>> {
        let atom = match self.atoms.get(handle) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };
        let mut document = AtomDocument::new();
        document.set_text("id", handle.to_string());
        document.set_text("type", atom.atom_type());
        match &atom {
            Atom::Node(node) => {
                document.set_text("name", &node.name);
            }
            Atom::Link(link) => {
                document.set_array(
                    "targets",
                    link.targets.iter().map(Handle::to_string).collect(),
                );
                document.set_text("toplevel", if link.toplevel { "1" } else { "0" });
                for (key, value) in link.properties.iter() {
                    document.set_text(key.clone(), value.to_string());
                }
                if let Some(strength) = link.properties.get_real("strength") {
                    document.set_text("strength", strength.to_string());
                }
            }
        }
        Ok(Some(document))
    }

    async fn node_exists(&self, handle: &Handle) -> Result<bool> {
        Ok(self
            .atoms
            .get(handle)
            .map(|entry| entry.value().as_node().is_some())
            .unwrap_or(false))
    }

    async fn link_exists(&self, handle: &Handle) -> Result<bool> {
        Ok(self
            .atoms
            .get(handle)
            .map(|entry| entry.value().as_link().is_some())
            .unwrap_or(false))
    }

    async fn add_node(&self, node: Node) -> Result<Handle> {
        let handle = node.handle();
        self.atoms.insert(handle.clone(), Atom::Node(node));
        Ok(handle)
    }

    async fn add_link(&self, link: Link) -> Result<Handle> {
        let handle = link.handle();
        self.atoms.insert(handle.clone(), Atom::Link(link));
        Ok(handle)
    }

    async fn add_atoms(
        &self,
        atoms: Vec<Atom>,
        toplevel: bool,
        _reindex: bool,
    ) -> Result<Vec<Handle>> {
        let mut handles = Vec::with_capacity(atoms.len());
        for atom in atoms {
            let handle = match atom {
                Atom::Node(node) => self.add_node(node).await?,
                Atom::Link(mut link) => {
                    link.toplevel = link.toplevel || toplevel;
                    self.add_link(link).await?
                }
            };
            handles.push(handle);
        }
        Ok(handles)
    }

    async fn delete_link(&self, handle: &Handle, cascade: bool) -> Result<bool> {
        let existed = match self.atoms.get(handle) {
            Some(entry) => entry.value().as_link().is_some(),
            None => false,
        };
        if !existed {
            return Ok(false);
        }
        self.atoms.remove(handle);
        if cascade {
            let referencing: Vec<Handle> = self
                .atoms
                .iter()
                .filter_map(|entry| match entry.value() {
                    Atom::Link(link) if link.targets.contains(handle) => Some(entry.key().clone()),
                    _ => None,
                })
                .collect();
            for parent in referencing {
                self.delete_link(&parent, true).await?;
            }
        }
        Ok(true)
    }

    async fn delete_node(&self, handle: &Handle, cascade: bool) -> Result<bool> {
        let existed = match self.atoms.get(handle) {
            Some(entry) => entry.value().as_node().is_some(),
            None => false,
        };
        if !existed {
            return Ok(false);
        }
        self.atoms.remove(handle);
        if cascade {
            let referencing: Vec<Handle> = self
                .atoms
                .iter()
                .filter_map(|entry| match entry.value() {
                    Atom::Link(link) if link.targets.contains(handle) => Some(entry.key().clone()),
                    _ => None,
                })
                .collect();
            for parent in referencing {
                self.delete_link(&parent, true).await?;
            }
        }
        Ok(true)
    }

    async fn query_for_pattern(&self, schema: &LinkSchema) -> Result<Vec<Handle>> {
        if let Some(handle) = schema.grounded_handle() {
            return Ok(if self.link_exists(&handle).await? {
                vec![handle]
            } else {
                Vec::new()
            });
        }
        let links = self.link_snapshot();
        let mut matches: Vec<Handle> = links
            .iter()
            .filter_map(|(handle, link)| {
                Self::matches_schema(&links, link, schema).then(|| handle.clone())
            })
            .collect();
        // Scan order over a DashMap is arbitrary; sort for reproducible
        // candidate streams.
        matches.sort();
        matches.dedup();
        Ok(matches)
    }

    async fn query_for_targets(&self, handle: &Handle) -> Result<Option<Vec<Handle>>> {
        Ok(self.atoms.get(handle).and_then(|entry| {
            entry
                .value()
                .as_link()
                .map(|link| link.targets.clone())
        }))
    }

    async fn add_pattern_index_schema(&self, tokens: &[String], entries: &[String]) -> Result<()> {
        self.index_schemas
            .lock()
            .push((tokens.to_vec(), entries.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn similarity_store() -> (InMemoryAtomStore, Handle, Handle) {
        let store = InMemoryAtomStore::new();
        let similarity = store
            .add_node(Node::new("Symbol", "Similarity"))
            .await
            .unwrap();
        let human = store.add_node(Node::new("Symbol", "human")).await.unwrap();
        let monkey = store.add_node(Node::new("Symbol", "monkey")).await.unwrap();
        let chimp = store.add_node(Node::new("Symbol", "chimp")).await.unwrap();
        store
            .add_link(Link::new(
                "Expression",
                vec![similarity.clone(), human.clone(), monkey.clone()],
            ))
            .await
            .unwrap();
        store
            .add_link(Link::new(
                "Expression",
                vec![similarity.clone(), human.clone(), chimp],
            ))
            .await
            .unwrap();
        (store, similarity, human)
    }

    #[tokio::test]
    async fn pattern_query_narrows_by_fixed_positions() {
        let (store, similarity, human) = similarity_store().await;
        let schema = LinkSchema::new(
            "Expression",
            vec![
                PatternTarget::Handle(similarity),
                PatternTarget::Handle(human),
                PatternTarget::Variable("v".to_string()),
            ],
        );
        let matches = store.query_for_pattern(&schema).await.unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[tokio::test]
    async fn grounded_pattern_resolves_to_single_link() {
        let (store, similarity, human) = similarity_store().await;
        let monkey = Handle::of_node("Symbol", "monkey");
        let schema = LinkSchema::new(
            "Expression",
            vec![
                PatternTarget::Handle(similarity),
                PatternTarget::Handle(human),
                PatternTarget::Handle(monkey),
            ],
        );
        let matches = store.query_for_pattern(&schema).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert!(store.link_exists(&matches[0]).await.unwrap());
    }

    #[tokio::test]
    async fn documents_expose_targets_and_type() {
        let (store, similarity, human) = similarity_store().await;
        let monkey = Handle::of_node("Symbol", "monkey");
        let link_handle = Handle::of_link(
            "Expression",
            &[similarity.clone(), human.clone(), monkey.clone()],
        );
        let document = store
            .get_atom_document(&link_handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(document.get("type"), Some("Expression"));
        assert_eq!(document.array_len("targets"), Some(3));
        assert_eq!(document.get_indexed("targets", 1), Some(human.as_str()));
    }

    #[tokio::test]
    async fn cascade_delete_removes_referencing_links() {
        let (store, _, human) = similarity_store().await;
        let before = store.len();
        assert!(store.delete_node(&human, true).await.unwrap());
        // The node and both Expression links referencing it are gone.
        assert_eq!(store.len(), before - 3);
    }

    #[tokio::test]
    async fn query_for_targets_distinguishes_nodes() {
        let (store, similarity, human) = similarity_store().await;
        assert_eq!(store.query_for_targets(&human).await.unwrap(), None);
        let monkey = Handle::of_node("Symbol", "monkey");
        let link_handle =
            Handle::of_link("Expression", &[similarity.clone(), human.clone(), monkey]);
        let targets = store
            .query_for_targets(&link_handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0], similarity);
    }
}
