//! Link patterns handed to the atom store.
//!
//! A [`LinkSchema`] describes the links a template matches: a concrete
//! link type plus one pattern per target position. Variables bind the
//! target handle; nested schemas match sub-links.

use serde::{Deserialize, Serialize};

use crate::handle::Handle;

/// Pattern for one target position of a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PatternTarget {
    /// A concrete node, matched by its computed handle.
    Node { node_type: String, name: String },
    /// An untyped variable, binds whatever handle sits in the position.
    Variable(String),
    /// A literal handle.
    Handle(Handle),
    /// A nested link pattern.
    SubSchema(LinkSchema),
}

impl PatternTarget {
    /// Handle this pattern requires in its position, when it pins one.
    pub fn fixed_handle(&self) -> Option<Handle> {
        match self {
            PatternTarget::Node { node_type, name } => Some(Handle::of_node(node_type, name)),
            PatternTarget::Handle(handle) => Some(handle.clone()),
            PatternTarget::Variable(_) | PatternTarget::SubSchema(_) => None,
        }
    }
}

/// A link pattern: concrete type, fixed arity, one pattern per target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSchema {
    pub link_type: String,
    pub targets: Vec<PatternTarget>,
}

impl LinkSchema {
    pub fn new(link_type: impl Into<String>, targets: Vec<PatternTarget>) -> Self {
        Self {
            link_type: link_type.into(),
            targets,
        }
    }

    pub fn arity(&self) -> usize {
        self.targets.len()
    }

    /// Names of all variables anywhere in the pattern, in position order.
    pub fn variables(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables(&self, names: &mut Vec<String>) {
        for target in &self.targets {
            match target {
                PatternTarget::Variable(name) => {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
                PatternTarget::SubSchema(schema) => schema.collect_variables(names),
                _ => {}
            }
        }
    }

    /// True when the pattern contains no variables or sub-patterns, i.e.
    /// it pins exactly one link handle.
    pub fn is_fully_grounded(&self) -> bool {
        self.targets
            .iter()
            .all(|target| target.fixed_handle().is_some())
    }

    /// The single handle a fully grounded pattern matches.
    pub fn grounded_handle(&self) -> Option<Handle> {
        let mut targets = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            targets.push(target.fixed_handle()?);
        }
        Some(Handle::of_link(&self.link_type, &targets))
    }
}

impl std::fmt::Display for LinkSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.link_type)?;
        for target in &self.targets {
            match target {
                PatternTarget::Node { node_type, name } => write!(f, " {}:{}", node_type, name)?,
                PatternTarget::Variable(name) => write!(f, " ${}", name)?,
                PatternTarget::Handle(handle) => write!(f, " #{}", handle)?,
                PatternTarget::SubSchema(schema) => write!(f, " {}", schema)?,
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn similarity_schema() -> LinkSchema {
        LinkSchema::new(
            "Expression",
            vec![
                PatternTarget::Node {
                    node_type: "Symbol".to_string(),
                    name: "Similarity".to_string(),
                },
                PatternTarget::Variable("v1".to_string()),
                PatternTarget::Variable("v2".to_string()),
            ],
        )
    }

    #[test]
    fn variables_are_collected_in_order_without_duplicates() {
        let schema = LinkSchema::new(
            "Expression",
            vec![
                PatternTarget::Variable("v2".to_string()),
                PatternTarget::SubSchema(similarity_schema()),
                PatternTarget::Variable("v1".to_string()),
            ],
        );
        assert_eq!(schema.variables(), vec!["v2", "v1"]);
    }

    #[test]
    fn grounded_schema_pins_one_handle() {
        let human = Handle::of_node("Symbol", "human");
        let monkey = Handle::of_node("Symbol", "monkey");
        let schema = LinkSchema::new(
            "Similarity",
            vec![
                PatternTarget::Handle(human.clone()),
                PatternTarget::Node {
                    node_type: "Symbol".to_string(),
                    name: "monkey".to_string(),
                },
            ],
        );
        assert!(schema.is_fully_grounded());
        assert_eq!(
            schema.grounded_handle(),
            Some(Handle::of_link("Similarity", &[human, monkey]))
        );
        assert!(!similarity_schema().is_fully_grounded());
        assert_eq!(similarity_schema().grounded_handle(), None);
    }
}
