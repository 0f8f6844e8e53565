//! Atoms: typed nodes and links with content-addressed handles.

use commons::tokens::{self, TokenError};
use commons::Properties;
use serde::{Deserialize, Serialize};

use crate::handle::Handle;

/// A node: type plus name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_type: String,
    pub name: String,
}

impl Node {
    pub fn new(node_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            name: name.into(),
        }
    }

    pub fn handle(&self) -> Handle {
        Handle::of_node(&self.node_type, &self.name)
    }
}

/// A link: type plus ordered target handles, an optional toplevel flag
/// and a property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub link_type: String,
    pub targets: Vec<Handle>,
    pub toplevel: bool,
    pub properties: Properties,
}

impl Link {
    pub fn new(link_type: impl Into<String>, targets: Vec<Handle>) -> Self {
        Self {
            link_type: link_type.into(),
            targets,
            toplevel: false,
            properties: Properties::new(),
        }
    }

    pub fn toplevel(mut self) -> Self {
        self.toplevel = true;
        self
    }

    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<commons::PropertyValue>,
    ) -> Self {
        self.properties.set(key, value);
        self
    }

    pub fn arity(&self) -> usize {
        self.targets.len()
    }

    pub fn handle(&self) -> Handle {
        Handle::of_link(&self.link_type, &self.targets)
    }
}

/// Either a node or a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Atom {
    Node(Node),
    Link(Link),
}

impl Atom {
    pub fn handle(&self) -> Handle {
        match self {
            Atom::Node(node) => node.handle(),
            Atom::Link(link) => link.handle(),
        }
    }

    pub fn atom_type(&self) -> &str {
        match self {
            Atom::Node(node) => &node.node_type,
            Atom::Link(link) => &link.link_type,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Atom::Node(node) => Some(node),
            Atom::Link(_) => None,
        }
    }

    pub fn as_link(&self) -> Option<&Link> {
        match self {
            Atom::Link(link) => Some(link),
            Atom::Node(_) => None,
        }
    }

    /// Appends the token encoding used when atoms cross the bus
    /// (`NODE type name` or `LINK type arity targets… toplevel props`).
    pub fn to_tokens(&self, out: &mut Vec<String>) {
        match self {
            Atom::Node(node) => {
                out.push("NODE".to_string());
                out.push(node.node_type.clone());
                out.push(node.name.clone());
            }
            Atom::Link(link) => {
                out.push("LINK".to_string());
                out.push(link.link_type.clone());
                out.push(link.arity().to_string());
                for target in &link.targets {
                    out.push(target.to_string());
                }
                tokens::push_flag(out, link.toplevel);
                link.properties.to_tokens(out);
            }
        }
    }

    /// Consumes one atom encoding from the front of the stream.
    pub fn from_tokens(stream: &mut Vec<String>) -> Result<Atom, TokenError> {
        let tag = tokens::take(stream)?;
        match tag.as_str() {
            "NODE" => {
                let node_type = tokens::take(stream)?;
                let name = tokens::take(stream)?;
                Ok(Atom::Node(Node::new(node_type, name)))
            }
            "LINK" => {
                let link_type = tokens::take(stream)?;
                let arity: usize = tokens::take_parse(stream)?;
                let mut targets = Vec::with_capacity(arity);
                for _ in 0..arity {
                    let raw = tokens::take(stream)?;
                    let handle = raw
                        .parse::<Handle>()
                        .map_err(|e| TokenError::invalid(raw, e.to_string()))?;
                    targets.push(handle);
                }
                let toplevel = tokens::take_flag(stream)?;
                let properties = Properties::from_tokens(stream)?;
                Ok(Atom::Link(Link {
                    link_type,
                    targets,
                    toplevel,
                    properties,
                }))
            }
            _ => Err(TokenError::invalid(tag, "expected NODE or LINK")),
        }
    }
}

impl From<Node> for Atom {
    fn from(node: Node) -> Self {
        Atom::Node(node)
    }
}

impl From<Link> for Atom {
    fn from(link: Link) -> Self {
        Atom::Link(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_handle_covers_type_and_targets() {
        let human = Node::new("Symbol", "human");
        let monkey = Node::new("Symbol", "monkey");
        let link = Link::new("Similarity", vec![human.handle(), monkey.handle()]);
        assert_eq!(
            link.handle(),
            Handle::of_link("Similarity", &[human.handle(), monkey.handle()])
        );
    }

    #[test]
    fn node_token_round_trip() {
        let atom: Atom = Node::new("Symbol", "human").into();
        let mut stream = Vec::new();
        atom.to_tokens(&mut stream);
        let decoded = Atom::from_tokens(&mut stream).unwrap();
        assert_eq!(decoded, atom);
        assert!(stream.is_empty());
    }

    #[test]
    fn link_token_round_trip() {
        let human = Node::new("Symbol", "human");
        let monkey = Node::new("Symbol", "monkey");
        let atom: Atom = Link::new("Similarity", vec![human.handle(), monkey.handle()])
            .toplevel()
            .with_property("strength", 0.9)
            .into();
        let mut stream = Vec::new();
        atom.to_tokens(&mut stream);
        stream.push("next".to_string());
        let decoded = Atom::from_tokens(&mut stream).unwrap();
        assert_eq!(decoded, atom);
        assert_eq!(stream, vec!["next".to_string()]);
    }

    #[test]
    fn malformed_atom_tag_is_rejected() {
        let mut stream = vec!["EDGE".to_string()];
        assert!(Atom::from_tokens(&mut stream).is_err());
    }
}
