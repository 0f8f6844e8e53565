//! Content-addressed atom handles.
//!
//! A handle is a 32-character lowercase hex digest derived from the atom
//! type and contents, stable across processes. Derivation uses SHA-256
//! truncated to the handle width.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AtomSpaceError;

/// Number of hex characters in a handle.
pub const HANDLE_WIDTH: usize = 32;

/// Identifier of an atom, a context key, or any composite of handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Handle of a named atom type.
    pub fn of_type(atom_type: &str) -> Self {
        Self::digest(&["type", atom_type])
    }

    /// Handle of a node: type plus name.
    pub fn of_node(node_type: &str, name: &str) -> Self {
        Self::digest(&["node", node_type, name])
    }

    /// Handle of a link: type plus ordered target handles.
    pub fn of_link(link_type: &str, targets: &[Handle]) -> Self {
        let mut parts = vec!["link".to_string(), link_type.to_string()];
        parts.extend(targets.iter().map(|handle| handle.0.clone()));
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        Self::digest(&refs)
    }

    /// Key of a named attention context.
    pub fn of_context(name: &str) -> Self {
        Self::digest(&["context", name])
    }

    /// Handle of an arbitrary ordered composite of elements.
    pub fn composite(elements: &[&str]) -> Self {
        let mut parts = vec!["composite"];
        parts.extend_from_slice(elements);
        Self::digest(&parts)
    }

    fn digest(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(HANDLE_WIDTH);
        for byte in digest.iter().take(HANDLE_WIDTH / 2) {
            hex.push_str(&format!("{:02x}", byte));
        }
        Handle(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Handle {
    type Err = AtomSpaceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() != HANDLE_WIDTH {
            return Err(AtomSpaceError::MalformedHandle {
                handle: value.to_string(),
                reason: format!("expected {} hex characters", HANDLE_WIDTH),
            });
        }
        if !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AtomSpaceError::MalformedHandle {
                handle: value.to_string(),
                reason: "expected hex characters only".to_string(),
            });
        }
        Ok(Handle(value.to_ascii_lowercase()))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_deterministic() {
        let a = Handle::of_node("Symbol", "human");
        let b = Handle::of_node("Symbol", "human");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), HANDLE_WIDTH);
    }

    #[test]
    fn contents_change_the_handle() {
        assert_ne!(
            Handle::of_node("Symbol", "human"),
            Handle::of_node("Symbol", "monkey")
        );
        assert_ne!(
            Handle::of_node("Symbol", "human"),
            Handle::of_node("Concept", "human")
        );
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(Handle::of_node("ab", "c"), Handle::of_node("a", "bc"));
    }

    #[test]
    fn link_handles_depend_on_target_order() {
        let x = Handle::of_node("Symbol", "x");
        let y = Handle::of_node("Symbol", "y");
        assert_ne!(
            Handle::of_link("Similarity", &[x.clone(), y.clone()]),
            Handle::of_link("Similarity", &[y, x])
        );
    }

    #[test]
    fn parse_validates_width_and_charset() {
        let handle = Handle::of_node("Symbol", "human");
        let parsed: Handle = handle.as_str().parse().unwrap();
        assert_eq!(parsed, handle);

        assert!("short".parse::<Handle>().is_err());
        assert!("zz".repeat(16).parse::<Handle>().is_err());
    }
}
