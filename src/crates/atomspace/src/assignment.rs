//! Variable assignments produced by pattern matching.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::handle::Handle;

/// Mapping from variable name to atom handle.
///
/// Equality and hashing are order-independent over the full set of
/// `(name, handle)` pairs. The hash is computed once and cached, which
/// keeps de-duplication in the unique-assignment filter O(1) amortised.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Assignment {
    bindings: BTreeMap<String, Handle>,
    #[serde(skip)]
    cached_hash: OnceLock<u64>,
}

impl Assignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to `handle`. Returns false (and changes nothing) when
    /// `name` is already bound to a different handle.
    pub fn assign(&mut self, name: impl Into<String>, handle: Handle) -> bool {
        let name = name.into();
        match self.bindings.get(&name) {
            Some(existing) if *existing != handle => false,
            Some(_) => true,
            None => {
                self.bindings.insert(name, handle);
                self.cached_hash = OnceLock::new();
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Handle> {
        self.bindings.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Handle)> {
        self.bindings.iter()
    }

    /// True when no variable is bound to conflicting handles across the
    /// two assignments.
    pub fn is_compatible(&self, other: &Assignment) -> bool {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small
            .bindings
            .iter()
            .all(|(name, handle)| match large.bindings.get(name) {
                Some(existing) => existing == handle,
                None => true,
            })
    }

    /// Union of the two assignments, or `None` on a binding conflict.
    pub fn merge(&self, other: &Assignment) -> Option<Assignment> {
        if !self.is_compatible(other) {
            return None;
        }
        let mut bindings = self.bindings.clone();
        for (name, handle) in &other.bindings {
            bindings.insert(name.clone(), handle.clone());
        }
        Some(Assignment {
            bindings,
            cached_hash: OnceLock::new(),
        })
    }

    fn hash_value(&self) -> u64 {
        *self.cached_hash.get_or_init(|| {
            use std::collections::hash_map::DefaultHasher;
            let mut hasher = DefaultHasher::new();
            // BTreeMap iteration is sorted, so this is order-independent
            // with respect to insertion.
            for (name, handle) in &self.bindings {
                name.hash(&mut hasher);
                handle.hash(&mut hasher);
            }
            hasher.finish()
        })
    }
}

impl PartialEq for Assignment {
    fn eq(&self, other: &Self) -> bool {
        self.bindings == other.bindings
    }
}

impl Eq for Assignment {}

impl Hash for Assignment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_value());
    }
}

impl std::fmt::Display for Assignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for (name, handle) in &self.bindings {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{} -> {}", name, handle)?;
            first = false;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn handle(n: u8) -> Handle {
        Handle::of_node("Symbol", &format!("atom-{}", n))
    }

    #[test]
    fn assign_rejects_conflicting_rebinding() {
        let mut assignment = Assignment::new();
        assert!(assignment.assign("v1", handle(1)));
        assert!(assignment.assign("v1", handle(1)));
        assert!(!assignment.assign("v1", handle(2)));
        assert_eq!(assignment.get("v1"), Some(&handle(1)));
    }

    #[test]
    fn equality_is_insertion_order_independent() {
        let mut a = Assignment::new();
        a.assign("v1", handle(1));
        a.assign("v2", handle(2));
        let mut b = Assignment::new();
        b.assign("v2", handle(2));
        b.assign("v1", handle(1));
        assert_eq!(a, b);

        use std::collections::hash_map::DefaultHasher;
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn merge_detects_conflicts() {
        let mut a = Assignment::new();
        a.assign("v1", handle(1));
        a.assign("shared", handle(3));
        let mut b = Assignment::new();
        b.assign("v2", handle(2));
        b.assign("shared", handle(3));
        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.get("v2"), Some(&handle(2)));

        let mut conflicting = Assignment::new();
        conflicting.assign("shared", handle(9));
        assert!(a.merge(&conflicting).is_none());
        assert!(!a.is_compatible(&conflicting));
    }

    fn arb_assignment() -> impl Strategy<Value = Assignment> {
        proptest::collection::btree_map("v[0-9]", 0u8..8, 0..5).prop_map(|map| {
            let mut assignment = Assignment::new();
            for (name, n) in map {
                assignment.assign(name, handle(n));
            }
            assignment
        })
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in arb_assignment(), b in arb_assignment()) {
            prop_assert_eq!(a.merge(&b), b.merge(&a));
        }

        #[test]
        fn merge_with_self_is_identity(a in arb_assignment()) {
            prop_assert_eq!(a.merge(&a), Some(a.clone()));
        }

        #[test]
        fn merged_assignment_is_compatible_with_parts(
            a in arb_assignment(),
            b in arb_assignment(),
        ) {
            if let Some(merged) = a.merge(&b) {
                prop_assert!(merged.is_compatible(&a));
                prop_assert!(merged.is_compatible(&b));
            }
        }
    }
}
