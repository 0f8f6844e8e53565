//! One match of a query: bound handles, the assignment that produced
//! them, and a strength/importance pair.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::assignment::Assignment;
use crate::error::AtomSpaceError;
use crate::handle::Handle;

/// A single query match flowing through the dataflow graph.
///
/// Answers move by value along the graph; operators may mutate
/// `strength`. `importance` is the attention value used by the Or
/// operator's greedy selection and is never negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub handles: Vec<Handle>,
    pub assignment: Assignment,
    /// Fitness of the match in `[0, 1]`.
    pub strength: f64,
    /// Attention-derived importance, `>= 0`.
    pub importance: f64,
    /// Optional rendered representation per handle.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub representations: HashMap<Handle, String>,
}

impl QueryAnswer {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
            assignment: Assignment::new(),
            strength: 1.0,
            importance: 0.0,
            representations: HashMap::new(),
        }
    }

    pub fn with_handle(handle: Handle, importance: f64) -> Self {
        let mut answer = Self::new();
        answer.handles.push(handle);
        answer.importance = importance;
        answer
    }

    /// Joins two answers: handles concatenated, assignments merged.
    /// Returns `None` when the assignments bind a variable to
    /// conflicting handles. Strength combines as the weakest clause,
    /// importance as the strongest.
    pub fn join(&self, other: &QueryAnswer) -> Option<QueryAnswer> {
        let assignment = self.assignment.merge(&other.assignment)?;
        let mut handles = self.handles.clone();
        handles.extend(other.handles.iter().cloned());
        let mut representations = self.representations.clone();
        for (handle, rendered) in &other.representations {
            representations.insert(handle.clone(), rendered.clone());
        }
        Some(QueryAnswer {
            handles,
            assignment,
            strength: self.strength.min(other.strength),
            importance: self.importance.max(other.importance),
            representations,
        })
    }

    /// Serializes the answer into the single string token carried inside
    /// an answer bundle.
    pub fn to_token(&self) -> String {
        serde_json::to_string(self).expect("query answer serialization cannot fail")
    }

    /// Decodes an answer-bundle token.
    pub fn from_token(token: &str) -> Result<Self, AtomSpaceError> {
        serde_json::from_str(token).map_err(|e| AtomSpaceError::Decode(e.to_string()))
    }
}

impl Default for QueryAnswer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueryAnswer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QueryAnswer[strength={:.3}, importance={:.3}, handles=[", self.strength, self.importance)?;
        for (i, handle) in self.handles.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", handle)?;
        }
        write!(f, "], assignment={}]", self.assignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str) -> Handle {
        Handle::of_node("Symbol", name)
    }

    #[test]
    fn token_round_trip() {
        let mut answer = QueryAnswer::with_handle(handle("link"), 0.7);
        answer.assignment.assign("v1", handle("human"));
        answer.strength = 0.5;
        answer
            .representations
            .insert(handle("link"), "(Similarity human monkey)".to_string());

        let decoded = QueryAnswer::from_token(&answer.to_token()).unwrap();
        assert_eq!(decoded, answer);
    }

    #[test]
    fn join_merges_compatible_answers() {
        let mut left = QueryAnswer::with_handle(handle("l1"), 0.2);
        left.assignment.assign("v1", handle("human"));
        left.strength = 0.9;
        let mut right = QueryAnswer::with_handle(handle("l2"), 0.8);
        right.assignment.assign("v1", handle("human"));
        right.assignment.assign("v2", handle("plant"));
        right.strength = 0.4;

        let joined = left.join(&right).unwrap();
        assert_eq!(joined.handles, vec![handle("l1"), handle("l2")]);
        assert_eq!(joined.assignment.len(), 2);
        assert_eq!(joined.strength, 0.4);
        assert_eq!(joined.importance, 0.8);
    }

    #[test]
    fn join_rejects_conflicting_bindings() {
        let mut left = QueryAnswer::with_handle(handle("l1"), 0.0);
        left.assignment.assign("v1", handle("human"));
        let mut right = QueryAnswer::with_handle(handle("l2"), 0.0);
        right.assignment.assign("v1", handle("snake"));
        assert!(left.join(&right).is_none());
    }

    #[test]
    fn malformed_token_is_rejected() {
        assert!(QueryAnswer::from_token("not json").is_err());
    }
}
