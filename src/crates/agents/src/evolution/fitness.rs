//! Fitness functions for the query evolver.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use atomspace::{AtomStore, QueryAnswer};

use crate::error::AgentError;
use crate::Result;

/// Scores one query answer in `[0, 1]`.
#[async_trait]
pub trait FitnessFunction: Send + Sync {
    async fn evaluate(&self, store: &dyn AtomStore, answer: &QueryAnswer) -> Result<f64>;
}

/// Named registry the `fitness_function` parameter resolves through.
pub struct FitnessFunctionRegistry {
    functions: HashMap<String, Arc<dyn FitnessFunction>>,
}

impl FitnessFunctionRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            functions: HashMap::new(),
        };
        registry.register("multiply_strength", Arc::new(MultiplyStrength));
        registry.register("mean_strength", Arc::new(MeanStrength));
        registry.register("count_letter", Arc::new(CountLetter { letter: 'a' }));
        registry
    }

    pub fn register(&mut self, tag: impl Into<String>, function: Arc<dyn FitnessFunction>) {
        self.functions.insert(tag.into(), function);
    }

    pub fn get(&self, tag: &str) -> Result<Arc<dyn FitnessFunction>> {
        self.functions
            .get(tag)
            .cloned()
            .ok_or_else(|| AgentError::UnknownFitnessFunction(tag.to_string()))
    }
}

impl Default for FitnessFunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

async fn strength_of(store: &dyn AtomStore, answer: &QueryAnswer) -> Result<Vec<f64>> {
    let mut strengths = Vec::with_capacity(answer.handles.len());
    for handle in &answer.handles {
        let strength = match store.get_atom_document(handle).await? {
            Some(document) => document
                .get("strength")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(1.0),
            None => 1.0,
        };
        strengths.push(strength);
    }
    Ok(strengths)
}

/// Product of the strengths of every link in the answer.
pub struct MultiplyStrength;

#[async_trait]
impl FitnessFunction for MultiplyStrength {
    async fn evaluate(&self, store: &dyn AtomStore, answer: &QueryAnswer) -> Result<f64> {
        Ok(strength_of(store, answer).await?.iter().product())
    }
}

/// Mean of the strengths of every link in the answer.
pub struct MeanStrength;

#[async_trait]
impl FitnessFunction for MeanStrength {
    async fn evaluate(&self, store: &dyn AtomStore, answer: &QueryAnswer) -> Result<f64> {
        let strengths = strength_of(store, answer).await?;
        if strengths.is_empty() {
            return Ok(0.0);
        }
        Ok(strengths.iter().sum::<f64>() / strengths.len() as f64)
    }
}

/// Toy function: frequency of a letter across the bound node names.
/// Kept for tests and demos.
pub struct CountLetter {
    pub letter: char,
}

#[async_trait]
impl FitnessFunction for CountLetter {
    async fn evaluate(&self, store: &dyn AtomStore, answer: &QueryAnswer) -> Result<f64> {
        let mut hits = 0usize;
        let mut total = 0usize;
        for (_, handle) in answer.assignment.iter() {
            if let Some(atomspace::Atom::Node(node)) = store.get_atom(handle).await? {
                hits += node.name.chars().filter(|c| *c == self.letter).count();
                total += node.name.chars().count();
            }
        }
        if total == 0 {
            return Ok(0.0);
        }
        Ok(hits as f64 / total as f64)
    }
}
