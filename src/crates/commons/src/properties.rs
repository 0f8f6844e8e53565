//! Typed property bag carried by bus command proxies.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tokens::{self, TokenError};

/// A tagged parameter value: text, integer, real or boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
}

impl PropertyValue {
    fn kind_tag(&self) -> &'static str {
        match self {
            PropertyValue::Text(_) => "s",
            PropertyValue::Integer(_) => "i",
            PropertyValue::Real(_) => "r",
            PropertyValue::Boolean(_) => "b",
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::Integer(value as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Real(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Boolean(value)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Text(text) => write!(f, "'{}'", text),
            PropertyValue::Integer(value) => write!(f, "{}", value),
            PropertyValue::Real(value) => write!(f, "{}", value),
            PropertyValue::Boolean(value) => write!(f, "{}", value),
        }
    }
}

/// String-keyed map of [`PropertyValue`]. Keys are unique; presentation
/// order is always sorted by key so stringification is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    entries: BTreeMap<String, PropertyValue>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.get(key)
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(PropertyValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn get_integer(&self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(PropertyValue::Integer(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_real(&self, key: &str) -> Option<f64> {
        match self.entries.get(key) {
            Some(PropertyValue::Real(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_boolean(&self, key: &str) -> Option<bool> {
        match self.entries.get(key) {
            Some(PropertyValue::Boolean(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.entries.iter()
    }

    /// Appends `count (key kind value)*` to the token stream.
    pub fn to_tokens(&self, out: &mut Vec<String>) {
        out.push(self.entries.len().to_string());
        for (key, value) in &self.entries {
            out.push(key.clone());
            out.push(value.kind_tag().to_string());
            out.push(value.to_token());
        }
    }

    /// Consumes `count (key kind value)*` from the front of the stream.
    pub fn from_tokens(tokens: &mut Vec<String>) -> Result<Self, TokenError> {
        let count: usize = tokens::take_parse(tokens)?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let key = tokens::take(tokens)?;
            let kind = tokens::take(tokens)?;
            let raw = tokens::take(tokens)?;
            let value = PropertyValue::from_token(&kind, &raw)?;
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }
}

impl PropertyValue {
    fn to_token(&self) -> String {
        match self {
            PropertyValue::Text(text) => text.clone(),
            PropertyValue::Integer(value) => value.to_string(),
            PropertyValue::Real(value) => value.to_string(),
            PropertyValue::Boolean(value) => if *value { "1" } else { "0" }.to_string(),
        }
    }

    fn from_token(kind: &str, raw: &str) -> Result<Self, TokenError> {
        match kind {
            "s" => Ok(PropertyValue::Text(raw.to_string())),
            "i" => raw
                .parse()
                .map(PropertyValue::Integer)
                .map_err(|_| TokenError::invalid(raw, "expected integer")),
            "r" => raw
                .parse()
                .map(PropertyValue::Real)
                .map_err(|_| TokenError::invalid(raw, "expected real")),
            "b" => match raw {
                "1" => Ok(PropertyValue::Boolean(true)),
                "0" => Ok(PropertyValue::Boolean(false)),
                _ => Err(TokenError::invalid(raw, "expected 0 or 1")),
            },
            _ => Err(TokenError::invalid(kind, "unknown property kind")),
        }
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for (key, value) in &self.entries {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", key, value)?;
            first = false;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters() {
        let mut props = Properties::new();
        props.set("name", "similarity");
        props.set("max", 1000i64);
        props.set("rate", 0.25);
        props.set("enabled", true);

        assert_eq!(props.get_text("name"), Some("similarity"));
        assert_eq!(props.get_integer("max"), Some(1000));
        assert_eq!(props.get_real("rate"), Some(0.25));
        assert_eq!(props.get_boolean("enabled"), Some(true));
        assert_eq!(props.get_boolean("max"), None);
        assert_eq!(props.get("missing"), None);
    }

    #[test]
    fn display_is_sorted_by_key() {
        let mut props = Properties::new();
        props.set("zulu", 1i64);
        props.set("alpha", "first");
        assert_eq!(props.to_string(), "{alpha: 'first', zulu: 1}");
    }

    #[test]
    fn token_round_trip() {
        let mut props = Properties::new();
        props.set("flag", false);
        props.set("limit", 42i64);
        props.set("tag", "abc def");
        props.set("weight", 1.5);

        let mut tokens = Vec::new();
        props.to_tokens(&mut tokens);
        tokens.push("trailing".to_string());

        let decoded = Properties::from_tokens(&mut tokens).unwrap();
        assert_eq!(decoded, props);
        assert_eq!(tokens, vec!["trailing".to_string()]);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let mut tokens = vec!["1".to_string(), "key".to_string()];
        assert!(Properties::from_tokens(&mut tokens).is_err());

        let mut tokens = vec![
            "1".to_string(),
            "key".to_string(),
            "x".to_string(),
            "v".to_string(),
        ];
        assert!(Properties::from_tokens(&mut tokens).is_err());
    }
}
