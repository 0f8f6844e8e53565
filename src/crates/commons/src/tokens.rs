//! Helpers for the front-consuming token streams used by proxy
//! serializers. Each layer of a proxy writes a fixed prefix of tokens and
//! the matching reader consumes the same prefix left to right.

use std::str::FromStr;

use thiserror::Error;

/// Failure while decoding a token stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("unexpected end of token stream")]
    Eof,
    #[error("invalid token {token:?}: {reason}")]
    Invalid { token: String, reason: String },
}

impl TokenError {
    pub fn invalid(token: impl Into<String>, reason: impl Into<String>) -> Self {
        TokenError::Invalid {
            token: token.into(),
            reason: reason.into(),
        }
    }
}

/// Removes and returns the first token.
pub fn take(tokens: &mut Vec<String>) -> Result<String, TokenError> {
    if tokens.is_empty() {
        return Err(TokenError::Eof);
    }
    Ok(tokens.remove(0))
}

/// Removes the first token and parses it as `T`.
pub fn take_parse<T>(tokens: &mut Vec<String>) -> Result<T, TokenError>
where
    T: FromStr,
{
    let token = take(tokens)?;
    token
        .parse()
        .map_err(|_| TokenError::invalid(token, format!("expected {}", std::any::type_name::<T>())))
}

/// Removes the first token expecting a `0`/`1` boolean.
pub fn take_flag(tokens: &mut Vec<String>) -> Result<bool, TokenError> {
    let token = take(tokens)?;
    match token.as_str() {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(TokenError::invalid(token, "expected 0 or 1")),
    }
}

/// Writes a boolean as `0`/`1`.
pub fn push_flag(tokens: &mut Vec<String>, flag: bool) {
    tokens.push(if flag { "1" } else { "0" }.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_from_front() {
        let mut tokens = vec!["a".to_string(), "b".to_string()];
        assert_eq!(take(&mut tokens).unwrap(), "a");
        assert_eq!(take(&mut tokens).unwrap(), "b");
        assert_eq!(take(&mut tokens), Err(TokenError::Eof));
    }

    #[test]
    fn take_parse_reports_bad_numbers() {
        let mut tokens = vec!["12".to_string(), "oops".to_string()];
        assert_eq!(take_parse::<u32>(&mut tokens).unwrap(), 12);
        assert!(take_parse::<u32>(&mut tokens).is_err());
    }

    #[test]
    fn flags_round_trip() {
        let mut tokens = Vec::new();
        push_flag(&mut tokens, true);
        push_flag(&mut tokens, false);
        assert_eq!(take_flag(&mut tokens).unwrap(), true);
        assert_eq!(take_flag(&mut tokens).unwrap(), false);
    }
}
