use serde_json::Value;

use crate::{
    broker::{BrokerResult, Error},
    options::Table,
};

pub const X_MATCH: &str = "x-match";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    All,
    Any,
}

/// Reads the binding's `x-match` argument. `None` means the binding matches
/// every message.
pub fn match_type(arguments: &Table) -> BrokerResult<Option<MatchType>> {
    let Some(value) = arguments.get(X_MATCH) else {
        return Ok(None);
    };

    match value {
        Value::String(s) if s.eq_ignore_ascii_case("all") => {
            Ok(Some(MatchType::All))
        }
        Value::String(s) if s.eq_ignore_ascii_case("any") => {
            Ok(Some(MatchType::Any))
        }
        Value::String(s) => Err(Error::InvalidMatchType(s.clone())),
        other => Err(Error::InvalidMatchType(other.to_string())),
    }
}

/// Matches message headers against a binding's arguments, ignoring every
/// argument whose key starts with `x-`.
pub fn headers_match(arguments: &Table, headers: &Table) -> BrokerResult<bool> {
    let Some(match_type) = match_type(arguments)? else {
        return Ok(true);
    };

    let mut constraints = arguments
        .iter()
        .filter(|(key, _)| !key.starts_with("x-"))
        .map(|(key, expected)| headers.get(key) == Some(expected));

    Ok(match match_type {
        MatchType::All => constraints.all(|matched| matched),
        MatchType::Any => constraints.any(|matched| matched),
    })
}
