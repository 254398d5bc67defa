//! Typed environment variable readers
//!
//! Missing values fall back to a default; malformed values are reported, so
//! `CATALOG_SYNC_REQUEST_BUDGET=9O` fails at startup instead of running with
//! the default budget.

use std::str::FromStr;

use crate::error::{LoamError, Result};

/// Read a variable, treating unset and blank values as absent.
pub fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Read a string variable with a default.
pub fn var_or(key: &str, default: &str) -> String {
    optional(key).unwrap_or_else(|| default.to_string())
}

/// Parse a variable, falling back to `default` when it is unset.
pub fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| LoamError::invalid_value(key, raw.clone(), e)),
        None => Ok(default),
    }
}

/// Parse a comma separated list, falling back to `default` when unset.
pub fn parse_list<T>(key: &str, default: &[T]) -> Result<Vec<T>>
where
    T: FromStr + Clone,
    T::Err: std::fmt::Display,
{
    let Some(raw) = optional(key) else {
        return Ok(default.to_vec());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse()
                .map_err(|e| LoamError::invalid_value(key, raw.clone(), e))
        })
        .collect()
}
