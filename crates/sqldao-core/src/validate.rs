//! Identifier validation.
//!
//! Table names, column names and ordering specs flow into generated SQL, so
//! every name registered on a table or passed as a string ordering is checked
//! against a conservative identifier pattern first.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use regex::Regex;

use crate::error::{Error, OrmError};

/// Pattern every table and column name must match.
pub const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

/// Thread-safe cache of compiled patterns.
struct RegexCache {
    cache: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        let regex = Regex::new(pattern)?;
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Check if a string matches a regex pattern.
///
/// An invalid pattern is logged and treated as a non-match.
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match regex_cache().get_or_compile(pattern) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
            tracing::warn!(
                pattern = pattern,
                error = %e,
                "Invalid regex pattern, treating as non-match"
            );
            false
        }
    }
}

pub fn is_valid_identifier(name: &str) -> bool {
    matches_pattern(name, IDENTIFIER_PATTERN)
}

/// Validate a table or column name.
#[allow(clippy::result_large_err)]
pub fn validate_identifier(name: &str) -> Result<(), Error> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(OrmError::InvalidIdentifier {
            name: name.to_string(),
        }
        .into())
    }
}

/// Parse an ordering spec such as `"name"` or `"-name"`.
///
/// Returns the column name and whether the order is descending.
#[allow(clippy::result_large_err)]
pub fn parse_order_spec(spec: &str) -> Result<(String, bool), Error> {
    let (column, descending) = match spec.strip_prefix('-') {
        Some(rest) => (rest, true),
        None => (spec, false),
    };
    validate_identifier(column)?;
    Ok((column.to_string(), descending))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("country_id"));
        assert!(is_valid_identifier("_hidden"));
        assert!(!is_valid_identifier("1abc"));
        assert!(!is_valid_identifier("name; DROP TABLE x"));
        assert!(!is_valid_identifier(""));
        assert!(validate_identifier("bad name").is_err());
    }

    #[test]
    fn test_parse_order_spec() {
        assert_eq!(parse_order_spec("name").unwrap(), ("name".to_string(), false));
        assert_eq!(parse_order_spec("-name").unwrap(), ("name".to_string(), true));
        assert!(parse_order_spec("--name").is_err());
        assert!(parse_order_spec("-").is_err());
    }

    #[test]
    fn test_invalid_pattern_is_non_match() {
        assert!(!matches_pattern("abc", "("));
    }
}
