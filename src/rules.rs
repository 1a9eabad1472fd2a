//! Static routing rules.
//!
//! A rule maps a request key, either a hostname or a path key, to the name of a
//! service. Rules are loaded once at startup from a comma separated list of
//! `key:service` tuples, typically taken from the `RULES` environment variable:
//!
//! ```text
//! shop.example.com:default/shop, api.example.com:default/api
//! ```
//!
//! Malformed tuples are logged and skipped. When a key appears more than once
//! the last tuple wins.

use std::collections::BTreeMap;

const TUPLE_SEPARATOR: char = ',';
const FIELD_SEPARATOR: char = ':';
const WHITESPACE: &[char] = &[' ', '\t', '\n', '\r'];

/// A tuple that could not be parsed into a rule.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    /// The tuple has no `:` between key and service.
    #[error("failed to parse rule {rule:?} at index {index}: missing ':'")]
    MissingSeparator {
        /// One-based position of the tuple in the source.
        index: usize,
        /// The offending tuple.
        rule: String,
    },

    /// The key or service is empty after trimming.
    #[error("failed to parse rule {rule:?} at index {index}: empty host or service")]
    EmptyField {
        /// One-based position of the tuple in the source.
        index: usize,
        /// The offending tuple.
        rule: String,
    },
}

/// Lookup table from request keys to service names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleTable {
    rules: BTreeMap<String, String>,
}

impl RuleTable {
    /// Loads rules from `source`, logging and skipping malformed tuples.
    #[must_use]
    pub fn load(source: &str) -> Self {
        let (table, errors) = Self::parse(source);

        for error in &errors {
            tracing::warn!("{error}");
        }

        tracing::info!(rules = ?table.rules, "loaded routing rules");
        table
    }

    /// Parses rules from `source`, returning the table along with every tuple
    /// that was rejected.
    ///
    /// Blank tuples (an empty source, or a trailing comma) are skipped silently.
    #[must_use]
    pub fn parse(source: &str) -> (Self, Vec<RuleError>) {
        let mut rules = BTreeMap::new();
        let mut errors = Vec::new();

        for (idx, rule) in source.split(TUPLE_SEPARATOR).enumerate() {
            if rule.trim_matches(WHITESPACE).is_empty() {
                continue;
            }

            match parse_rule(idx + 1, rule) {
                Ok((key, service)) => {
                    rules.insert(key, service);
                }
                Err(error) => errors.push(error),
            }
        }

        (Self { rules }, errors)
    }

    /// Returns the service name mapped to `key`.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.rules.get(key).map(String::as_str)
    }

    /// Iterates over `(key, service)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rules.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Iterates over the rule keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true when no rule was loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RuleTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            rules: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Splits one tuple on its first separator.
fn parse_rule(index: usize, rule: &str) -> Result<(String, String), RuleError> {
    let Some((key, service)) = rule.split_once(FIELD_SEPARATOR) else {
        return Err(RuleError::MissingSeparator {
            index,
            rule: rule.to_string(),
        });
    };

    let (key, service) = (key.trim_matches(WHITESPACE), service.trim_matches(WHITESPACE));
    if key.is_empty() || service.is_empty() {
        return Err(RuleError::EmptyField {
            index,
            rule: rule.to_string(),
        });
    }

    Ok((key.to_string(), service.to_string()))
}
