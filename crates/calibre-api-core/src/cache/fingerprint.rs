//! Query fingerprints and invalidation patterns
//!
//! A fingerprint is the endpoint name followed by the request's filters as a
//! sorted, lowercased query string: `search?author=herbert&limit=100&title=dune`.
//! Keys and values are trimmed and lowercased, blank values dropped, repeated
//! keys merged into a sorted set, so parameter order and casing never matter.

use crate::error::CacheError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Endpoint name of the statistics snapshot (it has no parameters)
pub const STATISTICS_ENDPOINT: &str = "statistics";

/// Deterministic cache key for a query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of a parameterless endpoint
    pub fn constant(endpoint: &str) -> Self {
        Self(endpoint.trim().to_lowercase())
    }

    pub fn statistics() -> Self {
        Self::constant(STATISTICS_ENDPOINT)
    }

    pub fn book(id: i64) -> Self {
        Self::from_pairs("book", [("id", id.to_string())])
    }

    /// Fingerprint of an endpoint plus its parameters
    pub fn from_pairs<I, K, V>(endpoint: &str, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut fields: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (key, value) in pairs {
            let key = key.as_ref().trim().to_lowercase();
            let value = value.as_ref().trim().to_lowercase();
            if key.is_empty() || value.is_empty() {
                continue;
            }
            fields.entry(key).or_default().insert(value);
        }

        if fields.is_empty() {
            return Self::constant(endpoint);
        }

        let query = fields
            .iter()
            .map(|(key, values)| {
                let values: Vec<String> = values.iter().map(|v| escape(v)).collect();
                format!("{}={}", escape(key), values.join(","))
            })
            .collect::<Vec<_>>()
            .join("&");

        Self(format!("{}?{}", endpoint.trim().to_lowercase(), query))
    }

    /// Rebuild a fingerprint from its stored form
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Endpoint part (before `?`)
    pub fn endpoint(&self) -> &str {
        self.0.split_once('?').map_or(self.0.as_str(), |(endpoint, _)| endpoint)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Percent-escape the characters that structure a fingerprint
///
/// Escapes are lower-case so a fingerprint survives pattern lowercasing.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            ',' => out.push_str("%2c"),
            '=' => out.push_str("%3d"),
            '?' => out.push_str("%3f"),
            _ => out.push(c),
        }
    }
    out
}

/// Glob over fingerprints: `*` matches any run of characters
///
/// `search*` selects every search, `*` selects everything, a pattern without
/// `*` selects exactly one fingerprint.
#[derive(Debug, Clone)]
pub struct FingerprintPattern {
    raw: String,
    regex: Regex,
}

impl FingerprintPattern {
    pub fn parse(pattern: &str) -> Result<Self, CacheError> {
        let raw = pattern.trim().to_lowercase();
        let body = raw
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        let regex = Regex::new(&format!("^{}$", body)).map_err(|source| {
            CacheError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;

        Ok(Self { raw, regex })
    }

    pub fn matches(&self, fingerprint: &Fingerprint) -> bool {
        self.regex.is_match(fingerprint.as_str())
    }

    /// The single fingerprint this pattern names, if it has no wildcard
    pub fn exact(&self) -> Option<Fingerprint> {
        (!self.raw.contains('*')).then(|| Fingerprint::from_raw(self.raw.clone()))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_and_case_independent() {
        let a = Fingerprint::from_pairs("search", [("title", "Dune"), ("author", "Herbert")]);
        let b = Fingerprint::from_pairs("SEARCH", [("Author", " HERBERT "), ("TITLE", "dune")]);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "search?author=herbert&title=dune");
    }

    #[test]
    fn test_repeated_keys_are_merged_and_sorted() {
        let a = Fingerprint::from_pairs("search", [("tags", "b"), ("tags", "a"), ("tags", "B")]);
        let b = Fingerprint::from_pairs("search", [("tags", "a"), ("tags", "b")]);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "search?tags=a,b");
    }

    #[test]
    fn test_blank_values_dropped() {
        let fp = Fingerprint::from_pairs("search", [("title", "  "), ("", "x")]);
        assert_eq!(fp, Fingerprint::constant("search"));
    }

    #[test]
    fn test_separators_are_escaped() {
        // Without escaping both would render as title=a&b=c
        let a = Fingerprint::from_pairs("search", [("title", "a&b=c")]);
        let b = Fingerprint::from_pairs("search", [("title", "a"), ("b", "c")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_escaped_fingerprint_matches_its_own_pattern() {
        let fp = Fingerprint::from_pairs("search", [("title", "a,b=c?d")]);
        assert_eq!(fp.as_str(), "search?title=a%2cb%3dc%3fd");

        let pattern = FingerprintPattern::parse(fp.as_str()).unwrap();
        assert!(pattern.matches(&fp));
        assert_eq!(pattern.exact(), Some(fp.clone()));

        let shouted = FingerprintPattern::parse(&fp.as_str().to_uppercase()).unwrap();
        assert!(shouted.matches(&fp));

        let prefix = FingerprintPattern::parse("search?title=a%2c*").unwrap();
        assert!(prefix.matches(&fp));
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(Fingerprint::statistics().endpoint(), "statistics");
        assert_eq!(Fingerprint::book(42).endpoint(), "book");
        assert_eq!(Fingerprint::book(42).as_str(), "book?id=42");
    }

    #[test]
    fn test_pattern_matching() {
        let searches = FingerprintPattern::parse("search*").unwrap();
        assert!(searches.matches(&Fingerprint::from_pairs("search", [("title", "dune")])));
        assert!(!searches.matches(&Fingerprint::statistics()));
        assert!(searches.exact().is_none());

        let all = FingerprintPattern::parse("*").unwrap();
        assert!(all.matches(&Fingerprint::book(1)));

        let exact = FingerprintPattern::parse("Statistics").unwrap();
        assert!(exact.matches(&Fingerprint::statistics()));
        assert_eq!(exact.exact(), Some(Fingerprint::statistics()));
    }

    #[test]
    fn test_pattern_treats_regex_metacharacters_literally() {
        let pattern = FingerprintPattern::parse("search?title=d.ne").unwrap();
        assert!(pattern.matches(&Fingerprint::from_raw("search?title=d.ne")));
        assert!(!pattern.matches(&Fingerprint::from_raw("search?title=dune")));
    }
}
