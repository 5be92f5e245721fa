//! Access gate: token validation ahead of any query or cache work
//!
//! The gate only answers "is this token acceptable". Where the token comes
//! from (header, query string) is the transport's business.

use crate::error::QueryError;
use std::collections::BTreeSet;
use std::fmt;

/// Longest token worth comparing; anything longer is rejected as malformed
pub const MAX_TOKEN_LEN: usize = 512;

/// Outcome of a token check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allowed,
    /// No token supplied
    Missing,
    /// Empty, oversized or not printable ASCII
    Malformed,
    /// Well-formed but not recognized
    Denied,
}

impl AuthDecision {
    pub fn is_allowed(self) -> bool {
        self == Self::Allowed
    }

    /// The error a rejected request reports, `None` when allowed
    pub fn into_error(self) -> Option<QueryError> {
        match self {
            Self::Allowed => None,
            Self::Missing | Self::Malformed => Some(QueryError::Unauthorized),
            Self::Denied => Some(QueryError::Forbidden),
        }
    }
}

/// Decides whether a request may proceed
pub trait Authorizer: Send + Sync {
    fn authorize(&self, token: Option<&str>) -> AuthDecision;
}

/// Whether `token` has an acceptable shape
pub fn is_well_formed(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token.bytes().all(|b| b.is_ascii_graphic())
}

/// Compare without short-circuiting on the first differing byte
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Fixed set of valid tokens from configuration
#[derive(Clone, Default)]
pub struct StaticTokenSet {
    tokens: BTreeSet<String>,
}

impl StaticTokenSet {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

// Never print the tokens themselves
impl fmt::Debug for StaticTokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenSet")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl Authorizer for StaticTokenSet {
    fn authorize(&self, token: Option<&str>) -> AuthDecision {
        let Some(token) = token else {
            return AuthDecision::Missing;
        };
        if !is_well_formed(token) {
            return AuthDecision::Malformed;
        }

        // Check every candidate so timing does not reveal which one matched
        let matched = self
            .tokens
            .iter()
            .fold(false, |found, valid| {
                constant_time_eq(valid.as_bytes(), token.as_bytes()) | found
            });

        if matched {
            AuthDecision::Allowed
        } else {
            AuthDecision::Denied
        }
    }
}
