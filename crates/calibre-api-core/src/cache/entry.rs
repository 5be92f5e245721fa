//! Cached query results

use super::Fingerprint;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// How a freshly computed entry should be stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOptions {
    pub ttl: Duration,

    /// Source revision the result was computed against. Lookups made with a
    /// stamp only accept entries carrying the same stamp.
    pub source_stamp: Option<i64>,
}

impl EntryOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            source_stamp: None,
        }
    }

    pub fn with_source_stamp(mut self, stamp: Option<i64>) -> Self {
        self.source_stamp = stamp;
        self
    }
}

/// A serialized query result and its lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,

    /// JSON document handed back to callers byte for byte
    pub payload: String,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source_stamp: Option<i64>,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, payload: String, options: &EntryOptions) -> Self {
        Self::created_at(fingerprint, payload, options, Utc::now())
    }

    pub fn created_at(
        fingerprint: Fingerprint,
        payload: String,
        options: &EntryOptions,
        created_at: DateTime<Utc>,
    ) -> Self {
        let expires_at = chrono::Duration::from_std(options.ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            fingerprint,
            payload,
            created_at,
            expires_at,
            source_stamp: options.source_stamp,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Usable for a lookup made at `now` against source revision `stamp`
    pub fn is_fresh(&self, now: DateTime<Utc>, stamp: Option<i64>) -> bool {
        !self.is_expired_at(now) && (stamp.is_none() || self.source_stamp == stamp)
    }

    /// Time left before expiry (zero once expired)
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}
