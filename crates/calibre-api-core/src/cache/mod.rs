//! Caching layer for calibre-api-core
//!
//! Memory tier (moka) in front of a SQLite durable tier, with single-flight
//! computation of misses.

pub mod entry;
pub mod fingerprint;
pub mod layer;
pub mod persistent;

pub use entry::{CacheEntry, EntryOptions};
pub use fingerprint::{Fingerprint, FingerprintPattern, STATISTICS_ENDPOINT};
pub use layer::{CacheStatus, QueryCache};
pub use persistent::{DurableStore, SqliteStore, StoreOptions, StoreStats, CACHE_DB};
