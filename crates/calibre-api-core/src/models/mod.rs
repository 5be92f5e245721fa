//! Data models for calibre-api

pub mod book;
pub mod filters;
pub mod stats;

pub use book::{BookRecord, RawBookRecord};
pub use filters::{DateRange, SearchFilters, SearchParams, DEFAULT_LIMIT, MAX_LIMIT};
pub use stats::StatisticsSnapshot;
