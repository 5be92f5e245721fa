//! Metadata source adapters
//!
//! The query engine only ever reads through [`MetadataSource`]. Implementations
//! are blocking (SQLite underneath) and are called from the blocking thread pool.

pub mod calibre;

pub use calibre::CalibreLibrary;

use crate::error::SourceError;
use crate::models::RawBookRecord;
use std::path::Path;

/// Read-only access to a library's book records
///
/// Implementations must be side-effect free and safe to share across threads
/// without external locking.
pub trait MetadataSource: Send + Sync {
    /// Every book in the library
    fn fetch_all(&self) -> Result<Vec<RawBookRecord>, SourceError>;

    /// A single book, `None` if no book has this id
    fn fetch_by_id(&self, id: i64) -> Result<Option<RawBookRecord>, SourceError>;

    /// Opaque revision of the underlying store (changes whenever the data may
    /// have changed), `None` if the source cannot tell
    fn revision(&self) -> Result<Option<i64>, SourceError> {
        Ok(None)
    }

    /// Directory holding the store on disk, if any (used by the library watcher)
    fn location(&self) -> Option<&Path> {
        None
    }
}
