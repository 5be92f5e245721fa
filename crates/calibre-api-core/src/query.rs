//! Query engine: filtered search, single-book lookup, library statistics
//!
//! Stateless over a [`MetadataSource`]. Every adapter call is blocking and
//! runs on the blocking thread pool.

use crate::error::{QueryError, SourceError};
use crate::models::{BookRecord, SearchFilters, StatisticsSnapshot};
use crate::source::MetadataSource;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Order for search results: case-insensitive title, then exact title, then id
pub fn sort_books(books: &mut [BookRecord]) {
    books.sort_by(|a, b| {
        a.title
            .to_lowercase()
            .cmp(&b.title.to_lowercase())
            .then_with(|| a.title.cmp(&b.title))
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[derive(Clone)]
pub struct QueryEngine {
    source: Arc<dyn MetadataSource>,
}

impl QueryEngine {
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &Arc<dyn MetadataSource> {
        &self.source
    }

    /// Books matching every filter, ordered, truncated to the filter limit
    pub async fn search(&self, filters: &SearchFilters) -> Result<Vec<BookRecord>, QueryError> {
        let started = Instant::now();
        let raw = self.blocking(|source| source.fetch_all()).await?;
        let scanned = raw.len();

        let mut books: Vec<BookRecord> = raw
            .into_iter()
            .map(BookRecord::from)
            .filter(|book| filters.matches(book))
            .collect();
        sort_books(&mut books);
        books.truncate(filters.limit);

        debug!(
            scanned,
            matched = books.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Search executed"
        );
        Ok(books)
    }

    pub async fn book(&self, id: i64) -> Result<BookRecord, QueryError> {
        self.blocking(move |source| source.fetch_by_id(id))
            .await?
            .map(BookRecord::from)
            .ok_or(QueryError::NotFound { id })
    }

    pub async fn statistics(&self) -> Result<StatisticsSnapshot, QueryError> {
        let started = Instant::now();
        let books: Vec<BookRecord> = self
            .blocking(|source| source.fetch_all())
            .await?
            .into_iter()
            .map(BookRecord::from)
            .collect();

        let snapshot = StatisticsSnapshot::from_books(&books, Utc::now());
        debug!(
            total_books = snapshot.total_books,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Statistics computed"
        );
        Ok(snapshot)
    }

    /// Current revision of the underlying store
    pub async fn source_revision(&self) -> Result<Option<i64>, QueryError> {
        self.blocking(|source| source.revision()).await
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, QueryError>
    where
        F: FnOnce(&dyn MetadataSource) -> Result<T, SourceError> + Send + 'static,
        T: Send + 'static,
    {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || op(source.as_ref()))
            .await
            .map_err(|e| QueryError::internal(format!("Metadata task failed: {}", e)))?
            .map_err(QueryError::from)
    }
}
