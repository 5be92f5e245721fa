//! Library service: the query engine behind the cache
//!
//! Every public query validates its input, derives a fingerprint and goes
//! through [`QueryCache::get_or_compute`]. Callers receive the cached JSON
//! payload, never a partially built result.

use crate::cache::{
    CacheEntry, CacheStatus, EntryOptions, Fingerprint, FingerprintPattern, QueryCache,
};
use crate::config::{CacheConfig, InvalidationPolicy, ServiceConfig};
use crate::error::{QueryError, SourceError};
use crate::models::SearchParams;
use crate::query::QueryEngine;
use crate::source::{CalibreLibrary, MetadataSource};
use crate::watcher::LibraryWatcher;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache lifetimes per query kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTtls {
    pub statistics: Duration,
    pub search: Duration,
    pub book: Duration,
}

impl From<&CacheConfig> for QueryTtls {
    fn from(config: &CacheConfig) -> Self {
        Self {
            statistics: config.statistics_ttl(),
            search: config.search_ttl(),
            book: config.book_ttl(),
        }
    }
}

impl Default for QueryTtls {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

pub struct LibraryService {
    engine: QueryEngine,
    cache: QueryCache,
    ttls: QueryTtls,
    policy: InvalidationPolicy,
    watcher: Option<LibraryWatcher>,
}

impl LibraryService {
    pub fn new(
        engine: QueryEngine,
        cache: QueryCache,
        ttls: QueryTtls,
        policy: InvalidationPolicy,
    ) -> Self {
        Self {
            engine,
            cache,
            ttls,
            policy,
            watcher: None,
        }
    }

    /// Service over an arbitrary source with the default TTL policy
    pub fn with_source(source: Arc<dyn MetadataSource>, cache: QueryCache) -> Self {
        Self::new(
            QueryEngine::new(source),
            cache,
            QueryTtls::default(),
            InvalidationPolicy::Ttl,
        )
    }

    /// Open the configured Calibre library and cache
    ///
    /// With the `watch` policy this starts a [`LibraryWatcher`] and must then
    /// be called from within a Tokio runtime. A watcher that cannot start is
    /// logged and the service falls back to TTL expiry.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, SourceError> {
        let library = CalibreLibrary::open(&config.library_path)?;
        let cache_dir = config.cache.resolved_dir();
        let cache = QueryCache::open(
            &cache_dir,
            config.cache.store_options(),
            config.cache.memory_capacity,
        );

        let mut service = Self::new(
            QueryEngine::new(Arc::new(library)),
            cache,
            QueryTtls::from(&config.cache),
            config.cache.invalidation,
        );

        if config.cache.invalidation == InvalidationPolicy::Watch {
            match LibraryWatcher::start(
                &config.library_path,
                service.cache.clone(),
                config.cache.watch_debounce(),
            ) {
                Ok(watcher) => service.watcher = Some(watcher),
                Err(e) => warn!(
                    error = %e,
                    "Library watcher unavailable, relying on TTL expiry"
                ),
            }
        }

        info!(
            library = %config.library_path.display(),
            cache_dir = %cache_dir.display(),
            policy = %config.cache.invalidation,
            degraded = service.cache.degraded_state().is_degraded(),
            "Library service ready"
        );
        Ok(service)
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn policy(&self) -> InvalidationPolicy {
        self.policy
    }

    /// Search results as a JSON array of books
    pub async fn search(&self, params: &SearchParams) -> Result<Arc<CacheEntry>, QueryError> {
        let filters = params.validate()?;
        let fingerprint = filters.fingerprint();
        let options = self.entry_options(self.ttls.search).await?;

        let engine = self.engine.clone();
        self.cache
            .get_or_compute(fingerprint, options, move || async move {
                let books = engine.search(&filters).await?;
                Ok(serde_json::to_string(&books)?)
            })
            .await
    }

    /// Library statistics as a JSON object
    pub async fn statistics(&self) -> Result<Arc<CacheEntry>, QueryError> {
        let options = self.entry_options(self.ttls.statistics).await?;

        let engine = self.engine.clone();
        self.cache
            .get_or_compute(Fingerprint::statistics(), options, move || async move {
                let snapshot = engine.statistics().await?;
                Ok(serde_json::to_string(&snapshot)?)
            })
            .await
    }

    /// One book as a JSON object
    pub async fn book(&self, id: i64) -> Result<Arc<CacheEntry>, QueryError> {
        let options = self.entry_options(self.ttls.book).await?;

        let engine = self.engine.clone();
        self.cache
            .get_or_compute(Fingerprint::book(id), options, move || async move {
                let book = engine.book(id).await?;
                Ok(serde_json::to_string(&book)?)
            })
            .await
    }

    /// Drop cached entries matching `pattern` (everything when `None`)
    pub async fn invalidate(&self, pattern: Option<&str>) -> Result<usize, QueryError> {
        match pattern.map(str::trim).filter(|p| !p.is_empty()) {
            None => Ok(self.cache.invalidate_all().await),
            Some(raw) => {
                let pattern = FingerprintPattern::parse(raw)
                    .map_err(|e| QueryError::invalid_filter("pattern", e.to_string()))?;
                Ok(self.cache.invalidate_matching(&pattern).await)
            }
        }
    }

    pub async fn status(&self) -> CacheStatus {
        self.cache.status().await
    }

    /// Stop the watcher and flush the cache
    pub async fn shutdown(&self) {
        if let Some(ref watcher) = self.watcher {
            watcher.stop().await;
        }
        self.cache.shutdown().await;
        debug!("Library service shut down");
    }

    async fn entry_options(&self, ttl: Duration) -> Result<EntryOptions, QueryError> {
        let options = EntryOptions::ttl(ttl);
        if self.policy != InvalidationPolicy::SourceMtime {
            return Ok(options);
        }
        let revision = self.engine.source_revision().await?;
        Ok(options.with_source_stamp(revision))
    }
}
