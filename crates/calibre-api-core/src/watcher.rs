//! Library watcher for the `watch` invalidation policy
//!
//! Watches the library directory and clears the whole query cache once
//! `metadata.db` (or its WAL) has been quiet for the debounce period.

use crate::cache::QueryCache;
use crate::source::calibre::METADATA_DB;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

/// Watches a Calibre library and invalidates the cache on change
///
/// Dropping the watcher stops it.
pub struct LibraryWatcher {
    _watcher: RecommendedWatcher,
    shutdown_tx: mpsc::Sender<()>,
    library_path: PathBuf,
}

impl LibraryWatcher {
    /// Start watching `library_path`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        library_path: &Path,
        cache: QueryCache,
        debounce: Duration,
    ) -> Result<Self, notify::Error> {
        let (event_tx, mut event_rx) = mpsc::channel::<notify::Result<Event>>(100);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.blocking_send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(library_path, RecursiveMode::NonRecursive)?;

        info!(library = %library_path.display(), ?debounce, "Library watcher started");

        tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;

            loop {
                let quiet = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    Some(result) = event_rx.recv() => {
                        match result {
                            Ok(event) if is_library_change(&event) => {
                                trace!(paths = ?event.paths, "Library change detected");
                                deadline = Some(Instant::now() + debounce);
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "Library watcher error"),
                        }
                    }
                    _ = quiet => {
                        deadline = None;
                        let removed = cache.invalidate_all().await;
                        info!(removed, "Library changed, query cache cleared");
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Library watcher shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            shutdown_tx,
            library_path: library_path.to_path_buf(),
        })
    }

    pub fn library_path(&self) -> &Path {
        &self.library_path
    }

    /// Stop the watcher
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Create/modify/remove of `metadata.db` or one of its side files
fn is_library_change(event: &Event) -> bool {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
        _ => return false,
    }

    event.paths.iter().any(|path| {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(METADATA_DB))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EntryOptions, Fingerprint};
    use crate::testing::{BookFixture, LibraryFixture};
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use tempfile::tempdir;

    #[test]
    fn test_is_library_change() {
        let modify = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/books/metadata.db"));
        assert!(is_library_change(&modify));

        let wal = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/books/metadata.db-wal"));
        assert!(is_library_change(&wal));

        let cover = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/books/Frank Herbert/Dune (1)/cover.jpg"));
        assert!(!is_library_change(&cover));

        let read = Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("/books/metadata.db"));
        assert!(!is_library_change(&read));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_change_clears_cache() {
        let dir = tempdir().unwrap();
        let fixture = LibraryFixture::create(dir.path()).unwrap();
        let cache = QueryCache::memory_only(100, "test");
        cache
            .get_or_compute(
                Fingerprint::statistics(),
                EntryOptions::ttl(Duration::from_secs(60)),
                || async { Ok("{}".to_string()) },
            )
            .await
            .unwrap();

        let watcher =
            LibraryWatcher::start(fixture.path(), cache.clone(), Duration::from_millis(50))
                .unwrap();
        assert_eq!(watcher.library_path(), dir.path());

        fixture.add_book(BookFixture::new("Dune")).unwrap();

        let mut cleared = false;
        for _ in 0..100 {
            if cache.get(&Fingerprint::statistics()).await.is_none() {
                cleared = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(cleared, "cache was not cleared after library change");
        watcher.stop().await;
    }
}
