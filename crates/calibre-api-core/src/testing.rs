//! Test support: a Calibre schema fixture builder and source/store doubles
//!
//! Built for this crate's tests and behind the `test-utils` feature for
//! downstream test suites.

use crate::cache::{CacheEntry, DurableStore, Fingerprint, FingerprintPattern, StoreStats};
use crate::error::{CacheError, SourceError};
use crate::models::RawBookRecord;
use crate::source::calibre::METADATA_DB;
use crate::source::MetadataSource;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// Subset of the Calibre schema read by the adapter, column names as Calibre
/// creates them
const CALIBRE_SCHEMA: &str = r#"
    CREATE TABLE books (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL DEFAULT 'Unknown' COLLATE NOCASE,
        sort TEXT COLLATE NOCASE,
        timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        pubdate TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        series_index REAL NOT NULL DEFAULT 1.0,
        author_sort TEXT COLLATE NOCASE,
        isbn TEXT DEFAULT '' COLLATE NOCASE,
        path TEXT NOT NULL DEFAULT '',
        uuid TEXT,
        has_cover BOOL DEFAULT 0,
        last_modified TIMESTAMP NOT NULL DEFAULT '2000-01-01 00:00:00+00:00'
    );
    CREATE TABLE authors (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL COLLATE NOCASE,
        sort TEXT COLLATE NOCASE,
        link TEXT NOT NULL DEFAULT '',
        UNIQUE(name)
    );
    CREATE TABLE books_authors_link (
        id INTEGER PRIMARY KEY,
        book INTEGER NOT NULL,
        author INTEGER NOT NULL,
        UNIQUE(book, author)
    );
    CREATE TABLE tags (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL COLLATE NOCASE,
        UNIQUE(name)
    );
    CREATE TABLE books_tags_link (
        id INTEGER PRIMARY KEY,
        book INTEGER NOT NULL,
        tag INTEGER NOT NULL,
        UNIQUE(book, tag)
    );
    CREATE TABLE series (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL COLLATE NOCASE,
        sort TEXT COLLATE NOCASE,
        UNIQUE(name)
    );
    CREATE TABLE books_series_link (
        id INTEGER PRIMARY KEY,
        book INTEGER NOT NULL,
        series INTEGER NOT NULL,
        UNIQUE(book)
    );
    CREATE TABLE publishers (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL COLLATE NOCASE,
        sort TEXT COLLATE NOCASE,
        UNIQUE(name)
    );
    CREATE TABLE books_publishers_link (
        id INTEGER PRIMARY KEY,
        book INTEGER NOT NULL,
        publisher INTEGER NOT NULL,
        UNIQUE(book)
    );
    CREATE TABLE ratings (
        id INTEGER PRIMARY KEY,
        rating INTEGER CHECK(rating > -1 AND rating < 11),
        UNIQUE(rating)
    );
    CREATE TABLE books_ratings_link (
        id INTEGER PRIMARY KEY,
        book INTEGER NOT NULL,
        rating INTEGER NOT NULL,
        UNIQUE(book, rating)
    );
    CREATE TABLE data (
        id INTEGER PRIMARY KEY,
        book INTEGER NOT NULL,
        format TEXT NOT NULL COLLATE NOCASE,
        uncompressed_size INTEGER NOT NULL,
        name TEXT NOT NULL,
        UNIQUE(book, format)
    );
"#;

/// A book to insert into a [`LibraryFixture`]
#[derive(Debug, Clone, Default)]
pub struct BookFixture {
    title: String,
    authors: Vec<String>,
    tags: Vec<String>,
    series: Option<(String, f64)>,
    publisher: Option<String>,
    rating: Option<u8>,
    pubdate: Option<String>,
    formats: Vec<String>,
}

impl BookFixture {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn series(mut self, name: impl Into<String>, index: f64) -> Self {
        self.series = Some((name.into(), index));
        self
    }

    pub fn publisher(mut self, name: impl Into<String>) -> Self {
        self.publisher = Some(name.into());
        self
    }

    /// Calibre scale, 0–10 (two points per star)
    pub fn rating(mut self, rating: u8) -> Self {
        self.rating = Some(rating);
        self
    }

    /// Calibre timestamp text, e.g. `1965-08-01 00:00:00+00:00`
    pub fn pubdate(mut self, pubdate: impl Into<String>) -> Self {
        self.pubdate = Some(pubdate.into());
        self
    }

    pub fn formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.formats = formats.into_iter().map(Into::into).collect();
        self
    }
}

/// A Calibre library directory with a minimal `metadata.db`
pub struct LibraryFixture {
    library_path: PathBuf,
    db_path: PathBuf,
}

impl LibraryFixture {
    /// Create an empty library in `dir`
    pub fn create(dir: &Path) -> rusqlite::Result<Self> {
        let db_path = dir.join(METADATA_DB);
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(CALIBRE_SCHEMA)?;

        Ok(Self {
            library_path: dir.to_path_buf(),
            db_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.library_path
    }

    /// Insert a book with its links, returning the new book id
    pub fn add_book(&self, book: BookFixture) -> rusqlite::Result<i64> {
        let mut conn = Connection::open(&self.db_path)?;
        let tx = conn.transaction()?;

        // Calibre's "undefined" date when no pubdate is given
        let pubdate = book
            .pubdate
            .unwrap_or_else(|| "0101-01-01 00:00:00+00:00".to_string());
        let series_index = book.series.as_ref().map_or(1.0, |(_, index)| *index);

        tx.execute(
            "INSERT INTO books (title, sort, pubdate, series_index, path) VALUES (?, ?, ?, ?, '')",
            params![&book.title, &book.title, &pubdate, series_index],
        )?;
        let book_id = tx.last_insert_rowid();
        let author_dir = book.authors.first().map_or("Unknown", String::as_str);
        tx.execute(
            "UPDATE books SET path = ? WHERE id = ?",
            params![format!("{}/{} ({})", author_dir, book.title, book_id), book_id],
        )?;

        for author in &book.authors {
            let author_id = upsert_name(&tx, "authors", author)?;
            tx.execute(
                "INSERT INTO books_authors_link (book, author) VALUES (?, ?)",
                params![book_id, author_id],
            )?;
        }

        for tag in &book.tags {
            let tag_id = upsert_name(&tx, "tags", tag)?;
            tx.execute(
                "INSERT OR IGNORE INTO books_tags_link (book, tag) VALUES (?, ?)",
                params![book_id, tag_id],
            )?;
        }

        if let Some((name, _)) = &book.series {
            let series_id = upsert_name(&tx, "series", name)?;
            tx.execute(
                "INSERT INTO books_series_link (book, series) VALUES (?, ?)",
                params![book_id, series_id],
            )?;
        }

        if let Some(name) = &book.publisher {
            let publisher_id = upsert_name(&tx, "publishers", name)?;
            tx.execute(
                "INSERT INTO books_publishers_link (book, publisher) VALUES (?, ?)",
                params![book_id, publisher_id],
            )?;
        }

        if let Some(rating) = book.rating {
            tx.execute(
                "INSERT OR IGNORE INTO ratings (rating) VALUES (?)",
                params![rating],
            )?;
            let rating_id: i64 = tx.query_row(
                "SELECT id FROM ratings WHERE rating = ?",
                params![rating],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO books_ratings_link (book, rating) VALUES (?, ?)",
                params![book_id, rating_id],
            )?;
        }

        for format in &book.formats {
            tx.execute(
                "INSERT INTO data (book, format, uncompressed_size, name) VALUES (?, ?, 1024, ?)",
                params![book_id, format.to_uppercase(), &book.title],
            )?;
        }

        tx.commit()?;
        Ok(book_id)
    }

    /// Remove a book and its links
    pub fn remove_book(&self, id: i64) -> rusqlite::Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(&format!(
            "DELETE FROM books WHERE id = {id};
             DELETE FROM books_authors_link WHERE book = {id};
             DELETE FROM books_tags_link WHERE book = {id};
             DELETE FROM books_series_link WHERE book = {id};
             DELETE FROM books_publishers_link WHERE book = {id};
             DELETE FROM books_ratings_link WHERE book = {id};
             DELETE FROM data WHERE book = {id};"
        ))
    }
}

fn upsert_name(conn: &Connection, table: &'static str, name: &str) -> rusqlite::Result<i64> {
    conn.execute(
        &format!("INSERT OR IGNORE INTO {table} (name) VALUES (?)"),
        params![name],
    )?;
    conn.query_row(
        &format!("SELECT id FROM {table} WHERE name = ?"),
        params![name],
        |row| row.get(0),
    )
}

/// In-memory [`MetadataSource`] that counts every call made to it
#[derive(Default)]
pub struct CountingSource {
    books: RwLock<Vec<RawBookRecord>>,
    revision: AtomicI64,
    fetch_all_calls: AtomicUsize,
    fetch_by_id_calls: AtomicUsize,
    revision_calls: AtomicUsize,
}

impl CountingSource {
    pub fn new(books: Vec<RawBookRecord>) -> Self {
        Self {
            books: RwLock::new(books),
            ..Default::default()
        }
    }

    /// Replace the library contents and advance the revision
    pub fn set_books(&self, books: Vec<RawBookRecord>) {
        *self.books.write() = books;
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    pub fn fetch_all_calls(&self) -> usize {
        self.fetch_all_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_by_id_calls(&self) -> usize {
        self.fetch_by_id_calls.load(Ordering::SeqCst)
    }

    /// Every call of any kind, revision checks included
    pub fn total_calls(&self) -> usize {
        self.fetch_all_calls() + self.fetch_by_id_calls() + self.revision_calls.load(Ordering::SeqCst)
    }
}

impl MetadataSource for CountingSource {
    fn fetch_all(&self) -> Result<Vec<RawBookRecord>, SourceError> {
        self.fetch_all_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.books.read().clone())
    }

    fn fetch_by_id(&self, id: i64) -> Result<Option<RawBookRecord>, SourceError> {
        self.fetch_by_id_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.books.read().iter().find(|b| b.id == id).cloned())
    }

    fn revision(&self) -> Result<Option<i64>, SourceError> {
        self.revision_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(self.revision.load(Ordering::SeqCst)))
    }
}

/// [`MetadataSource`] that is always unavailable
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingSource;

impl MetadataSource for FailingSource {
    fn fetch_all(&self) -> Result<Vec<RawBookRecord>, SourceError> {
        Err(SourceError::Unavailable {
            message: "database is locked".to_string(),
        })
    }

    fn fetch_by_id(&self, _id: i64) -> Result<Option<RawBookRecord>, SourceError> {
        self.fetch_all().map(|_| None)
    }
}

/// [`DurableStore`] whose every operation fails
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingStore;

impl FailingStore {
    fn fail<T>() -> Result<T, CacheError> {
        Err(CacheError::Unavailable {
            message: "disk I/O error".to_string(),
        })
    }
}

impl DurableStore for FailingStore {
    fn load(&self, _fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        Self::fail()
    }

    fn store(&self, _entry: &CacheEntry) -> Result<(), CacheError> {
        Self::fail()
    }

    fn remove(&self, _fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        Self::fail()
    }

    fn remove_matching(&self, _pattern: &FingerprintPattern) -> Result<usize, CacheError> {
        Self::fail()
    }

    fn clear(&self) -> Result<usize, CacheError> {
        Self::fail()
    }

    fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, CacheError> {
        Self::fail()
    }

    fn stats(&self) -> Result<StoreStats, CacheError> {
        Self::fail()
    }
}

/// Raw record shorthand for in-memory sources
pub fn raw_book(id: i64, title: &str, authors: &[&str]) -> RawBookRecord {
    RawBookRecord {
        id,
        title: title.to_string(),
        authors: authors.iter().map(|a| a.to_string()).collect(),
        ..Default::default()
    }
}
