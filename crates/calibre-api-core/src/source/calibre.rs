//! Calibre `metadata.db` adapter
//!
//! Opens the library database read-only for every call. No connection is
//! shared between callers, so the adapter needs no locking of its own.
//!
//! Tables read: books, authors, tags, series, publishers, ratings, data and
//! the matching `books_*_link` tables. Nothing is ever written.

use super::MetadataSource;
use crate::error::SourceError;
use crate::models::RawBookRecord;
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

/// Database file inside a Calibre library directory
pub const METADATA_DB: &str = "metadata.db";

/// Separator for `group_concat` lists (ASCII unit separator, never in names)
const LIST_SEPARATOR: char = '\u{1f}';

/// Calibre writes can hold the database briefly; wait rather than fail
const BUSY_TIMEOUT: Duration = Duration::from_millis(1500);

/// Calibre stores "no date" as year 101
const UNDEFINED_YEAR_CUTOFF: i32 = 101;

const BOOK_QUERY: &str = r#"
    SELECT
        b.id,
        b.title,
        b.path,
        b.series_index,
        b.pubdate,
        b.timestamp,
        b.last_modified,
        (SELECT group_concat(name, char(31)) FROM (
            SELECT a.name AS name
            FROM books_authors_link l JOIN authors a ON a.id = l.author
            WHERE l.book = b.id
            ORDER BY l.id
        )) AS authors,
        (SELECT group_concat(t.name, char(31))
            FROM books_tags_link l JOIN tags t ON t.id = l.tag
            WHERE l.book = b.id) AS tags,
        (SELECT s.name
            FROM books_series_link l JOIN series s ON s.id = l.series
            WHERE l.book = b.id LIMIT 1) AS series,
        (SELECT p.name
            FROM books_publishers_link l JOIN publishers p ON p.id = l.publisher
            WHERE l.book = b.id LIMIT 1) AS publisher,
        (SELECT r.rating
            FROM books_ratings_link l JOIN ratings r ON r.id = l.rating
            WHERE l.book = b.id LIMIT 1) AS rating,
        (SELECT group_concat(d.format, char(31))
            FROM data d WHERE d.book = b.id) AS formats
    FROM books b
"#;

/// Read-only adapter over a Calibre library directory
#[derive(Debug, Clone)]
pub struct CalibreLibrary {
    library_path: PathBuf,
    db_path: PathBuf,
}

impl CalibreLibrary {
    /// Point the adapter at a library directory
    ///
    /// Fails if `<library>/metadata.db` does not exist. The database itself is
    /// only opened when queried.
    pub fn open(library_path: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let library_path = library_path.into();
        let db_path = library_path.join(METADATA_DB);

        if !db_path.is_file() {
            return Err(SourceError::DatabaseNotFound { path: db_path });
        }

        debug!(path = %db_path.display(), "Calibre library located");
        Ok(Self {
            library_path,
            db_path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, SourceError> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| SourceError::Open {
            path: self.db_path.clone(),
            source,
        })?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|source| SourceError::Open {
                path: self.db_path.clone(),
                source,
            })?;

        Ok(conn)
    }

    fn read_row(row: &Row<'_>) -> rusqlite::Result<RawBookRecord> {
        Ok(RawBookRecord {
            id: row.get("id")?,
            title: row.get::<_, Option<String>>("title")?.unwrap_or_default(),
            path: row.get::<_, Option<String>>("path")?.unwrap_or_default(),
            series_index: row.get("series_index")?,
            pubdate: parse_timestamp(row.get::<_, Option<String>>("pubdate")?.as_deref()),
            added: parse_timestamp(row.get::<_, Option<String>>("timestamp")?.as_deref()),
            last_modified: parse_timestamp(
                row.get::<_, Option<String>>("last_modified")?.as_deref(),
            ),
            authors: split_list(row.get("authors")?),
            tags: split_list(row.get("tags")?),
            series: row.get("series")?,
            publisher: row.get("publisher")?,
            rating: row
                .get::<_, Option<i64>>("rating")?
                .map(|r| r.clamp(0, 10) as u8),
            formats: split_list(row.get("formats")?),
        })
    }
}

impl MetadataSource for CalibreLibrary {
    fn fetch_all(&self) -> Result<Vec<RawBookRecord>, SourceError> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(&format!("{} ORDER BY b.id", BOOK_QUERY))
            .map_err(|source| SourceError::Query {
                context: "prepare book listing",
                source,
            })?;

        let rows = stmt
            .query_map([], Self::read_row)
            .map_err(|source| SourceError::Query {
                context: "list books",
                source,
            })?;

        let mut books = Vec::new();
        for row in rows {
            books.push(row.map_err(|source| SourceError::Query {
                context: "read book row",
                source,
            })?);
        }

        trace!(count = books.len(), "Fetched all books");
        Ok(books)
    }

    fn fetch_by_id(&self, id: i64) -> Result<Option<RawBookRecord>, SourceError> {
        let conn = self.connect()?;
        conn.query_row(
            &format!("{} WHERE b.id = ?", BOOK_QUERY),
            params![id],
            Self::read_row,
        )
        .optional()
        .map_err(|source| SourceError::Query {
            context: "fetch book by id",
            source,
        })
    }

    /// Latest modification time (ms since epoch) of `metadata.db` or its WAL
    fn revision(&self) -> Result<Option<i64>, SourceError> {
        let stat = |path: &Path| -> Result<Option<SystemTime>, SourceError> {
            match std::fs::metadata(path) {
                Ok(meta) => meta.modified().map(Some).map_err(|source| SourceError::Stat {
                    path: path.to_path_buf(),
                    source,
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(source) => Err(SourceError::Stat {
                    path: path.to_path_buf(),
                    source,
                }),
            }
        };

        let wal_path = self.db_path.with_extension("db-wal");
        let latest = [stat(&self.db_path)?, stat(&wal_path)?]
            .into_iter()
            .flatten()
            .max();

        Ok(latest.map(|modified| DateTime::<Utc>::from(modified).timestamp_millis()))
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.library_path)
    }
}

fn split_list(joined: Option<String>) -> Vec<String> {
    joined
        .map(|s| {
            s.split(LIST_SEPARATOR)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Parse the timestamp formats Calibre writes, mapping its "undefined" sentinel to `None`
fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }

    let parsed = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%:z")
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f").map(|dt| dt.and_utc())
        })
        .ok()?;

    if parsed.year() <= UNDEFINED_YEAR_CUTOFF {
        return None;
    }
    Some(parsed)
}
