//! Whole-library aggregate statistics

use crate::models::BookRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Aggregate counts over the whole library
///
/// Maps are ordered so that serializing the same library twice yields the
/// same bytes (apart from `generated_at`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub total_books: u64,
    pub total_authors: u64,
    pub total_tags: u64,
    pub total_series: u64,
    pub total_publishers: u64,

    /// Books with a non-zero rating
    pub rated_books: u64,
    pub unrated_books: u64,

    /// Books belonging to any series
    pub series_books: u64,

    pub books_per_author: BTreeMap<String, u64>,
    pub books_per_tag: BTreeMap<String, u64>,
    pub books_per_format: BTreeMap<String, u64>,

    pub generated_at: DateTime<Utc>,
}

impl StatisticsSnapshot {
    /// Snapshot of an empty library
    pub fn empty(generated_at: DateTime<Utc>) -> Self {
        Self {
            total_books: 0,
            total_authors: 0,
            total_tags: 0,
            total_series: 0,
            total_publishers: 0,
            rated_books: 0,
            unrated_books: 0,
            series_books: 0,
            books_per_author: BTreeMap::new(),
            books_per_tag: BTreeMap::new(),
            books_per_format: BTreeMap::new(),
            generated_at,
        }
    }

    /// Aggregate a full set of books
    pub fn from_books<'a, I>(books: I, generated_at: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = &'a BookRecord>,
    {
        let mut snapshot = Self::empty(generated_at);
        let mut series = BTreeSet::new();
        let mut publishers = BTreeSet::new();

        for book in books {
            snapshot.total_books += 1;

            if book.is_rated() {
                snapshot.rated_books += 1;
            } else {
                snapshot.unrated_books += 1;
            }

            for author in &book.authors {
                *snapshot.books_per_author.entry(author.clone()).or_insert(0) += 1;
            }
            for tag in &book.tags {
                *snapshot.books_per_tag.entry(tag.clone()).or_insert(0) += 1;
            }
            for format in &book.formats {
                *snapshot.books_per_format.entry(format.clone()).or_insert(0) += 1;
            }

            if let Some(ref name) = book.series {
                snapshot.series_books += 1;
                series.insert(name.as_str());
            }
            if let Some(ref name) = book.publisher {
                publishers.insert(name.as_str());
            }
        }

        snapshot.total_authors = snapshot.books_per_author.len() as u64;
        snapshot.total_tags = snapshot.books_per_tag.len() as u64;
        snapshot.total_series = series.len() as u64;
        snapshot.total_publishers = publishers.len() as u64;
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawBookRecord;

    #[test]
    fn test_empty_library() {
        let now = Utc::now();
        let snapshot = StatisticsSnapshot::from_books(&[], now);
        assert_eq!(snapshot, StatisticsSnapshot::empty(now));
        assert_eq!(snapshot.total_books, 0);
        assert!(snapshot.books_per_author.is_empty());
    }

    #[test]
    fn test_aggregates() {
        let books: Vec<BookRecord> = vec![
            RawBookRecord {
                id: 1,
                title: "Dune".into(),
                authors: vec!["Frank Herbert".into()],
                tags: vec!["Science Fiction".into()],
                series: Some("Dune".into()),
                publisher: Some("Chilton".into()),
                rating: Some(10),
                formats: vec!["EPUB".into(), "PDF".into()],
                ..Default::default()
            },
            RawBookRecord {
                id: 2,
                title: "Dune Messiah".into(),
                authors: vec!["Frank Herbert".into()],
                tags: vec!["Science Fiction".into()],
                series: Some("Dune".into()),
                publisher: Some("Putnam".into()),
                rating: Some(0),
                formats: vec!["EPUB".into()],
                ..Default::default()
            },
            RawBookRecord {
                id: 3,
                title: "Good Omens".into(),
                authors: vec!["Terry Pratchett".into(), "Neil Gaiman".into()],
                tags: vec!["Fantasy".into(), "Humor".into()],
                ..Default::default()
            },
        ]
        .into_iter()
        .map(BookRecord::from)
        .collect();

        let snapshot = StatisticsSnapshot::from_books(&books, Utc::now());
        assert_eq!(snapshot.total_books, 3);
        assert_eq!(snapshot.total_authors, 3);
        assert_eq!(snapshot.total_tags, 3);
        assert_eq!(snapshot.total_series, 1);
        assert_eq!(snapshot.series_books, 2);
        assert_eq!(snapshot.total_publishers, 2);
        assert_eq!(snapshot.rated_books, 1);
        assert_eq!(snapshot.unrated_books, 2);
        assert_eq!(snapshot.books_per_author["Frank Herbert"], 2);
        assert_eq!(snapshot.books_per_tag["Science Fiction"], 2);
        assert_eq!(snapshot.books_per_format["EPUB"], 2);
        assert_eq!(snapshot.books_per_format["PDF"], 1);
    }
}
