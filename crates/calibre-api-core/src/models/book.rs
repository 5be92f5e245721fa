//! Book records: raw rows from the metadata store and their normalized projection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A book as read from the metadata store
///
/// Close to the Calibre tables: rating uses Calibre's 0-10 scale (two points
/// per star) and link tables are already folded into name lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBookRecord {
    pub id: i64,
    pub title: String,
    pub authors: Vec<String>,
    pub tags: Vec<String>,
    pub series: Option<String>,
    pub series_index: Option<f64>,
    pub publisher: Option<String>,
    /// 0-10, `None` when the book has no ratings row
    pub rating: Option<u8>,
    pub pubdate: Option<DateTime<Utc>>,
    /// Calibre's `timestamp` column (date added to the library)
    pub added: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    /// Book directory relative to the library root
    pub path: String,
    /// Upper-case format names (EPUB, PDF, ...)
    pub formats: Vec<String>,
}

/// Normalized book record returned by queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRecord {
    pub id: i64,
    pub title: String,
    pub authors: Vec<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_index: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// Stars, 0.0-5.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    pub path: String,
    pub formats: Vec<String>,
}

impl BookRecord {
    /// Whether the book counts as rated (Calibre stores unrated as 0 or no row)
    pub fn is_rated(&self) -> bool {
        self.rating.is_some_and(|r| r > 0.0)
    }
}

impl From<RawBookRecord> for BookRecord {
    fn from(raw: RawBookRecord) -> Self {
        let mut tags = raw.tags;
        tags.sort_by_key(|t| t.to_lowercase());

        let mut formats: Vec<String> = raw.formats.iter().map(|f| f.to_uppercase()).collect();
        formats.sort();
        formats.dedup();

        Self {
            id: raw.id,
            title: raw.title.trim().to_string(),
            // Author order is meaningful (primary author first), keep it
            authors: raw.authors,
            tags,
            series: raw.series.filter(|s| !s.trim().is_empty()),
            series_index: raw.series_index,
            publisher: raw.publisher.filter(|p| !p.trim().is_empty()),
            rating: raw.rating.map(|r| f32::from(r.min(10)) / 2.0),
            published: raw.pubdate,
            added: raw.added,
            last_modified: raw.last_modified,
            path: raw.path,
            formats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        let raw = RawBookRecord {
            id: 3,
            title: "  Dune ".to_string(),
            authors: vec!["Frank Herbert".to_string()],
            tags: vec!["science fiction".to_string(), "Classic".to_string()],
            series: Some(String::new()),
            rating: Some(8),
            formats: vec!["epub".to_string(), "EPUB".to_string(), "pdf".to_string()],
            ..Default::default()
        };

        let book = BookRecord::from(raw);
        assert_eq!(book.title, "Dune");
        assert_eq!(book.tags, vec!["Classic", "science fiction"]);
        assert_eq!(book.series, None);
        assert_eq!(book.rating, Some(4.0));
        assert_eq!(book.formats, vec!["EPUB", "PDF"]);
        assert!(book.is_rated());
    }

    #[test]
    fn test_zero_rating_is_unrated() {
        let book = BookRecord::from(RawBookRecord {
            rating: Some(0),
            ..Default::default()
        });
        assert!(!book.is_rated());
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let book = BookRecord::from(RawBookRecord {
            id: 1,
            title: "Foundation".to_string(),
            ..Default::default()
        });
        let json = serde_json::to_value(&book).unwrap();
        assert!(json.get("series").is_none());
        assert!(json.get("rating").is_none());
        assert_eq!(json["title"], "Foundation");
    }
}
