//! Search parameters as received and their validated, normalized form

use crate::cache::Fingerprint;
use crate::error::QueryError;
use crate::models::BookRecord;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

/// Default number of results when no limit is given
pub const DEFAULT_LIMIT: usize = 100;

/// Largest accepted `limit`
pub const MAX_LIMIT: usize = 1000;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Raw search parameters, as they arrive from a query string or the CLI
///
/// Everything is a string so that malformed values surface as
/// [`QueryError::InvalidFilter`] instead of a framework-level rejection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub title: Option<String>,
    pub author: Option<String>,
    /// Comma separated tag names
    pub tags: Option<String>,
    /// Inclusive lower bound on the published date (YYYY-MM-DD)
    pub published_from: Option<String>,
    /// Inclusive upper bound on the published date (YYYY-MM-DD)
    pub published_to: Option<String>,
    pub limit: Option<String>,
}

impl SearchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let joined = tags
            .into_iter()
            .map(|t| t.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.tags = Some(joined);
        self
    }

    pub fn with_published(mut self, from: Option<&str>, to: Option<&str>) -> Self {
        self.published_from = from.map(str::to_string);
        self.published_to = to.map(str::to_string);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit.to_string());
        self
    }

    /// Validate and normalize into [`SearchFilters`]
    pub fn validate(&self) -> Result<SearchFilters, QueryError> {
        let title = normalize_text(self.title.as_deref());
        let author = normalize_text(self.author.as_deref());

        let mut tags: Vec<String> = self
            .tags
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter_map(|t| normalize_text(Some(t)))
            .collect();
        tags.sort();
        tags.dedup();

        let from = parse_date("published_from", self.published_from.as_deref())?;
        let to = parse_date("published_to", self.published_to.as_deref())?;
        let published = match (from, to) {
            (None, None) => None,
            (from, to) => Some(DateRange::new(from, to)?),
        };

        let limit = match self.limit.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_LIMIT,
            Some(raw) => {
                let limit: usize = raw.parse().map_err(|_| {
                    QueryError::invalid_filter("limit", format!("'{}' is not a number", raw))
                })?;
                if !(1..=MAX_LIMIT).contains(&limit) {
                    return Err(QueryError::invalid_filter(
                        "limit",
                        format!("must be between 1 and {}", MAX_LIMIT),
                    ));
                }
                limit
            }
        };

        Ok(SearchFilters {
            title,
            author,
            tags,
            published,
            limit,
        })
    }
}

/// Trim + lowercase, with blank values treated as absent
fn normalize_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_lowercase)
}

fn parse_date(field: &str, value: Option<&str>) -> Result<Option<NaiveDate>, QueryError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .map(Some)
            .map_err(|_| {
                QueryError::invalid_filter(field, format!("'{}' is not a YYYY-MM-DD date", raw))
            }),
    }
}

/// Inclusive date range; either bound may be open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<Self, QueryError> {
        if let (Some(start), Some(end)) = (from, to) {
            if start > end {
                return Err(QueryError::invalid_filter(
                    "published_from",
                    format!("start {} is after end {}", start, end),
                ));
            }
        }
        Ok(Self { from, to })
    }

    pub fn contains(&self, when: DateTime<Utc>) -> bool {
        let day = when.date_naive();
        self.from.is_none_or(|from| day >= from) && self.to.is_none_or(|to| day <= to)
    }
}

/// Validated, normalized search filters
///
/// Text values are already lowercased; matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilters {
    pub title: Option<String>,
    pub author: Option<String>,
    pub tags: Vec<String>,
    pub published: Option<DateRange>,
    pub limit: usize,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            title: None,
            author: None,
            tags: Vec::new(),
            published: None,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl SearchFilters {
    /// Conjunctive match: every present filter must hold
    pub fn matches(&self, book: &BookRecord) -> bool {
        if let Some(ref title) = self.title {
            if !book.title.to_lowercase().contains(title.as_str()) {
                return false;
            }
        }

        if let Some(ref author) = self.author {
            if !book
                .authors
                .iter()
                .any(|a| a.to_lowercase().contains(author.as_str()))
            {
                return false;
            }
        }

        if !self.tags.is_empty() {
            let book_tags: Vec<String> = book.tags.iter().map(|t| t.to_lowercase()).collect();
            if !self.tags.iter().all(|wanted| book_tags.contains(wanted)) {
                return false;
            }
        }

        if let Some(ref range) = self.published {
            match book.published {
                Some(published) if range.contains(published) => {}
                _ => return false,
            }
        }

        true
    }

    /// Cache key for this search
    pub fn fingerprint(&self) -> Fingerprint {
        let mut pairs: Vec<(&str, String)> = Vec::new();
        if let Some(ref title) = self.title {
            pairs.push(("title", title.clone()));
        }
        if let Some(ref author) = self.author {
            pairs.push(("author", author.clone()));
        }
        for tag in &self.tags {
            pairs.push(("tags", tag.clone()));
        }
        if let Some(range) = self.published {
            if let Some(from) = range.from {
                pairs.push(("published_from", from.format(DATE_FORMAT).to_string()));
            }
            if let Some(to) = range.to {
                pairs.push(("published_to", to.format(DATE_FORMAT).to_string()));
            }
        }
        pairs.push(("limit", self.limit.to_string()));

        Fingerprint::from_pairs("search", pairs)
    }
}
