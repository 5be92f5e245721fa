//! Terminal output for the one-shot commands

use calibre_api_core::models::{BookRecord, StatisticsSnapshot};
use comfy_table::{Cell, Color, ContentArrangement, Row, Table};
use std::collections::BTreeMap;

/// How many entries of each breakdown the summary shows
const TOP_N: usize = 10;

// ============================================================================
// Formatters
// ============================================================================

/// Format search results as table (human) or JSON
pub fn format_book_table(books: &[BookRecord], json: bool) -> String {
    if json {
        return serde_json::to_string_pretty(books).unwrap_or_else(|_| "[]".to_string());
    }

    if books.is_empty() {
        return "No books found.".to_string();
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("ID").fg(Color::Cyan),
        Cell::new("Title").fg(Color::Cyan),
        Cell::new("Authors").fg(Color::Cyan),
        Cell::new("Series").fg(Color::Cyan),
        Cell::new("Published").fg(Color::Cyan),
        Cell::new("Rating").fg(Color::Cyan),
        Cell::new("Formats").fg(Color::Cyan),
    ]);

    for book in books {
        let id = book.id.to_string();
        let title = truncate(&book.title, 40);
        let authors = truncate(&book.authors.join(", "), 30);
        let series = match (&book.series, book.series_index) {
            (Some(name), Some(index)) => format!("{} #{}", truncate(name, 20), index),
            (Some(name), None) => truncate(name, 20),
            _ => "-".to_string(),
        };
        let published = book
            .published
            .map(|ts| ts.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "-".to_string());
        let rating = book
            .rating
            .filter(|r| *r > 0.0)
            .map(|r| format!("{:.1}", r))
            .unwrap_or_else(|| "-".to_string());
        let formats = book.formats.join(", ");

        table.add_row(Row::from(vec![
            &id, &title, &authors, &series, &published, &rating, &formats,
        ]));
    }

    let noun = if books.len() == 1 { "book" } else { "books" };
    format!("{}\n{} {}", table, books.len(), noun)
}

/// Format library statistics (human or JSON)
pub fn format_statistics(snapshot: &StatisticsSnapshot, json: bool) -> String {
    if json {
        return serde_json::to_string_pretty(snapshot).unwrap_or_else(|_| "{}".to_string());
    }

    let mut lines = vec![];
    lines.push("calibre-api - Library Statistics".to_string());
    lines.push("================================".to_string());
    lines.push(String::new());
    lines.push(format!("Books:            {}", snapshot.total_books));
    lines.push(format!("  Rated:          {}", snapshot.rated_books));
    lines.push(format!("  Unrated:        {}", snapshot.unrated_books));
    lines.push(format!("  In a series:    {}", snapshot.series_books));
    lines.push(format!("Authors:          {}", snapshot.total_authors));
    lines.push(format!("Tags:             {}", snapshot.total_tags));
    lines.push(format!("Series:           {}", snapshot.total_series));
    lines.push(format!("Publishers:       {}", snapshot.total_publishers));

    for (title, counts) in [
        ("Top authors", &snapshot.books_per_author),
        ("Top tags", &snapshot.books_per_tag),
        ("Formats", &snapshot.books_per_format),
    ] {
        if counts.is_empty() {
            continue;
        }
        lines.push(String::new());
        lines.push(breakdown_table(title, counts));
    }

    lines.push(String::new());
    lines.push(format!(
        "Generated:        {}",
        snapshot.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    lines.join("\n")
}

// ============================================================================
// Utilities
// ============================================================================

/// Largest counts first, ties by name
fn top_counts(counts: &BTreeMap<String, u64>, n: usize) -> Vec<(&str, u64)> {
    let mut sorted: Vec<(&str, u64)> = counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    sorted.truncate(n);
    sorted
}

fn breakdown_table(title: &str, counts: &BTreeMap<String, u64>) -> String {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new(title).fg(Color::Cyan),
        Cell::new("Books").fg(Color::Cyan),
    ]);
    for (name, count) in top_counts(counts, TOP_N) {
        table.add_row(Row::from(vec![truncate(name, 40), count.to_string()]));
    }
    table.to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max - 1).collect::<String>() + "…"
    }
}

// ============================================================================
// Tests
// ============================================================================
