//! Typed search filters, one per search function.
//!
//! Every field is optional; an unset field does not narrow the result.

use serde::{Deserialize, Serialize};
use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

use crate::{
    catalog::{BookStatus, ReaderStatus},
    ledger::{CirculationStatus, FineStatus},
};

/// Fold text for matching: decompose, drop diacritics, lowercase.
///
/// `đ` has no canonical decomposition and is mapped to `d` by hand.
#[must_use]
pub fn fold_text(input: &str) -> String {
    input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| if matches!(c, '\u{0110}' | '\u{0111}') { 'd' } else { c })
        .collect::<String>()
        .to_lowercase()
}

/// A free-text search term matched case- and diacritic-insensitively
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTerm {
    /// Folded term; empty matches everything
    folded: String,
}

impl SearchTerm {
    /// Prepare `term` for matching
    #[must_use]
    pub fn new(term: &str) -> Self {
        Self { folded: fold_text(term.trim()) }
    }

    /// Whether the term is blank
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.folded.is_empty()
    }

    /// Whether `field` contains the term
    #[must_use]
    pub fn matches(&self, field: &str) -> bool {
        self.is_empty() || fold_text(field).contains(&self.folded)
    }

    /// Whether any of `fields` contains the term
    #[must_use]
    pub fn matches_any<S: AsRef<str>>(&self, fields: impl IntoIterator<Item = S>) -> bool {
        self.is_empty() || fields.into_iter().any(|field| self.matches(field.as_ref()))
    }
}

/// Narrowing options for reader search
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReaderFilter {
    /// Only readers of this class
    pub class_name: Option<String>,
    /// Only readers with this standing
    pub status: Option<ReaderStatus>,
    /// Only readers of this gender
    pub gender: Option<String>,
    /// Only readers holding at least one overdue loan
    pub has_overdue: bool,
    /// Only readers with a fine balance
    pub has_fines: bool,
}

/// Shelf availability filter for books
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// At least one copy can be lent
    Available,
    /// No copy can be lent
    Unavailable,
}

/// Narrowing options for book search
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookFilter {
    /// Only books in this category
    pub category_id: Option<String>,
    /// Only books by this author
    pub author_id: Option<String>,
    /// Only books from this publisher
    pub publisher_id: Option<String>,
    /// Only books in this language
    pub language: Option<String>,
    /// Only books with this lending status
    pub status: Option<BookStatus>,
    /// Shelf availability
    pub availability: Option<Availability>,
    /// Only books in this condition
    pub condition: Option<String>,
}

/// Narrowing options for borrow record listings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BorrowFilter {
    /// Only loans of this reader
    pub reader_id: Option<String>,
    /// Only loans of this book
    pub book_id: Option<String>,
    /// Matched against the status derived at query time
    pub status: Option<CirculationStatus>,
    /// Only loans due within the current UTC day
    pub due_today: bool,
}

/// Narrowing options for fine listings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FineFilter {
    /// Only fines of this reader
    pub reader_id: Option<String>,
    /// Only fines in this state
    pub status: Option<FineStatus>,
    /// Only unpaid fines past their payment due date
    pub overdue: bool,
}

/// Whether an optional filter value accepts `actual`
pub(crate) fn accepts<T: PartialEq + ?Sized>(wanted: Option<&T>, actual: &T) -> bool {
    wanted.is_none_or(|wanted| wanted == actual)
}
