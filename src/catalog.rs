//! Catalog records: readers, books and the leaf data books point at.
//!
//! Derived counters (`current_borrows`, `fine_amount`, the copy counts) are
//! owned by the engine. The patch types below deliberately leave them out.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::{SUSPENSION_FINE_THRESHOLD, WARNING_FINE_THRESHOLD},
    error::{CirculationError, CirculationResult},
};

/// Standing of a reader
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderStatus {
    /// May borrow and reserve
    #[default]
    Active,
    /// Fines or overdue books pending
    Warning,
    /// Blocked until fines are paid
    Suspended,
}

impl ReaderStatus {
    /// Severity rank, used to make sure escalation never loosens a status
    #[must_use]
    pub fn severity(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Warning => 1,
            Self::Suspended => 2,
        }
    }

    /// The least strict status an unpaid balance of `fine_amount` allows
    #[must_use]
    pub fn for_balance(fine_amount: u64) -> Self {
        if fine_amount >= SUSPENSION_FINE_THRESHOLD {
            Self::Suspended
        } else if fine_amount >= WARNING_FINE_THRESHOLD {
            Self::Warning
        } else {
            Self::Active
        }
    }
}

impl fmt::Display for ReaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Warning => "warning",
            Self::Suspended => "suspended",
        };
        f.write_str(name)
    }
}

/// A registered library patron
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reader {
    /// Unique id
    pub id: String,
    /// School-issued student id, unique
    pub student_id: String,
    /// Full name
    pub full_name: String,
    /// Date of birth
    #[serde(default)]
    pub date_of_birth: Option<DateTime<Utc>>,
    /// Gender as entered
    #[serde(default)]
    pub gender: String,
    /// School class, e.g. `10A1`
    pub class_name: String,
    /// Email address
    #[serde(default)]
    pub email: String,
    /// Phone number
    #[serde(default)]
    pub phone: String,
    /// Postal address
    #[serde(default)]
    pub address: String,
    /// Guardian name
    #[serde(default)]
    pub parent_name: String,
    /// Guardian phone number
    #[serde(default)]
    pub parent_phone: String,
    /// When the reader registered
    pub registration_date: DateTime<Utc>,
    /// Library card number, `LIB<year><seq>`
    #[serde(default)]
    pub card_number: String,
    /// Standing; only active readers may borrow
    #[serde(default)]
    pub status: ReaderStatus,
    /// Maximum simultaneous loans
    pub borrow_limit: u32,
    /// Open loans
    #[serde(default)]
    pub current_borrows: u32,
    /// Loans over the reader's lifetime
    #[serde(default)]
    pub total_borrows: u32,
    /// Unpaid fine balance
    #[serde(default)]
    pub fine_amount: u64,
    /// Last borrow, return, renewal or payment
    pub last_activity: DateTime<Utc>,
    /// Free-text notes
    #[serde(default)]
    pub notes: String,
}

impl Reader {
    /// Whether the reader may borrow or reserve
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ReaderStatus::Active
    }

    /// Raise the status to `status` unless it is already at least as strict
    pub fn escalate(&mut self, status: ReaderStatus) {
        if status.severity() > self.status.severity() {
            self.status = status;
        }
    }

    /// Merge a validated patch into this reader
    pub(crate) fn apply_patch(&mut self, patch: ReaderPatch) {
        let ReaderPatch {
            student_id,
            full_name,
            class_name,
            date_of_birth,
            gender,
            email,
            phone,
            address,
            parent_name,
            parent_phone,
            notes,
            status,
            borrow_limit,
        } = patch;
        if let Some(value) = student_id {
            self.student_id = value.trim().to_string();
        }
        if let Some(value) = full_name {
            self.full_name = value.trim().to_string();
        }
        if let Some(value) = class_name {
            self.class_name = value.trim().to_string();
        }
        if let Some(value) = date_of_birth {
            self.date_of_birth = Some(value);
        }
        if let Some(value) = gender {
            self.gender = value;
        }
        if let Some(value) = email {
            self.email = value;
        }
        if let Some(value) = phone {
            self.phone = value;
        }
        if let Some(value) = address {
            self.address = value;
        }
        if let Some(value) = parent_name {
            self.parent_name = value;
        }
        if let Some(value) = parent_phone {
            self.parent_phone = value;
        }
        if let Some(value) = notes {
            self.notes = value;
        }
        if let Some(value) = status {
            self.status = value;
        }
        if let Some(value) = borrow_limit {
            self.borrow_limit = value;
        }
    }
}

/// Registration form for a new reader
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewReader {
    /// School-issued student id, unique
    pub student_id: String,
    /// Full name
    pub full_name: String,
    /// School class, e.g. `10A1`
    pub class_name: String,
    /// Date of birth
    pub date_of_birth: Option<DateTime<Utc>>,
    /// Gender as entered
    pub gender: String,
    /// Email address
    pub email: String,
    /// Phone number
    pub phone: String,
    /// Postal address
    pub address: String,
    /// Guardian name
    pub parent_name: String,
    /// Guardian phone number
    pub parent_phone: String,
    /// Free-text notes
    pub notes: String,
}

impl NewReader {
    /// Check the required fields
    ///
    /// # Errors
    ///
    /// Returns `CirculationError::Validation` when a required field is blank.
    pub fn validate(&self) -> CirculationResult<()> {
        require("studentId", &self.student_id)?;
        require("fullName", &self.full_name)?;
        require("className", &self.class_name)
    }
}

/// Editable reader fields; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReaderPatch {
    /// School-issued student id, unique
    pub student_id: Option<String>,
    /// Full name
    pub full_name: Option<String>,
    /// School class, e.g. `10A1`
    pub class_name: Option<String>,
    /// Date of birth
    pub date_of_birth: Option<DateTime<Utc>>,
    /// Gender as entered
    pub gender: Option<String>,
    /// Email address
    pub email: Option<String>,
    /// Phone number
    pub phone: Option<String>,
    /// Postal address
    pub address: Option<String>,
    /// Guardian name
    pub parent_name: Option<String>,
    /// Guardian phone number
    pub parent_phone: Option<String>,
    /// Free-text notes
    pub notes: Option<String>,
    /// New standing; cannot be weaker than the balance allows
    pub status: Option<ReaderStatus>,
    /// New loan limit; cannot drop below open loans
    pub borrow_limit: Option<u32>,
}

impl ReaderPatch {
    /// Check the fields that are being changed
    ///
    /// # Errors
    ///
    /// Returns `CirculationError::Validation` when a required field is set
    /// blank or the borrow limit is zero.
    pub fn validate(&self) -> CirculationResult<()> {
        require_if_set("studentId", self.student_id.as_deref())?;
        require_if_set("fullName", self.full_name.as_deref())?;
        require_if_set("className", self.class_name.as_deref())?;
        if self.borrow_limit == Some(0) {
            return Err(CirculationError::Validation("borrowLimit must be at least 1".into()));
        }
        Ok(())
    }
}

/// Lending status of a title, derived from its copy counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    /// At least one copy on the shelf
    #[default]
    Available,
    /// Every copy is out on loan or held
    Borrowed,
    /// Every copy is held for reservations
    Reserved,
}

/// A catalogued title with its copy counts
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    /// Unique id
    pub id: String,
    /// Title
    pub title: String,
    /// Author of the book
    pub author_id: String,
    /// Category the book is filed under
    pub category_id: String,
    /// Publisher, empty when unknown
    #[serde(default)]
    pub publisher_id: String,
    /// ISBN, unique when set
    #[serde(default)]
    pub isbn: String,
    /// Year of publication
    #[serde(default)]
    pub publication_year: i32,
    /// Exact publication date
    #[serde(default)]
    pub publication_date: Option<DateTime<Utc>>,
    /// Page count
    #[serde(default)]
    pub pages: u32,
    /// Language of the text
    #[serde(default)]
    pub language: String,
    /// Free-text description
    #[serde(default)]
    pub description: String,
    /// Shelf location
    #[serde(default)]
    pub location: String,
    /// Copies owned
    pub total_copies: u32,
    /// Copies on the shelf
    #[serde(default)]
    pub available_copies: u32,
    /// Copies out on loan
    #[serde(default)]
    pub borrowed_copies: u32,
    /// Copies held for reservations
    #[serde(default)]
    pub reserved_copies: u32,
    /// Purchase price
    #[serde(default)]
    pub price: u64,
    /// Physical condition, e.g. `good`
    #[serde(default)]
    pub condition: String,
    /// When the book was catalogued
    pub added_date: DateTime<Utc>,
    /// When a copy was last lent
    #[serde(default)]
    pub last_borrowed: Option<DateTime<Utc>>,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Lending status derived from the copy counts
    #[serde(default)]
    pub status: BookStatus,
}

impl Book {
    /// Set the copy counts from the number of open loans and active
    /// reservations.
    ///
    /// Reservations only hold copies that are not out on loan, so the three
    /// counts always add up to `total_copies`.
    pub(crate) fn set_availability(&mut self, open_loans: u32, active_reservations: u32) {
        let borrowed = open_loans.min(self.total_copies);
        let free = self.total_copies.saturating_sub(borrowed);
        let reserved = active_reservations.min(free);
        self.borrowed_copies = borrowed;
        self.reserved_copies = reserved;
        self.available_copies = free.saturating_sub(reserved);
        self.status = if self.available_copies > 0 {
            BookStatus::Available
        } else if self.borrowed_copies > 0 {
            BookStatus::Borrowed
        } else {
            BookStatus::Reserved
        };
    }

    /// Merge a validated patch into this book
    pub(crate) fn apply_patch(&mut self, patch: BookPatch) {
        let BookPatch {
            title,
            author_id,
            category_id,
            publisher_id,
            isbn,
            publication_year,
            publication_date,
            pages,
            language,
            description,
            location,
            total_copies,
            price,
            condition,
            tags,
        } = patch;
        if let Some(value) = title {
            self.title = value.trim().to_string();
        }
        if let Some(value) = author_id {
            self.author_id = value;
        }
        if let Some(value) = category_id {
            self.category_id = value;
        }
        if let Some(value) = publisher_id {
            self.publisher_id = value;
        }
        if let Some(value) = isbn {
            self.isbn = value.trim().to_string();
        }
        if let Some(value) = publication_year {
            self.publication_year = value;
        }
        if let Some(value) = publication_date {
            self.publication_date = Some(value);
        }
        if let Some(value) = pages {
            self.pages = value;
        }
        if let Some(value) = language {
            self.language = value;
        }
        if let Some(value) = description {
            self.description = value;
        }
        if let Some(value) = location {
            self.location = value;
        }
        if let Some(value) = total_copies {
            self.total_copies = value;
        }
        if let Some(value) = price {
            self.price = value;
        }
        if let Some(value) = condition {
            self.condition = value;
        }
        if let Some(value) = tags {
            self.tags = value;
        }
    }
}

/// Cataloguing form for a new title
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewBook {
    /// Title
    pub title: String,
    /// Author of the book
    pub author_id: String,
    /// Category the book is filed under
    pub category_id: String,
    /// Publisher, empty when unknown
    pub publisher_id: String,
    /// ISBN, unique when set
    pub isbn: String,
    /// Year of publication, defaults to the current year
    pub publication_year: Option<i32>,
    /// Exact publication date
    pub publication_date: Option<DateTime<Utc>>,
    /// Page count
    pub pages: u32,
    /// Language of the text
    pub language: String,
    /// Free-text description
    pub description: String,
    /// Shelf location
    pub location: String,
    /// Copies owned, at least one
    pub total_copies: u32,
    /// Purchase price
    pub price: u64,
    /// Physical condition, defaults to `good`
    pub condition: String,
    /// Free-form tags
    pub tags: Vec<String>,
}

impl Default for NewBook {
    fn default() -> Self {
        Self {
            title: String::new(),
            author_id: String::new(),
            category_id: String::new(),
            publisher_id: String::new(),
            isbn: String::new(),
            publication_year: None,
            publication_date: None,
            pages: 0,
            language: String::new(),
            description: String::new(),
            location: String::new(),
            total_copies: 1,
            price: 0,
            condition: String::new(),
            tags: Vec::new(),
        }
    }
}

impl NewBook {
    /// Check the required fields
    ///
    /// # Errors
    ///
    /// Returns `CirculationError::Validation` when a required field is blank
    /// or the title has no copies.
    pub fn validate(&self) -> CirculationResult<()> {
        require("title", &self.title)?;
        require("authorId", &self.author_id)?;
        require("categoryId", &self.category_id)?;
        if self.total_copies == 0 {
            return Err(CirculationError::Validation("totalCopies must be at least 1".into()));
        }
        Ok(())
    }
}

/// Editable book fields; copy counts other than the total are derived
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookPatch {
    /// Title
    pub title: Option<String>,
    /// Author of the book
    pub author_id: Option<String>,
    /// Category the book is filed under
    pub category_id: Option<String>,
    /// Publisher, empty when unknown
    pub publisher_id: Option<String>,
    /// ISBN, unique when set
    pub isbn: Option<String>,
    /// Year of publication
    pub publication_year: Option<i32>,
    /// Exact publication date
    pub publication_date: Option<DateTime<Utc>>,
    /// Page count
    pub pages: Option<u32>,
    /// Language of the text
    pub language: Option<String>,
    /// Free-text description
    pub description: Option<String>,
    /// Shelf location
    pub location: Option<String>,
    /// New copy total; cannot drop below copies on loan
    pub total_copies: Option<u32>,
    /// Purchase price
    pub price: Option<u64>,
    /// Physical condition, e.g. `good`
    pub condition: Option<String>,
    /// Free-form tags
    pub tags: Option<Vec<String>>,
}

impl BookPatch {
    /// Check the fields that are being changed
    ///
    /// # Errors
    ///
    /// Returns `CirculationError::Validation` when a required field is set
    /// blank or the total drops to zero.
    pub fn validate(&self) -> CirculationResult<()> {
        require_if_set("title", self.title.as_deref())?;
        require_if_set("authorId", self.author_id.as_deref())?;
        require_if_set("categoryId", self.category_id.as_deref())?;
        if self.total_copies == Some(0) {
            return Err(CirculationError::Validation("totalCopies must be at least 1".into()));
        }
        Ok(())
    }
}

/// A subject grouping for books
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    /// Unique id
    pub id: String,
    /// Display name
    pub name: String,
    /// Free-text description
    #[serde(default)]
    pub description: String,
    /// Display color as a hex code
    #[serde(default)]
    pub color: String,
}

/// Form for a new category
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewCategory {
    /// Display name
    pub name: String,
    /// Free-text description
    pub description: String,
    /// Display color, defaults to `#007bff`
    pub color: Option<String>,
}

/// Editable category fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CategoryPatch {
    /// Display name
    pub name: Option<String>,
    /// Free-text description
    pub description: Option<String>,
    /// Display color as a hex code
    pub color: Option<String>,
}

/// A book author
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    /// Unique id
    pub id: String,
    /// Display name
    pub name: String,
    /// Short biography
    #[serde(default)]
    pub biography: String,
    /// Nationality
    #[serde(default)]
    pub nationality: String,
}

/// Form for a new author
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewAuthor {
    /// Display name
    pub name: String,
    /// Short biography
    pub biography: String,
    /// Nationality
    pub nationality: String,
}

/// A publishing house
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Publisher {
    /// Unique id
    pub id: String,
    /// Display name
    pub name: String,
    /// Postal address
    #[serde(default)]
    pub address: String,
    /// Phone number
    #[serde(default)]
    pub phone: String,
    /// Email address
    #[serde(default)]
    pub email: String,
}

/// Form for a new publisher
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewPublisher {
    /// Display name
    pub name: String,
    /// Postal address
    pub address: String,
    /// Phone number
    pub phone: String,
    /// Email address
    pub email: String,
}

/// Reject a blank required field
pub(crate) fn require(field: &str, value: &str) -> CirculationResult<()> {
    if value.trim().is_empty() {
        return Err(CirculationError::Validation(format!("{field} is required")));
    }
    Ok(())
}

/// Reject a required field that a patch sets to blank
fn require_if_set(field: &str, value: Option<&str>) -> CirculationResult<()> {
    value.map_or(Ok(()), |value| require(field, value))
}
