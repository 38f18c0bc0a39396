//! The in-memory object store the engine mutates.
//!
//! One collection per entity kind. The store is passed to the engine
//! explicitly; there is no process-wide instance.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    catalog::{Author, Book, Category, Publisher, Reader},
    events::ActivityEntry,
    ledger::{BorrowRecord, Fine, Renewal, Reservation},
};

/// The record collections, each persisted under its own key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Registered readers
    Readers,
    /// Catalogued books
    Books,
    /// Loans
    BorrowRecords,
    /// Book categories
    Categories,
    /// Authors
    Authors,
    /// Publishers
    Publishers,
    /// Fines
    Fines,
    /// Renewal audit records
    Renewals,
    /// Reservation queue entries
    Reservations,
}

impl EntityKind {
    /// Every kind, in persistence order
    pub const ALL: [Self; 9] = [
        Self::Readers,
        Self::Books,
        Self::BorrowRecords,
        Self::Categories,
        Self::Authors,
        Self::Publishers,
        Self::Fines,
        Self::Renewals,
        Self::Reservations,
    ];

    /// Storage key and JSON bundle field of the collection
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Readers => "readers",
            Self::Books => "books",
            Self::BorrowRecords => "borrowRecords",
            Self::Categories => "categories",
            Self::Authors => "authors",
            Self::Publishers => "publishers",
            Self::Fines => "fines",
            Self::Renewals => "renewals",
            Self::Reservations => "reservations",
        }
    }

    /// JSON fields holding dates, re-hydrated on load and import
    #[must_use]
    pub const fn date_fields(self) -> &'static [&'static str] {
        match self {
            Self::Readers => &["dateOfBirth", "registrationDate", "lastActivity"],
            Self::Books => &["publicationDate", "addedDate", "lastBorrowed"],
            Self::BorrowRecords => &["borrowDate", "dueDate", "returnDate"],
            Self::Fines => &["issueDate", "dueDate", "paidDate"],
            Self::Renewals => &["renewalDate", "previousDueDate", "newDueDate"],
            Self::Reservations => &["reservationDate", "expiryDate"],
            Self::Categories | Self::Authors | Self::Publishers => &[],
        }
    }
}

/// A data-integrity problem found in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// Two records of one kind share an id
    DuplicateId { kind: &'static str, id: String },
    /// Borrow record pointing at a missing reader or book
    OrphanedBorrowRecord { record_id: String },
    /// Fine pointing at a missing borrow record
    OrphanedFine { fine_id: String },
    /// Reservation pointing at a missing reader or book
    OrphanedReservation { reservation_id: String },
    /// Renewal pointing at a missing borrow record
    OrphanedRenewal { renewal_id: String },
    /// A reader's derived counters disagree with the ledger
    ReaderCounterDrift { reader_id: String },
    /// A book's copy counts disagree with the ledger
    BookCounterDrift { book_id: String },
}

/// What a repair pass removed or re-derived
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    /// Later copies of a repeated id, across all collections
    pub duplicates_removed: usize,
    /// Records pointing at a missing reader or book
    pub borrow_records_removed: usize,
    /// Fines pointing at a missing borrow record
    pub fines_removed: usize,
    /// Reservations pointing at a missing reader or book
    pub reservations_removed: usize,
    /// Renewals pointing at a missing borrow record
    pub renewals_removed: usize,
}

impl RepairReport {
    /// Whether anything was deleted
    #[must_use]
    pub fn removed_anything(&self) -> bool {
        self.duplicates_removed > 0
            || self.borrow_records_removed > 0
            || self.fines_removed > 0
            || self.reservations_removed > 0
            || self.renewals_removed > 0
    }
}

/// All library data held in memory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Store {
    pub(crate) readers: Vec<Reader>,
    pub(crate) books: Vec<Book>,
    pub(crate) borrow_records: Vec<BorrowRecord>,
    pub(crate) categories: Vec<Category>,
    pub(crate) authors: Vec<Author>,
    pub(crate) publishers: Vec<Publisher>,
    pub(crate) fines: Vec<Fine>,
    pub(crate) renewals: Vec<Renewal>,
    pub(crate) reservations: Vec<Reservation>,
    /// Activity log, newest first
    pub(crate) activities: Vec<ActivityEntry>,
    /// When the store was last persisted
    pub(crate) last_save_time: Option<DateTime<Utc>>,
    /// UTC date of the last maintenance sweep
    pub(crate) last_maintenance_date: Option<NaiveDate>,
}

impl Store {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All readers
    #[must_use]
    pub fn readers(&self) -> &[Reader] {
        &self.readers
    }

    /// All books
    #[must_use]
    pub fn books(&self) -> &[Book] {
        &self.books
    }

    /// All borrow records
    #[must_use]
    pub fn borrow_records(&self) -> &[BorrowRecord] {
        &self.borrow_records
    }

    /// All categories
    #[must_use]
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// All authors
    #[must_use]
    pub fn authors(&self) -> &[Author] {
        &self.authors
    }

    /// All publishers
    #[must_use]
    pub fn publishers(&self) -> &[Publisher] {
        &self.publishers
    }

    /// All fines
    #[must_use]
    pub fn fines(&self) -> &[Fine] {
        &self.fines
    }

    /// All renewals
    #[must_use]
    pub fn renewals(&self) -> &[Renewal] {
        &self.renewals
    }

    /// All reservations
    #[must_use]
    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    /// Activity log, newest first
    #[must_use]
    pub fn activities(&self) -> &[ActivityEntry] {
        &self.activities
    }

    /// When the store was last persisted
    #[must_use]
    pub fn last_save_time(&self) -> Option<DateTime<Utc>> {
        self.last_save_time
    }

    /// UTC date of the last maintenance sweep
    #[must_use]
    pub fn last_maintenance_date(&self) -> Option<NaiveDate> {
        self.last_maintenance_date
    }

    /// Whether every collection is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
            && self.books.is_empty()
            && self.borrow_records.is_empty()
            && self.categories.is_empty()
            && self.authors.is_empty()
            && self.publishers.is_empty()
            && self.fines.is_empty()
            && self.renewals.is_empty()
            && self.reservations.is_empty()
    }

    /// Look up a reader by id
    #[must_use]
    pub fn reader(&self, id: &str) -> Option<&Reader> {
        self.readers.iter().find(|r| r.id == id)
    }

    /// Look up a book by id
    #[must_use]
    pub fn book(&self, id: &str) -> Option<&Book> {
        self.books.iter().find(|b| b.id == id)
    }

    /// Look up a borrow record by id
    #[must_use]
    pub fn borrow_record(&self, id: &str) -> Option<&BorrowRecord> {
        self.borrow_records.iter().find(|r| r.id == id)
    }

    /// Look up a fine by id
    #[must_use]
    pub fn fine(&self, id: &str) -> Option<&Fine> {
        self.fines.iter().find(|f| f.id == id)
    }

    /// Look up a reservation by id
    #[must_use]
    pub fn reservation(&self, id: &str) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Mutable reader lookup
    pub(crate) fn reader_mut(&mut self, id: &str) -> Option<&mut Reader> {
        self.readers.iter_mut().find(|r| r.id == id)
    }

    /// Mutable book lookup
    pub(crate) fn book_mut(&mut self, id: &str) -> Option<&mut Book> {
        self.books.iter_mut().find(|b| b.id == id)
    }

    /// Mutable borrow record lookup
    pub(crate) fn borrow_record_mut(&mut self, id: &str) -> Option<&mut BorrowRecord> {
        self.borrow_records.iter_mut().find(|r| r.id == id)
    }

    /// Mutable fine lookup
    pub(crate) fn fine_mut(&mut self, id: &str) -> Option<&mut Fine> {
        self.fines.iter_mut().find(|f| f.id == id)
    }

    /// Mutable reservation lookup
    pub(crate) fn reservation_mut(&mut self, id: &str) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// The open (borrowed or overdue) record for a reader and book, if any
    #[must_use]
    pub fn open_record(&self, reader_id: &str, book_id: &str) -> Option<&BorrowRecord> {
        self.borrow_records
            .iter()
            .find(|r| r.is_open() && r.reader_id == reader_id && r.book_id == book_id)
    }

    /// The reader's active reservation for a book, if any
    #[must_use]
    pub fn active_reservation(&self, reader_id: &str, book_id: &str) -> Option<&Reservation> {
        self.reservations
            .iter()
            .find(|r| r.is_active() && r.reader_id == reader_id && r.book_id == book_id)
    }

    /// Active reservations for a book, lowest priority number first
    #[must_use]
    pub fn reservation_queue(&self, book_id: &str) -> Vec<&Reservation> {
        let mut queue: Vec<&Reservation> =
            self.reservations.iter().filter(|r| r.is_active() && r.book_id == book_id).collect();
        queue.sort_by_key(|r| r.priority);
        queue
    }

    /// Number of open loans of a book
    fn open_loans_of(&self, book_id: &str) -> u32 {
        count_u32(self.borrow_records.iter().filter(|r| r.is_open() && r.book_id == book_id))
    }

    /// Number of active reservations of a book
    fn active_reservations_of(&self, book_id: &str) -> u32 {
        count_u32(self.reservations.iter().filter(|r| r.is_active() && r.book_id == book_id))
    }

    /// Re-derive the copy counts of one book from the ledger
    pub(crate) fn refresh_availability(&mut self, book_id: &str) {
        let loans = self.open_loans_of(book_id);
        let reservations = self.active_reservations_of(book_id);
        if let Some(book) = self.book_mut(book_id) {
            book.set_availability(loans, reservations);
        }
    }

    /// Re-derive the copy counts of every book
    pub(crate) fn refresh_all_availability(&mut self) {
        let ids: Vec<String> = self.books.iter().map(|b| b.id.clone()).collect();
        for id in &ids {
            self.refresh_availability(id);
        }
    }

    /// Renumber a book's active reservations 1..n in their current order
    pub(crate) fn renumber_queue(&mut self, book_id: &str) {
        let mut queue: Vec<&mut Reservation> = self
            .reservations
            .iter_mut()
            .filter(|r| r.is_active() && r.book_id == book_id)
            .collect();
        queue.sort_by_key(|r| r.priority);
        for (rank, reservation) in (1_u32..).zip(queue) {
            reservation.priority = rank;
        }
    }

    /// Ledger-derived `(current_borrows, fine_amount)` for a reader
    fn derived_reader_counters(&self, reader_id: &str) -> (u32, u64) {
        let open = count_u32(
            self.borrow_records.iter().filter(|r| r.is_open() && r.reader_id == reader_id),
        );
        let owed = self
            .fines
            .iter()
            .filter(|f| f.is_unpaid() && f.reader_id == reader_id)
            .fold(0_u64, |sum, f| sum.saturating_add(f.amount));
        (open, owed)
    }

    /// List integrity problems without changing anything
    #[must_use]
    pub fn integrity_issues(&self) -> Vec<IntegrityIssue> {
        let mut issues = Vec::new();
        push_duplicates(&mut issues, EntityKind::Readers, self.readers.iter().map(|r| &r.id));
        push_duplicates(&mut issues, EntityKind::Books, self.books.iter().map(|b| &b.id));
        push_duplicates(
            &mut issues,
            EntityKind::BorrowRecords,
            self.borrow_records.iter().map(|r| &r.id),
        );
        push_duplicates(&mut issues, EntityKind::Fines, self.fines.iter().map(|f| &f.id));
        push_duplicates(
            &mut issues,
            EntityKind::Reservations,
            self.reservations.iter().map(|r| &r.id),
        );

        for record in &self.borrow_records {
            if self.reader(&record.reader_id).is_none() || self.book(&record.book_id).is_none() {
                issues.push(IntegrityIssue::OrphanedBorrowRecord { record_id: record.id.clone() });
            }
        }
        for fine in &self.fines {
            if self.borrow_record(&fine.borrow_record_id).is_none() {
                issues.push(IntegrityIssue::OrphanedFine { fine_id: fine.id.clone() });
            }
        }
        for reservation in &self.reservations {
            if self.reader(&reservation.reader_id).is_none()
                || self.book(&reservation.book_id).is_none()
            {
                issues.push(IntegrityIssue::OrphanedReservation {
                    reservation_id: reservation.id.clone(),
                });
            }
        }
        for renewal in &self.renewals {
            if self.borrow_record(&renewal.borrow_record_id).is_none() {
                issues.push(IntegrityIssue::OrphanedRenewal { renewal_id: renewal.id.clone() });
            }
        }
        for reader in &self.readers {
            if self.derived_reader_counters(&reader.id) != (reader.current_borrows, reader.fine_amount)
            {
                issues.push(IntegrityIssue::ReaderCounterDrift { reader_id: reader.id.clone() });
            }
        }
        for book in &self.books {
            let mut derived = book.clone();
            derived.set_availability(
                self.open_loans_of(&book.id),
                self.active_reservations_of(&book.id),
            );
            if derived != *book {
                issues.push(IntegrityIssue::BookCounterDrift { book_id: book.id.clone() });
            }
        }
        issues
    }

    /// Delete repeated ids and orphaned ledger records, then re-derive every
    /// counter.
    ///
    /// The first record with a given id is kept. Removals are logged at warn.
    pub fn repair(&mut self) -> RepairReport {
        let duplicates_removed = [
            drop_duplicates(&mut self.readers, |r| &r.id),
            drop_duplicates(&mut self.books, |b| &b.id),
            drop_duplicates(&mut self.borrow_records, |r| &r.id),
            drop_duplicates(&mut self.fines, |f| &f.id),
            drop_duplicates(&mut self.reservations, |r| &r.id),
        ]
        .into_iter()
        .fold(0_usize, usize::saturating_add);

        let reader_ids: HashSet<String> = self.readers.iter().map(|r| r.id.clone()).collect();
        let book_ids: HashSet<String> = self.books.iter().map(|b| b.id.clone()).collect();

        let before = self.borrow_records.len();
        self.borrow_records
            .retain(|r| reader_ids.contains(&r.reader_id) && book_ids.contains(&r.book_id));
        let borrow_records_removed = before.saturating_sub(self.borrow_records.len());

        let record_ids: HashSet<String> =
            self.borrow_records.iter().map(|r| r.id.clone()).collect();

        let before = self.fines.len();
        self.fines.retain(|f| record_ids.contains(&f.borrow_record_id));
        let fines_removed = before.saturating_sub(self.fines.len());

        let before = self.reservations.len();
        self.reservations
            .retain(|r| reader_ids.contains(&r.reader_id) && book_ids.contains(&r.book_id));
        let reservations_removed = before.saturating_sub(self.reservations.len());

        let before = self.renewals.len();
        self.renewals.retain(|r| record_ids.contains(&r.borrow_record_id));
        let renewals_removed = before.saturating_sub(self.renewals.len());

        let report = RepairReport {
            duplicates_removed,
            borrow_records_removed,
            fines_removed,
            reservations_removed,
            renewals_removed,
        };
        if report.removed_anything() {
            warn!(?report, "removed orphaned records from the store");
        }

        self.refresh_reader_counters();
        for book_id in &book_ids {
            self.renumber_queue(book_id);
        }
        self.refresh_all_availability();
        report
    }

    /// Re-derive `current_borrows` and `fine_amount` of every reader
    fn refresh_reader_counters(&mut self) {
        let derived: Vec<(String, u32, u64)> = self
            .readers
            .iter()
            .map(|r| {
                let (open, owed) = self.derived_reader_counters(&r.id);
                (r.id.clone(), open, owed)
            })
            .collect();
        for (id, open, owed) in derived {
            if let Some(reader) = self.reader_mut(&id) {
                reader.current_borrows = open;
                reader.fine_amount = owed;
            }
        }
    }

    /// Prepend an entry to the activity log, keeping at most `limit`
    pub(crate) fn push_activity(&mut self, entry: ActivityEntry, limit: usize) {
        self.activities.insert(0, entry);
        self.activities.truncate(limit);
    }
}

/// Count items into a `u32`, saturating
fn count_u32<I: Iterator>(items: I) -> u32 {
    u32::try_from(items.count()).unwrap_or(u32::MAX)
}

/// Keep the first item per id; returns how many were dropped
fn drop_duplicates<T>(items: &mut Vec<T>, id: impl Fn(&T) -> &String) -> usize {
    let before = items.len();
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(id(item).clone()));
    before.saturating_sub(items.len())
}

/// Record every id that occurs more than once
fn push_duplicates<S: AsRef<str>>(
    issues: &mut Vec<IntegrityIssue>,
    kind: EntityKind,
    ids: impl Iterator<Item = S>,
) {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for id in ids {
        let id = id.as_ref();
        if !seen.insert(id.to_owned()) && reported.insert(id.to_owned()) {
            issues.push(IntegrityIssue::DuplicateId { kind: kind.key(), id: id.to_owned() });
        }
    }
}

/// Collections as they appear in an export bundle
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct Collections {
    pub(crate) readers: Vec<Reader>,
    pub(crate) books: Vec<Book>,
    pub(crate) borrow_records: Vec<BorrowRecord>,
    pub(crate) categories: Vec<Category>,
    pub(crate) authors: Vec<Author>,
    pub(crate) publishers: Vec<Publisher>,
    pub(crate) fines: Vec<Fine>,
    pub(crate) renewals: Vec<Renewal>,
    pub(crate) reservations: Vec<Reservation>,
}

impl From<&Store> for Collections {
    fn from(store: &Store) -> Self {
        Self {
            readers: store.readers.clone(),
            books: store.books.clone(),
            borrow_records: store.borrow_records.clone(),
            categories: store.categories.clone(),
            authors: store.authors.clone(),
            publishers: store.publishers.clone(),
            fines: store.fines.clone(),
            renewals: store.renewals.clone(),
            reservations: store.reservations.clone(),
        }
    }
}

impl From<Collections> for Store {
    fn from(collections: Collections) -> Self {
        Self {
            readers: collections.readers,
            books: collections.books,
            borrow_records: collections.borrow_records,
            categories: collections.categories,
            authors: collections.authors,
            publishers: collections.publishers,
            fines: collections.fines,
            renewals: collections.renewals,
            reservations: collections.reservations,
            ..Self::default()
        }
    }
}
