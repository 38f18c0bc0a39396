//! Read-only views over the store: search, listings, dashboard totals.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Days, Utc};
use serde::Serialize;

use super::{CirculationEngine, days_after, days_before, start_of_day};
use crate::{
    catalog::{Book, Reader, ReaderStatus},
    filters::{Availability, BookFilter, BorrowFilter, FineFilter, ReaderFilter, SearchTerm, accepts},
    ledger::{BorrowRecord, CirculationStatus, Fine, overdue_days},
};

/// An overdue loan joined with its reader and book
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueEntry {
    /// The loan
    pub record: BorrowRecord,
    /// Borrowing reader
    pub reader: Reader,
    /// Borrowed book
    pub book: Book,
    /// Whole days past due, rounded up
    pub overdue_days: u64,
    /// Fine the loan would incur if returned now
    pub projected_fine: u64,
}

/// A loan coming due soon
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DueSoonEntry {
    /// The loan
    pub record: BorrowRecord,
    /// Borrowing reader, if still registered
    pub reader: Option<Reader>,
    /// Borrowed book, if still catalogued
    pub book: Option<Book>,
    /// Whole days left, rounded up
    pub days_until_due: u64,
}

/// A title with its recent borrow count
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopularBook {
    /// The title
    pub book: Book,
    /// Loans in the window
    pub borrow_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderTotals {
    /// Registered readers
    pub total: usize,
    /// Readers in good standing
    pub active: usize,
    /// Readers in warning
    pub warning: usize,
    /// Readers suspended
    pub suspended: usize,
}

/// Copy counts summed over every title
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookTotals {
    /// Distinct titles
    pub titles: usize,
    /// Copies owned
    pub total: u64,
    /// Copies on the shelf
    pub available: u64,
    /// Copies on loan
    pub borrowed: u64,
    /// Copies held for reservations
    pub reserved: u64,
}

/// Loan counts; `today`, `this_week` and `this_month` count borrow dates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowTotals {
    /// Every loan ever recorded
    pub total: usize,
    /// Open and not yet due
    pub active: usize,
    /// Past their due date
    pub overdue: usize,
    /// Started today
    pub today: usize,
    /// Started in the last 7 days
    pub this_week: usize,
    /// Started in the last 30 days
    pub this_month: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnTotals {
    /// Returned today
    pub today: usize,
    /// Returned in the last 7 days
    pub this_week: usize,
    /// Returned in the last 30 days
    pub this_month: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FineTotals {
    /// Fines ever issued
    pub total: usize,
    /// Unpaid fines
    pub unpaid: usize,
    /// Amount charged
    pub total_amount: u64,
    /// Amount still owed
    pub unpaid_amount: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationTotals {
    /// Reservations still queued
    pub active: usize,
    /// Reservations ever made
    pub total: usize,
}

/// Dashboard totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    /// Reader counts
    pub readers: ReaderTotals,
    /// Copy counts
    pub books: BookTotals,
    /// Loan counts
    pub borrows: BorrowTotals,
    /// Return counts
    pub returns: ReturnTotals,
    /// Fine counts
    pub fines: FineTotals,
    /// Reservation counts
    pub reservations: ReservationTotals,
}

impl CirculationEngine {
    /// Readers matching a free-text term and the filter.
    ///
    /// The term is looked up in name, student id, card number, class, email
    /// and phone.
    #[must_use]
    pub fn search_readers(&self, term: &str, filter: &ReaderFilter) -> Vec<&Reader> {
        let term = SearchTerm::new(term);
        let now = self.clock.now();
        let overdue_readers: HashSet<&str> = self
            .store
            .borrow_records
            .iter()
            .filter(|r| r.is_overdue_at(now))
            .map(|r| r.reader_id.as_str())
            .collect();

        self.store
            .readers
            .iter()
            .filter(|r| {
                term.matches_any([
                    &r.full_name,
                    &r.student_id,
                    &r.card_number,
                    &r.class_name,
                    &r.email,
                    &r.phone,
                ])
            })
            .filter(|r| accepts(filter.class_name.as_deref(), r.class_name.as_str()))
            .filter(|r| accepts(filter.status.as_ref(), &r.status))
            .filter(|r| accepts(filter.gender.as_deref(), r.gender.as_str()))
            .filter(|r| !filter.has_overdue || overdue_readers.contains(r.id.as_str()))
            .filter(|r| !filter.has_fines || r.fine_amount > 0)
            .collect()
    }

    /// Books matching a free-text term and the filter.
    ///
    /// The term is looked up in title, ISBN, description, location and tags.
    #[must_use]
    pub fn search_books(&self, term: &str, filter: &BookFilter) -> Vec<&Book> {
        let term = SearchTerm::new(term);
        self.store
            .books
            .iter()
            .filter(|b| {
                let fields = [&b.title, &b.isbn, &b.description, &b.location];
                term.matches_any(fields.into_iter().chain(&b.tags))
            })
            .filter(|b| accepts(filter.category_id.as_deref(), b.category_id.as_str()))
            .filter(|b| accepts(filter.author_id.as_deref(), b.author_id.as_str()))
            .filter(|b| accepts(filter.publisher_id.as_deref(), b.publisher_id.as_str()))
            .filter(|b| accepts(filter.language.as_deref(), b.language.as_str()))
            .filter(|b| accepts(filter.status.as_ref(), &b.status))
            .filter(|b| accepts(filter.condition.as_deref(), b.condition.as_str()))
            .filter(|b| match filter.availability {
                None => true,
                Some(Availability::Available) => b.available_copies > 0,
                Some(Availability::Unavailable) => b.available_copies == 0,
            })
            .collect()
    }

    /// Borrow records matching the filter; status is derived at call time
    #[must_use]
    pub fn get_borrow_records(&self, filter: &BorrowFilter) -> Vec<&BorrowRecord> {
        let now = self.clock.now();
        let today = now.date_naive();
        let day_start = start_of_day(today);
        let day_end = start_of_day(today.checked_add_days(Days::new(1)).unwrap_or(today));

        self.store
            .borrow_records
            .iter()
            .filter(|r| accepts(filter.reader_id.as_deref(), r.reader_id.as_str()))
            .filter(|r| accepts(filter.book_id.as_deref(), r.book_id.as_str()))
            .filter(|r| accepts(filter.status.as_ref(), &r.status_at(now)))
            .filter(|r| {
                !filter.due_today || (r.is_open() && r.due_date >= day_start && r.due_date < day_end)
            })
            .collect()
    }

    /// Open loans past their due date, optionally narrowed by a term matched
    /// against reader name, student id and book title.
    ///
    /// Records whose reader or book is missing are skipped.
    #[must_use]
    pub fn get_overdue_books(&self, term: &str) -> Vec<OverdueEntry> {
        let term = SearchTerm::new(term);
        let now = self.clock.now();
        self.store
            .borrow_records
            .iter()
            .filter(|r| r.is_overdue_at(now))
            .filter_map(|record| {
                let reader = self.store.reader(&record.reader_id)?;
                let book = self.store.book(&record.book_id)?;
                if !term.matches_any([&reader.full_name, &reader.student_id, &book.title]) {
                    return None;
                }
                let days = record.overdue_days_at(now);
                Some(OverdueEntry {
                    record: record.clone(),
                    reader: reader.clone(),
                    book: book.clone(),
                    overdue_days: days,
                    projected_fine: days.saturating_mul(self.policy.fine_per_day),
                })
            })
            .collect()
    }

    /// Fines matching the filter
    #[must_use]
    pub fn get_fines(&self, filter: &FineFilter) -> Vec<&Fine> {
        let now = self.clock.now();
        self.store
            .fines
            .iter()
            .filter(|f| accepts(filter.reader_id.as_deref(), f.reader_id.as_str()))
            .filter(|f| accepts(filter.status.as_ref(), &f.status))
            .filter(|f| !filter.overdue || (f.is_unpaid() && f.due_date < now))
            .collect()
    }

    /// Dashboard totals.
    ///
    /// "Today" and "this month" start at UTC midnight; "this week" is the
    /// last seven days.
    #[must_use]
    pub fn get_statistics(&self) -> Statistics {
        let now = self.clock.now();
        let today = start_of_day(now.date_naive());
        let this_week = days_before(today, 7);
        let this_month = start_of_day(now.date_naive().with_day(1).unwrap_or(now.date_naive()));
        let store = &self.store;

        let count_readers =
            |status: ReaderStatus| store.readers.iter().filter(|r| r.status == status).count();
        let copies = |count: fn(&Book) -> u32| -> u64 {
            store.books.iter().map(|b| u64::from(count(b))).sum()
        };
        let borrowed_since = |since: DateTime<Utc>| {
            store.borrow_records.iter().filter(|r| r.borrow_date >= since).count()
        };
        let returned_since = |since: DateTime<Utc>| {
            store.borrow_records.iter().filter(|r| r.return_date.is_some_and(|d| d >= since)).count()
        };

        Statistics {
            readers: ReaderTotals {
                total: store.readers.len(),
                active: count_readers(ReaderStatus::Active),
                warning: count_readers(ReaderStatus::Warning),
                suspended: count_readers(ReaderStatus::Suspended),
            },
            books: BookTotals {
                titles: store.books.len(),
                total: copies(|b| b.total_copies),
                available: copies(|b| b.available_copies),
                borrowed: copies(|b| b.borrowed_copies),
                reserved: copies(|b| b.reserved_copies),
            },
            borrows: BorrowTotals {
                total: store.borrow_records.len(),
                active: store
                    .borrow_records
                    .iter()
                    .filter(|r| r.status_at(now) == CirculationStatus::Borrowed)
                    .count(),
                overdue: store.borrow_records.iter().filter(|r| r.is_overdue_at(now)).count(),
                today: borrowed_since(today),
                this_week: borrowed_since(this_week),
                this_month: borrowed_since(this_month),
            },
            returns: ReturnTotals {
                today: returned_since(today),
                this_week: returned_since(this_week),
                this_month: returned_since(this_month),
            },
            fines: FineTotals {
                total: store.fines.len(),
                unpaid: store.fines.iter().filter(|f| f.is_unpaid()).count(),
                total_amount: store.fines.iter().map(|f| f.amount).sum(),
                unpaid_amount: store.fines.iter().filter(|f| f.is_unpaid()).map(|f| f.amount).sum(),
            },
            reservations: ReservationTotals {
                active: store.reservations.iter().filter(|r| r.is_active()).count(),
                total: store.reservations.len(),
            },
        }
    }

    /// Books with at least one but no more than `threshold` copies on the shelf
    #[must_use]
    pub fn get_low_stock_books(&self, threshold: u32) -> Vec<&Book> {
        self.store
            .books
            .iter()
            .filter(|b| b.available_copies > 0 && b.available_copies <= threshold)
            .collect()
    }

    /// The `limit` most borrowed titles over the last `days` days
    #[must_use]
    pub fn get_popular_books(&self, limit: usize, days: u32) -> Vec<PopularBook> {
        let cutoff = days_before(self.clock.now(), days);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for record in self.store.borrow_records.iter().filter(|r| r.borrow_date >= cutoff) {
            let count = counts.entry(record.book_id.as_str()).or_default();
            *count = count.saturating_add(1);
        }

        let mut popular: Vec<PopularBook> = self
            .store
            .books
            .iter()
            .filter_map(|book| {
                let borrow_count = counts.get(book.id.as_str()).copied()?;
                Some(PopularBook { book: book.clone(), borrow_count })
            })
            .collect();
        popular.sort_by(|a, b| b.borrow_count.cmp(&a.borrow_count));
        popular.truncate(limit);
        popular
    }

    /// Readers with any activity in the last `days` days
    #[must_use]
    pub fn get_active_readers(&self, days: u32) -> Vec<&Reader> {
        let cutoff = days_before(self.clock.now(), days);
        self.store.readers.iter().filter(|r| r.last_activity >= cutoff).collect()
    }

    /// Open loans not yet overdue that fall due within `days` days, soonest first
    #[must_use]
    pub fn get_due_soon_books(&self, days: u32) -> Vec<DueSoonEntry> {
        let now = self.clock.now();
        let cutoff = days_after(now, days);
        let mut due_soon: Vec<DueSoonEntry> = self
            .store
            .borrow_records
            .iter()
            .filter(|r| r.is_open() && r.due_date >= now && r.due_date <= cutoff)
            .map(|record| DueSoonEntry {
                record: record.clone(),
                reader: self.store.reader(&record.reader_id).cloned(),
                book: self.store.book(&record.book_id).cloned(),
                days_until_due: overdue_days(now, record.due_date),
            })
            .collect();
        due_soon.sort_by_key(|entry| entry.record.due_date);
        due_soon
    }
}
