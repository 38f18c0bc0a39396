//! Period reports over borrows, readers, books and fines.
//!
//! A period is an inclusive range of UTC calendar dates.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{Book, ReaderStatus},
    engine::CirculationEngine,
    error::{CirculationError, CirculationResult},
};

/// Titles listed in the popular and least-popular book tables
const BOOK_TABLE_SIZE: usize = 20;

/// Readers listed in the top-borrowers table
const TOP_READERS: usize = 10;

/// Readers listed in the top-fined table
const TOP_FINED_READERS: usize = 20;

/// Bucket size of the borrow report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// One bucket per day
    #[default]
    Day,
    /// Weeks start on Sunday
    Week,
    /// Calendar months
    Month,
    /// Calendar years
    Year,
}

impl GroupBy {
    /// First date of the bucket holding `date`
    fn bucket_start(self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Day => date,
            Self::Week => date
                .checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_sunday())))
                .unwrap_or(date),
            Self::Month => date.with_day(1).unwrap_or(date),
            Self::Year => date.with_ordinal(1).unwrap_or(date),
        }
    }

    /// Display label of the bucket starting at `start`
    fn label(self, start: NaiveDate) -> String {
        match self {
            Self::Day => start.format("%Y-%m-%d").to_string(),
            Self::Week => format!("Week of {}", start.format("%Y-%m-%d")),
            Self::Month => start.format("%Y-%m").to_string(),
            Self::Year => start.format("%Y").to_string(),
        }
    }
}

/// Inclusive date range of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Period {
    /// First day, inclusive
    pub start: NaiveDate,
    /// Last day, inclusive
    pub end: NaiveDate,
}

impl Period {
    /// Build a period, rejecting an end before the start
    ///
    /// # Errors
    ///
    /// Returns `CirculationError::Validation` when `end < start`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> CirculationResult<Self> {
        if end < start {
            return Err(CirculationError::Validation(format!(
                "report period ends ({end}) before it starts ({start})"
            )));
        }
        Ok(Self { start, end })
    }

    /// Whether an instant falls on one of the period's dates
    #[must_use]
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let date = instant.date_naive();
        date >= self.start && date <= self.end
    }

    /// Number of dates in the period
    #[must_use]
    pub fn days(&self) -> u64 {
        let span = self.end.signed_duration_since(self.start).num_days();
        u64::try_from(span).map_or(1, |days| days.saturating_add(1))
    }

    /// Every date of the period, in order
    fn dates(self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |date| *date <= end)
    }
}

/// `count / over` as a float, for averages
fn ratio(count: usize, over: u64) -> f64 {
    let count = u32::try_from(count).map_or(f64::from(u32::MAX), f64::from);
    let over = u32::try_from(over).map_or(f64::from(u32::MAX), f64::from);
    count / over.max(1.0)
}

/// Borrows and returns in one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodCount {
    /// Bucket label
    pub period: String,
    /// First day of the bucket
    pub start: NaiveDate,
    /// Borrows in the bucket
    pub borrows: usize,
    /// Returns in the bucket
    pub returns: usize,
}

/// Borrow and return activity bucketed by day, week, month or year
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowReport {
    /// Dates covered
    pub period: Period,
    /// Bucket size
    pub group_by: GroupBy,
    /// Buckets with any activity, oldest first
    pub periods: Vec<PeriodCount>,
    /// Borrows in the period
    pub total_borrows: usize,
    /// Returns in the period
    pub total_returns: usize,
    /// Borrows per day over the period
    pub avg_borrows_per_day: f64,
    /// Returns per day over the period
    pub avg_returns_per_day: f64,
}

/// Per-class reader summary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSummary {
    /// School class, e.g. `10A1`
    pub class_name: String,
    /// Readers in the class
    pub total: usize,
    /// Readers with activity during the period
    pub active: usize,
    /// Readers with an unpaid balance
    pub with_fines: usize,
    /// Lifetime loans of the class
    pub total_borrows: u64,
    /// Lifetime loans per reader
    pub avg_borrows_per_reader: f64,
}

/// A row of the top-borrowers table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopReader {
    /// The reader
    pub reader_id: String,
    /// Full name
    pub full_name: String,
    /// School-issued student id, unique
    pub student_id: String,
    /// School class, e.g. `10A1`
    pub class_name: String,
    /// Lifetime loans
    pub total_borrows: u32,
    /// Open loans
    pub current_borrows: u32,
    /// Unpaid fine balance
    pub fine_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderReport {
    /// Dates covered
    pub period: Period,
    /// Registered readers
    pub total_readers: usize,
    /// Readers with activity during the period
    pub active_readers: usize,
    /// Readers registered during the period
    pub new_readers: usize,
    /// Readers with an unpaid balance
    pub readers_with_fines: usize,
    /// Suspended readers
    pub suspended_readers: usize,
    /// Sorted by class name
    pub classes: Vec<ClassSummary>,
    /// Most borrowing readers among those active in the period
    pub top_readers: Vec<TopReader>,
}

/// Per-category book summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    /// The category
    pub category_id: String,
    /// Display name
    pub name: String,
    /// Titles in the category
    pub titles: usize,
    /// Copies in the category
    pub total_copies: u64,
    /// Copies on the shelf
    pub available_copies: u64,
    /// Loans started in the period
    pub borrows_in_period: usize,
}

/// A row of the popular and least-popular book tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookUsage {
    /// The book
    pub book_id: String,
    /// Title
    pub title: String,
    /// Author name
    pub author: String,
    /// Category name
    pub category: String,
    /// Loans in the period
    pub borrow_count: usize,
    /// Copies owned
    pub total_copies: u32,
    /// Copies on the shelf
    pub available_copies: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookReport {
    /// Dates covered
    pub period: Period,
    /// Distinct titles
    pub titles: usize,
    /// Copies owned
    pub total_copies: u64,
    /// Copies on the shelf
    pub available_copies: u64,
    /// Copies on loan
    pub borrowed_copies: u64,
    /// Loans started in the period
    pub borrows_in_period: usize,
    /// Busiest category first
    pub categories: Vec<CategorySummary>,
    /// Most borrowed titles, busiest first
    pub popular_books: Vec<BookUsage>,
    /// Titles not borrowed during the period, newest additions first
    pub unused_books: Vec<BookUsage>,
}

/// Fine totals for one reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderFines {
    /// The reader
    pub reader_id: String,
    /// Full name
    pub full_name: String,
    /// School-issued student id, unique
    pub student_id: String,
    /// School class, e.g. `10A1`
    pub class_name: String,
    /// Fines issued in the period
    pub fines: usize,
    /// Amount issued in the period
    pub total_amount: u64,
    /// Amount paid
    pub paid_amount: u64,
    /// Amount still owed
    pub unpaid_amount: u64,
}

/// Fines issued and paid on one date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyFines {
    /// Calendar day
    pub date: NaiveDate,
    /// Fines issued that day
    pub issued: usize,
    /// Amount issued
    pub issued_amount: u64,
    /// Fines paid that day
    pub paid: usize,
    /// Amount paid
    pub paid_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FineReport {
    /// Dates covered
    pub period: Period,
    /// Fines issued during the period
    pub issued: usize,
    /// Amount issued
    pub issued_amount: u64,
    /// Fines paid during the period
    pub paid: usize,
    /// Amount paid
    pub paid_amount: u64,
    /// Everything still owed, regardless of period
    pub outstanding: usize,
    /// Amount still unpaid
    pub outstanding_amount: u64,
    /// Readers fined during the period, largest total first
    pub top_readers: Vec<ReaderFines>,
    /// One row per date of the period
    pub daily: Vec<DailyFines>,
}

impl CirculationEngine {
    /// Borrows and returns between two dates, bucketed by `group_by`.
    ///
    /// # Errors
    ///
    /// Returns `CirculationError::Validation` when `end < start`.
    pub fn borrow_report(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        group_by: GroupBy,
    ) -> CirculationResult<BorrowReport> {
        let period = Period::new(start, end)?;
        let records = self.store().borrow_records();

        let mut buckets: BTreeMap<NaiveDate, (usize, usize)> = BTreeMap::new();
        let mut total_borrows = 0_usize;
        let mut total_returns = 0_usize;
        for record in records {
            if period.contains(record.borrow_date) {
                let counts =
                    buckets.entry(group_by.bucket_start(record.borrow_date.date_naive())).or_default();
                counts.0 = counts.0.saturating_add(1);
                total_borrows = total_borrows.saturating_add(1);
            }
            if let Some(returned) = record.return_date.filter(|d| period.contains(*d)) {
                let counts = buckets.entry(group_by.bucket_start(returned.date_naive())).or_default();
                counts.1 = counts.1.saturating_add(1);
                total_returns = total_returns.saturating_add(1);
            }
        }

        let periods = buckets
            .into_iter()
            .map(|(start, (borrows, returns))| PeriodCount {
                period: group_by.label(start),
                start,
                borrows,
                returns,
            })
            .collect();
        Ok(BorrowReport {
            period,
            group_by,
            periods,
            total_borrows,
            total_returns,
            avg_borrows_per_day: ratio(total_borrows, period.days()),
            avg_returns_per_day: ratio(total_returns, period.days()),
        })
    }

    /// Reader activity between two dates, with per-class totals.
    ///
    /// # Errors
    ///
    /// Returns `CirculationError::Validation` when `end < start`.
    pub fn reader_report(&self, start: NaiveDate, end: NaiveDate) -> CirculationResult<ReaderReport> {
        let period = Period::new(start, end)?;
        let readers = self.store().readers();

        let mut classes: BTreeMap<&str, ClassSummary> = BTreeMap::new();
        for reader in readers {
            let summary = classes.entry(reader.class_name.as_str()).or_insert_with(|| ClassSummary {
                class_name: reader.class_name.clone(),
                total: 0,
                active: 0,
                with_fines: 0,
                total_borrows: 0,
                avg_borrows_per_reader: 0.0,
            });
            summary.total = summary.total.saturating_add(1);
            if period.contains(reader.last_activity) {
                summary.active = summary.active.saturating_add(1);
            }
            if reader.fine_amount > 0 {
                summary.with_fines = summary.with_fines.saturating_add(1);
            }
            summary.total_borrows = summary.total_borrows.saturating_add(u64::from(reader.total_borrows));
        }
        let classes = classes
            .into_values()
            .map(|mut summary| {
                let borrows = usize::try_from(summary.total_borrows).unwrap_or(usize::MAX);
                summary.avg_borrows_per_reader =
                    ratio(borrows, u64::try_from(summary.total).unwrap_or(u64::MAX));
                summary
            })
            .collect();

        let mut top: Vec<TopReader> = readers
            .iter()
            .filter(|r| period.contains(r.last_activity))
            .map(|r| TopReader {
                reader_id: r.id.clone(),
                full_name: r.full_name.clone(),
                student_id: r.student_id.clone(),
                class_name: r.class_name.clone(),
                total_borrows: r.total_borrows,
                current_borrows: r.current_borrows,
                fine_amount: r.fine_amount,
            })
            .collect();
        top.sort_by(|a, b| b.total_borrows.cmp(&a.total_borrows));
        top.truncate(TOP_READERS);

        Ok(ReaderReport {
            period,
            total_readers: readers.len(),
            active_readers: readers.iter().filter(|r| period.contains(r.last_activity)).count(),
            new_readers: readers.iter().filter(|r| period.contains(r.registration_date)).count(),
            readers_with_fines: readers.iter().filter(|r| r.fine_amount > 0).count(),
            suspended_readers: readers
                .iter()
                .filter(|r| r.status == ReaderStatus::Suspended)
                .count(),
            classes,
            top_readers: top,
        })
    }

    /// Collection usage between two dates, per title and per category.
    ///
    /// # Errors
    ///
    /// Returns `CirculationError::Validation` when `end < start`.
    pub fn book_report(&self, start: NaiveDate, end: NaiveDate) -> CirculationResult<BookReport> {
        let period = Period::new(start, end)?;
        let store = self.store();
        let books = store.books();

        let mut borrow_counts: HashMap<&str, usize> = HashMap::new();
        let mut borrows_in_period = 0_usize;
        for record in store.borrow_records().iter().filter(|r| period.contains(r.borrow_date)) {
            let count = borrow_counts.entry(record.book_id.as_str()).or_default();
            *count = count.saturating_add(1);
            borrows_in_period = borrows_in_period.saturating_add(1);
        }
        let borrows_of = |book: &Book| borrow_counts.get(book.id.as_str()).copied().unwrap_or(0);
        let usage = |book: &Book| BookUsage {
            book_id: book.id.clone(),
            title: book.title.clone(),
            author: store
                .authors()
                .iter()
                .find(|a| a.id == book.author_id)
                .map(|a| a.name.clone())
                .unwrap_or_default(),
            category: store
                .categories()
                .iter()
                .find(|c| c.id == book.category_id)
                .map(|c| c.name.clone())
                .unwrap_or_default(),
            borrow_count: borrows_of(book),
            total_copies: book.total_copies,
            available_copies: book.available_copies,
        };

        let mut categories: Vec<CategorySummary> = store
            .categories()
            .iter()
            .map(|category| {
                let in_category = || books.iter().filter(|b| b.category_id == category.id);
                CategorySummary {
                    category_id: category.id.clone(),
                    name: category.name.clone(),
                    titles: in_category().count(),
                    total_copies: in_category().map(|b| u64::from(b.total_copies)).sum(),
                    available_copies: in_category().map(|b| u64::from(b.available_copies)).sum(),
                    borrows_in_period: in_category().map(borrows_of).sum(),
                }
            })
            .collect();
        categories.sort_by(|a, b| b.borrows_in_period.cmp(&a.borrows_in_period));

        let mut popular: Vec<BookUsage> =
            books.iter().filter(|&b| borrows_of(b) > 0).map(usage).collect();
        popular.sort_by(|a, b| b.borrow_count.cmp(&a.borrow_count));
        popular.truncate(BOOK_TABLE_SIZE);

        let mut unused: Vec<&Book> = books.iter().filter(|&b| borrows_of(b) == 0).collect();
        unused.sort_by(|a, b| b.added_date.cmp(&a.added_date));
        let unused_books = unused.into_iter().take(BOOK_TABLE_SIZE).map(usage).collect();

        Ok(BookReport {
            period,
            titles: books.len(),
            total_copies: books.iter().map(|b| u64::from(b.total_copies)).sum(),
            available_copies: books.iter().map(|b| u64::from(b.available_copies)).sum(),
            borrowed_copies: books.iter().map(|b| u64::from(b.borrowed_copies)).sum(),
            borrows_in_period,
            categories,
            popular_books: popular,
            unused_books,
        })
    }

    /// Fines issued and collected between two dates, with a daily breakdown.
    ///
    /// # Errors
    ///
    /// Returns `CirculationError::Validation` when `end < start`.
    pub fn fine_report(&self, start: NaiveDate, end: NaiveDate) -> CirculationResult<FineReport> {
        let period = Period::new(start, end)?;
        let store = self.store();
        let fines = store.fines();
        let issued: Vec<_> = fines.iter().filter(|f| period.contains(f.issue_date)).collect();
        let paid: Vec<_> =
            fines.iter().filter(|f| f.paid_date.is_some_and(|d| period.contains(d))).collect();

        let mut by_reader: HashMap<&str, ReaderFines> = HashMap::new();
        for fine in &issued {
            let Some(reader) = store.reader(&fine.reader_id) else {
                continue;
            };
            let row = by_reader.entry(reader.id.as_str()).or_insert_with(|| ReaderFines {
                reader_id: reader.id.clone(),
                full_name: reader.full_name.clone(),
                student_id: reader.student_id.clone(),
                class_name: reader.class_name.clone(),
                fines: 0,
                total_amount: 0,
                paid_amount: 0,
                unpaid_amount: 0,
            });
            row.fines = row.fines.saturating_add(1);
            row.total_amount = row.total_amount.saturating_add(fine.amount);
            if fine.is_unpaid() {
                row.unpaid_amount = row.unpaid_amount.saturating_add(fine.amount);
            } else {
                row.paid_amount = row.paid_amount.saturating_add(fine.amount);
            }
        }
        let mut top_readers: Vec<ReaderFines> = by_reader.into_values().collect();
        top_readers.sort_by(|a, b| {
            b.total_amount.cmp(&a.total_amount).then_with(|| a.full_name.cmp(&b.full_name))
        });
        top_readers.truncate(TOP_FINED_READERS);

        let daily = period
            .dates()
            .map(|date| {
                let issued_on: Vec<_> =
                    issued.iter().filter(|f| f.issue_date.date_naive() == date).collect();
                let paid_on: Vec<_> = paid
                    .iter()
                    .filter(|f| f.paid_date.is_some_and(|d| d.date_naive() == date))
                    .collect();
                DailyFines {
                    date,
                    issued: issued_on.len(),
                    issued_amount: issued_on.iter().map(|f| f.amount).sum(),
                    paid: paid_on.len(),
                    paid_amount: paid_on.iter().map(|f| f.amount).sum(),
                }
            })
            .collect();

        let outstanding: Vec<_> = fines.iter().filter(|f| f.is_unpaid()).collect();
        Ok(FineReport {
            period,
            issued: issued.len(),
            issued_amount: issued.iter().map(|f| f.amount).sum(),
            paid: paid.len(),
            paid_amount: paid.iter().map(|f| f.amount).sum(),
            outstanding: outstanding.len(),
            outstanding_amount: outstanding.iter().map(|f| f.amount).sum(),
            top_readers,
            daily,
        })
    }
}
