//! Transactional circulation records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds in a day, the unit overdue time is rounded up to
const MILLIS_PER_DAY: u64 = 86_400_000;

/// Whole days, rounded up, by which `at` is past `due`; zero when not late
#[must_use]
pub fn overdue_days(due: DateTime<Utc>, at: DateTime<Utc>) -> u64 {
    let late = at.signed_duration_since(due).num_milliseconds();
    u64::try_from(late).map_or(0, |millis| millis.div_ceil(MILLIS_PER_DAY))
}

/// Persisted state of a borrow record.
///
/// Overdue is not stored: see [`BorrowRecord::status_at`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BorrowStatus {
    /// The copy is with the reader
    #[default]
    #[serde(alias = "overdue")]
    Borrowed,
    /// The copy is back
    Returned,
}

/// Circulation status as seen at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CirculationStatus {
    /// Out on loan, due date not passed
    Borrowed,
    /// Out on loan past its due date
    Overdue,
    /// Returned
    Returned,
}

impl fmt::Display for CirculationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Borrowed => "borrowed",
            Self::Overdue => "overdue",
            Self::Returned => "returned",
        };
        f.write_str(name)
    }
}

/// One loan of one book to one reader
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowRecord {
    /// Unique id
    pub id: String,
    /// Reader the record belongs to
    pub reader_id: String,
    /// Book the record concerns
    pub book_id: String,
    /// When the copy was lent
    pub borrow_date: DateTime<Utc>,
    /// When the copy is due back
    pub due_date: DateTime<Utc>,
    /// When the copy came back
    #[serde(default)]
    pub return_date: Option<DateTime<Utc>>,
    /// Stored state; overdue is derived from `due_date`
    #[serde(default)]
    pub status: BorrowStatus,
    /// Renewals so far
    #[serde(default)]
    pub renewal_count: u32,
    /// Free-text notes
    #[serde(default)]
    pub notes: String,
    /// Actor who lent the copy
    #[serde(default)]
    pub librarian: String,
}

impl BorrowRecord {
    /// Whether the copy is still out (borrowed or overdue)
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == BorrowStatus::Borrowed
    }

    /// Whether the record is open and its due date has passed at `now`
    #[must_use]
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && self.due_date < now
    }

    /// The single rule deriving overdue from the due date
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> CirculationStatus {
        match self.status {
            BorrowStatus::Returned => CirculationStatus::Returned,
            BorrowStatus::Borrowed if self.due_date < now => CirculationStatus::Overdue,
            BorrowStatus::Borrowed => CirculationStatus::Borrowed,
        }
    }

    /// Days overdue at `now`, zero for returned or on-time records
    #[must_use]
    pub fn overdue_days_at(&self, now: DateTime<Utc>) -> u64 {
        if self.is_open() { overdue_days(self.due_date, now) } else { 0 }
    }

    /// Append a line to the free-text notes
    pub(crate) fn append_note(&mut self, line: &str) {
        append_line(&mut self.notes, line);
    }
}

/// Payment state of a fine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FineStatus {
    /// Still owed
    #[default]
    Unpaid,
    /// Settled
    Paid,
}

/// How a fine was settled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Paid at the desk
    #[default]
    Cash,
    /// Bank transfer
    BankTransfer,
    /// Card payment
    Card,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cash => "cash",
            Self::BankTransfer => "bank transfer",
            Self::Card => "card",
        };
        f.write_str(name)
    }
}

/// A charge for returning a book late
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fine {
    /// Unique id
    pub id: String,
    /// Loan the record refers to
    pub borrow_record_id: String,
    /// Reader the record belongs to
    pub reader_id: String,
    /// Amount charged
    pub amount: u64,
    /// Why the record was created
    #[serde(default)]
    pub reason: String,
    /// When the fine was issued
    pub issue_date: DateTime<Utc>,
    /// When the copy is due back
    pub due_date: DateTime<Utc>,
    /// When the fine was paid
    #[serde(default)]
    pub paid_date: Option<DateTime<Utc>>,
    /// Paid or unpaid
    #[serde(default)]
    pub status: FineStatus,
    /// How the fine was paid
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    /// Free-text notes
    #[serde(default)]
    pub notes: String,
    /// Actor who issued the fine
    #[serde(default)]
    pub issued_by: String,
}

impl Fine {
    /// Whether the fine still counts against the reader's balance
    #[must_use]
    pub fn is_unpaid(&self) -> bool {
        self.status == FineStatus::Unpaid
    }

    /// Append a line to the free-text notes
    pub(crate) fn append_note(&mut self, line: &str) {
        append_line(&mut self.notes, line);
    }
}

/// Audit record of a due-date extension
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Renewal {
    /// Unique id
    pub id: String,
    /// Loan the record refers to
    pub borrow_record_id: String,
    /// Reader the record belongs to
    pub reader_id: String,
    /// Book the record concerns
    pub book_id: String,
    /// When the renewal happened
    pub renewal_date: DateTime<Utc>,
    /// Due date before the renewal
    pub previous_due_date: DateTime<Utc>,
    /// Due date after the renewal
    pub new_due_date: DateTime<Utc>,
    /// Why the record was created
    #[serde(default)]
    pub reason: String,
    /// Actor who took the payment
    #[serde(default)]
    pub approved_by: String,
}

/// Lifecycle of a reservation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Waiting in the queue
    #[default]
    Active,
    /// Withdrawn by the reader or librarian
    Cancelled,
    /// Hold window ran out
    Expired,
    /// The holder borrowed the book
    Fulfilled,
}

/// A reader queued for a title with no free copy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    /// Unique id
    pub id: String,
    /// Reader the record belongs to
    pub reader_id: String,
    /// Book the record concerns
    pub book_id: String,
    /// When the reader queued
    pub reservation_date: DateTime<Utc>,
    /// When the reservation lapses
    pub expiry_date: DateTime<Utc>,
    /// Lifecycle state
    #[serde(default)]
    pub status: ReservationStatus,
    /// 1-based FIFO rank among the book's active reservations
    pub priority: u32,
    /// Free-text notes
    #[serde(default)]
    pub notes: String,
    /// Whether the reader was told a copy is back
    #[serde(default)]
    pub notification_sent: bool,
}

impl Reservation {
    /// Whether the reservation is still queued
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }
}

/// Append `line` to `notes`, newline separated
fn append_line(notes: &mut String, line: &str) {
    if !notes.is_empty() {
        notes.push('\n');
    }
    notes.push_str(line.trim_end());
}
