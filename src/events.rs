use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of mutating calls recorded in the activity log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    /// Reader registered
    AddReader,
    /// Reader details changed
    UpdateReader,
    /// Reader removed
    DeleteReader,
    /// Book catalogued
    AddBook,
    /// Book details changed
    UpdateBook,
    /// Book removed
    DeleteBook,
    /// Category created
    AddCategory,
    /// Category changed
    UpdateCategory,
    /// Category removed
    DeleteCategory,
    /// Author created
    AddAuthor,
    /// Publisher created
    AddPublisher,
    /// Copy lent
    BorrowBook,
    /// Copy returned
    ReturnBook,
    /// Loan extended
    RenewBook,
    /// Reader queued for a title
    ReserveBook,
    /// Reservation withdrawn
    CancelReservation,
    /// Reservation lapsed in the sweep
    ExpireReservation,
    /// Queue holder told a copy is back
    NotifyReservation,
    /// Fine issued
    CreateFine,
    /// Fine paid
    PayFine,
    /// Sweep ran
    DailyMaintenance,
    /// Integrity repair ran
    RepairData,
    /// Store exported
    ExportData,
    /// Store replaced by an import
    ImportData,
    /// Store cleared
    ResetData,
}

/// One line of the activity log
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    /// Unique id
    pub id: String,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// User name of the librarian (or `system`) that caused the change
    pub actor: String,
    /// What kind of change
    pub action: ActivityAction,
    /// Human-readable summary
    pub description: String,
    /// Structured details
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Events pushed to the UI layer after a committed operation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// A returned copy is now held for the first reader in the queue
    ReservationAvailable { reservation_id: String, reader_id: String, book_id: String },
    /// A borrow left only a few copies on the shelf
    LowStock { book_id: String, available_copies: u32 },
    /// The sweep fined an overdue loan
    Overdue { borrow_record_id: String, reader_id: String, book_id: String, overdue_days: u64 },
}
