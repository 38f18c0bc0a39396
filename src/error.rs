use thiserror::Error;

use crate::{catalog::ReaderStatus, persistence::StorageError};

/// Errors raised by circulation engine operations.
///
/// Every rule violation is permanent until the underlying state changes, so
/// callers surface the message instead of retrying.
#[derive(Debug, Error)]
pub enum CirculationError {
    /// No reader with the given id
    #[error("reader not found: {0}")]
    ReaderNotFound(String),
    /// No book with the given id
    #[error("book not found: {0}")]
    BookNotFound(String),
    /// No borrow record with the given id
    #[error("borrow record not found: {0}")]
    BorrowRecordNotFound(String),
    /// No fine with the given id
    #[error("fine not found: {0}")]
    FineNotFound(String),
    /// No reservation with the given id
    #[error("reservation not found: {0}")]
    ReservationNotFound(String),
    /// No category with the given id
    #[error("category not found: {0}")]
    CategoryNotFound(String),
    /// No author with the given id
    #[error("author not found: {0}")]
    AuthorNotFound(String),
    /// No publisher with the given id
    #[error("publisher not found: {0}")]
    PublisherNotFound(String),

    /// Reader is in warning or suspended state
    #[error("reader {reader_id} is not allowed to borrow or reserve (status: {status})")]
    ReaderNotActive { reader_id: String, status: ReaderStatus },
    /// Reader already holds `limit` books
    #[error("borrow limit reached: reader already holds {limit} books")]
    BorrowLimitReached { limit: u32 },
    /// No free copy of the book
    #[error("book unavailable: no copy of {book_id} can be lent")]
    BookUnavailable { book_id: String },
    /// Reader already has an open record for this book
    #[error("reader {reader_id} already borrowed book {book_id}")]
    AlreadyBorrowed { reader_id: String, book_id: String },
    /// Reader carries an unpaid fine balance
    #[error("reader has outstanding fines of {amount}")]
    OutstandingFines { amount: u64 },
    /// Record is not in borrowed/overdue state
    #[error("borrow record {0} is already returned")]
    AlreadyReturned(String),
    /// Record already renewed `max` times
    #[error("renewal limit reached: already renewed {max} times")]
    RenewalLimitReached { max: u32 },
    /// Another reader queued for the book
    #[error("book {book_id} is reserved by another reader")]
    ReservedByAnotherReader { book_id: String },
    /// Due date already passed
    #[error("borrow record {0} is overdue and cannot be renewed")]
    RenewalPastDue(String),
    /// Fine was settled before
    #[error("fine {0} is already paid")]
    FineAlreadyPaid(String),
    /// Reservations are only taken for books with no free copy
    #[error("book {book_id} has available copies, no reservation needed")]
    BookAvailable { book_id: String },
    /// Reader already queued for this book
    #[error("reader {reader_id} already reserved book {book_id}")]
    AlreadyReserved { reader_id: String, book_id: String },
    /// Reservation is cancelled, expired or fulfilled
    #[error("reservation {0} is not active")]
    ReservationNotActive(String),

    /// Input failed field validation
    #[error("validation failed: {0}")]
    Validation(String),
    /// Another reader uses the student id
    #[error("duplicate student id: {0}")]
    DuplicateStudentId(String),
    /// Another book uses the ISBN
    #[error("duplicate ISBN: {0}")]
    DuplicateIsbn(String),
    /// Another category uses the name
    #[error("duplicate category name: {0}")]
    DuplicateCategory(String),
    /// Entity still has borrowed or overdue records
    #[error("{0} has active borrows")]
    HasActiveBorrows(String),
    /// Reader still owes money
    #[error("reader {0} has unpaid fines")]
    HasUnpaidFines(String),
    /// Book still has a reservation queue
    #[error("book {0} has active reservations")]
    HasActiveReservations(String),
    /// Category is referenced by books
    #[error("category {0} is used by books")]
    CategoryInUse(String),

    /// Import payload is malformed
    #[error("invalid import payload: {0}")]
    InvalidImport(String),
    /// Policy values are out of range
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// Persisting or loading the store failed
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Result alias for engine operations
pub type CirculationResult<T> = Result<T, CirculationError>;
