//! Circulation engine for a school library.
//!
//! This crate tracks readers, books and the loans between them: borrowing,
//! returns, renewals, reservation queues and overdue fines, with a daily
//! maintenance sweep, period reports and whole-store import/export. Every
//! mutating call is persisted through a [`KeyValueStorage`] backend and
//! rolled back if the write fails.

pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod filters;
pub mod ledger;
pub mod observers;
pub mod persistence;
pub mod reports;
pub mod store;

pub use catalog::{Book, BookStatus, Reader, ReaderStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Policy;
pub use engine::CirculationEngine;
pub use error::{CirculationError, CirculationResult};
pub use events::{ActivityAction, ActivityEntry, Notification};
pub use ledger::{BorrowRecord, CirculationStatus, Fine, PaymentMethod, Renewal, Reservation};
pub use observers::{ActivityLogger, CirculationObserver, NotificationService};
pub use persistence::{FileStorage, KeyValueStorage, MemoryStorage, StorageError};
pub use store::Store;
