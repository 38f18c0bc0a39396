use std::{fmt, mem};

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde_json::Value;
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::Policy,
    error::CirculationResult,
    events::{ActivityAction, ActivityEntry, Notification},
    observers::CirculationObserver,
    persistence::{KeyValueStorage, load_store, save_store},
    store::Store,
};

mod bulk;
mod catalog;
mod circulation;
mod maintenance;
mod queries;

pub use bulk::ImportSummary;
pub use maintenance::SweepReport;
pub use queries::{
    BookTotals, BorrowTotals, DueSoonEntry, FineTotals, OverdueEntry, PopularBook, ReaderTotals,
    ReservationTotals, ReturnTotals, Statistics,
};

/// Actor recorded when no librarian is signed in
pub const SYSTEM_ACTOR: &str = "system";

/// The circulation engine: owns the store and runs every operation on it.
///
/// Each mutating call runs inside [`CirculationEngine::transact`]: the store
/// is snapshotted, the change staged and persisted, and the snapshot restored
/// if either the rules or the storage reject it.
pub struct CirculationEngine {
    /// The library data
    store: Store,
    /// Where the store is persisted after every change
    storage: Box<dyn KeyValueStorage>,
    /// Wall-clock source
    clock: Box<dyn Clock>,
    /// Circulation rules
    policy: Policy,
    /// User name written to audit fields
    actor: String,
    /// Receivers of committed activity and notifications
    observers: Vec<Box<dyn CirculationObserver>>,
    /// Committed notifications not yet taken by the caller
    notifications: Vec<Notification>,
}

// Manual implementation of Debug for CirculationEngine
impl fmt::Debug for CirculationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CirculationEngine")
            .field("readers", &self.store.readers().len())
            .field("books", &self.store.books().len())
            .field("borrow_records", &self.store.borrow_records().len())
            .field("policy", &self.policy)
            .field("actor", &self.actor)
            .field("observers_count", &self.observers.len())
            .field("pending_notifications", &self.notifications.len())
            .finish_non_exhaustive()
    }
}

impl CirculationEngine {
    /// Open the store kept in `storage`, repairing integrity problems.
    ///
    /// Orphaned records are dropped and counters re-derived before the engine
    /// is handed out; the repaired store is written back.
    ///
    /// # Errors
    ///
    /// Returns `CirculationError::InvalidPolicy` for an invalid policy and
    /// `CirculationError::Storage` when the stored data cannot be read or
    /// the repaired store cannot be written.
    pub fn open(
        policy: Policy,
        storage: impl KeyValueStorage + 'static,
        clock: impl Clock + 'static,
    ) -> CirculationResult<Self> {
        policy.validate()?;
        let mut storage: Box<dyn KeyValueStorage> = Box::new(storage);
        let mut store = load_store(storage.as_ref())?;

        let issues = store.integrity_issues();
        if !issues.is_empty() {
            warn!(count = issues.len(), ?issues, "data integrity issues found, repairing");
            let report = store.repair();
            warn!(?report, "data integrity repaired");
            save_store(&store, storage.as_mut())?;
        }

        Ok(Self {
            store,
            storage,
            clock: Box::new(clock),
            policy,
            actor: SYSTEM_ACTOR.to_string(),
            observers: Vec::new(),
            notifications: Vec::new(),
        })
    }

    /// Register an observer to be notified of committed changes
    pub fn register_observer(&mut self, observer: Box<dyn CirculationObserver>) {
        self.observers.push(observer);
    }

    /// Set the user name written to `librarian`/`issuedBy`/`approvedBy`
    pub fn set_actor(&mut self, actor: impl Into<String>) {
        self.actor = actor.into();
    }

    /// The user name currently written to audit fields
    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Read-only view of the store
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The circulation rules in force
    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Current time according to the engine's clock
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Drain the notifications committed since the last call
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        mem::take(&mut self.notifications)
    }

    /// Run `operation` as one all-or-nothing change.
    ///
    /// Activity entries and notifications staged by the operation are only
    /// delivered after the store has been persisted.
    fn transact<T>(
        &mut self,
        operation: impl FnOnce(&mut Txn<'_>) -> CirculationResult<T>,
    ) -> CirculationResult<T> {
        let snapshot = self.store.clone();
        let now = self.clock.now();
        let mut txn = Txn {
            store: &mut self.store,
            policy: &self.policy,
            actor: &self.actor,
            now,
            activities: Vec::new(),
            notifications: Vec::new(),
        };

        let outcome = operation(&mut txn);
        let Txn { activities, notifications, .. } = txn;
        let value = match outcome {
            Ok(value) => value,
            Err(err) => {
                self.store = snapshot;
                return Err(err);
            }
        };

        for entry in &activities {
            self.store.push_activity(entry.clone(), self.policy.activity_log_limit);
        }
        self.store.last_save_time = Some(now);

        if let Err(err) = save_store(&self.store, self.storage.as_mut()) {
            error!(error = %err, "persisting the store failed, change rolled back");
            self.store = snapshot;
            return Err(err.into());
        }

        for entry in &activities {
            for observer in &self.observers {
                observer.on_activity(entry);
            }
        }
        for notification in notifications {
            for observer in &self.observers {
                observer.on_notification(&notification);
            }
            self.notifications.push(notification);
        }
        Ok(value)
    }
}

/// A staged change: the store being mutated plus the side effects to emit
/// once it commits.
#[derive(Debug)]
struct Txn<'a> {
    /// Store under mutation
    store: &'a mut Store,
    /// Rules in force
    policy: &'a Policy,
    /// User name for audit fields
    actor: &'a str,
    /// Instant the whole change happens at
    now: DateTime<Utc>,
    /// Activity entries to log on commit
    activities: Vec<ActivityEntry>,
    /// Notifications to deliver on commit
    notifications: Vec<Notification>,
}

impl Txn<'_> {
    /// Stage an activity-log entry
    fn log(&mut self, action: ActivityAction, description: String, data: Value) {
        self.activities.push(ActivityEntry {
            id: new_id(),
            timestamp: self.now,
            actor: self.actor.to_string(),
            action,
            description,
            data,
        });
    }

    /// Stage a notification
    fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    /// `now` formatted as a calendar date for notes
    fn today_label(&self) -> String {
        self.now.format("%Y-%m-%d").to_string()
    }
}

/// Fresh record id
fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// `days` whole days after `from`
fn days_after(from: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    TimeDelta::try_days(i64::from(days))
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `days` whole days before `from`
fn days_before(from: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    TimeDelta::try_days(i64::from(days))
        .and_then(|delta| from.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Midnight UTC at the start of `date`
fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).map_or(DateTime::<Utc>::MIN_UTC, |midnight| midnight.and_utc())
}

// Include tests module
#[cfg(test)]
mod tests;
