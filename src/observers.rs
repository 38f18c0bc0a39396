use std::{cell::RefCell, rc::Rc};

use tracing::info;

use crate::events::{ActivityEntry, Notification};

/// Receives activity and notifications once an operation has committed
pub trait CirculationObserver {
    /// Called for every activity-log entry
    fn on_activity(&self, entry: &ActivityEntry);

    /// Called for every notification; ignored by default
    fn on_notification(&self, _notification: &Notification) {}
}

/// Forwards activity entries to `tracing`
#[derive(Debug)]
pub struct ActivityLogger;

impl CirculationObserver for ActivityLogger {
    fn on_activity(&self, entry: &ActivityEntry) {
        info!(
            action = ?entry.action,
            actor = %entry.actor,
            "{}",
            entry.description
        );
    }
}

/// Announces notifications through `tracing`
#[derive(Debug)]
pub struct NotificationService;

impl CirculationObserver for NotificationService {
    fn on_activity(&self, _entry: &ActivityEntry) {}

    fn on_notification(&self, notification: &Notification) {
        match notification {
            Notification::ReservationAvailable { reader_id, book_id, .. } => {
                info!(%reader_id, %book_id, "reserved book is ready for pickup");
            }
            Notification::LowStock { book_id, available_copies } => {
                info!(%book_id, available_copies, "book is running low on copies");
            }
            Notification::Overdue { reader_id, book_id, overdue_days, .. } => {
                info!(%reader_id, %book_id, overdue_days, "loan is overdue and was fined");
            }
        }
    }
}

/// Keeps every delivered entry and notification; clones share the buffers
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    /// Activity entries in delivery order
    activities: Rc<RefCell<Vec<ActivityEntry>>>,
    /// Notifications in delivery order
    notifications: Rc<RefCell<Vec<Notification>>>,
}

impl RecordingObserver {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Activity entries received so far
    #[must_use]
    pub fn activities(&self) -> Vec<ActivityEntry> {
        self.activities.borrow().clone()
    }

    /// Notifications received so far
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.borrow().clone()
    }
}

impl CirculationObserver for RecordingObserver {
    fn on_activity(&self, entry: &ActivityEntry) {
        self.activities.borrow_mut().push(entry.clone());
    }

    fn on_notification(&self, notification: &Notification) {
        self.notifications.borrow_mut().push(notification.clone());
    }
}
