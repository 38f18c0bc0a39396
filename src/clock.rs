use std::{cell::Cell, fmt, rc::Rc};

use chrono::{DateTime, TimeDelta, Utc};

/// Source of the current wall-clock time
pub trait Clock {
    /// Current instant in UTC
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same instant, so a test can keep one handle and advance
/// the time seen by an engine owning another.
#[derive(Clone)]
pub struct ManualClock {
    /// Shared current instant
    now: Rc<Cell<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Rc::new(Cell::new(start)) }
    }

    /// Jump to an absolute instant
    pub fn set(&self, instant: DateTime<Utc>) {
        self.now.set(instant);
    }

    /// Move forward by `delta`; saturates at the end of representable time
    pub fn advance(&self, delta: TimeDelta) {
        let current = self.now.get();
        self.now.set(current.checked_add_signed(delta).unwrap_or(current));
    }

    /// Move forward by whole days
    pub fn advance_days(&self, days: i64) {
        if let Some(delta) = TimeDelta::try_days(days) {
            self.advance(delta);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock").field("now", &self.now.get()).finish()
    }
}
