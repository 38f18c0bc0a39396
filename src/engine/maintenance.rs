//! The once-a-day maintenance sweep.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use super::{CirculationEngine, Txn};
use crate::{
    catalog::ReaderStatus,
    config::SUSPENSION_OVERDUE_COUNT,
    error::CirculationResult,
    events::{ActivityAction, Notification},
    ledger::ReservationStatus,
};

/// What one sweep did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// UTC date the sweep ran for
    pub date: NaiveDate,
    /// Instant the sweep ran
    pub timestamp: DateTime<Utc>,
    /// Reservations expired
    pub expired_reservations: usize,
    /// Open records past their due date at sweep time
    pub overdue_records: usize,
    /// Readers moved to warning or suspended
    pub readers_escalated: usize,
    /// Fines issued by the sweep
    pub fines_created: usize,
}

impl Txn<'_> {
    /// Expire reservations whose hold window has passed
    fn expire_reservations(&mut self) -> usize {
        let now = self.now;
        let mut expired = Vec::new();
        for reservation in &mut self.store.reservations {
            if reservation.is_active() && reservation.expiry_date < now {
                reservation.status = ReservationStatus::Expired;
                expired.push((reservation.id.clone(), reservation.book_id.clone()));
            }
        }

        for (reservation_id, book_id) in &expired {
            self.store.renumber_queue(book_id);
            self.store.refresh_availability(book_id);
            self.log(
                ActivityAction::ExpireReservation,
                format!("Reservation {reservation_id} for book {book_id} expired"),
                json!({ "reservationId": reservation_id, "bookId": book_id }),
            );
        }
        debug!(count = expired.len(), "expired reservations");
        expired.len()
    }

    /// Escalate readers holding overdue books; returns `(overdue records,
    /// readers escalated)`
    fn escalate_overdue_readers(&mut self) -> (usize, usize) {
        let now = self.now;
        let mut overdue_by_reader: HashMap<&str, usize> = HashMap::new();
        for record in self.store.borrow_records.iter().filter(|r| r.is_overdue_at(now)) {
            let count = overdue_by_reader.entry(record.reader_id.as_str()).or_default();
            *count = count.saturating_add(1);
        }
        let overdue_records: usize = overdue_by_reader.values().sum();

        let mut escalated = 0_usize;
        for reader in &mut self.store.readers {
            let Some(&count) = overdue_by_reader.get(reader.id.as_str()) else {
                continue;
            };
            let target = if count >= SUSPENSION_OVERDUE_COUNT {
                ReaderStatus::Suspended
            } else {
                ReaderStatus::Warning
            };
            let before = reader.status;
            reader.escalate(target);
            if reader.status != before {
                escalated = escalated.saturating_add(1);
            }
        }
        debug!(overdue_records, escalated, "escalated readers with overdue books");
        (overdue_records, escalated)
    }

    /// Fine every overdue record that has no fine yet
    fn fine_overdue_records(&mut self) -> usize {
        let now = self.now;
        let unfined: Vec<(String, String, String, u64)> = self
            .store
            .borrow_records
            .iter()
            .filter(|r| r.is_overdue_at(now))
            .filter(|r| !self.store.fines.iter().any(|f| f.borrow_record_id == r.id))
            .map(|r| (r.id.clone(), r.reader_id.clone(), r.book_id.clone(), r.overdue_days_at(now)))
            .collect();

        for (record_id, reader_id, book_id, days) in &unfined {
            let amount = days.saturating_mul(self.policy.fine_per_day);
            self.create_fine(record_id, reader_id, amount, format!("Overdue by {days} days"));
            self.notify(Notification::Overdue {
                borrow_record_id: record_id.clone(),
                reader_id: reader_id.clone(),
                book_id: book_id.clone(),
                overdue_days: *days,
            });
        }
        debug!(count = unfined.len(), "fined overdue records");
        unfined.len()
    }

    fn sweep(&mut self, date: NaiveDate) -> SweepReport {
        let expired_reservations = self.expire_reservations();
        let (overdue_records, readers_escalated) = self.escalate_overdue_readers();
        let fines_created = self.fine_overdue_records();
        self.store.refresh_all_availability();
        self.store.last_maintenance_date = Some(date);

        let report = SweepReport {
            date,
            timestamp: self.now,
            expired_reservations,
            overdue_records,
            readers_escalated,
            fines_created,
        };
        self.log(
            ActivityAction::DailyMaintenance,
            format!("Daily maintenance for {date}"),
            json!(report),
        );
        report
    }
}

impl CirculationEngine {
    /// Run the daily sweep unless it already ran on today's UTC date.
    ///
    /// Expires stale reservations, escalates readers with overdue loans and
    /// fines overdue records that have no fine yet. Returns `None` when the
    /// sweep already ran today; nothing is changed in that case.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the swept store cannot be persisted.
    pub fn run_daily_maintenance(&mut self) -> CirculationResult<Option<SweepReport>> {
        let today = self.clock.now().date_naive();
        if self.store.last_maintenance_date == Some(today) {
            debug!(%today, "maintenance already ran today");
            return Ok(None);
        }

        let report = self.transact(|txn| Ok(txn.sweep(today)))?;
        info!(?report, "daily maintenance complete");
        Ok(Some(report))
    }
}
