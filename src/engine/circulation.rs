//! Loans, renewals, reservations and fines.

use serde_json::json;
use tracing::info;

use super::{CirculationEngine, Txn, days_after, new_id};
use crate::{
    catalog::ReaderStatus,
    config::WARNING_FINE_THRESHOLD,
    error::{CirculationError, CirculationResult},
    events::{ActivityAction, Notification},
    ledger::{
        BorrowRecord, BorrowStatus, CirculationStatus, Fine, FineStatus, PaymentMethod, Renewal,
        Reservation, ReservationStatus, overdue_days,
    },
};

impl Txn<'_> {
    fn borrow_book(
        &mut self,
        reader_id: &str,
        book_id: &str,
        notes: &str,
    ) -> CirculationResult<BorrowRecord> {
        let reader = self
            .store
            .reader(reader_id)
            .ok_or_else(|| CirculationError::ReaderNotFound(reader_id.to_string()))?;
        let book = self
            .store
            .book(book_id)
            .ok_or_else(|| CirculationError::BookNotFound(book_id.to_string()))?;

        if !reader.is_active() {
            return Err(CirculationError::ReaderNotActive {
                reader_id: reader_id.to_string(),
                status: reader.status,
            });
        }
        if reader.current_borrows >= reader.borrow_limit {
            return Err(CirculationError::BorrowLimitReached { limit: reader.borrow_limit });
        }
        // a queue holder whose copy is being held may take it off the hold shelf
        let held = self
            .store
            .active_reservation(reader_id, book_id)
            .filter(|r| r.priority <= book.reserved_copies)
            .map(|r| r.id.clone());
        if book.available_copies == 0 && held.is_none() {
            return Err(CirculationError::BookUnavailable { book_id: book_id.to_string() });
        }
        if self.store.open_record(reader_id, book_id).is_some() {
            return Err(CirculationError::AlreadyBorrowed {
                reader_id: reader_id.to_string(),
                book_id: book_id.to_string(),
            });
        }
        if reader.fine_amount > 0 {
            return Err(CirculationError::OutstandingFines { amount: reader.fine_amount });
        }
        let reader_name = reader.full_name.clone();
        let title = book.title.clone();

        let record = BorrowRecord {
            id: new_id(),
            reader_id: reader_id.to_string(),
            book_id: book_id.to_string(),
            borrow_date: self.now,
            due_date: days_after(self.now, self.policy.max_borrow_days),
            return_date: None,
            status: BorrowStatus::Borrowed,
            renewal_count: 0,
            notes: notes.trim().to_string(),
            librarian: self.actor.to_string(),
        };
        self.store.borrow_records.push(record.clone());

        let now = self.now;
        if let Some(reader) = self.store.reader_mut(reader_id) {
            reader.current_borrows = reader.current_borrows.saturating_add(1);
            reader.total_borrows = reader.total_borrows.saturating_add(1);
            reader.last_activity = now;
        }
        if let Some(reservation_id) = &held {
            if let Some(reservation) = self.store.reservation_mut(reservation_id) {
                reservation.status = ReservationStatus::Fulfilled;
            }
            self.store.renumber_queue(book_id);
        }
        if let Some(book) = self.store.book_mut(book_id) {
            book.last_borrowed = Some(now);
        }
        self.store.refresh_availability(book_id);

        let available = self.store.book(book_id).map_or(0, |b| b.available_copies);
        if available > 0 && available <= self.policy.low_stock_threshold {
            self.notify(Notification::LowStock {
                book_id: book_id.to_string(),
                available_copies: available,
            });
        }

        self.log(
            ActivityAction::BorrowBook,
            format!("{reader_name} borrowed {title}"),
            json!({
                "borrowRecordId": record.id,
                "readerId": reader_id,
                "bookId": book_id,
                "dueDate": record.due_date,
                "fulfilledReservation": held,
            }),
        );
        Ok(record)
    }

    fn return_book(
        &mut self,
        record_id: &str,
        condition: Option<&str>,
        notes: &str,
    ) -> CirculationResult<BorrowRecord> {
        let record = self
            .store
            .borrow_record(record_id)
            .ok_or_else(|| CirculationError::BorrowRecordNotFound(record_id.to_string()))?;
        if !record.is_open() {
            return Err(CirculationError::AlreadyReturned(record_id.to_string()));
        }
        let reader_id = record.reader_id.clone();
        let book_id = record.book_id.clone();
        let due_date = record.due_date;
        let reader_name = self
            .store
            .reader(&reader_id)
            .map(|r| r.full_name.clone())
            .ok_or_else(|| CirculationError::ReaderNotFound(reader_id.clone()))?;
        let title = self
            .store
            .book(&book_id)
            .map(|b| b.title.clone())
            .ok_or_else(|| CirculationError::BookNotFound(book_id.clone()))?;

        let now = self.now;
        let note = format!("Returned on {}. {}", self.today_label(), notes.trim());
        if let Some(record) = self.store.borrow_record_mut(record_id) {
            record.return_date = Some(now);
            record.status = BorrowStatus::Returned;
            record.append_note(&note);
        }
        if let Some(reader) = self.store.reader_mut(&reader_id) {
            reader.current_borrows = reader.current_borrows.saturating_sub(1);
            reader.last_activity = now;
        }
        let condition = condition.map(str::trim).filter(|c| !c.is_empty());
        if let (Some(condition), Some(book)) = (condition, self.store.book_mut(&book_id)) {
            book.condition = condition.to_string();
        }

        let days_late = overdue_days(due_date, now);
        let fine = if days_late > 0 {
            self.charge_late_return(record_id, &reader_id, days_late)
        } else {
            None
        };
        self.store.refresh_availability(&book_id);

        self.log(
            ActivityAction::ReturnBook,
            format!("{reader_name} returned {title}"),
            json!({
                "borrowRecordId": record_id,
                "readerId": reader_id,
                "bookId": book_id,
                "isOverdue": days_late > 0,
                "overdueDays": days_late,
                "fineId": fine.as_ref().map(|f| f.id.clone()),
            }),
        );
        self.notify_next_reservation(&book_id);

        self.store
            .borrow_record(record_id)
            .cloned()
            .ok_or_else(|| CirculationError::BorrowRecordNotFound(record_id.to_string()))
    }

    /// Bring the fines of a late record up to `days_late × finePerDay`.
    ///
    /// An unpaid fine left by the sweep is raised; if it was already paid a
    /// supplementary fine covers the difference.
    fn charge_late_return(
        &mut self,
        record_id: &str,
        reader_id: &str,
        days_late: u64,
    ) -> Option<Fine> {
        let total = days_late.saturating_mul(self.policy.fine_per_day);
        let charged = self
            .store
            .fines
            .iter()
            .filter(|f| f.borrow_record_id == record_id)
            .fold(0_u64, |sum, f| sum.saturating_add(f.amount));
        let outstanding = total.saturating_sub(charged);
        if outstanding == 0 {
            return None;
        }
        let reason = format!("Returned {days_late} days late");

        let unpaid = self
            .store
            .fines
            .iter()
            .find(|f| f.is_unpaid() && f.borrow_record_id == record_id)
            .map(|f| f.id.clone());
        match unpaid {
            Some(fine_id) => self.raise_fine(&fine_id, outstanding, reason),
            None => Some(self.create_fine(record_id, reader_id, outstanding, reason)),
        }
    }

    /// Issue a fine and add it to the reader's balance
    pub(super) fn create_fine(
        &mut self,
        record_id: &str,
        reader_id: &str,
        amount: u64,
        reason: String,
    ) -> Fine {
        let fine = Fine {
            id: new_id(),
            borrow_record_id: record_id.to_string(),
            reader_id: reader_id.to_string(),
            amount,
            reason,
            issue_date: self.now,
            due_date: days_after(self.now, self.policy.fine_payment_days),
            paid_date: None,
            status: FineStatus::Unpaid,
            payment_method: None,
            notes: String::new(),
            issued_by: self.actor.to_string(),
        };
        self.store.fines.push(fine.clone());
        self.add_to_balance(reader_id, amount);
        self.log(
            ActivityAction::CreateFine,
            format!("Fined reader {reader_id} {amount}: {}", fine.reason),
            json!({ "fineId": fine.id, "borrowRecordId": record_id, "amount": amount }),
        );
        fine
    }

    /// Add `extra` to an unpaid fine and to the reader's balance
    fn raise_fine(&mut self, fine_id: &str, extra: u64, reason: String) -> Option<Fine> {
        let fine = self.store.fine_mut(fine_id)?;
        fine.amount = fine.amount.saturating_add(extra);
        fine.reason = reason;
        let fine = fine.clone();

        self.add_to_balance(&fine.reader_id, extra);
        self.log(
            ActivityAction::CreateFine,
            format!("Raised fine {} to {}: {}", fine.id, fine.amount, fine.reason),
            json!({ "fineId": fine.id, "borrowRecordId": fine.borrow_record_id, "amount": fine.amount }),
        );
        Some(fine)
    }

    /// Add to a reader's balance and escalate their status on the thresholds
    fn add_to_balance(&mut self, reader_id: &str, amount: u64) {
        let now = self.now;
        if let Some(reader) = self.store.reader_mut(reader_id) {
            reader.fine_amount = reader.fine_amount.saturating_add(amount);
            reader.last_activity = now;
            reader.escalate(ReaderStatus::for_balance(reader.fine_amount));
        }
    }

    /// Tell the first reader in a book's queue that a copy came back
    fn notify_next_reservation(&mut self, book_id: &str) {
        let Some((reservation_id, reader_id)) = self
            .store
            .reservation_queue(book_id)
            .first()
            .map(|r| (r.id.clone(), r.reader_id.clone()))
        else {
            return;
        };
        if let Some(reservation) = self.store.reservation_mut(&reservation_id) {
            reservation.notification_sent = true;
        }
        self.notify(Notification::ReservationAvailable {
            reservation_id: reservation_id.clone(),
            reader_id: reader_id.clone(),
            book_id: book_id.to_string(),
        });
        self.log(
            ActivityAction::NotifyReservation,
            format!("Notified reader {reader_id} that book {book_id} is available"),
            json!({ "reservationId": reservation_id, "readerId": reader_id, "bookId": book_id }),
        );
    }

    fn renew_book(&mut self, record_id: &str, reason: &str) -> CirculationResult<Renewal> {
        let record = self
            .store
            .borrow_record(record_id)
            .ok_or_else(|| CirculationError::BorrowRecordNotFound(record_id.to_string()))?;
        match record.status_at(self.now) {
            CirculationStatus::Returned => {
                return Err(CirculationError::AlreadyReturned(record_id.to_string()));
            }
            CirculationStatus::Overdue => {
                return Err(CirculationError::RenewalPastDue(record_id.to_string()));
            }
            CirculationStatus::Borrowed => {}
        }
        if record.renewal_count >= self.policy.max_renewals {
            return Err(CirculationError::RenewalLimitReached { max: self.policy.max_renewals });
        }
        let reserved_by_other = self.store.reservations.iter().any(|r| {
            r.is_active() && r.book_id == record.book_id && r.reader_id != record.reader_id
        });
        if reserved_by_other {
            return Err(CirculationError::ReservedByAnotherReader {
                book_id: record.book_id.clone(),
            });
        }
        let reader = self
            .store
            .reader(&record.reader_id)
            .ok_or_else(|| CirculationError::ReaderNotFound(record.reader_id.clone()))?;
        if reader.fine_amount > 0 {
            return Err(CirculationError::OutstandingFines { amount: reader.fine_amount });
        }

        let renewal = Renewal {
            id: new_id(),
            borrow_record_id: record_id.to_string(),
            reader_id: record.reader_id.clone(),
            book_id: record.book_id.clone(),
            renewal_date: self.now,
            previous_due_date: record.due_date,
            new_due_date: days_after(record.due_date, self.policy.max_borrow_days),
            reason: reason.trim().to_string(),
            approved_by: self.actor.to_string(),
        };
        let note = format!(
            "Renewed on {} until {}",
            self.today_label(),
            renewal.new_due_date.format("%Y-%m-%d")
        );

        if let Some(record) = self.store.borrow_record_mut(record_id) {
            record.due_date = renewal.new_due_date;
            record.renewal_count = record.renewal_count.saturating_add(1);
            record.append_note(&note);
        }
        let now = self.now;
        if let Some(reader) = self.store.reader_mut(&renewal.reader_id) {
            reader.last_activity = now;
        }
        self.store.renewals.push(renewal.clone());
        self.log(
            ActivityAction::RenewBook,
            format!("Renewed loan {record_id} until {}", renewal.new_due_date.format("%Y-%m-%d")),
            json!({
                "borrowRecordId": record_id,
                "previousDueDate": renewal.previous_due_date,
                "newDueDate": renewal.new_due_date,
            }),
        );
        Ok(renewal)
    }

    fn reserve_book(
        &mut self,
        reader_id: &str,
        book_id: &str,
        notes: &str,
    ) -> CirculationResult<Reservation> {
        let reader = self
            .store
            .reader(reader_id)
            .ok_or_else(|| CirculationError::ReaderNotFound(reader_id.to_string()))?;
        let book = self
            .store
            .book(book_id)
            .ok_or_else(|| CirculationError::BookNotFound(book_id.to_string()))?;
        if !reader.is_active() {
            return Err(CirculationError::ReaderNotActive {
                reader_id: reader_id.to_string(),
                status: reader.status,
            });
        }
        if book.available_copies > 0 {
            return Err(CirculationError::BookAvailable { book_id: book_id.to_string() });
        }
        if self.store.active_reservation(reader_id, book_id).is_some() {
            return Err(CirculationError::AlreadyReserved {
                reader_id: reader_id.to_string(),
                book_id: book_id.to_string(),
            });
        }
        if self.store.open_record(reader_id, book_id).is_some() {
            return Err(CirculationError::AlreadyBorrowed {
                reader_id: reader_id.to_string(),
                book_id: book_id.to_string(),
            });
        }
        let reader_name = reader.full_name.clone();
        let title = book.title.clone();
        let queue_length = u32::try_from(self.store.reservation_queue(book_id).len())
            .unwrap_or(u32::MAX);

        let reservation = Reservation {
            id: new_id(),
            reader_id: reader_id.to_string(),
            book_id: book_id.to_string(),
            reservation_date: self.now,
            expiry_date: days_after(self.now, self.policy.reservation_hold_days),
            status: ReservationStatus::Active,
            priority: queue_length.saturating_add(1),
            notes: notes.trim().to_string(),
            notification_sent: false,
        };
        self.store.reservations.push(reservation.clone());
        self.store.refresh_availability(book_id);
        let now = self.now;
        if let Some(reader) = self.store.reader_mut(reader_id) {
            reader.last_activity = now;
        }

        self.log(
            ActivityAction::ReserveBook,
            format!("{reader_name} reserved {title} (position {})", reservation.priority),
            json!({
                "reservationId": reservation.id,
                "readerId": reader_id,
                "bookId": book_id,
                "priority": reservation.priority,
            }),
        );
        Ok(reservation)
    }

    fn cancel_reservation(&mut self, reservation_id: &str) -> CirculationResult<Reservation> {
        let reservation = self
            .store
            .reservation(reservation_id)
            .ok_or_else(|| CirculationError::ReservationNotFound(reservation_id.to_string()))?;
        if !reservation.is_active() {
            return Err(CirculationError::ReservationNotActive(reservation_id.to_string()));
        }
        let book_id = reservation.book_id.clone();
        let priority = reservation.priority;

        if let Some(reservation) = self.store.reservation_mut(reservation_id) {
            reservation.status = ReservationStatus::Cancelled;
        }
        for later in &mut self.store.reservations {
            if later.is_active() && later.book_id == book_id && later.priority > priority {
                later.priority = later.priority.saturating_sub(1);
            }
        }
        self.store.refresh_availability(&book_id);

        let cancelled = self
            .store
            .reservation(reservation_id)
            .cloned()
            .ok_or_else(|| CirculationError::ReservationNotFound(reservation_id.to_string()))?;
        self.log(
            ActivityAction::CancelReservation,
            format!("Cancelled reservation {reservation_id} for book {book_id}"),
            json!({ "reservationId": reservation_id, "bookId": book_id, "priority": priority }),
        );
        Ok(cancelled)
    }

    fn pay_fine(
        &mut self,
        fine_id: &str,
        method: PaymentMethod,
        notes: &str,
    ) -> CirculationResult<Fine> {
        let fine = self
            .store
            .fine(fine_id)
            .ok_or_else(|| CirculationError::FineNotFound(fine_id.to_string()))?;
        if !fine.is_unpaid() {
            return Err(CirculationError::FineAlreadyPaid(fine_id.to_string()));
        }
        let reader_id = fine.reader_id.clone();
        let amount = fine.amount;
        if self.store.reader(&reader_id).is_none() {
            return Err(CirculationError::ReaderNotFound(reader_id));
        }

        let now = self.now;
        let note = format!("Paid by {method} on {}. {}", self.today_label(), notes.trim());
        if let Some(fine) = self.store.fine_mut(fine_id) {
            fine.status = FineStatus::Paid;
            fine.paid_date = Some(now);
            fine.payment_method = Some(method);
            fine.append_note(&note);
        }
        if let Some(reader) = self.store.reader_mut(&reader_id) {
            reader.fine_amount = reader.fine_amount.saturating_sub(amount);
            reader.last_activity = now;
            let cleared = match reader.status {
                ReaderStatus::Suspended => reader.fine_amount == 0,
                ReaderStatus::Warning => reader.fine_amount < WARNING_FINE_THRESHOLD,
                ReaderStatus::Active => false,
            };
            if cleared {
                reader.status = ReaderStatus::Active;
            }
        }

        let paid = self
            .store
            .fine(fine_id)
            .cloned()
            .ok_or_else(|| CirculationError::FineNotFound(fine_id.to_string()))?;
        self.log(
            ActivityAction::PayFine,
            format!("Reader {reader_id} paid fine {fine_id} ({amount}) by {method}"),
            json!({ "fineId": fine_id, "readerId": reader_id, "amount": amount, "method": method }),
        );
        Ok(paid)
    }
}

impl CirculationEngine {
    /// Lend a book to a reader for `maxBorrowDays`.
    ///
    /// Checks run in a fixed order and the first failure is reported: reader
    /// and book exist, reader active, under the borrow limit, a copy is free
    /// (or held for this reader's reservation), no open loan of the same
    /// book, no fine balance.
    ///
    /// # Errors
    ///
    /// Returns the `CirculationError` of the first failed check, or
    /// `Storage` when the change cannot be persisted.
    pub fn borrow_book(
        &mut self,
        reader_id: &str,
        book_id: &str,
        notes: &str,
    ) -> CirculationResult<BorrowRecord> {
        let record = self.transact(|txn| txn.borrow_book(reader_id, book_id, notes))?;
        info!(record_id = %record.id, %reader_id, %book_id, "book borrowed");
        Ok(record)
    }

    /// Take a book back, fining late returns and notifying the next reader
    /// in the reservation queue.
    ///
    /// # Errors
    ///
    /// Returns `BorrowRecordNotFound`, `AlreadyReturned`, a not-found error
    /// for a missing reader or book, or `Storage`.
    pub fn return_book(
        &mut self,
        record_id: &str,
        condition: Option<&str>,
        notes: &str,
    ) -> CirculationResult<BorrowRecord> {
        let record = self.transact(|txn| txn.return_book(record_id, condition, notes))?;
        info!(%record_id, "book returned");
        Ok(record)
    }

    /// Extend an on-time loan by another `maxBorrowDays`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyReturned`, `RenewalPastDue`, `RenewalLimitReached`,
    /// `ReservedByAnotherReader`, `OutstandingFines`, or `Storage`.
    pub fn renew_book(&mut self, record_id: &str, reason: &str) -> CirculationResult<Renewal> {
        let renewal = self.transact(|txn| txn.renew_book(record_id, reason))?;
        info!(%record_id, new_due_date = %renewal.new_due_date, "loan renewed");
        Ok(renewal)
    }

    /// Queue a reader for a book with no free copy.
    ///
    /// # Errors
    ///
    /// Returns a not-found error, `ReaderNotActive`, `BookAvailable`,
    /// `AlreadyReserved`, `AlreadyBorrowed`, or `Storage`.
    pub fn reserve_book(
        &mut self,
        reader_id: &str,
        book_id: &str,
        notes: &str,
    ) -> CirculationResult<Reservation> {
        let reservation = self.transact(|txn| txn.reserve_book(reader_id, book_id, notes))?;
        info!(reservation_id = %reservation.id, priority = reservation.priority, "book reserved");
        Ok(reservation)
    }

    /// Withdraw an active reservation; later readers move up the queue.
    ///
    /// # Errors
    ///
    /// Returns `ReservationNotFound`, `ReservationNotActive`, or `Storage`.
    pub fn cancel_reservation(&mut self, reservation_id: &str) -> CirculationResult<Reservation> {
        let reservation = self.transact(|txn| txn.cancel_reservation(reservation_id))?;
        info!(%reservation_id, "reservation cancelled");
        Ok(reservation)
    }

    /// Settle a fine and relax the reader's status once the balance allows.
    ///
    /// # Errors
    ///
    /// Returns `FineNotFound`, `FineAlreadyPaid`, `ReaderNotFound`, or
    /// `Storage`.
    pub fn pay_fine(
        &mut self,
        fine_id: &str,
        method: PaymentMethod,
        notes: &str,
    ) -> CirculationResult<Fine> {
        let fine = self.transact(|txn| txn.pay_fine(fine_id, method, notes))?;
        info!(%fine_id, amount = fine.amount, %method, "fine paid");
        Ok(fine)
    }
}
