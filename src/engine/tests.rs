#![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::arithmetic_side_effects)]

use std::{cell::Cell, rc::Rc};

use chrono::{DateTime, NaiveDate, TimeDelta, TimeZone, Utc};

use crate::{
    catalog::{BookPatch, BookStatus, NewAuthor, NewBook, NewCategory, NewReader, ReaderPatch, ReaderStatus},
    clock::{Clock, ManualClock},
    config::Policy,
    engine::CirculationEngine,
    error::CirculationError,
    events::{ActivityAction, Notification},
    filters::{BookFilter, BorrowFilter, FineFilter, ReaderFilter},
    ledger::{CirculationStatus, FineStatus, PaymentMethod, ReservationStatus},
    observers::RecordingObserver,
    persistence::{KeyValueStorage, MemoryStorage, StorageError},
    reports::GroupBy,
    store::IntegrityIssue,
};

/// 2024-11-01 09:00 UTC, a Friday
fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 11, 1, 9, 0, 0).single().unwrap()
}

/// An engine over in-memory storage with one category and one author
struct Library {
    /// Engine under test
    engine: CirculationEngine,
    /// Shared with the engine; advance it to move time
    clock: ManualClock,
    /// Shared with the engine, for reopening
    storage: MemoryStorage,
    /// The seeded category
    category_id: String,
    /// The seeded author
    author_id: String,
}

impl Library {
    /// Library with the default policy
    fn new() -> Self {
        Self::with_policy(Policy::default())
    }

    /// Library with a custom policy
    fn with_policy(policy: Policy) -> Self {
        let clock = ManualClock::new(start_time());
        let storage = MemoryStorage::new();
        let mut engine = CirculationEngine::open(policy, storage.clone(), clock.clone()).unwrap();
        let category_id = engine
            .add_category(NewCategory { name: "Văn học".into(), ..NewCategory::default() })
            .unwrap()
            .id;
        let author_id =
            engine.add_author(NewAuthor { name: "Ngô Tất Tố".into(), ..NewAuthor::default() }).unwrap().id;
        Self { engine, clock, storage, category_id, author_id }
    }

    /// Register a reader and return its id
    fn reader(&mut self, student_id: &str) -> String {
        self.engine
            .add_reader(NewReader {
                student_id: student_id.into(),
                full_name: format!("Reader {student_id}"),
                class_name: "10A1".into(),
                ..NewReader::default()
            })
            .unwrap()
            .id
    }

    /// Catalogue a book and return its id
    fn book(&mut self, title: &str, copies: u32) -> String {
        self.engine
            .add_book(NewBook {
                title: title.into(),
                author_id: self.author_id.clone(),
                category_id: self.category_id.clone(),
                total_copies: copies,
                ..NewBook::default()
            })
            .unwrap()
            .id
    }

    /// Fines charged against one borrow record
    fn fines_for(&self, record_id: &str) -> Vec<crate::ledger::Fine> {
        self.engine
            .store()
            .fines()
            .iter()
            .filter(|f| f.borrow_record_id == record_id)
            .cloned()
            .collect()
    }

    /// Every book's copy counts add up to its total
    fn assert_copies_balance(&self) {
        for book in self.engine.store().books() {
            assert_eq!(
                book.available_copies + book.borrowed_copies + book.reserved_copies,
                book.total_copies,
                "copy counts of {} do not add up",
                book.title
            );
        }
    }
}

/// Storage whose writes can be switched to fail
#[derive(Debug, Clone, Default)]
struct FlakyStorage {
    /// Backing store for reads and successful writes
    inner: MemoryStorage,
    /// When set, every write fails
    failing: Rc<Cell<bool>>,
}

impl KeyValueStorage for FlakyStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key)
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), StorageError> {
        if self.failing.get() {
            return Err(StorageError::Unavailable("quota exceeded".into()));
        }
        self.inner.set(key, value)
    }
}

#[test]
fn test_borrow_sets_due_date_and_counters() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 3);
    lib.engine.set_actor("thu.thu");

    let record = lib.engine.borrow_book(&reader, &book, "  first loan ").unwrap();
    assert_eq!(record.due_date, start_time() + TimeDelta::days(14));
    assert_eq!(record.librarian, "thu.thu");
    assert_eq!(record.notes, "first loan");

    let reader = lib.engine.get_reader(&reader).unwrap();
    assert_eq!(reader.current_borrows, 1);
    assert_eq!(reader.total_borrows, 1);

    let book = lib.engine.get_book(&book).unwrap();
    assert_eq!((book.available_copies, book.borrowed_copies, book.reserved_copies), (2, 1, 0));
    assert_eq!(book.last_borrowed, Some(start_time()));

    let latest = &lib.engine.store().activities()[0];
    assert_eq!(latest.action, ActivityAction::BorrowBook);
    assert_eq!(latest.actor, "thu.thu");
}

#[test]
fn test_borrow_limit_is_enforced() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    for n in 0..5 {
        let book = lib.book(&format!("Book {n}"), 1);
        lib.engine.borrow_book(&reader, &book, "").unwrap();
    }
    let sixth = lib.book("Book 5", 1);

    let result = lib.engine.borrow_book(&reader, &sixth, "");
    assert!(matches!(result, Err(CirculationError::BorrowLimitReached { limit: 5 })));
    assert_eq!(lib.engine.store().borrow_records().len(), 5);
    assert_eq!(lib.engine.get_book(&sixth).unwrap().available_copies, 1);
}

#[test]
fn test_borrow_reports_first_failed_check() {
    let mut lib = Library::new();
    let holder = lib.reader("HS001");
    let suspended = lib.reader("HS002");
    let book = lib.book("Tắt Đèn", 1);
    lib.engine.borrow_book(&holder, &book, "").unwrap();
    lib.engine
        .update_reader(
            &suspended,
            ReaderPatch { status: Some(ReaderStatus::Suspended), ..ReaderPatch::default() },
        )
        .unwrap();

    // inactive reader and no free copy: the status check runs first
    let result = lib.engine.borrow_book(&suspended, &book, "");
    assert!(matches!(
        result,
        Err(CirculationError::ReaderNotActive { status: ReaderStatus::Suspended, .. })
    ));
    assert!(matches!(
        lib.engine.borrow_book("missing", &book, ""),
        Err(CirculationError::ReaderNotFound(_))
    ));
}

#[test]
fn test_borrow_rejects_duplicate_and_unavailable() {
    let mut lib = Library::new();
    let first = lib.reader("HS001");
    let second = lib.reader("HS002");
    let two_copies = lib.book("Số đỏ", 2);
    let one_copy = lib.book("Tắt Đèn", 1);

    lib.engine.borrow_book(&first, &two_copies, "").unwrap();
    assert!(matches!(
        lib.engine.borrow_book(&first, &two_copies, ""),
        Err(CirculationError::AlreadyBorrowed { .. })
    ));

    lib.engine.borrow_book(&first, &one_copy, "").unwrap();
    assert!(matches!(
        lib.engine.borrow_book(&second, &one_copy, ""),
        Err(CirculationError::BookUnavailable { .. })
    ));
    lib.assert_copies_balance();
}

#[test]
fn test_late_return_fines_and_hands_copy_to_reservation() {
    let mut lib = Library::new();
    let borrower = lib.reader("HS001");
    let waiting = lib.reader("HS002");
    let other = lib.reader("HS003");
    let book = lib.book("Tắt Đèn", 1);

    let record = lib.engine.borrow_book(&borrower, &book, "").unwrap();
    let reservation = lib.engine.reserve_book(&waiting, &book, "").unwrap();
    assert_eq!(reservation.priority, 1);
    assert_eq!(reservation.expiry_date, start_time() + TimeDelta::days(7));
    lib.assert_copies_balance();

    lib.clock.advance_days(17);
    drop(lib.engine.take_notifications());
    let returned = lib.engine.return_book(&record.id, None, "").unwrap();
    assert_eq!(returned.status_at(lib.clock.now()), CirculationStatus::Returned);

    let fines = lib.fines_for(&record.id);
    assert_eq!(fines.len(), 1);
    assert_eq!(fines[0].amount, 6000);
    assert_eq!(fines[0].status, FineStatus::Unpaid);
    assert_eq!(lib.engine.get_reader(&borrower).unwrap().fine_amount, 6000);
    assert_eq!(lib.engine.get_reader(&borrower).unwrap().status, ReaderStatus::Active);

    let notifications = lib.engine.take_notifications();
    assert!(notifications.iter().any(|n| matches!(
        n,
        Notification::ReservationAvailable { reader_id, .. } if *reader_id == waiting
    )));
    assert!(lib.engine.store().reservation(&reservation.id).unwrap().notification_sent);

    let held = lib.engine.get_book(&book).unwrap();
    assert_eq!((held.available_copies, held.borrowed_copies, held.reserved_copies), (0, 0, 1));
    assert_eq!(held.status, BookStatus::Reserved);

    // the held copy goes to the queue holder only
    assert!(matches!(
        lib.engine.borrow_book(&other, &book, ""),
        Err(CirculationError::BookUnavailable { .. })
    ));
    lib.engine.borrow_book(&waiting, &book, "").unwrap();
    assert_eq!(
        lib.engine.store().reservation(&reservation.id).unwrap().status,
        ReservationStatus::Fulfilled
    );
    let lent = lib.engine.get_book(&book).unwrap();
    assert_eq!((lent.available_copies, lent.borrowed_copies, lent.reserved_copies), (0, 1, 0));

    // the fine now blocks the original borrower
    let another = lib.book("Số đỏ", 1);
    assert!(matches!(
        lib.engine.borrow_book(&borrower, &another, ""),
        Err(CirculationError::OutstandingFines { amount: 6000 })
    ));
}

#[test]
fn test_partial_overdue_day_rounds_up() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 1);
    let record = lib.engine.borrow_book(&reader, &book, "").unwrap();

    lib.clock.advance(TimeDelta::days(17) + TimeDelta::hours(1));
    lib.engine.return_book(&record.id, Some("worn"), "").unwrap();

    let fines = lib.fines_for(&record.id);
    assert_eq!(fines.len(), 1);
    assert_eq!(fines[0].amount, 4 * 2000);
    assert_eq!(lib.engine.get_book(&book).unwrap().condition, "worn");
}

#[test]
fn test_on_time_return_creates_no_fine() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 1);
    let record = lib.engine.borrow_book(&reader, &book, "").unwrap();

    lib.clock.advance_days(14);
    lib.engine.return_book(&record.id, None, "").unwrap();
    assert!(lib.engine.store().fines().is_empty());
    assert!(matches!(
        lib.engine.return_book(&record.id, None, ""),
        Err(CirculationError::AlreadyReturned(_))
    ));
    assert_eq!(lib.engine.get_reader(&reader).unwrap().current_borrows, 0);
}

#[test]
fn test_return_after_sweep_raises_the_sweep_fine() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 1);
    let record = lib.engine.borrow_book(&reader, &book, "").unwrap();

    lib.clock.advance_days(16);
    let report = lib.engine.run_daily_maintenance().unwrap().unwrap();
    assert_eq!(report.fines_created, 1);
    assert_eq!(report.overdue_records, 1);
    assert_eq!(report.readers_escalated, 1);
    assert_eq!(lib.fines_for(&record.id)[0].amount, 4000);
    assert_eq!(lib.engine.get_reader(&reader).unwrap().status, ReaderStatus::Warning);
    assert!(lib.engine.take_notifications().iter().any(|n| matches!(
        n,
        Notification::Overdue { overdue_days: 2, .. }
    )));

    lib.clock.advance_days(1);
    lib.engine.return_book(&record.id, None, "").unwrap();
    let fines = lib.fines_for(&record.id);
    assert_eq!(fines.len(), 1);
    assert_eq!(fines[0].amount, 6000);
    assert_eq!(lib.engine.get_reader(&reader).unwrap().fine_amount, 6000);

    // paying below the warning threshold restores the reader
    lib.engine.pay_fine(&fines[0].id, PaymentMethod::Cash, "").unwrap();
    let reader = lib.engine.get_reader(&reader).unwrap();
    assert_eq!(reader.fine_amount, 0);
    assert_eq!(reader.status, ReaderStatus::Active);
}

#[test]
fn test_return_after_paid_sweep_fine_adds_the_difference() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 1);
    let record = lib.engine.borrow_book(&reader, &book, "").unwrap();

    lib.clock.advance_days(16);
    lib.engine.run_daily_maintenance().unwrap();
    let sweep_fine = lib.fines_for(&record.id)[0].id.clone();
    lib.engine.pay_fine(&sweep_fine, PaymentMethod::BankTransfer, "").unwrap();

    lib.clock.advance_days(1);
    lib.engine.return_book(&record.id, None, "").unwrap();
    let fines = lib.fines_for(&record.id);
    assert_eq!(fines.len(), 2);
    let total: u64 = fines.iter().map(|f| f.amount).sum();
    assert_eq!(total, 6000);
    assert_eq!(lib.engine.get_reader(&reader).unwrap().fine_amount, 2000);
}

#[test]
fn test_sweep_runs_once_per_day() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 1);
    lib.engine.borrow_book(&reader, &book, "").unwrap();
    lib.clock.advance_days(15);

    assert!(lib.engine.run_daily_maintenance().unwrap().is_some());
    let after_first = lib.engine.store().clone();

    lib.clock.advance(TimeDelta::hours(6));
    assert!(lib.engine.run_daily_maintenance().unwrap().is_none());
    assert_eq!(lib.engine.store(), &after_first);
    assert_eq!(lib.engine.store().fines().len(), 1);

    // the next day the sweep runs again but does not fine the record twice
    lib.clock.advance_days(1);
    let report = lib.engine.run_daily_maintenance().unwrap().unwrap();
    assert_eq!(report.fines_created, 0);
    assert_eq!(lib.engine.store().fines().len(), 1);
}

#[test]
fn test_sweep_suspends_reader_with_three_overdue_books() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    for n in 0..3 {
        let book = lib.book(&format!("Book {n}"), 1);
        lib.engine.borrow_book(&reader, &book, "").unwrap();
    }

    lib.clock.advance_days(15);
    lib.engine.run_daily_maintenance().unwrap();
    let reader = lib.engine.get_reader(&reader).unwrap();
    assert_eq!(reader.status, ReaderStatus::Suspended);
    assert_eq!(reader.fine_amount, 3 * 2000);
}

#[test]
fn test_sweep_expires_reservations_and_renumbers_queue() {
    let mut lib = Library::new();
    let borrower = lib.reader("HS001");
    let early = lib.reader("HS002");
    let late = lib.reader("HS003");
    let book = lib.book("Tắt Đèn", 1);
    lib.engine.borrow_book(&borrower, &book, "").unwrap();

    let first = lib.engine.reserve_book(&early, &book, "").unwrap();
    lib.clock.advance_days(3);
    let second = lib.engine.reserve_book(&late, &book, "").unwrap();
    assert_eq!(second.priority, 2);

    lib.clock.advance_days(5);
    let report = lib.engine.run_daily_maintenance().unwrap().unwrap();
    assert_eq!(report.expired_reservations, 1);

    let store = lib.engine.store();
    assert_eq!(store.reservation(&first.id).unwrap().status, ReservationStatus::Expired);
    assert_eq!(store.reservation(&second.id).unwrap().priority, 1);
    assert!(store.activities().iter().any(|a| a.action == ActivityAction::ExpireReservation));
    lib.assert_copies_balance();
}

#[test]
fn test_renewal_extends_due_date_until_limit() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 1);
    let record = lib.engine.borrow_book(&reader, &book, "").unwrap();

    let renewal = lib.engine.renew_book(&record.id, "exam week").unwrap();
    assert_eq!(renewal.previous_due_date, record.due_date);
    assert_eq!(renewal.new_due_date, record.due_date + TimeDelta::days(14));
    lib.engine.renew_book(&record.id, "").unwrap();

    let renewed = lib.engine.store().borrow_record(&record.id).unwrap();
    assert_eq!(renewed.renewal_count, 2);
    assert_eq!(renewed.due_date, record.due_date + TimeDelta::days(28));
    assert_eq!(lib.engine.store().renewals().len(), 2);

    assert!(matches!(
        lib.engine.renew_book(&record.id, ""),
        Err(CirculationError::RenewalLimitReached { max: 2 })
    ));
}

#[test]
fn test_renewal_blocked_by_reservation_and_due_date() {
    let mut lib = Library::new();
    let borrower = lib.reader("HS001");
    let waiting = lib.reader("HS002");
    let reserved = lib.book("Tắt Đèn", 1);
    let free = lib.book("Số đỏ", 1);
    let queued = lib.engine.borrow_book(&borrower, &reserved, "").unwrap();
    let overdue = lib.engine.borrow_book(&borrower, &free, "").unwrap();
    lib.engine.reserve_book(&waiting, &reserved, "").unwrap();

    assert!(matches!(
        lib.engine.renew_book(&queued.id, ""),
        Err(CirculationError::ReservedByAnotherReader { .. })
    ));

    lib.clock.advance_days(15);
    assert!(matches!(
        lib.engine.renew_book(&overdue.id, ""),
        Err(CirculationError::RenewalPastDue(_))
    ));
}

#[test]
fn test_cancel_reservation_moves_later_readers_up() {
    let mut lib = Library::new();
    let borrower = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 1);
    lib.engine.borrow_book(&borrower, &book, "").unwrap();

    let mut queue = Vec::new();
    for student in ["HS002", "HS003", "HS004"] {
        let reader = lib.reader(student);
        queue.push(lib.engine.reserve_book(&reader, &book, "").unwrap());
    }
    assert_eq!(queue.iter().map(|r| r.priority).collect::<Vec<_>>(), [1, 2, 3]);

    let cancelled = lib.engine.cancel_reservation(&queue[1].id).unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);

    let store = lib.engine.store();
    assert_eq!(store.reservation(&queue[0].id).unwrap().priority, 1);
    assert_eq!(store.reservation(&queue[2].id).unwrap().priority, 2);
    assert!(matches!(
        lib.engine.cancel_reservation(&queue[1].id),
        Err(CirculationError::ReservationNotActive(_))
    ));
}

#[test]
fn test_reserve_preconditions() {
    let mut lib = Library::new();
    let borrower = lib.reader("HS001");
    let waiting = lib.reader("HS002");
    let book = lib.book("Tắt Đèn", 1);

    assert!(matches!(
        lib.engine.reserve_book(&waiting, &book, ""),
        Err(CirculationError::BookAvailable { .. })
    ));
    lib.engine.borrow_book(&borrower, &book, "").unwrap();
    assert!(matches!(
        lib.engine.reserve_book(&borrower, &book, ""),
        Err(CirculationError::AlreadyBorrowed { .. })
    ));
    lib.engine.reserve_book(&waiting, &book, "").unwrap();
    assert!(matches!(
        lib.engine.reserve_book(&waiting, &book, ""),
        Err(CirculationError::AlreadyReserved { .. })
    ));
}

#[test]
fn test_fines_escalate_and_payment_restores_status() {
    let mut lib = Library::new();
    let warned = lib.reader("HS001");
    let suspended = lib.reader("HS002");
    let first = lib.book("Tắt Đèn", 1);
    let second = lib.book("Số đỏ", 1);
    let light = lib.engine.borrow_book(&warned, &first, "").unwrap();
    let heavy = lib.engine.borrow_book(&suspended, &second, "").unwrap();

    lib.clock.advance_days(24);
    lib.engine.return_book(&light.id, None, "").unwrap();
    lib.clock.advance_days(15);
    lib.engine.return_book(&heavy.id, None, "").unwrap();

    // 10 days late and 25 days late
    assert_eq!(lib.engine.get_reader(&warned).unwrap().status, ReaderStatus::Warning);
    assert_eq!(lib.engine.get_reader(&suspended).unwrap().status, ReaderStatus::Suspended);

    let heavy_fine = lib.fines_for(&heavy.id)[0].clone();
    assert_eq!(heavy_fine.amount, 50_000);
    let paid = lib.engine.pay_fine(&heavy_fine.id, PaymentMethod::Card, "at the desk").unwrap();
    assert_eq!(paid.status, FineStatus::Paid);
    assert_eq!(paid.payment_method, Some(PaymentMethod::Card));
    assert_eq!(lib.engine.get_reader(&suspended).unwrap().status, ReaderStatus::Active);

    assert!(matches!(
        lib.engine.pay_fine(&heavy_fine.id, PaymentMethod::Cash, ""),
        Err(CirculationError::FineAlreadyPaid(_))
    ));
    assert_eq!(
        lib.engine.get_fines(&FineFilter { status: Some(FineStatus::Unpaid), ..FineFilter::default() }).len(),
        1
    );
}

#[test]
fn test_failed_persist_rolls_back() {
    let clock = ManualClock::new(start_time());
    let storage = FlakyStorage::default();
    let recorder = RecordingObserver::new();
    let mut engine = CirculationEngine::open(Policy::default(), storage.clone(), clock).unwrap();
    engine.register_observer(Box::new(recorder.clone()));

    let category =
        engine.add_category(NewCategory { name: "Văn học".into(), ..NewCategory::default() }).unwrap();
    let author = engine.add_author(NewAuthor { name: "Nam Cao".into(), ..NewAuthor::default() }).unwrap();
    let book = engine
        .add_book(NewBook {
            title: "Chí Phèo".into(),
            author_id: author.id,
            category_id: category.id,
            ..NewBook::default()
        })
        .unwrap();
    let reader = engine
        .add_reader(NewReader {
            student_id: "HS001".into(),
            full_name: "Lê Văn Cường".into(),
            class_name: "11B2".into(),
            ..NewReader::default()
        })
        .unwrap();
    let before = engine.store().clone();
    let delivered = recorder.activities().len();

    storage.failing.set(true);
    let result = engine.borrow_book(&reader.id, &book.id, "");
    assert!(matches!(result, Err(CirculationError::Storage(StorageError::Unavailable(_)))));
    assert_eq!(engine.store(), &before);
    assert_eq!(recorder.activities().len(), delivered);
    assert!(engine.take_notifications().is_empty());

    storage.failing.set(false);
    engine.borrow_book(&reader.id, &book.id, "").unwrap();
    assert_eq!(engine.get_reader(&reader.id).unwrap().current_borrows, 1);
    assert_eq!(recorder.activities().last().unwrap().action, ActivityAction::BorrowBook);
}

#[test]
fn test_rejected_operation_changes_nothing() {
    let mut lib = Library::new();
    let recorder = RecordingObserver::new();
    lib.engine.register_observer(Box::new(recorder.clone()));
    let reader = lib.reader("HS001");
    let before = lib.engine.store().clone();
    assert_eq!(recorder.activities().len(), 1);

    assert!(lib.engine.borrow_book(&reader, "missing", "").is_err());
    assert_eq!(lib.engine.store(), &before);
    assert_eq!(recorder.activities().len(), 1);
}

#[test]
fn test_store_survives_reopen() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 2);
    let record = lib.engine.borrow_book(&reader, &book, "").unwrap();
    lib.clock.advance_days(20);
    lib.engine.return_book(&record.id, None, "").unwrap();

    let reopened =
        CirculationEngine::open(Policy::default(), lib.storage.clone(), lib.clock.clone()).unwrap();
    assert_eq!(reopened.store(), lib.engine.store());
    assert!(reopened.check_integrity().is_empty());
}

#[test]
fn test_open_repairs_orphaned_records() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 1);
    lib.engine.borrow_book(&reader, &book, "").unwrap();
    let mut storage = lib.storage.clone();
    storage.set("readers", "[]".into()).unwrap();

    let reopened = CirculationEngine::open(Policy::default(), storage, lib.clock.clone()).unwrap();
    assert!(reopened.store().borrow_records().is_empty());
    assert_eq!(reopened.get_book(&book).unwrap().available_copies, 1);
}

#[test]
fn test_import_rejects_malformed_payloads() {
    let mut lib = Library::new();
    lib.reader("HS001");
    let before = lib.engine.store().clone();

    for payload in [
        "not json",
        "[]",
        r#"{"readers": [], "books": []}"#,
        r#"{"readers": {}, "books": [], "borrowRecords": []}"#,
        r#"{"readers": [{"id": "r1"}], "books": [], "borrowRecords": []}"#,
        r#"{"readers": [{"id": "r1", "studentId": "HS9", "fullName": "X", "className": "9A",
            "registrationDate": "yesterday", "lastActivity": "2024-09-01", "borrowLimit": 5}],
            "books": [], "borrowRecords": []}"#,
    ] {
        let result = lib.engine.import_data(payload);
        assert!(matches!(result, Err(CirculationError::InvalidImport(_))), "accepted {payload}");
        assert_eq!(lib.engine.store(), &before);
    }
}

#[test]
fn test_import_hydrates_plain_dates_and_drops_orphans() {
    let mut lib = Library::new();
    let payload = r#"{
        "readers": [{"id": "r1", "studentId": "HS001", "fullName": "Phạm Thị Dung",
            "className": "12C1", "registrationDate": "2024-09-01",
            "lastActivity": "2024-10-20T08:30:00.000Z", "borrowLimit": 5}],
        "books": [{"id": "b1", "title": "Tắt Đèn", "authorId": "a1", "categoryId": "c1",
            "totalCopies": 2, "addedDate": "2024-09-01"}],
        "borrowRecords": [
            {"id": "br1", "readerId": "r1", "bookId": "b1", "borrowDate": "2024-10-20",
             "dueDate": "2024-11-03", "status": "borrowed"},
            {"id": "br2", "readerId": "ghost", "bookId": "b1", "borrowDate": "2024-10-20",
             "dueDate": "2024-11-03", "status": "overdue"}
        ],
        "fines": null,
        "exportDate": "2024-10-21T00:00:00.000Z",
        "version": "1.0"
    }"#;

    let summary = lib.engine.import_data(payload).unwrap();
    assert_eq!(summary.readers, 1);
    assert_eq!(summary.borrow_records, 1);
    assert_eq!(summary.repair.borrow_records_removed, 1);
    assert_eq!(summary.categories, 0);

    let reader = lib.engine.get_reader("r1").unwrap();
    assert_eq!(reader.registration_date, Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).single().unwrap());
    assert_eq!(reader.current_borrows, 1);
    let book = lib.engine.get_book("b1").unwrap();
    assert_eq!((book.available_copies, book.borrowed_copies), (1, 1));
    assert_eq!(lib.engine.store().activities()[0].action, ActivityAction::ImportData);
}

#[test]
fn test_export_reset_import_restores_collections() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 2);
    lib.engine.borrow_book(&reader, &book, "").unwrap();
    let before = lib.engine.store().clone();

    let exported = lib.engine.export_json().unwrap();
    assert!(exported.contains("\"version\": \"1.0\""));
    assert!(exported.contains("\"borrowRecords\""));

    lib.engine.reset_data().unwrap();
    assert!(lib.engine.store().is_empty());
    assert_eq!(lib.engine.store().activities().len(), 1);

    lib.engine.import_data(&exported).unwrap();
    let after = lib.engine.store();
    assert_eq!(after.readers(), before.readers());
    assert_eq!(after.books(), before.books());
    assert_eq!(after.borrow_records(), before.borrow_records());
    assert_eq!(after.categories(), before.categories());
    assert_eq!(after.authors(), before.authors());
}

#[test]
fn test_reader_registration_rules() {
    let mut lib = Library::new();
    let first = lib.reader("HS001");
    let second = lib.reader("HS002");
    assert_eq!(lib.engine.get_reader(&first).unwrap().card_number, "LIB2024001");
    assert_eq!(lib.engine.get_reader(&second).unwrap().card_number, "LIB2024002");
    assert_eq!(lib.engine.get_reader(&first).unwrap().borrow_limit, 5);
    assert_eq!(
        lib.engine.get_reader_by_card_number("LIB2024002").map(|r| r.id.as_str()),
        Some(second.as_str())
    );

    let duplicate = lib.engine.add_reader(NewReader {
        student_id: "HS001".into(),
        full_name: "Someone Else".into(),
        class_name: "10A2".into(),
        ..NewReader::default()
    });
    assert!(matches!(duplicate, Err(CirculationError::DuplicateStudentId(_))));
    let blank = lib.engine.add_reader(NewReader { student_id: "HS009".into(), ..NewReader::default() });
    assert!(matches!(blank, Err(CirculationError::Validation(_))));

    let renamed = lib
        .engine
        .update_reader(&second, ReaderPatch { student_id: Some("HS001".into()), ..ReaderPatch::default() });
    assert!(matches!(renamed, Err(CirculationError::DuplicateStudentId(_))));
    let moved = lib
        .engine
        .update_reader(&second, ReaderPatch { class_name: Some("11A1".into()), ..ReaderPatch::default() })
        .unwrap();
    assert_eq!(moved.class_name, "11A1");
    assert_eq!(lib.engine.get_reader_by_student_id("HS002").unwrap().class_name, "11A1");
}

#[test]
fn test_delete_reader_blockers() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let queued = lib.reader("HS002");
    let book = lib.book("Tắt Đèn", 1);
    let record = lib.engine.borrow_book(&reader, &book, "").unwrap();
    let other = lib.book("Số đỏ", 1);
    lib.engine.borrow_book(&reader, &other, "").unwrap();
    lib.engine.reserve_book(&queued, &other, "").unwrap();

    assert!(matches!(lib.engine.delete_reader(&reader), Err(CirculationError::HasActiveBorrows(_))));

    lib.clock.advance_days(15);
    lib.engine.return_book(&record.id, None, "").unwrap();
    lib.engine.delete_reader(&queued).unwrap();
    assert!(lib.engine.store().reservations().iter().all(|r| r.reader_id != queued));
    assert_eq!(lib.engine.get_book(&other).unwrap().reserved_copies, 0);

    let open = lib.engine.store().open_record(&reader, &other).unwrap().id.clone();
    lib.engine.return_book(&open, None, "").unwrap();
    assert!(matches!(lib.engine.delete_reader(&reader), Err(CirculationError::HasUnpaidFines(_))));

    let unpaid: Vec<String> = lib
        .engine
        .get_fines(&FineFilter { reader_id: Some(reader.clone()), ..FineFilter::default() })
        .iter()
        .map(|f| f.id.clone())
        .collect();
    for fine in unpaid {
        lib.engine.pay_fine(&fine, PaymentMethod::Cash, "").unwrap();
    }
    lib.engine.delete_reader(&reader).unwrap();
    assert!(lib.engine.get_reader(&reader).is_none());
    assert!(lib.engine.check_integrity().is_empty());
}

#[test]
fn test_book_catalog_rules() {
    let mut lib = Library::new();
    let book = lib.book("Tắt Đèn", 2);
    let first = lib.reader("HS001");
    let second = lib.reader("HS002");

    let missing_category = lib.engine.add_book(NewBook {
        title: "Orphan".into(),
        author_id: lib.author_id.clone(),
        category_id: "nowhere".into(),
        ..NewBook::default()
    });
    assert!(matches!(missing_category, Err(CirculationError::CategoryNotFound(_))));

    lib.engine
        .update_book(&book, BookPatch { isbn: Some("978-0".into()), ..BookPatch::default() })
        .unwrap();
    let duplicate = lib.engine.add_book(NewBook {
        title: "Copy".into(),
        author_id: lib.author_id.clone(),
        category_id: lib.category_id.clone(),
        isbn: "978-0".into(),
        ..NewBook::default()
    });
    assert!(matches!(duplicate, Err(CirculationError::DuplicateIsbn(_))));
    assert_eq!(lib.engine.get_book_by_isbn("978-0").map(|b| b.id.as_str()), Some(book.as_str()));

    lib.engine.borrow_book(&first, &book, "").unwrap();
    lib.engine.borrow_book(&second, &book, "").unwrap();
    let shrink = lib
        .engine
        .update_book(&book, BookPatch { total_copies: Some(1), ..BookPatch::default() });
    assert!(matches!(shrink, Err(CirculationError::Validation(_))));
    let grown = lib
        .engine
        .update_book(&book, BookPatch { total_copies: Some(3), ..BookPatch::default() })
        .unwrap();
    assert_eq!((grown.available_copies, grown.borrowed_copies), (1, 2));

    assert!(matches!(lib.engine.delete_book(&book), Err(CirculationError::HasActiveBorrows(_))));
    assert!(matches!(
        lib.engine.delete_category(&lib.category_id),
        Err(CirculationError::CategoryInUse(_))
    ));
    assert!(matches!(
        lib.engine.add_category(NewCategory { name: " VĂN HỌC ".into(), ..NewCategory::default() }),
        Err(CirculationError::DuplicateCategory(_))
    ));
}

#[test]
fn test_search_is_diacritic_insensitive() {
    let mut lib = Library::new();
    lib.engine
        .add_reader(NewReader {
            student_id: "HS010".into(),
            full_name: "Nguyễn Văn An".into(),
            class_name: "10A1".into(),
            ..NewReader::default()
        })
        .unwrap();
    lib.reader("HS011");
    lib.engine
        .add_book(NewBook {
            title: "Tắt Đèn".into(),
            author_id: lib.author_id.clone(),
            category_id: lib.category_id.clone(),
            tags: vec!["kinh điển".into()],
            ..NewBook::default()
        })
        .unwrap();

    let found = lib.engine.search_readers("nguyen van", &ReaderFilter::default());
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].student_id, "HS010");
    assert_eq!(lib.engine.search_readers("", &ReaderFilter::default()).len(), 2);
    assert_eq!(lib.engine.search_books("tat den", &BookFilter::default()).len(), 1);
    assert_eq!(lib.engine.search_books("kinh dien", &BookFilter::default()).len(), 1);
}

#[test]
fn test_overdue_listing_and_statistics() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let late = lib.book("Tắt Đèn", 1);
    let on_time = lib.book("Số đỏ", 2);
    lib.engine.borrow_book(&reader, &late, "").unwrap();
    lib.clock.advance_days(5);
    lib.engine.borrow_book(&reader, &on_time, "").unwrap();
    lib.clock.advance_days(12);

    let overdue = lib.engine.get_overdue_books("");
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].book.id, late);
    assert_eq!(overdue[0].overdue_days, 3);
    assert_eq!(overdue[0].projected_fine, 6000);
    assert!(lib.engine.get_overdue_books("so do").is_empty());

    let derived = lib.engine.get_borrow_records(&BorrowFilter {
        status: Some(CirculationStatus::Overdue),
        ..BorrowFilter::default()
    });
    assert_eq!(derived.len(), 1);
    assert!(
        lib.engine
            .search_readers("", &ReaderFilter { has_overdue: true, ..ReaderFilter::default() })
            .iter()
            .any(|r| r.id == reader)
    );

    let stats = lib.engine.get_statistics();
    assert_eq!(stats.readers.total, 1);
    assert_eq!(stats.books.titles, 2);
    assert_eq!(stats.books.total, 3);
    assert_eq!(stats.books.borrowed, 2);
    assert_eq!(stats.borrows.active, 1);
    assert_eq!(stats.borrows.overdue, 1);
}

#[test]
fn test_low_stock_and_due_soon() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 3);
    drop(lib.engine.take_notifications());

    lib.engine.borrow_book(&reader, &book, "").unwrap();
    assert!(lib.engine.take_notifications().iter().any(|n| matches!(
        n,
        Notification::LowStock { available_copies: 2, .. }
    )));
    assert_eq!(lib.engine.get_low_stock_books(2).len(), 1);

    lib.clock.advance_days(12);
    let due_soon = lib.engine.get_due_soon_books(3);
    assert_eq!(due_soon.len(), 1);
    assert_eq!(due_soon[0].days_until_due, 2);
    assert!(lib.engine.get_due_soon_books(1).is_empty());

    assert_eq!(lib.engine.get_popular_books(10, 30)[0].borrow_count, 1);
    assert_eq!(lib.engine.get_active_readers(30).len(), 1);
    assert!(lib.engine.get_active_readers(5).is_empty());
}

#[test]
fn test_activity_log_is_capped_newest_first() {
    let mut lib = Library::with_policy(Policy { activity_log_limit: 3, ..Policy::default() });
    for student in ["HS001", "HS002", "HS003", "HS004"] {
        lib.reader(student);
    }

    let log = lib.engine.store().activities();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|entry| entry.action == ActivityAction::AddReader));
    assert!(log[0].description.contains("LIB2024004"));
}

#[test]
fn test_period_reports() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 1);
    let record = lib.engine.borrow_book(&reader, &book, "").unwrap();
    lib.clock.advance_days(16);
    lib.engine.return_book(&record.id, None, "").unwrap();

    let nov = |day| NaiveDate::from_ymd_opt(2024, 11, day).unwrap();
    let borrows = lib.engine.borrow_report(nov(1), nov(30), GroupBy::Day).unwrap();
    assert_eq!(borrows.total_borrows, 1);
    assert_eq!(borrows.total_returns, 1);
    assert_eq!(borrows.periods.len(), 2);
    assert_eq!(borrows.periods[0].period, "2024-11-01");

    let fines = lib.engine.fine_report(nov(1), nov(30)).unwrap();
    assert_eq!(fines.daily.len(), 30);
    assert_eq!(fines.issued_amount, 4000);
    assert_eq!(fines.daily[16].issued, 1);
    assert_eq!(fines.top_readers[0].reader_id, reader);

    let books = lib.engine.book_report(nov(1), nov(30)).unwrap();
    assert_eq!(books.popular_books[0].borrow_count, 1);
    assert_eq!(books.categories[0].borrows_in_period, 1);

    let readers = lib.engine.reader_report(nov(1), nov(30)).unwrap();
    assert_eq!(readers.new_readers, 1);
    assert_eq!(readers.top_readers[0].total_borrows, 1);

    assert!(lib.engine.borrow_report(nov(2), nov(1), GroupBy::Week).is_err());
}

#[test]
fn test_repair_reports_drift() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let book = lib.book("Tắt Đèn", 1);
    lib.engine.borrow_book(&reader, &book, "").unwrap();
    lib.engine.store.books[0].available_copies = 1;

    assert!(
        lib.engine
            .check_integrity()
            .contains(&IntegrityIssue::BookCounterDrift { book_id: book.clone() })
    );
    lib.engine.repair_integrity().unwrap();
    assert!(lib.engine.check_integrity().is_empty());
    assert_eq!(lib.engine.get_book(&book).unwrap().available_copies, 0);
}

#[test]
fn test_patches_trim_unique_keys() {
    let mut lib = Library::new();
    lib.reader("HS001");
    let second = lib.reader("HS002");

    let clash = lib
        .engine
        .update_reader(&second, ReaderPatch { student_id: Some(" HS001 ".into()), ..ReaderPatch::default() });
    assert!(matches!(clash, Err(CirculationError::DuplicateStudentId(_))));
    assert_eq!(lib.engine.get_reader(&second).unwrap().student_id, "HS002");

    let moved = lib
        .engine
        .update_reader(&second, ReaderPatch { student_id: Some(" HS003 ".into()), ..ReaderPatch::default() })
        .unwrap();
    assert_eq!(moved.student_id, "HS003");
    assert!(lib.engine.get_reader_by_student_id("HS003").is_some());

    let first_book = lib.book("Tắt Đèn", 1);
    let second_book = lib.book("Số đỏ", 1);
    lib.engine
        .update_book(&first_book, BookPatch { isbn: Some("978-1".into()), ..BookPatch::default() })
        .unwrap();
    let clash = lib
        .engine
        .update_book(&second_book, BookPatch { isbn: Some(" 978-1 ".into()), ..BookPatch::default() });
    assert!(matches!(clash, Err(CirculationError::DuplicateIsbn(_))));

    let renamed = lib
        .engine
        .update_book(&second_book, BookPatch { isbn: Some(" 978-2 ".into()), ..BookPatch::default() })
        .unwrap();
    assert_eq!(renamed.isbn, "978-2");
    assert_eq!(lib.engine.get_book_by_isbn("978-2").map(|b| b.id.as_str()), Some(second_book.as_str()));
}

#[test]
fn test_reader_patch_respects_balance_and_loans() {
    let mut lib = Library::new();
    let debtor = lib.reader("HS001");
    let busy = lib.reader("HS002");
    let book = lib.book("Tắt Đèn", 1);
    let record = lib.engine.borrow_book(&debtor, &book, "").unwrap();
    lib.clock.advance_days(44);
    lib.engine.return_book(&record.id, None, "").unwrap();

    let owed = lib.engine.get_reader(&debtor).unwrap().clone();
    assert_eq!((owed.status, owed.fine_amount), (ReaderStatus::Suspended, 60_000));
    for status in [ReaderStatus::Active, ReaderStatus::Warning] {
        let lifted = lib
            .engine
            .update_reader(&debtor, ReaderPatch { status: Some(status), ..ReaderPatch::default() });
        assert!(matches!(lifted, Err(CirculationError::Validation(_))));
    }
    assert_eq!(lib.engine.get_reader(&debtor).unwrap().status, ReaderStatus::Suspended);

    for title in ["Số đỏ", "Chí Phèo"] {
        let copy = lib.book(title, 1);
        lib.engine.borrow_book(&busy, &copy, "").unwrap();
    }
    let shrunk = lib
        .engine
        .update_reader(&busy, ReaderPatch { borrow_limit: Some(1), ..ReaderPatch::default() });
    assert!(matches!(shrunk, Err(CirculationError::Validation(_))));
    let kept = lib
        .engine
        .update_reader(&busy, ReaderPatch { borrow_limit: Some(2), ..ReaderPatch::default() })
        .unwrap();
    assert_eq!(kept.borrow_limit, 2);
}

#[test]
fn test_repair_drops_repeated_ids() {
    let mut lib = Library::new();
    let reader = lib.reader("HS001");
    let copy = lib.engine.get_reader(&reader).unwrap().clone();
    lib.engine.store.readers.push(copy);

    assert!(lib.engine.check_integrity().contains(&IntegrityIssue::DuplicateId {
        kind: "readers",
        id: reader
    }));
    let report = lib.engine.repair_integrity().unwrap();
    assert_eq!(report.duplicates_removed, 1);
    assert_eq!(lib.engine.store().readers().len(), 1);
    assert!(lib.engine.check_integrity().is_empty());
}
