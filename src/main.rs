//! Demo: opens a file-backed library, seeds it when empty and runs a short
//! borrow, reserve, return and report scenario.

use std::{env, error::Error, path::PathBuf};

use chrono::Datelike;
use library_circulation::{
    ActivityLogger, CirculationEngine, FileStorage, NotificationService, PaymentMethod,
    SystemClock,
    catalog::{NewAuthor, NewBook, NewCategory, NewPublisher, NewReader},
    config::load_policy,
    filters::BookFilter,
    reports::GroupBy,
};
use tracing_subscriber::EnvFilter;

/// Fill an empty store with a small sample collection
fn seed_library(engine: &mut CirculationEngine) -> Result<(), Box<dyn Error>> {
    let novels = engine.add_category(NewCategory {
        name: "Văn học Việt Nam".into(),
        description: "Vietnamese literature".into(),
        color: None,
    })?;
    let science = engine.add_category(NewCategory {
        name: "Khoa học".into(),
        description: "Popular science".into(),
        color: Some("#28a745".into()),
    })?;
    let ngo_tat_to = engine.add_author(NewAuthor {
        name: "Ngô Tất Tố".into(),
        nationality: "Vietnamese".into(),
        ..NewAuthor::default()
    })?;
    let hawking = engine.add_author(NewAuthor {
        name: "Stephen Hawking".into(),
        nationality: "British".into(),
        ..NewAuthor::default()
    })?;
    let publisher = engine.add_publisher(NewPublisher {
        name: "NXB Kim Đồng".into(),
        ..NewPublisher::default()
    })?;

    engine.add_book(NewBook {
        title: "Tắt Đèn".into(),
        author_id: ngo_tat_to.id,
        category_id: novels.id,
        publisher_id: publisher.id.clone(),
        isbn: "978-604-2-00001-1".into(),
        language: "Vietnamese".into(),
        location: "A1-03".into(),
        total_copies: 3,
        price: 65_000,
        tags: vec!["classic".into()],
        ..NewBook::default()
    })?;
    engine.add_book(NewBook {
        title: "A Brief History of Time".into(),
        author_id: hawking.id,
        category_id: science.id,
        publisher_id: publisher.id,
        isbn: "978-055-3-38016-3".into(),
        language: "English".into(),
        location: "B2-11".into(),
        total_copies: 1,
        price: 120_000,
        ..NewBook::default()
    })?;

    for (student_id, full_name, class_name) in
        [("HS001", "Nguyễn Văn An", "10A1"), ("HS002", "Trần Thị Bình", "10A2")]
    {
        engine.add_reader(NewReader {
            student_id: student_id.into(),
            full_name: full_name.into(),
            class_name: class_name.into(),
            ..NewReader::default()
        })?;
    }
    Ok(())
}

/// Data directory comes from the first argument, `library-data` by default
fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let data_dir = env::args().nth(1).map_or_else(|| PathBuf::from("library-data"), PathBuf::from);
    let policy = load_policy()?;
    let mut engine = CirculationEngine::open(policy, FileStorage::new(&data_dir), SystemClock)?;

    // Register observers
    engine.register_observer(Box::new(ActivityLogger));
    engine.register_observer(Box::new(NotificationService));
    engine.set_actor("librarian");

    if engine.store().is_empty() {
        println!("Seeding sample data into {}", data_dir.display());
        seed_library(&mut engine)?;
    }

    if let Some(report) = engine.run_daily_maintenance()? {
        println!(
            "Maintenance: {} reservations expired, {} fines created",
            report.expired_reservations, report.fines_created
        );
    }

    let readers: Vec<String> = engine.store().readers().iter().map(|r| r.id.clone()).collect();
    let hawking = engine
        .search_books("brief history", &BookFilter::default())
        .first()
        .map(|b| b.id.clone());

    if let (Some(hawking), [first, second, ..]) = (hawking, readers.as_slice()) {
        // The first reader takes the only copy; the second queues for it
        match engine.borrow_book(first, &hawking, "") {
            Ok(record) => println!("Borrowed, due {}", record.due_date.format("%Y-%m-%d")),
            Err(e) => println!("Borrow rejected: {e}"),
        }
        match engine.reserve_book(second, &hawking, "") {
            Ok(reservation) => println!("Reserved at position {}", reservation.priority),
            Err(e) => println!("Reservation rejected: {e}"),
        }

        let open = engine.store().open_record(first, &hawking).map(|r| r.id.clone());
        if let Some(record_id) = open {
            let returned = engine.return_book(&record_id, Some("good"), "demo return")?;
            if let Some(date) = returned.return_date {
                println!("Returned on {}", date.format("%Y-%m-%d"));
            }
        }
        for notification in engine.take_notifications() {
            println!("Notification: {notification:?}");
        }
    }

    let unpaid: Vec<String> = engine
        .store()
        .fines()
        .iter()
        .filter(|f| f.is_unpaid())
        .map(|f| f.id.clone())
        .collect();
    for fine_id in unpaid {
        match engine.pay_fine(&fine_id, PaymentMethod::Cash, "paid at the desk") {
            Ok(fine) => println!("Fine {} of {} paid", fine.id, fine.amount),
            Err(e) => println!("Payment rejected: {e}"),
        }
    }

    let stats = engine.get_statistics();
    println!(
        "Readers: {} | Titles: {} ({} copies, {} available) | Open loans: {} | Overdue: {}",
        stats.readers.total,
        stats.books.titles,
        stats.books.total,
        stats.books.available,
        stats.borrows.active,
        stats.borrows.overdue,
    );

    let today = engine.now().date_naive();
    let month_start = today.with_day(1).unwrap_or(today);
    let report = engine.borrow_report(month_start, today, GroupBy::Week)?;
    for bucket in &report.periods {
        println!("{}: {} borrows, {} returns", bucket.period, bucket.borrows, bucket.returns);
    }

    let issues = engine.check_integrity();
    if !issues.is_empty() {
        println!("Integrity issues: {issues:?}");
    }
    Ok(())
}
