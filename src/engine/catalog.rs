//! Catalog maintenance: readers, books, categories, authors, publishers.

use chrono::Datelike;
use serde_json::json;

use super::{CirculationEngine, Txn, new_id};
use crate::{
    catalog::{
        Author, Book, BookPatch, BookStatus, Category, CategoryPatch, NewAuthor, NewBook, NewCategory,
        NewPublisher, NewReader, Publisher, Reader, ReaderPatch, ReaderStatus, require,
    },
    error::{CirculationError, CirculationResult},
    events::ActivityAction,
    ledger::ReservationStatus,
};

/// Color given to categories created without one
const DEFAULT_CATEGORY_COLOR: &str = "#007bff";

/// Condition recorded for books catalogued without one
const DEFAULT_CONDITION: &str = "good";

impl Txn<'_> {
    /// Next free `LIB{year}{nnn}` card number
    fn next_card_number(&self) -> String {
        let year = self.now.year();
        (1..=u32::MAX)
            .map(|n| format!("LIB{year}{n:03}"))
            .find(|card| !self.store.readers.iter().any(|r| &r.card_number == card))
            .unwrap_or_default()
    }

    /// Reject a student id already used by a reader other than `except`
    fn ensure_unique_student_id(&self, student_id: &str, except: Option<&str>) -> CirculationResult<()> {
        let student_id = student_id.trim();
        let taken = self
            .store
            .readers
            .iter()
            .any(|r| r.student_id == student_id && Some(r.id.as_str()) != except);
        if taken {
            return Err(CirculationError::DuplicateStudentId(student_id.to_string()));
        }
        Ok(())
    }

    /// Reject a non-blank ISBN already used by a book other than `except`
    fn ensure_unique_isbn(&self, isbn: &str, except: Option<&str>) -> CirculationResult<()> {
        let isbn = isbn.trim();
        if isbn.is_empty() {
            return Ok(());
        }
        let taken =
            self.store.books.iter().any(|b| b.isbn == isbn && Some(b.id.as_str()) != except);
        if taken {
            return Err(CirculationError::DuplicateIsbn(isbn.to_string()));
        }
        Ok(())
    }

    /// Reject a category name (case-insensitive) used by another category
    fn ensure_unique_category(&self, name: &str, except: Option<&str>) -> CirculationResult<()> {
        let wanted = name.trim().to_lowercase();
        let taken = self
            .store
            .categories
            .iter()
            .any(|c| c.name.trim().to_lowercase() == wanted && Some(c.id.as_str()) != except);
        if taken {
            return Err(CirculationError::DuplicateCategory(name.trim().to_string()));
        }
        Ok(())
    }

    /// Check that a book's category, author and optional publisher exist
    fn ensure_book_references(
        &self,
        category_id: Option<&str>,
        author_id: Option<&str>,
        publisher_id: Option<&str>,
    ) -> CirculationResult<()> {
        if let Some(id) = category_id.filter(|id| !self.store.categories.iter().any(|c| c.id == *id)) {
            return Err(CirculationError::CategoryNotFound(id.to_string()));
        }
        if let Some(id) = author_id.filter(|id| !self.store.authors.iter().any(|a| a.id == *id)) {
            return Err(CirculationError::AuthorNotFound(id.to_string()));
        }
        if let Some(id) = publisher_id
            .filter(|id| !id.trim().is_empty())
            .filter(|id| !self.store.publishers.iter().any(|p| p.id == *id))
        {
            return Err(CirculationError::PublisherNotFound(id.to_string()));
        }
        Ok(())
    }

    fn add_reader(&mut self, form: NewReader) -> CirculationResult<Reader> {
        form.validate()?;
        let student_id = form.student_id.trim().to_string();
        self.ensure_unique_student_id(&student_id, None)?;

        let reader = Reader {
            id: new_id(),
            student_id,
            full_name: form.full_name.trim().to_string(),
            date_of_birth: form.date_of_birth,
            gender: form.gender,
            class_name: form.class_name.trim().to_string(),
            email: form.email,
            phone: form.phone,
            address: form.address,
            parent_name: form.parent_name,
            parent_phone: form.parent_phone,
            registration_date: self.now,
            card_number: self.next_card_number(),
            status: ReaderStatus::Active,
            borrow_limit: self.policy.max_books_per_reader,
            current_borrows: 0,
            total_borrows: 0,
            fine_amount: 0,
            last_activity: self.now,
            notes: form.notes,
        };
        self.store.readers.push(reader.clone());
        self.log(
            ActivityAction::AddReader,
            format!("Registered reader {} ({})", reader.full_name, reader.card_number),
            json!({ "readerId": reader.id, "cardNumber": reader.card_number }),
        );
        Ok(reader)
    }

    fn update_reader(&mut self, reader_id: &str, patch: ReaderPatch) -> CirculationResult<Reader> {
        patch.validate()?;
        if let Some(student_id) = patch.student_id.as_deref() {
            self.ensure_unique_student_id(student_id, Some(reader_id))?;
        }
        let reader = self
            .store
            .reader_mut(reader_id)
            .ok_or_else(|| CirculationError::ReaderNotFound(reader_id.to_string()))?;
        let floor = ReaderStatus::for_balance(reader.fine_amount);
        if let Some(status) = patch.status.filter(|s| s.severity() < floor.severity()) {
            return Err(CirculationError::Validation(format!(
                "status {status} not allowed with {} in unpaid fines (at least {floor})",
                reader.fine_amount
            )));
        }
        if let Some(limit) = patch.borrow_limit.filter(|&limit| limit < reader.current_borrows) {
            return Err(CirculationError::Validation(format!(
                "borrowLimit {limit} is below the {} books currently borrowed",
                reader.current_borrows
            )));
        }
        let before = reader.clone();
        reader.apply_patch(patch);
        let after = reader.clone();

        self.log(
            ActivityAction::UpdateReader,
            format!("Updated reader {}", after.full_name),
            json!({ "oldData": before, "newData": after }),
        );
        Ok(after)
    }

    fn delete_reader(&mut self, reader_id: &str) -> CirculationResult<()> {
        let reader = self
            .store
            .reader(reader_id)
            .ok_or_else(|| CirculationError::ReaderNotFound(reader_id.to_string()))?;
        let name = reader.full_name.clone();

        if self.store.borrow_records.iter().any(|r| r.is_open() && r.reader_id == reader_id) {
            return Err(CirculationError::HasActiveBorrows(format!("reader {reader_id}")));
        }
        if self.store.fines.iter().any(|f| f.is_unpaid() && f.reader_id == reader_id) {
            return Err(CirculationError::HasUnpaidFines(reader_id.to_string()));
        }

        let mut affected_books = Vec::new();
        for reservation in &mut self.store.reservations {
            if reservation.is_active() && reservation.reader_id == reader_id {
                reservation.status = ReservationStatus::Cancelled;
                affected_books.push(reservation.book_id.clone());
            }
        }
        for book_id in &affected_books {
            self.store.renumber_queue(book_id);
            self.store.refresh_availability(book_id);
        }

        self.store.readers.retain(|r| r.id != reader_id);
        // closed loans, paid fines and old reservations go with the reader
        let purged = self.store.repair();
        self.log(
            ActivityAction::DeleteReader,
            format!("Deleted reader {name}"),
            json!({
                "readerId": reader_id,
                "cancelledReservations": affected_books.len(),
                "purged": purged,
            }),
        );
        Ok(())
    }

    fn add_book(&mut self, form: NewBook) -> CirculationResult<Book> {
        form.validate()?;
        self.ensure_book_references(
            Some(form.category_id.as_str()),
            Some(form.author_id.as_str()),
            Some(form.publisher_id.as_str()),
        )?;
        self.ensure_unique_isbn(&form.isbn, None)?;

        let condition = if form.condition.trim().is_empty() {
            DEFAULT_CONDITION.to_string()
        } else {
            form.condition
        };
        let mut book = Book {
            id: new_id(),
            title: form.title.trim().to_string(),
            author_id: form.author_id,
            category_id: form.category_id,
            publisher_id: form.publisher_id,
            isbn: form.isbn.trim().to_string(),
            publication_year: form.publication_year.unwrap_or_else(|| self.now.year()),
            publication_date: form.publication_date,
            pages: form.pages,
            language: form.language,
            description: form.description,
            location: form.location,
            total_copies: form.total_copies,
            available_copies: form.total_copies,
            borrowed_copies: 0,
            reserved_copies: 0,
            price: form.price,
            condition,
            added_date: self.now,
            last_borrowed: None,
            tags: form.tags,
            status: BookStatus::Available,
        };
        book.set_availability(0, 0);
        self.store.books.push(book.clone());
        self.log(
            ActivityAction::AddBook,
            format!("Catalogued {} ({} copies)", book.title, book.total_copies),
            json!({ "bookId": book.id, "totalCopies": book.total_copies }),
        );
        Ok(book)
    }

    fn update_book(&mut self, book_id: &str, patch: BookPatch) -> CirculationResult<Book> {
        patch.validate()?;
        self.ensure_book_references(
            patch.category_id.as_deref(),
            patch.author_id.as_deref(),
            patch.publisher_id.as_deref(),
        )?;
        if let Some(isbn) = patch.isbn.as_deref() {
            self.ensure_unique_isbn(isbn, Some(book_id))?;
        }
        let book = self
            .store
            .book(book_id)
            .ok_or_else(|| CirculationError::BookNotFound(book_id.to_string()))?;
        if patch.total_copies.is_some_and(|total| total < book.borrowed_copies) {
            return Err(CirculationError::Validation(format!(
                "totalCopies cannot drop below the {} copies on loan",
                book.borrowed_copies
            )));
        }
        let before = book.clone();

        if let Some(book) = self.store.book_mut(book_id) {
            book.apply_patch(patch);
        }
        self.store.refresh_availability(book_id);
        let after = self
            .store
            .book(book_id)
            .cloned()
            .ok_or_else(|| CirculationError::BookNotFound(book_id.to_string()))?;

        self.log(
            ActivityAction::UpdateBook,
            format!("Updated book {}", after.title),
            json!({ "oldData": before, "newData": after }),
        );
        Ok(after)
    }

    fn delete_book(&mut self, book_id: &str) -> CirculationResult<()> {
        let title = self
            .store
            .book(book_id)
            .map(|b| b.title.clone())
            .ok_or_else(|| CirculationError::BookNotFound(book_id.to_string()))?;

        if self.store.borrow_records.iter().any(|r| r.is_open() && r.book_id == book_id) {
            return Err(CirculationError::HasActiveBorrows(format!("book {book_id}")));
        }
        if self.store.reservations.iter().any(|r| r.is_active() && r.book_id == book_id) {
            return Err(CirculationError::HasActiveReservations(book_id.to_string()));
        }

        self.store.books.retain(|b| b.id != book_id);
        let purged = self.store.repair();
        self.log(
            ActivityAction::DeleteBook,
            format!("Deleted book {title}"),
            json!({ "bookId": book_id, "purged": purged }),
        );
        Ok(())
    }

    fn add_category(&mut self, form: NewCategory) -> CirculationResult<Category> {
        require("name", &form.name)?;
        self.ensure_unique_category(&form.name, None)?;

        let category = Category {
            id: new_id(),
            name: form.name.trim().to_string(),
            description: form.description,
            color: form
                .color
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CATEGORY_COLOR.to_string()),
        };
        self.store.categories.push(category.clone());
        self.log(
            ActivityAction::AddCategory,
            format!("Added category {}", category.name),
            json!({ "categoryId": category.id }),
        );
        Ok(category)
    }

    fn update_category(
        &mut self,
        category_id: &str,
        patch: CategoryPatch,
    ) -> CirculationResult<Category> {
        if let Some(name) = patch.name.as_deref() {
            require("name", name)?;
            self.ensure_unique_category(name, Some(category_id))?;
        }
        let category = self
            .store
            .categories
            .iter_mut()
            .find(|c| c.id == category_id)
            .ok_or_else(|| CirculationError::CategoryNotFound(category_id.to_string()))?;
        let before = category.clone();
        if let Some(name) = patch.name {
            category.name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            category.description = description;
        }
        if let Some(color) = patch.color {
            category.color = color;
        }
        let after = category.clone();

        self.log(
            ActivityAction::UpdateCategory,
            format!("Updated category {}", after.name),
            json!({ "oldData": before, "newData": after }),
        );
        Ok(after)
    }

    fn delete_category(&mut self, category_id: &str) -> CirculationResult<()> {
        let name = self
            .store
            .categories
            .iter()
            .find(|c| c.id == category_id)
            .map(|c| c.name.clone())
            .ok_or_else(|| CirculationError::CategoryNotFound(category_id.to_string()))?;
        if self.store.books.iter().any(|b| b.category_id == category_id) {
            return Err(CirculationError::CategoryInUse(name));
        }

        self.store.categories.retain(|c| c.id != category_id);
        self.log(
            ActivityAction::DeleteCategory,
            format!("Deleted category {name}"),
            json!({ "categoryId": category_id }),
        );
        Ok(())
    }

    fn add_author(&mut self, form: NewAuthor) -> CirculationResult<Author> {
        require("name", &form.name)?;
        let author = Author {
            id: new_id(),
            name: form.name.trim().to_string(),
            biography: form.biography,
            nationality: form.nationality,
        };
        self.store.authors.push(author.clone());
        self.log(
            ActivityAction::AddAuthor,
            format!("Added author {}", author.name),
            json!({ "authorId": author.id }),
        );
        Ok(author)
    }

    fn add_publisher(&mut self, form: NewPublisher) -> CirculationResult<Publisher> {
        require("name", &form.name)?;
        let publisher = Publisher {
            id: new_id(),
            name: form.name.trim().to_string(),
            address: form.address,
            phone: form.phone,
            email: form.email,
        };
        self.store.publishers.push(publisher.clone());
        self.log(
            ActivityAction::AddPublisher,
            format!("Added publisher {}", publisher.name),
            json!({ "publisherId": publisher.id }),
        );
        Ok(publisher)
    }
}

impl CirculationEngine {
    /// Register a reader with a fresh card number and the default borrow limit.
    ///
    /// # Errors
    ///
    /// Fails with `Validation` for blank required fields and
    /// `DuplicateStudentId` when the student id is taken.
    pub fn add_reader(&mut self, form: NewReader) -> CirculationResult<Reader> {
        self.transact(|txn| txn.add_reader(form))
    }

    /// Apply a partial update to a reader; counters cannot be edited.
    ///
    /// # Errors
    ///
    /// Fails with `ReaderNotFound`, `Validation` or `DuplicateStudentId`.
    pub fn update_reader(&mut self, reader_id: &str, patch: ReaderPatch) -> CirculationResult<Reader> {
        self.transact(|txn| txn.update_reader(reader_id, patch))
    }

    /// Delete a reader with no open loans and no unpaid fines.
    ///
    /// The reader's active reservations are cancelled.
    ///
    /// # Errors
    ///
    /// Fails with `ReaderNotFound`, `HasActiveBorrows` or `HasUnpaidFines`.
    pub fn delete_reader(&mut self, reader_id: &str) -> CirculationResult<()> {
        self.transact(|txn| txn.delete_reader(reader_id))
    }

    /// Catalogue a title; all its copies start on the shelf.
    ///
    /// # Errors
    ///
    /// Fails with `Validation`, `DuplicateIsbn` or a not-found error for a
    /// missing category, author or publisher.
    pub fn add_book(&mut self, form: NewBook) -> CirculationResult<Book> {
        self.transact(|txn| txn.add_book(form))
    }

    /// Apply a partial update to a book and re-derive its copy counts.
    ///
    /// # Errors
    ///
    /// Fails with `BookNotFound`, `Validation` (including a total below the
    /// copies on loan), `DuplicateIsbn` or a missing reference.
    pub fn update_book(&mut self, book_id: &str, patch: BookPatch) -> CirculationResult<Book> {
        self.transact(|txn| txn.update_book(book_id, patch))
    }

    /// Delete a book with no open loans and no reservation queue.
    ///
    /// # Errors
    ///
    /// Fails with `BookNotFound`, `HasActiveBorrows` or `HasActiveReservations`.
    pub fn delete_book(&mut self, book_id: &str) -> CirculationResult<()> {
        self.transact(|txn| txn.delete_book(book_id))
    }

    /// Add a category.
    ///
    /// # Errors
    ///
    /// Fails with `Validation` or `DuplicateCategory`.
    pub fn add_category(&mut self, form: NewCategory) -> CirculationResult<Category> {
        self.transact(|txn| txn.add_category(form))
    }

    /// Rename or recolor a category.
    ///
    /// # Errors
    ///
    /// Fails with `CategoryNotFound`, `Validation` or `DuplicateCategory`.
    pub fn update_category(
        &mut self,
        category_id: &str,
        patch: CategoryPatch,
    ) -> CirculationResult<Category> {
        self.transact(|txn| txn.update_category(category_id, patch))
    }

    /// Delete a category no book uses.
    ///
    /// # Errors
    ///
    /// Fails with `CategoryNotFound` or `CategoryInUse`.
    pub fn delete_category(&mut self, category_id: &str) -> CirculationResult<()> {
        self.transact(|txn| txn.delete_category(category_id))
    }

    /// Add an author.
    ///
    /// # Errors
    ///
    /// Fails with `Validation` for a blank name.
    pub fn add_author(&mut self, form: NewAuthor) -> CirculationResult<Author> {
        self.transact(|txn| txn.add_author(form))
    }

    /// Add a publisher.
    ///
    /// # Errors
    ///
    /// Fails with `Validation` for a blank name.
    pub fn add_publisher(&mut self, form: NewPublisher) -> CirculationResult<Publisher> {
        self.transact(|txn| txn.add_publisher(form))
    }

    #[must_use]
    pub fn get_reader(&self, reader_id: &str) -> Option<&Reader> {
        self.store.reader(reader_id)
    }

    #[must_use]
    pub fn get_reader_by_student_id(&self, student_id: &str) -> Option<&Reader> {
        self.store.readers.iter().find(|r| r.student_id == student_id)
    }

    #[must_use]
    pub fn get_reader_by_card_number(&self, card_number: &str) -> Option<&Reader> {
        self.store.readers.iter().find(|r| r.card_number == card_number)
    }

    #[must_use]
    pub fn get_book(&self, book_id: &str) -> Option<&Book> {
        self.store.book(book_id)
    }

    #[must_use]
    pub fn get_book_by_isbn(&self, isbn: &str) -> Option<&Book> {
        let isbn = isbn.trim();
        self.store.books.iter().find(|b| !b.isbn.is_empty() && b.isbn == isbn)
    }
}
