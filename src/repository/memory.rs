//! In-process store implementing every repository trait.
//!
//! All tables live behind one mutex, so each trait method is trivially atomic
//! with respect to the others. Used by the test suites and for running the
//! engine without a database.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;

use super::{BookStore, LoanStore, UserStore};
use crate::{
    error::{AppError, AppResult},
    models::{
        book::{Author, Book, BookShort, CreateBook, Genre, Publisher, UpdateBook},
        enums::{BookStatus, BorrowingPrivilege},
        loan::{Loan, LoanDetails, LossRecord, NewLoan},
        user::{CreateUser, UpdateUser, User, UserShort},
    },
    services::privilege::MAX_ACTIVE_LOANS,
};

#[derive(Debug, Default)]
struct Tables {
    last_id: i64,
    authors: BTreeMap<i64, Author>,
    publishers: BTreeMap<i64, Publisher>,
    genres: BTreeMap<i64, Genre>,
    books: BTreeMap<i64, Book>,
    users: BTreeMap<i64, User>,
    loans: BTreeMap<i64, Loan>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn details(&self, loan: &Loan) -> Option<LoanDetails> {
        let user = self.users.get(&loan.user_id)?;
        let book = self.books.get(&loan.book_id)?;
        Some(LoanDetails::new(loan, UserShort::from(user), BookShort::from(book)))
    }

    fn details_where(&self, filter: impl Fn(&Loan) -> bool) -> Vec<LoanDetails> {
        self.loans
            .values()
            .filter(|loan| filter(loan))
            .filter_map(|loan| self.details(loan))
            .collect()
    }

    fn active_loan_count(&self, user_id: i64) -> i64 {
        self.loans
            .values()
            .filter(|loan| loan.user_id == user_id && loan.is_active())
            .count() as i64
    }

    fn users_where(&self, filter: impl Fn(&User) -> bool) -> Vec<User> {
        self.users.values().filter(|user| filter(user)).cloned().collect()
    }

    fn username_taken(&self, username: &str, except: Option<i64>) -> bool {
        self.users
            .values()
            .any(|user| Some(user.id) != except && user.username == username)
    }

    fn name_taken(&self, name: &str, except: Option<i64>) -> bool {
        let name = name.to_lowercase();
        self.books
            .values()
            .any(|book| Some(book.id) != except && book.name.to_lowercase() == name)
    }

    fn check_references(
        &self,
        author_ids: Option<&BTreeSet<i64>>,
        publisher_ids: Option<&BTreeSet<i64>>,
        genre_ids: Option<&BTreeSet<i64>>,
    ) -> AppResult<()> {
        fn missing<T>(ids: Option<&BTreeSet<i64>>, table: &BTreeMap<i64, T>) -> Option<i64> {
            ids?.iter().copied().find(|id| !table.contains_key(id))
        }

        if let Some(id) = missing(author_ids, &self.authors) {
            return Err(AppError::Validation(format!("Unknown reference: author {}", id)));
        }
        if let Some(id) = missing(publisher_ids, &self.publishers) {
            return Err(AppError::Validation(format!("Unknown reference: publisher {}", id)));
        }
        if let Some(id) = missing(genre_ids, &self.genres) {
            return Err(AppError::Validation(format!("Unknown reference: genre {}", id)));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_author(
        &self,
        first_name: &str,
        pen_name: Option<&str>,
        second_name: Option<&str>,
    ) -> Author {
        let mut tables = self.tables.lock().await;
        let author = Author {
            id: tables.next_id(),
            pen_name: pen_name.map(str::to_string),
            first_name: first_name.to_string(),
            second_name: second_name.map(str::to_string),
        };
        tables.authors.insert(author.id, author.clone());
        author
    }

    pub async fn insert_publisher(&self, name: &str) -> Publisher {
        let mut tables = self.tables.lock().await;
        let publisher = Publisher {
            id: tables.next_id(),
            name: name.to_string(),
        };
        tables.publishers.insert(publisher.id, publisher.clone());
        publisher
    }

    pub async fn insert_genre(&self, name: &str) -> Genre {
        let mut tables = self.tables.lock().await;
        let genre = Genre {
            id: tables.next_id(),
            name: name.to_string(),
        };
        tables.genres.insert(genre.id, genre.clone());
        genre
    }

    /// Overwrite a member record as-is, e.g. to start from a degraded tier
    pub async fn put_user(&self, user: User) {
        let mut tables = self.tables.lock().await;
        tables.last_id = tables.last_id.max(user.id);
        tables.users.insert(user.id, user);
    }

    pub async fn find_loan(&self, id: i64) -> Option<Loan> {
        self.tables.lock().await.loans.get(&id).cloned()
    }
}

#[async_trait]
impl BookStore for MemoryStore {
    async fn find_book(&self, id: i64) -> AppResult<Option<Book>> {
        Ok(self.tables.lock().await.books.get(&id).cloned())
    }

    async fn book_exists(&self, id: i64) -> AppResult<bool> {
        Ok(self.tables.lock().await.books.contains_key(&id))
    }

    async fn find_book_by_name(&self, name: &str) -> AppResult<Option<Book>> {
        let name = name.trim().to_lowercase();
        let tables = self.tables.lock().await;
        Ok(tables
            .books
            .values()
            .find(|book| book.name.to_lowercase() == name)
            .cloned())
    }

    async fn list_books(&self) -> AppResult<Vec<Book>> {
        Ok(self.tables.lock().await.books.values().cloned().collect())
    }

    async fn find_authors_matching(&self, criteria: &str) -> AppResult<Vec<Author>> {
        let criteria = criteria.trim();
        let tables = self.tables.lock().await;
        Ok(tables
            .authors
            .values()
            .filter(|author| author.matches(criteria))
            .cloned()
            .collect())
    }

    async fn find_genre_by_name(&self, name: &str) -> AppResult<Option<Genre>> {
        let name = name.trim().to_lowercase();
        let tables = self.tables.lock().await;
        Ok(tables
            .genres
            .values()
            .find(|genre| genre.name.to_lowercase() == name)
            .cloned())
    }

    async fn find_publisher_by_name(&self, name: &str) -> AppResult<Option<Publisher>> {
        let name = name.trim().to_lowercase();
        let tables = self.tables.lock().await;
        Ok(tables
            .publishers
            .values()
            .find(|publisher| publisher.name.to_lowercase() == name)
            .cloned())
    }

    async fn find_books_by_authors(&self, author_ids: &[i64]) -> AppResult<Vec<Book>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .books
            .values()
            .filter(|book| author_ids.iter().any(|id| book.author_ids.contains(id)))
            .cloned()
            .collect())
    }

    async fn find_books_by_genre(&self, genre_id: i64) -> AppResult<Vec<Book>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .books
            .values()
            .filter(|book| book.genre_ids.contains(&genre_id))
            .cloned()
            .collect())
    }

    async fn find_books_by_publisher(&self, publisher_id: i64) -> AppResult<Vec<Book>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .books
            .values()
            .filter(|book| book.publisher_ids.contains(&publisher_id))
            .cloned()
            .collect())
    }

    async fn create_book(&self, book: &CreateBook) -> AppResult<Book> {
        let mut tables = self.tables.lock().await;
        let name = book.name.trim();

        if tables.name_taken(name, None) {
            return Err(AppError::Conflict(format!("Book '{}' already exists", name)));
        }
        tables.check_references(
            Some(&book.author_ids),
            Some(&book.publisher_ids),
            Some(&book.genre_ids),
        )?;

        let created = Book {
            id: tables.next_id(),
            name: name.to_string(),
            status: BookStatus::Active,
            author_ids: book.author_ids.clone(),
            publisher_ids: book.publisher_ids.clone(),
            genre_ids: book.genre_ids.clone(),
        };
        tables.books.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_book(&self, id: i64, update: &UpdateBook) -> AppResult<Book> {
        let mut tables = self.tables.lock().await;

        if !tables.books.contains_key(&id) {
            return Err(AppError::BookNotFound(id));
        }
        let name = update.name.as_deref().map(str::trim);
        if let Some(name) = name {
            if tables.name_taken(name, Some(id)) {
                return Err(AppError::Conflict(format!("Book '{}' already exists", name)));
            }
        }
        tables.check_references(
            update.author_ids.as_ref(),
            update.publisher_ids.as_ref(),
            update.genre_ids.as_ref(),
        )?;

        let book = tables
            .books
            .get_mut(&id)
            .ok_or(AppError::BookNotFound(id))?;
        if let Some(name) = name {
            book.name = name.to_string();
        }
        if let Some(ids) = &update.author_ids {
            book.author_ids = ids.clone();
        }
        if let Some(ids) = &update.publisher_ids {
            book.publisher_ids = ids.clone();
        }
        if let Some(ids) = &update.genre_ids {
            book.genre_ids = ids.clone();
        }
        Ok(book.clone())
    }

    async fn delete_book(&self, id: i64) -> AppResult<()> {
        let mut tables = self.tables.lock().await;

        let book = tables.books.get(&id).ok_or(AppError::BookNotFound(id))?;
        if book.status == BookStatus::Borrowed {
            return Err(AppError::Conflict(format!("Book {} is currently borrowed", id)));
        }
        if tables.loans.values().any(|loan| loan.book_id == id) {
            return Err(AppError::Conflict(format!("Book {} has loan records", id)));
        }

        tables.books.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user(&self, id: i64) -> AppResult<Option<User>> {
        Ok(self.tables.lock().await.users.get(&id).cloned())
    }

    async fn list_users(&self) -> AppResult<Vec<User>> {
        Ok(self.tables.lock().await.users.values().cloned().collect())
    }

    async fn find_user_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let username = username.to_lowercase();
        let tables = self.tables.lock().await;
        Ok(tables
            .users
            .values()
            .find(|user| user.username.to_lowercase() == username)
            .cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let email = email.trim().to_lowercase();
        let tables = self.tables.lock().await;
        Ok(tables
            .users
            .values()
            .find(|user| {
                user.email
                    .as_deref()
                    .is_some_and(|address| address.to_lowercase() == email)
            })
            .cloned())
    }

    async fn find_users_by_first_name(&self, fragment: &str) -> AppResult<Vec<User>> {
        let needle = fragment.trim().to_lowercase();
        let tables = self.tables.lock().await;
        Ok(tables.users_where(|user| {
            user.first_name
                .as_deref()
                .is_some_and(|name| name.to_lowercase().contains(&needle))
        }))
    }

    async fn find_users_by_last_name(&self, fragment: &str) -> AppResult<Vec<User>> {
        let needle = fragment.trim().to_lowercase();
        let tables = self.tables.lock().await;
        Ok(tables.users_where(|user| {
            user.last_name
                .as_deref()
                .is_some_and(|name| name.to_lowercase().contains(&needle))
        }))
    }

    async fn create_user(&self, user: &CreateUser) -> AppResult<User> {
        let mut tables = self.tables.lock().await;
        let username = user.username.trim();

        if tables.username_taken(username, None) {
            return Err(AppError::Conflict(format!("Username '{}' is taken", username)));
        }

        let created = User {
            id: tables.next_id(),
            username: username.to_string(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            role: user.role.unwrap_or_default(),
            lost_book_count: 0,
            borrowing_privilege: BorrowingPrivilege::Full,
        };
        tables.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_user(&self, id: i64, update: &UpdateUser) -> AppResult<User> {
        let mut tables = self.tables.lock().await;

        let username = update.username.as_deref().map(str::trim);
        if let Some(username) = username {
            if tables.username_taken(username, Some(id)) {
                return Err(AppError::Conflict(format!("Username '{}' is taken", username)));
            }
        }

        let user = tables.users.get_mut(&id).ok_or(AppError::UserNotFound(id))?;
        if let Some(username) = username {
            user.username = username.to_string();
        }
        if let Some(email) = &update.email {
            user.email = Some(email.clone());
        }
        if let Some(first_name) = &update.first_name {
            user.first_name = Some(first_name.clone());
        }
        if let Some(last_name) = &update.last_name {
            user.last_name = Some(last_name.clone());
        }
        Ok(user.clone())
    }

    async fn delete_user(&self, id: i64) -> AppResult<()> {
        let mut tables = self.tables.lock().await;

        if tables.users.remove(&id).is_none() {
            return Err(AppError::UserNotFound(id));
        }

        let owned: Vec<Loan> = tables
            .loans
            .values()
            .filter(|loan| loan.user_id == id)
            .cloned()
            .collect();
        for loan in owned {
            tables.loans.remove(&loan.id);
            if loan.is_active() {
                if let Some(book) = tables.books.get_mut(&loan.book_id) {
                    book.status = BookStatus::Active;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LoanStore for MemoryStore {
    async fn count_active_loans(&self, user_id: i64) -> AppResult<i64> {
        Ok(self.tables.lock().await.active_loan_count(user_id))
    }

    async fn find_active_loans(&self, user_id: i64) -> AppResult<Vec<LoanDetails>> {
        let tables = self.tables.lock().await;
        let mut loans = tables.details_where(|loan| loan.user_id == user_id && loan.is_active());
        loans.sort_by_key(|loan| (loan.borrow_date, loan.id));
        Ok(loans)
    }

    async fn find_loan_history(&self, user_id: i64) -> AppResult<Vec<LoanDetails>> {
        let tables = self.tables.lock().await;
        let mut loans = tables.details_where(|loan| loan.user_id == user_id && !loan.is_active());
        loans.sort_by_key(|loan| std::cmp::Reverse((loan.borrow_date, loan.id)));
        Ok(loans)
    }

    async fn find_lost_loans(&self) -> AppResult<Vec<LoanDetails>> {
        let tables = self.tables.lock().await;
        let mut loans = tables.details_where(|loan| loan.lost);
        loans.sort_by_key(|loan| (loan.due_date, loan.id));
        Ok(loans)
    }

    async fn find_expired_unflagged(&self, as_of: NaiveDate) -> AppResult<Vec<Loan>> {
        let tables = self.tables.lock().await;
        let mut loans: Vec<Loan> = tables
            .loans
            .values()
            .filter(|loan| loan.is_expired(as_of))
            .cloned()
            .collect();
        loans.sort_by_key(|loan| (loan.due_date, loan.id));
        Ok(loans)
    }

    async fn open_loan(&self, loan: &NewLoan) -> AppResult<Loan> {
        let mut tables = self.tables.lock().await;

        let privilege = tables
            .users
            .get(&loan.user_id)
            .map(|user| user.borrowing_privilege)
            .ok_or(AppError::UserNotFound(loan.user_id))?;

        if privilege == BorrowingPrivilege::Unable {
            return Err(AppError::BorrowingNotAllowed);
        }
        if privilege != loan.privilege {
            return Err(AppError::Conflict(format!(
                "Borrowing privilege changed from {} to {} during the request",
                loan.privilege, privilege
            )));
        }
        if tables.active_loan_count(loan.user_id) >= MAX_ACTIVE_LOANS {
            return Err(AppError::MaxBooksExceeded { limit: MAX_ACTIVE_LOANS });
        }

        let book = tables
            .books
            .get(&loan.book_id)
            .ok_or(AppError::BookNotFound(loan.book_id))?;
        if book.status != BookStatus::Active {
            return Err(AppError::BookNotAvailable {
                book_id: book.id,
                status: book.status,
            });
        }

        let created = Loan {
            id: tables.next_id(),
            user_id: loan.user_id,
            book_id: loan.book_id,
            borrow_date: loan.borrow_date,
            due_date: loan.due_date,
            return_date: None,
            lost: false,
        };
        if let Some(book) = tables.books.get_mut(&loan.book_id) {
            book.status = BookStatus::Borrowed;
        }
        tables.loans.insert(created.id, created.clone());
        Ok(created)
    }

    async fn close_loan(&self, loan_id: i64, returned_on: NaiveDate) -> AppResult<Loan> {
        let mut tables = self.tables.lock().await;

        let loan = tables
            .loans
            .get_mut(&loan_id)
            .filter(|loan| loan.is_active())
            .ok_or_else(|| AppError::LoanNotFound(format!("no active loan with id {}", loan_id)))?;
        loan.return_date = Some(returned_on);
        let closed = loan.clone();

        if let Some(book) = tables.books.get_mut(&closed.book_id) {
            book.status = BookStatus::Active;
        }
        Ok(closed)
    }

    async fn mark_lost(&self, loss: &LossRecord) -> AppResult<Loan> {
        let mut tables = self.tables.lock().await;

        let loan = tables
            .loans
            .get(&loss.loan_id)
            .filter(|loan| loan.is_active())
            .cloned()
            .ok_or_else(|| AppError::Conflict(format!("Loan {} is no longer active", loss.loan_id)))?;

        // Check every guard before the first write
        match tables.users.get(&loan.user_id) {
            Some(user) if user.borrowing_privilege == loss.previous_privilege => {}
            _ => {
                return Err(AppError::Conflict(format!(
                    "Privilege of user {} changed while flagging loan {}",
                    loan.user_id, loan.id
                )))
            }
        }

        if let Some(user) = tables.users.get_mut(&loan.user_id) {
            user.lost_book_count += 1;
            user.borrowing_privilege = loss.privilege;
        }
        if let Some(book) = tables.books.get_mut(&loan.book_id) {
            book.status = BookStatus::Lost;
        }
        let flagged = Loan { lost: true, ..loan };
        tables.loans.insert(flagged.id, flagged.clone());
        Ok(flagged)
    }
}
