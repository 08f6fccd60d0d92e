//! Repository layer: store seams and their implementations

pub mod books;
pub mod loans;
pub mod memory;
pub mod users;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{Pool, Postgres};

use crate::{
    error::{AppError, AppResult},
    models::{
        book::{Author, Book, CreateBook, Genre, Publisher, UpdateBook},
        loan::{Loan, LoanDetails, LossRecord, NewLoan},
        user::{CreateUser, UpdateUser, User},
    },
};

pub use memory::MemoryStore;

/// Catalog store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BookStore: Send + Sync {
    async fn find_book(&self, id: i64) -> AppResult<Option<Book>>;
    async fn book_exists(&self, id: i64) -> AppResult<bool>;
    /// Case-insensitive exact name lookup
    async fn find_book_by_name(&self, name: &str) -> AppResult<Option<Book>>;
    async fn list_books(&self) -> AppResult<Vec<Book>>;
    async fn find_authors_matching(&self, criteria: &str) -> AppResult<Vec<Author>>;
    async fn find_genre_by_name(&self, name: &str) -> AppResult<Option<Genre>>;
    async fn find_publisher_by_name(&self, name: &str) -> AppResult<Option<Publisher>>;
    async fn find_books_by_authors(&self, author_ids: &[i64]) -> AppResult<Vec<Book>>;
    async fn find_books_by_genre(&self, genre_id: i64) -> AppResult<Vec<Book>>;
    async fn find_books_by_publisher(&self, publisher_id: i64) -> AppResult<Vec<Book>>;
    /// Inserts an `ACTIVE` book with its associations
    async fn create_book(&self, book: &CreateBook) -> AppResult<Book>;
    /// Name and associations only; status is owned by the lending engine
    async fn update_book(&self, id: i64, update: &UpdateBook) -> AppResult<Book>;
    /// Refuses with `Conflict` while the book is borrowed or any loan
    /// references it
    async fn delete_book(&self, id: i64) -> AppResult<()>;
}

/// Member store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, id: i64) -> AppResult<Option<User>>;
    async fn list_users(&self) -> AppResult<Vec<User>>;
    /// Case-insensitive exact username lookup
    async fn find_user_by_username(&self, username: &str) -> AppResult<Option<User>>;
    /// Case-insensitive exact email lookup
    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>>;
    /// Case-insensitive substring match on the first name
    async fn find_users_by_first_name(&self, fragment: &str) -> AppResult<Vec<User>>;
    /// Case-insensitive substring match on the last name
    async fn find_users_by_last_name(&self, fragment: &str) -> AppResult<Vec<User>>;
    async fn create_user(&self, user: &CreateUser) -> AppResult<User>;
    /// Profile fields only; lending state is owned by the engine and the sweep
    async fn update_user(&self, id: i64, update: &UpdateUser) -> AppResult<User>;
    /// Deletes the member and their loans. Books still out on an active loan
    /// go back to `ACTIVE` in the same unit.
    async fn delete_user(&self, id: i64) -> AppResult<()>;
}

/// Loan ledger.
///
/// `open_loan`, `close_loan` and `mark_lost` are each one atomic unit: every
/// row they touch is committed together or not at all.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoanStore: Send + Sync {
    async fn count_active_loans(&self, user_id: i64) -> AppResult<i64>;
    /// Active loans, oldest first
    async fn find_active_loans(&self, user_id: i64) -> AppResult<Vec<LoanDetails>>;
    /// Returned and lost loans, most recent first
    async fn find_loan_history(&self, user_id: i64) -> AppResult<Vec<LoanDetails>>;
    async fn find_lost_loans(&self) -> AppResult<Vec<LoanDetails>>;
    /// Unreturned, unflagged loans with `due_date < as_of`
    async fn find_expired_unflagged(&self, as_of: NaiveDate) -> AppResult<Vec<Loan>>;
    /// Inserts the loan and flips the book `ACTIVE -> BORROWED`
    async fn open_loan(&self, loan: &NewLoan) -> AppResult<Loan>;
    /// Sets the return date of an active loan and flips the book back to `ACTIVE`
    async fn close_loan(&self, loan_id: i64, returned_on: NaiveDate) -> AppResult<Loan>;
    /// Flags the loan lost, the book `LOST`, and charges the loss to the user
    async fn mark_lost(&self, loss: &LossRecord) -> AppResult<Loan>;
}

/// Store handles shared by all services
#[derive(Clone)]
pub struct Repository {
    pub books: Arc<dyn BookStore>,
    pub users: Arc<dyn UserStore>,
    pub loans: Arc<dyn LoanStore>,
}

impl Repository {
    /// Create a PostgreSQL-backed repository with the given database pool
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            books: Arc::new(books::BooksRepository::new(pool.clone())),
            users: Arc::new(users::UsersRepository::new(pool.clone())),
            loans: Arc::new(loans::LoansRepository::new(pool)),
        }
    }

    /// Repository over a single in-process store
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            books: store.clone(),
            users: store.clone(),
            loans: store,
        }
    }

    pub fn from_stores(
        books: Arc<dyn BookStore>,
        users: Arc<dyn UserStore>,
        loans: Arc<dyn LoanStore>,
    ) -> Self {
        Self { books, users, loans }
    }
}

/// `ILIKE` pattern matching `fragment` literally anywhere in the value.
/// Pair it with `ESCAPE '\'`.
pub(crate) fn like_pattern(fragment: &str) -> String {
    let mut pattern = String::with_capacity(fragment.len() + 2);
    pattern.push('%');
    for c in fragment.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Map Postgres constraint violations onto client errors
pub(crate) fn constraint_error(error: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db) = &error {
        match db.code().as_deref() {
            Some("23505") => return AppError::Conflict(db.message().to_string()),
            Some("23503") => {
                return AppError::Validation(format!("Unknown reference: {}", db.message()))
            }
            _ => {}
        }
    }
    AppError::Database(error)
}
