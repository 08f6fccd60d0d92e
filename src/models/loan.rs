//! Loan (borrowed book) model and related types

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use super::book::BookShort;
use super::enums::{BookStatus, BorrowingPrivilege};
use super::user::UserShort;

/// Loan record from the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Loan {
    pub id: i64,
    pub user_id: i64,
    pub book_id: i64,
    pub borrow_date: NaiveDate,
    pub due_date: NaiveDate,
    /// Set when the book comes back; stays empty for lost loans
    pub return_date: Option<NaiveDate>,
    pub lost: bool,
}

/// Lifecycle of a loan. Returned and lost are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoanState {
    Active,
    Returned,
    Lost,
}

impl Loan {
    pub fn state(&self) -> LoanState {
        if self.lost {
            LoanState::Lost
        } else if self.return_date.is_some() {
            LoanState::Returned
        } else {
            LoanState::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == LoanState::Active
    }

    /// Active and past its due date, i.e. what the overdue sweep picks up
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.is_active() && self.due_date < today
    }
}

/// Loan with borrower and book summaries for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LoanDetails {
    pub id: i64,
    pub borrow_date: NaiveDate,
    pub due_date: NaiveDate,
    pub return_date: Option<NaiveDate>,
    pub lost: bool,
    pub state: LoanState,
    pub overdue: bool,
    pub user: UserShort,
    pub book: BookShort,
}

impl LoanDetails {
    pub fn new(loan: &Loan, user: UserShort, book: BookShort) -> Self {
        Self {
            id: loan.id,
            borrow_date: loan.borrow_date,
            due_date: loan.due_date,
            return_date: loan.return_date,
            lost: loan.lost,
            state: loan.state(),
            overdue: false,
            user,
            book,
        }
    }

    pub fn with_overdue_as_of(mut self, today: NaiveDate) -> Self {
        self.overdue = self.state == LoanState::Active && self.due_date < today;
        self
    }
}

/// Flat row of a loan joined with its user and book
#[derive(Debug, Clone, FromRow)]
pub struct LoanDetailsRow {
    pub id: i64,
    pub user_id: i64,
    pub book_id: i64,
    pub borrow_date: NaiveDate,
    pub due_date: NaiveDate,
    pub return_date: Option<NaiveDate>,
    pub lost: bool,
    pub username: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub book_name: String,
    pub book_status: BookStatus,
}

impl From<LoanDetailsRow> for LoanDetails {
    fn from(row: LoanDetailsRow) -> Self {
        let loan = Loan {
            id: row.id,
            user_id: row.user_id,
            book_id: row.book_id,
            borrow_date: row.borrow_date,
            due_date: row.due_date,
            return_date: row.return_date,
            lost: row.lost,
        };
        LoanDetails::new(
            &loan,
            UserShort {
                id: row.user_id,
                username: row.username,
                email: row.email,
                first_name: row.first_name,
                last_name: row.last_name,
            },
            BookShort {
                id: row.book_id,
                name: row.book_name,
                status: row.book_status,
            },
        )
    }
}

/// A loan about to be opened. `privilege` is the tier `due_date` was
/// computed from; the store refuses the loan if the tier changed meanwhile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLoan {
    pub user_id: i64,
    pub book_id: i64,
    pub privilege: BorrowingPrivilege,
    pub borrow_date: NaiveDate,
    pub due_date: NaiveDate,
}

/// Everything written when an overdue loan is declared lost
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossRecord {
    pub loan_id: i64,
    pub book_id: i64,
    pub user_id: i64,
    pub previous_privilege: BorrowingPrivilege,
    pub privilege: BorrowingPrivilege,
}

/// Borrow request
#[derive(Debug, Deserialize, ToSchema)]
pub struct BorrowRequest {
    pub book_id: i64,
}

/// Return request
#[derive(Debug, Deserialize, ToSchema)]
pub struct ReturnRequest {
    pub book_id: i64,
}
