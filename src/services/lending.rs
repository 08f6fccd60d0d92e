//! Borrowing engine: borrow and return, plus the loan read views

use std::sync::Arc;

use super::{clock::Clock, privilege};
use crate::{
    error::{AppError, AppResult},
    models::{
        book::BookShort,
        enums::{BookStatus, BorrowingPrivilege},
        loan::{LoanDetails, LoanState, NewLoan},
        user::{User, UserShort},
    },
    repository::Repository,
};

#[derive(Clone)]
pub struct LendingService {
    repository: Repository,
    clock: Arc<dyn Clock>,
}

impl LendingService {
    pub fn new(repository: Repository, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }

    /// Borrow a book for a member.
    ///
    /// Rules are checked in a fixed order: privilege, loan limit, book
    /// existence, book availability. The loan insert and the book status flip
    /// are committed together by the store.
    pub async fn borrow(&self, user_id: i64, book_id: i64) -> AppResult<LoanDetails> {
        let user = self.load_user(user_id).await?;

        if user.borrowing_privilege == BorrowingPrivilege::Unable {
            return Err(AppError::BorrowingNotAllowed);
        }

        let active = self.repository.loans.count_active_loans(user.id).await?;
        if active >= privilege::MAX_ACTIVE_LOANS {
            return Err(AppError::MaxBooksExceeded {
                limit: privilege::MAX_ACTIVE_LOANS,
            });
        }

        let book = self
            .repository
            .books
            .find_book(book_id)
            .await?
            .ok_or(AppError::BookNotFound(book_id))?;

        if book.status != BookStatus::Active {
            return Err(AppError::BookNotAvailable {
                book_id: book.id,
                status: book.status,
            });
        }

        let today = self.clock.today();
        let due_date = privilege::due_date(user.borrowing_privilege, today).ok_or_else(|| {
            tracing::error!(
                user_id = user.id,
                privilege = %user.borrowing_privilege,
                "No loan duration for privilege past the borrowing gate"
            );
            AppError::Unexpected(format!(
                "no loan duration for privilege {}",
                user.borrowing_privilege
            ))
        })?;

        let loan = self
            .repository
            .loans
            .open_loan(&NewLoan {
                user_id: user.id,
                book_id: book.id,
                privilege: user.borrowing_privilege,
                borrow_date: today,
                due_date,
            })
            .await?;

        tracing::info!(
            loan_id = loan.id,
            user_id = user.id,
            book_id = book.id,
            %due_date,
            "Book borrowed"
        );

        let book = BookShort {
            status: BookStatus::Borrowed,
            ..BookShort::from(&book)
        };
        Ok(LoanDetails::new(&loan, UserShort::from(&user), book).with_overdue_as_of(today))
    }

    /// Return a book the member currently holds
    pub async fn return_book(&self, user_id: i64, book_id: i64) -> AppResult<LoanDetails> {
        let today = self.clock.today();
        let active = self.repository.loans.find_active_loans(user_id).await?;

        let held = select_loan_to_return(&active, book_id).ok_or_else(|| {
            AppError::LoanNotFound(format!(
                "user {} has no active loan for book {}",
                user_id, book_id
            ))
        })?;

        let loan = self.repository.loans.close_loan(held.id, today).await?;

        tracing::info!(loan_id = loan.id, user_id, book_id, "Book returned");

        let book = BookShort {
            status: BookStatus::Active,
            ..held.book.clone()
        };
        Ok(LoanDetails::new(&loan, held.user.clone(), book))
    }

    pub async fn current_loans(&self, user_id: i64) -> AppResult<Vec<LoanDetails>> {
        let today = self.clock.today();
        let loans = self.repository.loans.find_active_loans(user_id).await?;
        Ok(loans
            .into_iter()
            .map(|loan| loan.with_overdue_as_of(today))
            .collect())
    }

    pub async fn loan_history(&self, user_id: i64) -> AppResult<Vec<LoanDetails>> {
        self.repository.loans.find_loan_history(user_id).await
    }

    /// Current loans of any member, for administrators
    pub async fn user_current_loans(&self, user_id: i64) -> AppResult<Vec<LoanDetails>> {
        self.load_user(user_id).await?;
        self.current_loans(user_id).await
    }

    /// Loan history of any member, for administrators
    pub async fn user_loan_history(&self, user_id: i64) -> AppResult<Vec<LoanDetails>> {
        self.load_user(user_id).await?;
        self.loan_history(user_id).await
    }

    pub async fn lost_loans(&self) -> AppResult<Vec<LoanDetails>> {
        self.repository.loans.find_lost_loans().await
    }

    async fn load_user(&self, user_id: i64) -> AppResult<User> {
        self.repository
            .users
            .find_user(user_id)
            .await?
            .ok_or(AppError::UserNotFound(user_id))
    }
}

/// The active loan a return applies to. When the same book was borrowed more
/// than once, the most recent borrow wins (latest borrow date, then highest id).
pub fn select_loan_to_return(loans: &[LoanDetails], book_id: i64) -> Option<&LoanDetails> {
    loans
        .iter()
        .filter(|loan| loan.book.id == book_id && loan.state == LoanState::Active)
        .max_by_key(|loan| (loan.borrow_date, loan.id))
}
