//! Loans repository for database operations

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{Pool, Postgres};

use super::{constraint_error, LoanStore};
use crate::{
    error::{AppError, AppResult},
    models::{
        enums::{BookStatus, BorrowingPrivilege},
        loan::{Loan, LoanDetails, LoanDetailsRow, LossRecord, NewLoan},
    },
    services::privilege::MAX_ACTIVE_LOANS,
};

const LOAN_COLUMNS: &str = "id, user_id, book_id, borrow_date, due_date, return_date, lost";

/// Loan joined with the borrower and book summaries
const LOAN_DETAILS_SELECT: &str = r#"
    SELECT l.id, l.user_id, l.book_id, l.borrow_date, l.due_date, l.return_date, l.lost,
           u.username, u.email, u.first_name, u.last_name,
           b.name AS book_name, b.status AS book_status
    FROM loans l
    JOIN users u ON u.id = l.user_id
    JOIN books b ON b.id = l.book_id
"#;

#[derive(Clone)]
pub struct LoansRepository {
    pool: Pool<Postgres>,
}

impl LoansRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn fetch_details(&self, filter: &str, user_id: Option<i64>) -> AppResult<Vec<LoanDetails>> {
        let sql = format!("{LOAN_DETAILS_SELECT} {filter}");
        let mut query = sqlx::query_as::<_, LoanDetailsRow>(&sql);
        if let Some(user_id) = user_id {
            query = query.bind(user_id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(LoanDetails::from).collect())
    }
}

#[async_trait]
impl LoanStore for LoansRepository {
    async fn count_active_loans(&self, user_id: i64) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM loans WHERE user_id = $1 AND return_date IS NULL AND lost = FALSE",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn find_active_loans(&self, user_id: i64) -> AppResult<Vec<LoanDetails>> {
        self.fetch_details(
            "WHERE l.user_id = $1 AND l.return_date IS NULL AND l.lost = FALSE \
             ORDER BY l.borrow_date, l.id",
            Some(user_id),
        )
        .await
    }

    async fn find_loan_history(&self, user_id: i64) -> AppResult<Vec<LoanDetails>> {
        self.fetch_details(
            "WHERE l.user_id = $1 AND (l.return_date IS NOT NULL OR l.lost) \
             ORDER BY l.borrow_date DESC, l.id DESC",
            Some(user_id),
        )
        .await
    }

    async fn find_lost_loans(&self) -> AppResult<Vec<LoanDetails>> {
        self.fetch_details("WHERE l.lost ORDER BY l.due_date, l.id", None)
            .await
    }

    async fn find_expired_unflagged(&self, as_of: NaiveDate) -> AppResult<Vec<Loan>> {
        let loans = sqlx::query_as::<_, Loan>(&format!(
            r#"
            SELECT {LOAN_COLUMNS} FROM loans
            WHERE due_date < $1 AND lost = FALSE AND return_date IS NULL
            ORDER BY due_date, id
            "#
        ))
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;

        Ok(loans)
    }

    async fn open_loan(&self, loan: &NewLoan) -> AppResult<Loan> {
        let mut tx = self.pool.begin().await?;

        // Serialize borrows of the same member so the limit check holds
        let privilege: BorrowingPrivilege = sqlx::query_scalar(
            "SELECT borrowing_privilege FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(loan.user_id)
        .fetch_optional(&mut *tx)
        .await?
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

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM loans WHERE user_id = $1 AND return_date IS NULL AND lost = FALSE",
        )
        .bind(loan.user_id)
        .fetch_one(&mut *tx)
        .await?;

        if active >= MAX_ACTIVE_LOANS {
            return Err(AppError::MaxBooksExceeded { limit: MAX_ACTIVE_LOANS });
        }

        let flipped = sqlx::query("UPDATE books SET status = $2 WHERE id = $1 AND status = $3")
            .bind(loan.book_id)
            .bind(BookStatus::Borrowed)
            .bind(BookStatus::Active)
            .execute(&mut *tx)
            .await?;

        if flipped.rows_affected() == 0 {
            let status: Option<BookStatus> =
                sqlx::query_scalar("SELECT status FROM books WHERE id = $1")
                    .bind(loan.book_id)
                    .fetch_optional(&mut *tx)
                    .await?;

            return Err(match status {
                None => AppError::BookNotFound(loan.book_id),
                Some(status) => AppError::BookNotAvailable {
                    book_id: loan.book_id,
                    status,
                },
            });
        }

        let created = sqlx::query_as::<_, Loan>(&format!(
            r#"
            INSERT INTO loans (user_id, book_id, borrow_date, due_date, return_date, lost)
            VALUES ($1, $2, $3, $4, NULL, FALSE)
            RETURNING {LOAN_COLUMNS}
            "#
        ))
        .bind(loan.user_id)
        .bind(loan.book_id)
        .bind(loan.borrow_date)
        .bind(loan.due_date)
        .fetch_one(&mut *tx)
        .await
        .map_err(constraint_error)?;

        tx.commit().await?;

        Ok(created)
    }

    async fn close_loan(&self, loan_id: i64, returned_on: NaiveDate) -> AppResult<Loan> {
        let mut tx = self.pool.begin().await?;

        let loan = sqlx::query_as::<_, Loan>(&format!(
            r#"
            UPDATE loans SET return_date = $2
            WHERE id = $1 AND return_date IS NULL AND lost = FALSE
            RETURNING {LOAN_COLUMNS}
            "#
        ))
        .bind(loan_id)
        .bind(returned_on)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::LoanNotFound(format!("no active loan with id {}", loan_id)))?;

        sqlx::query("UPDATE books SET status = $2 WHERE id = $1")
            .bind(loan.book_id)
            .bind(BookStatus::Active)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(loan)
    }

    async fn mark_lost(&self, loss: &LossRecord) -> AppResult<Loan> {
        let mut tx = self.pool.begin().await?;

        let loan = sqlx::query_as::<_, Loan>(&format!(
            r#"
            UPDATE loans SET lost = TRUE
            WHERE id = $1 AND return_date IS NULL AND lost = FALSE
            RETURNING {LOAN_COLUMNS}
            "#
        ))
        .bind(loss.loan_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::Conflict(format!("Loan {} is no longer active", loss.loan_id)))?;

        sqlx::query("UPDATE books SET status = $2 WHERE id = $1")
            .bind(loan.book_id)
            .bind(BookStatus::Lost)
            .execute(&mut *tx)
            .await?;

        let charged = sqlx::query(
            r#"
            UPDATE users
            SET lost_book_count = lost_book_count + 1, borrowing_privilege = $2
            WHERE id = $1 AND borrowing_privilege = $3
            "#,
        )
        .bind(loan.user_id)
        .bind(loss.privilege)
        .bind(loss.previous_privilege)
        .execute(&mut *tx)
        .await?;

        if charged.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "Privilege of user {} changed while flagging loan {}",
                loan.user_id, loan.id
            )));
        }

        tx.commit().await?;

        Ok(loan)
    }
}
