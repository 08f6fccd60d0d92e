//! Error types for Shelfmark server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::models::enums::BookStatus;

/// Stable numeric error codes exposed to API clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Failure = 1,
    NotAuthorized = 2,
    DbFailure = 3,
    NoSuchUser = 4,
    NoSuchBook = 5,
    NoSuchLoan = 6,
    NoSuchData = 7,
    BookNotAvailable = 8,
    MaxBooksExceeded = 9,
    BorrowingNotAllowed = 10,
    Duplicate = 11,
    BadValue = 12,
    UnexpectedError = 13,
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Borrowing not allowed: lost books were not returned, borrowing rights are revoked")]
    BorrowingNotAllowed,

    #[error("Maximum books limit exceeded: at most {limit} books may be borrowed at the same time")]
    MaxBooksExceeded { limit: i64 },

    #[error("Book not found: id {0}")]
    BookNotFound(i64),

    #[error("Loan not found: {0}")]
    LoanNotFound(String),

    #[error("User not found: id {0}")]
    UserNotFound(i64),

    #[error("Book {book_id} is not available (status: {status})")]
    BookNotAvailable { book_id: i64, status: BookStatus },

    #[error("Unexpected error occurred: {0}")]
    Unexpected(String),
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

/// Error response body
#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub code: u32,
    pub error: String,
    pub message: String,
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, ErrorCode) {
        match self {
            AppError::Authentication(_) => (StatusCode::UNAUTHORIZED, ErrorCode::NotAuthorized),
            AppError::Authorization(_) => (StatusCode::FORBIDDEN, ErrorCode::NotAuthorized),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::NoSuchData),
            AppError::Validation(_) | AppError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, ErrorCode::BadValue)
            }
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::DbFailure),
            AppError::Conflict(_) => (StatusCode::CONFLICT, ErrorCode::Duplicate),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Failure),
            AppError::BorrowingNotAllowed => {
                (StatusCode::FORBIDDEN, ErrorCode::BorrowingNotAllowed)
            }
            AppError::MaxBooksExceeded { .. } => {
                (StatusCode::BAD_REQUEST, ErrorCode::MaxBooksExceeded)
            }
            AppError::BookNotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::NoSuchBook),
            AppError::LoanNotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::NoSuchLoan),
            AppError::UserNotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::NoSuchUser),
            AppError::BookNotAvailable { .. } => {
                (StatusCode::BAD_REQUEST, ErrorCode::BookNotAvailable)
            }
            AppError::Unexpected(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::UnexpectedError)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                "Database error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
            AppError::Unexpected(msg) => {
                tracing::error!("Invariant violation: {}", msg);
                "Unexpected error occurred".to_string()
            }
            AppError::Authentication(msg)
            | AppError::Authorization(msg)
            | AppError::NotFound(msg)
            | AppError::Validation(msg)
            | AppError::Conflict(msg)
            | AppError::BadRequest(msg) => msg.clone(),
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            code: code as u32,
            error: format!("{:?}", code),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
