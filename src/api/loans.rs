//! Loan management endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::{
    error::AppResult,
    models::loan::{BorrowRequest, LoanDetails, ReturnRequest},
    AppState,
};

use super::AuthenticatedUser;

/// Borrow a book for the signed-in member
#[utoipa::path(
    post,
    path = "/loans",
    tag = "loans",
    security(("bearer_auth" = [])),
    request_body = BorrowRequest,
    responses(
        (status = 201, description = "Loan created", body = LoanDetails),
        (status = 400, description = "Loan limit reached or book not available"),
        (status = 403, description = "Borrowing not allowed"),
        (status = 404, description = "Book not found")
    )
)]
pub async fn borrow(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(request): Json<BorrowRequest>,
) -> AppResult<(StatusCode, Json<LoanDetails>)> {
    let loan = state
        .services
        .lending
        .borrow(claims.user_id, request.book_id)
        .await?;
    Ok((StatusCode::CREATED, Json(loan)))
}

/// Return a book held by the signed-in member
#[utoipa::path(
    post,
    path = "/loans/return",
    tag = "loans",
    security(("bearer_auth" = [])),
    request_body = ReturnRequest,
    responses(
        (status = 200, description = "Book returned", body = LoanDetails),
        (status = 404, description = "No active loan for this book")
    )
)]
pub async fn return_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(request): Json<ReturnRequest>,
) -> AppResult<Json<LoanDetails>> {
    let loan = state
        .services
        .lending
        .return_book(claims.user_id, request.book_id)
        .await?;
    Ok(Json(loan))
}

/// Active loans of the signed-in member
#[utoipa::path(
    get,
    path = "/loans/current",
    tag = "loans",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Active loans, oldest first", body = Vec<LoanDetails>)
    )
)]
pub async fn current_loans(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<Vec<LoanDetails>>> {
    let loans = state.services.lending.current_loans(claims.user_id).await?;
    Ok(Json(loans))
}

/// Returned and lost loans of the signed-in member
#[utoipa::path(
    get,
    path = "/loans/history",
    tag = "loans",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Past loans, most recent first", body = Vec<LoanDetails>)
    )
)]
pub async fn loan_history(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<Vec<LoanDetails>>> {
    let loans = state.services.lending.loan_history(claims.user_id).await?;
    Ok(Json(loans))
}

#[utoipa::path(
    get,
    path = "/admin/users/{id}/loans/current",
    tag = "admin",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "User ID")
    ),
    responses(
        (status = 200, description = "Active loans of the user", body = Vec<LoanDetails>),
        (status = 403, description = "Administrator privileges required"),
        (status = 404, description = "User not found")
    )
)]
pub async fn user_current_loans(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(user_id): Path<i64>,
) -> AppResult<Json<Vec<LoanDetails>>> {
    claims.require_admin()?;

    let loans = state.services.lending.user_current_loans(user_id).await?;
    Ok(Json(loans))
}

#[utoipa::path(
    get,
    path = "/admin/users/{id}/loans/history",
    tag = "admin",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "User ID")
    ),
    responses(
        (status = 200, description = "Past loans of the user", body = Vec<LoanDetails>),
        (status = 403, description = "Administrator privileges required"),
        (status = 404, description = "User not found")
    )
)]
pub async fn user_loan_history(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(user_id): Path<i64>,
) -> AppResult<Json<Vec<LoanDetails>>> {
    claims.require_admin()?;

    let loans = state.services.lending.user_loan_history(user_id).await?;
    Ok(Json(loans))
}

/// Every loan the overdue sweep has flagged lost
#[utoipa::path(
    get,
    path = "/admin/loans/lost",
    tag = "admin",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Lost loans", body = Vec<LoanDetails>),
        (status = 403, description = "Administrator privileges required")
    )
)]
pub async fn lost_loans(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<Vec<LoanDetails>>> {
    claims.require_admin()?;

    let loans = state.services.lending.lost_loans().await?;
    Ok(Json(loans))
}
