//! Overdue sweep.
//!
//! Once a day every loan past its due date that is neither returned nor
//! already flagged is declared lost: the book goes to `LOST`, the borrower's
//! lost count goes up by one and their privilege drops one tier. Each loan is
//! its own atomic unit, so a failure on one never rolls back or blocks the
//! others.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Days, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone};
use serde::Serialize;
use tokio::task::JoinHandle;

use super::{clock::Clock, privilege};
use crate::{
    error::{AppError, AppResult},
    models::loan::{Loan, LossRecord},
    repository::Repository,
};

/// Outcome of one sweep run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub as_of: NaiveDate,
    /// Expired loans found
    pub examined: usize,
    /// Loans flagged lost by this run
    pub flagged: usize,
    /// Ids of loans that could not be flagged
    pub failed: Vec<i64>,
}

pub struct OverdueSweep {
    repository: Repository,
    clock: Arc<dyn Clock>,
}

impl OverdueSweep {
    pub fn new(repository: Repository, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }

    /// Flag every expired, unreturned, unflagged loan as lost
    pub async fn run(&self) -> AppResult<SweepReport> {
        let as_of = self.clock.today();
        tracing::info!(%as_of, "Overdue sweep started");

        let expired = self.repository.loans.find_expired_unflagged(as_of).await?;

        let mut report = SweepReport {
            as_of,
            examined: expired.len(),
            flagged: 0,
            failed: Vec::new(),
        };

        for loan in &expired {
            match self.flag_lost(loan).await {
                Ok(()) => report.flagged += 1,
                Err(e) => {
                    tracing::error!(
                        loan_id = loan.id,
                        user_id = loan.user_id,
                        book_id = loan.book_id,
                        error = %e,
                        "Failed to flag overdue loan as lost"
                    );
                    report.failed.push(loan.id);
                }
            }
        }

        tracing::info!(
            %as_of,
            examined = report.examined,
            flagged = report.flagged,
            failed = report.failed.len(),
            "Overdue sweep finished"
        );

        Ok(report)
    }

    async fn flag_lost(&self, loan: &Loan) -> AppResult<()> {
        // Read the borrower fresh: an earlier loss in this run may have
        // degraded them already
        let user = self
            .repository
            .users
            .find_user(loan.user_id)
            .await?
            .ok_or(AppError::UserNotFound(loan.user_id))?;

        let previous = user.borrowing_privilege;
        let next = privilege::degrade(previous);

        self.repository
            .loans
            .mark_lost(&LossRecord {
                loan_id: loan.id,
                book_id: loan.book_id,
                user_id: user.id,
                previous_privilege: previous,
                privilege: next,
            })
            .await?;

        tracing::info!(
            loan_id = loan.id,
            book_id = loan.book_id,
            user_id = user.id,
            due_date = %loan.due_date,
            "Overdue loan flagged lost"
        );

        if privilege::is_floor(previous) {
            tracing::info!(user_id = user.id, privilege = %previous, "Borrower already at the lowest privilege");
        } else {
            tracing::info!(
                user_id = user.id,
                from = %previous,
                to = %next,
                "Borrowing privilege degraded"
            );
        }

        Ok(())
    }

    /// Run the sweep every day at `at`, local time, until the task is aborted
    pub fn spawn_daily(self: Arc<Self>, at: NaiveTime) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let delay = until_next(&Local::now(), at);
                tracing::debug!(?delay, %at, "Next overdue sweep scheduled");
                tokio::time::sleep(delay).await;

                match self.run().await {
                    Ok(report) if !report.failed.is_empty() => {
                        tracing::warn!(failed = ?report.failed, "Overdue sweep left loans unflagged")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Overdue sweep failed"),
                }
            }
        })
    }
}

/// Time from `now` to the next wall-clock occurrence of `at` in `now`'s zone,
/// always strictly in the future. Measured between real instants, so a day
/// stretched or shortened by a daylight saving change still fires once.
pub fn until_next<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> Duration {
    let zone = now.timezone();
    let today = now.date_naive();
    (0..=2)
        .filter_map(|days| today.checked_add_days(Days::new(days)))
        .filter_map(|day| first_instant_at(&zone, day.and_time(at)))
        .find(|next| next > now)
        .and_then(|next| (next - now.clone()).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// Earliest instant showing `local` on the wall clock. A time skipped by a
/// spring-forward gap moves an hour later.
fn first_instant_at<Tz: TimeZone>(zone: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    zone.from_local_datetime(&local)
        .earliest()
        .or_else(|| zone.from_local_datetime(&(local + TimeDelta::hours(1))).earliest())
}
