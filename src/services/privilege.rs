//! Borrowing privilege policy.
//!
//! Pure functions only: how long a tier may keep a book, how many books a
//! member may hold, and where a tier falls after a lost book.

use chrono::{Days, NaiveDate};

use crate::models::enums::BorrowingPrivilege;

/// Concurrent active loans allowed per member, whatever the tier
pub const MAX_ACTIVE_LOANS: i64 = 3;

/// Loan length for a tier. `UNABLE` members never get a due date.
pub fn loan_duration_days(privilege: BorrowingPrivilege) -> Option<u64> {
    match privilege {
        BorrowingPrivilege::Full => Some(30),
        BorrowingPrivilege::Limited => Some(15),
        BorrowingPrivilege::Unable => None,
    }
}

/// Due date of a loan opened on `borrow_date` under `privilege`
pub fn due_date(privilege: BorrowingPrivilege, borrow_date: NaiveDate) -> Option<NaiveDate> {
    loan_duration_days(privilege).and_then(|days| borrow_date.checked_add_days(Days::new(days)))
}

/// Tier after one more lost book. `UNABLE` is the floor.
pub fn degrade(privilege: BorrowingPrivilege) -> BorrowingPrivilege {
    match privilege {
        BorrowingPrivilege::Full => BorrowingPrivilege::Limited,
        BorrowingPrivilege::Limited | BorrowingPrivilege::Unable => BorrowingPrivilege::Unable,
    }
}

pub fn is_floor(privilege: BorrowingPrivilege) -> bool {
    degrade(privilege) == privilege
}
