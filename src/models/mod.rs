//! Data models for Shelfmark

pub mod book;
pub mod enums;
pub mod loan;
pub mod user;

// Re-export commonly used types
pub use book::{Author, Book, BookShort, Genre, Publisher};
pub use enums::{BookStatus, BorrowingPrivilege, Role};
pub use loan::{Loan, LoanDetails, LoanState};
pub use user::{User, UserShort};
