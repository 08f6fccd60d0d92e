//! Borrowing engine and overdue sweep, end to end over the in-memory store

use std::sync::Arc;

use chrono::{Days, NaiveDate};

use shelfmark_server::{
    error::AppError,
    models::{
        book::CreateBook,
        enums::{BookStatus, BorrowingPrivilege},
        loan::{LoanState, LossRecord, NewLoan},
        user::{CreateUser, UpdateUser, User, UserQuery},
    },
    repository::{LoanStore, MemoryStore, Repository},
    services::{clock::FixedClock, Services},
};

struct Library {
    store: Arc<MemoryStore>,
    clock: Arc<FixedClock>,
    services: Services,
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn start() -> NaiveDate {
    date(2024, 3, 1)
}

impl Library {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(start()));
        let services = Services::new(Repository::in_memory(store.clone()), clock.clone());
        Self {
            store,
            clock,
            services,
        }
    }

    async fn member(&self, username: &str) -> User {
        self.services
            .users
            .create_user(CreateUser {
                username: username.to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn member_with(&self, username: &str, privilege: BorrowingPrivilege) -> User {
        let user = User {
            borrowing_privilege: privilege,
            ..self.member(username).await
        };
        self.store.put_user(user.clone()).await;
        user
    }

    async fn book(&self, name: &str) -> i64 {
        self.services
            .catalog
            .create_book(CreateBook {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    async fn book_status(&self, id: i64) -> BookStatus {
        self.services.catalog.get_book(id).await.unwrap().status
    }

    async fn user(&self, id: i64) -> User {
        self.services.users.get_user(id).await.unwrap()
    }
}

#[tokio::test]
async fn test_unable_member_can_never_borrow() {
    let library = Library::new();
    let user = library.member_with("banned", BorrowingPrivilege::Unable).await;
    let book = library.book("Dune").await;

    let result = library.services.lending.borrow(user.id, book).await;
    assert!(matches!(result, Err(AppError::BorrowingNotAllowed)));

    // Even for a book that does not exist
    let result = library.services.lending.borrow(user.id, 9_999).await;
    assert!(matches!(result, Err(AppError::BorrowingNotAllowed)));

    assert_eq!(library.book_status(book).await, BookStatus::Active);
}

#[tokio::test]
async fn test_fourth_concurrent_loan_is_refused() {
    let library = Library::new();
    let user = library.member("reader").await;

    for name in ["Dune", "Emma", "Ulysses"] {
        let book = library.book(name).await;
        library.services.lending.borrow(user.id, book).await.unwrap();
    }
    let fourth = library.book("Walden").await;

    let result = library.services.lending.borrow(user.id, fourth).await;
    assert!(matches!(result, Err(AppError::MaxBooksExceeded { limit: 3 })));
    assert_eq!(library.book_status(fourth).await, BookStatus::Active);

    let current = library.services.lending.current_loans(user.id).await.unwrap();
    assert_eq!(current.len(), 3);
}

#[tokio::test]
async fn test_borrow_sets_due_date_from_tier() {
    let library = Library::new();
    let full = library.member("full").await;
    let limited = library.member_with("limited", BorrowingPrivilege::Limited).await;
    let first = library.book("Dune").await;
    let second = library.book("Emma").await;

    let loan = library.services.lending.borrow(full.id, first).await.unwrap();
    assert_eq!(loan.borrow_date, start());
    assert_eq!(loan.due_date, date(2024, 3, 31));
    assert_eq!(loan.state, LoanState::Active);
    assert!(loan.return_date.is_none());
    assert!(!loan.lost);
    assert_eq!(loan.book.status, BookStatus::Borrowed);
    assert_eq!(library.book_status(first).await, BookStatus::Borrowed);

    let loan = library.services.lending.borrow(limited.id, second).await.unwrap();
    assert_eq!(loan.due_date, date(2024, 3, 16));
}

#[tokio::test]
async fn test_borrowed_and_unknown_books() {
    let library = Library::new();
    let first = library.member("first").await;
    let second = library.member("second").await;
    let book = library.book("Dune").await;

    library.services.lending.borrow(first.id, book).await.unwrap();

    let result = library.services.lending.borrow(second.id, book).await;
    assert!(matches!(
        result,
        Err(AppError::BookNotAvailable { status: BookStatus::Borrowed, .. })
    ));

    let result = library.services.lending.borrow(second.id, 9_999).await;
    assert!(matches!(result, Err(AppError::BookNotFound(9_999))));
}

#[tokio::test]
async fn test_return_closes_loan_once() {
    let library = Library::new();
    let user = library.member("reader").await;
    let book = library.book("Dune").await;

    library.services.lending.borrow(user.id, book).await.unwrap();
    library.clock.advance(5);

    let returned = library.services.lending.return_book(user.id, book).await.unwrap();
    assert_eq!(returned.return_date, Some(date(2024, 3, 6)));
    assert_eq!(returned.state, LoanState::Returned);
    assert_eq!(library.book_status(book).await, BookStatus::Active);

    let again = library.services.lending.return_book(user.id, book).await;
    assert!(matches!(again, Err(AppError::LoanNotFound(_))));

    let history = library.services.lending.loan_history(user.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, returned.id);
}

#[tokio::test]
async fn test_return_of_someone_elses_book_is_refused() {
    let library = Library::new();
    let owner = library.member("owner").await;
    let other = library.member("other").await;
    let book = library.book("Dune").await;

    library.services.lending.borrow(owner.id, book).await.unwrap();

    let result = library.services.lending.return_book(other.id, book).await;
    assert!(matches!(result, Err(AppError::LoanNotFound(_))));
    assert_eq!(library.book_status(book).await, BookStatus::Borrowed);
}

#[tokio::test]
async fn test_sweep_flags_overdue_loan_and_degrades_borrower() {
    let library = Library::new();
    let user = library.member("late").await;
    let book = library.book("Dune").await;

    let loan = library.services.lending.borrow(user.id, book).await.unwrap();

    // Due date is March 31; the sweep on April 1 sees it as expired
    library.clock.set(date(2024, 4, 1));
    let current = library.services.lending.current_loans(user.id).await.unwrap();
    assert!(current[0].overdue);

    let report = library.services.sweep.run().await.unwrap();
    assert_eq!(report.as_of, date(2024, 4, 1));
    assert_eq!(report.examined, 1);
    assert_eq!(report.flagged, 1);
    assert!(report.failed.is_empty());

    let flagged = library.store.find_loan(loan.id).await.unwrap();
    assert!(flagged.lost);
    assert!(flagged.return_date.is_none());
    assert_eq!(library.book_status(book).await, BookStatus::Lost);

    let user = library.user(user.id).await;
    assert_eq!(user.lost_book_count, 1);
    assert_eq!(user.borrowing_privilege, BorrowingPrivilege::Limited);

    // A second run finds nothing left to do
    let report = library.services.sweep.run().await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(report.flagged, 0);
    assert_eq!(library.user(user.id).await, user);
}

#[tokio::test]
async fn test_sweep_leaves_loans_due_today_alone() {
    let library = Library::new();
    let user = library.member("punctual").await;
    let book = library.book("Dune").await;

    library.services.lending.borrow(user.id, book).await.unwrap();
    library.clock.set(date(2024, 3, 31));

    let report = library.services.sweep.run().await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(library.book_status(book).await, BookStatus::Borrowed);
}

#[tokio::test]
async fn test_sweep_without_new_overdue_loans_changes_nothing() {
    let library = Library::new();
    let user = library.member("reader").await;
    let book = library.book("Dune").await;
    library.services.lending.borrow(user.id, book).await.unwrap();

    let first = library.services.sweep.run().await.unwrap();
    let second = library.services.sweep.run().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.flagged, 0);
    assert_eq!(library.user(user.id).await.lost_book_count, 0);
}

#[tokio::test]
async fn test_two_losses_in_one_run_reach_the_floor() {
    let library = Library::new();
    let user = library.member("careless").await;
    let first = library.book("Dune").await;
    let second = library.book("Emma").await;
    let third = library.book("Walden").await;

    library.services.lending.borrow(user.id, first).await.unwrap();
    library.services.lending.borrow(user.id, second).await.unwrap();
    library
        .clock
        .set(start().checked_add_days(Days::new(31)).unwrap());

    let report = library.services.sweep.run().await.unwrap();
    assert_eq!(report.flagged, 2);

    let user = library.user(user.id).await;
    assert_eq!(user.lost_book_count, 2);
    assert_eq!(user.borrowing_privilege, BorrowingPrivilege::Unable);

    let result = library.services.lending.borrow(user.id, third).await;
    assert!(matches!(result, Err(AppError::BorrowingNotAllowed)));
}

#[tokio::test]
async fn test_lost_loan_is_terminal() {
    let library = Library::new();
    let user = library.member("reader").await;
    let book = library.book("Dune").await;

    library.services.lending.borrow(user.id, book).await.unwrap();
    library.clock.set(date(2024, 5, 1));
    library.services.sweep.run().await.unwrap();

    let result = library.services.lending.return_book(user.id, book).await;
    assert!(matches!(result, Err(AppError::LoanNotFound(_))));

    let history = library.services.lending.loan_history(user.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, LoanState::Lost);
    assert!(history[0].return_date.is_none());

    let lost = library.services.lending.lost_loans().await.unwrap();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].book.status, BookStatus::Lost);

    // A lost book cannot go out again
    let other = library.member("other").await;
    let result = library.services.lending.borrow(other.id, book).await;
    assert!(matches!(
        result,
        Err(AppError::BookNotAvailable { status: BookStatus::Lost, .. })
    ));
}

#[tokio::test]
async fn test_history_is_most_recent_first() {
    let library = Library::new();
    let user = library.member("regular").await;
    let book = library.book("Dune").await;

    for _ in 0..3 {
        library.services.lending.borrow(user.id, book).await.unwrap();
        library.clock.advance(2);
        library.services.lending.return_book(user.id, book).await.unwrap();
        library.clock.advance(1);
    }

    let history = library.services.lending.loan_history(user.id).await.unwrap();
    let borrowed: Vec<NaiveDate> = history.iter().map(|loan| loan.borrow_date).collect();
    assert_eq!(
        borrowed,
        vec![date(2024, 3, 7), date(2024, 3, 4), date(2024, 3, 1)]
    );
}

#[tokio::test]
async fn test_deleting_member_releases_their_books() {
    let library = Library::new();
    let user = library.member("leaving").await;
    let book = library.book("Dune").await;

    library.services.lending.borrow(user.id, book).await.unwrap();
    library.services.users.delete_user(user.id).await.unwrap();

    assert_eq!(library.book_status(book).await, BookStatus::Active);
    let result = library.services.lending.user_current_loans(user.id).await;
    assert!(matches!(result, Err(AppError::UserNotFound(_))));
}

#[tokio::test]
async fn test_catalog_search() {
    let library = Library::new();
    let herbert = library
        .store
        .insert_author("Frank", None, Some("Herbert"))
        .await;
    let orwell = library
        .store
        .insert_author("Eric", Some("George Orwell"), Some("Blair"))
        .await;
    let scifi = library.store.insert_genre("Science Fiction").await;
    let chilton = library.store.insert_publisher("Chilton Books").await;

    library
        .services
        .catalog
        .create_book(CreateBook {
            name: "Dune".to_string(),
            author_ids: [herbert.id].into(),
            publisher_ids: [chilton.id].into(),
            genre_ids: [scifi.id].into(),
        })
        .await
        .unwrap();
    library
        .services
        .catalog
        .create_book(CreateBook {
            name: "1984".to_string(),
            author_ids: [orwell.id].into(),
            genre_ids: [scifi.id].into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let catalog = &library.services.catalog;
    assert_eq!(catalog.search_by_author("orwell").await.unwrap().len(), 1);
    assert_eq!(catalog.search_by_author("  ").await.unwrap().len(), 0);
    // Wildcard characters are matched literally
    assert_eq!(catalog.search_by_author("_").await.unwrap().len(), 0);
    assert_eq!(catalog.search_by_author("%").await.unwrap().len(), 0);
    assert_eq!(catalog.search_by_genre("science fiction").await.unwrap().len(), 2);
    assert_eq!(catalog.search_by_publisher("Chilton Books").await.unwrap().len(), 1);
    assert_eq!(catalog.find_by_name("DUNE").await.unwrap().name, "Dune");
    assert!(matches!(
        catalog.search_by_genre("Poetry").await,
        Err(AppError::NotFound(_))
    ));

    let duplicate = catalog
        .create_book(CreateBook {
            name: "dune".to_string(),
            ..Default::default()
        })
        .await;
    assert!(matches!(duplicate, Err(AppError::Conflict(_))));

    let dangling = catalog
        .create_book(CreateBook {
            name: "Emma".to_string(),
            author_ids: [9_999].into(),
            ..Default::default()
        })
        .await;
    assert!(matches!(dangling, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn test_open_loan_refuses_a_privilege_changed_mid_borrow() {
    let library = Library::new();
    let user = library.member("reader").await;
    let book = library.book("Dune").await;

    // The due date below was computed for FULL, then the member lost a tier
    library
        .store
        .put_user(User {
            borrowing_privilege: BorrowingPrivilege::Limited,
            ..user.clone()
        })
        .await;

    let result = library
        .store
        .open_loan(&NewLoan {
            user_id: user.id,
            book_id: book,
            privilege: BorrowingPrivilege::Full,
            borrow_date: start(),
            due_date: date(2024, 3, 31),
        })
        .await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    assert_eq!(library.book_status(book).await, BookStatus::Active);
    assert_eq!(library.store.count_active_loans(user.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_mark_lost_refuses_a_loan_returned_after_the_query() {
    let library = Library::new();
    let user = library.member("reader").await;
    let book = library.book("Dune").await;

    let loan = library.services.lending.borrow(user.id, book).await.unwrap();
    library.clock.set(date(2024, 4, 1));

    let expired = library
        .store
        .find_expired_unflagged(date(2024, 4, 1))
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);

    // The member brings the book back before the sweep writes
    library.services.lending.return_book(user.id, book).await.unwrap();
    let before = library.user(user.id).await;

    let result = library
        .store
        .mark_lost(&LossRecord {
            loan_id: expired[0].id,
            book_id: expired[0].book_id,
            user_id: user.id,
            previous_privilege: BorrowingPrivilege::Full,
            privilege: BorrowingPrivilege::Limited,
        })
        .await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let stored = library.store.find_loan(loan.id).await.unwrap();
    assert_eq!(stored.state(), LoanState::Returned);
    assert_eq!(stored.return_date, Some(date(2024, 4, 1)));
    assert!(!stored.lost);
    assert_eq!(library.book_status(book).await, BookStatus::Active);
    assert_eq!(library.user(user.id).await, before);
}

#[tokio::test]
async fn test_mark_lost_refuses_a_stale_privilege_without_partial_writes() {
    let library = Library::new();
    let user = library.member("reader").await;
    let book = library.book("Dune").await;

    let loan = library.services.lending.borrow(user.id, book).await.unwrap();
    library.clock.set(date(2024, 4, 1));

    let expired = library
        .store
        .find_expired_unflagged(date(2024, 4, 1))
        .await
        .unwrap();

    // Another loss degraded the member between the read and the write
    let degraded = User {
        borrowing_privilege: BorrowingPrivilege::Limited,
        lost_book_count: 1,
        ..library.user(user.id).await
    };
    library.store.put_user(degraded.clone()).await;

    let result = library
        .store
        .mark_lost(&LossRecord {
            loan_id: expired[0].id,
            book_id: expired[0].book_id,
            user_id: user.id,
            previous_privilege: BorrowingPrivilege::Full,
            privilege: BorrowingPrivilege::Limited,
        })
        .await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let stored = library.store.find_loan(loan.id).await.unwrap();
    assert_eq!(stored.state(), LoanState::Active);
    assert_eq!(library.book_status(book).await, BookStatus::Borrowed);
    assert_eq!(library.user(user.id).await, degraded);

    // The next run reads the current tier and succeeds
    let report = library.services.sweep.run().await.unwrap();
    assert_eq!(report.flagged, 1);
    let user = library.user(user.id).await;
    assert_eq!(user.lost_book_count, 2);
    assert_eq!(user.borrowing_privilege, BorrowingPrivilege::Unable);
}

#[tokio::test]
async fn test_delete_book_only_when_never_lent() {
    let library = Library::new();
    let user = library.member("reader").await;
    let shelved = library.book("Dune").await;
    let lent = library.book("Emma").await;
    let catalog = &library.services.catalog;

    assert!(matches!(
        catalog.delete_book(9_999).await,
        Err(AppError::BookNotFound(9_999))
    ));

    library.services.lending.borrow(user.id, lent).await.unwrap();
    assert!(matches!(catalog.delete_book(lent).await, Err(AppError::Conflict(_))));

    // Back on the shelf, but the ledger still points at it
    library.services.lending.return_book(user.id, lent).await.unwrap();
    assert!(matches!(catalog.delete_book(lent).await, Err(AppError::Conflict(_))));
    assert_eq!(library.book_status(lent).await, BookStatus::Active);

    catalog.delete_book(shelved).await.unwrap();
    assert!(matches!(
        catalog.get_book(shelved).await,
        Err(AppError::BookNotFound(_))
    ));
}

#[tokio::test]
async fn test_profile_update_leaves_lending_state_alone() {
    let library = Library::new();
    let user = library
        .member_with("reader", BorrowingPrivilege::Limited)
        .await;
    library.member("taken").await;
    let users = &library.services.users;

    let updated = users
        .update_user(
            user.id,
            UpdateUser {
                first_name: Some("Ada".to_string()),
                email: Some("ada@example.org".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.username, "reader");
    assert_eq!(updated.first_name.as_deref(), Some("Ada"));
    assert_eq!(updated.borrowing_privilege, BorrowingPrivilege::Limited);
    assert_eq!(updated.lost_book_count, 0);

    let rename = UpdateUser {
        username: Some("taken".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        users.update_user(user.id, rename).await,
        Err(AppError::Conflict(_))
    ));
    assert!(matches!(
        users.update_user(9_999, UpdateUser::default()).await,
        Err(AppError::UserNotFound(9_999))
    ));
}

#[tokio::test]
async fn test_member_lookups() {
    let library = Library::new();
    let users = &library.services.users;
    for (username, first, last, email) in [
        ("ada", "Ada", "Lovelace", "ada@example.org"),
        ("alan", "Alan", "Turing", "alan@example.org"),
        ("grace", "Grace", "Hopper", "grace@example.org"),
    ] {
        users
            .create_user(CreateUser {
                username: username.to_string(),
                email: Some(email.to_string()),
                first_name: Some(first.to_string()),
                last_name: Some(last.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    assert_eq!(users.list_users().await.unwrap().len(), 3);

    let by_username = users
        .search(&UserQuery {
            username: Some("ALAN".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_username[0].last_name.as_deref(), Some("Turing"));

    let by_email = users
        .search(&UserQuery {
            email: Some("grace@example.org".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_email[0].username, "grace");

    let by_first_name = users
        .search(&UserQuery {
            first_name: Some("a".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_first_name.len(), 3);

    let by_last_name = users
        .search(&UserQuery {
            last_name: Some("opp".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_last_name.len(), 1);

    let missing = users
        .search(&UserQuery {
            email: Some("nobody@example.org".to_string()),
            ..Default::default()
        })
        .await;
    assert!(matches!(missing, Err(AppError::NotFound(_))));
}
