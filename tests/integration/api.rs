//! API integration tests against the in-process router

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::NaiveDate;
use serde_json::{json, Value};
use tower::ServiceExt;

use shelfmark_server::{
    api,
    config::AppConfig,
    models::{
        book::CreateBook,
        enums::Role,
        user::{CreateUser, UserClaims, UserQuery},
    },
    repository::{MemoryStore, Repository},
    services::{clock::FixedClock, Services},
    AppState,
};

const SECRET: &str = "test-secret";

struct TestApp {
    router: Router,
    services: Services,
}

impl TestApp {
    fn new() -> Self {
        let mut config = AppConfig::default();
        config.auth.jwt_secret = SECRET.to_string();

        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));
        let services = Services::new(Repository::in_memory(store), clock);

        let router = api::create_router(AppState {
            config: Arc::new(config),
            services: Arc::new(services.clone()),
        });

        Self { router, services }
    }

    async fn member(&self, username: &str, role: Role) -> String {
        let user = self
            .services
            .users
            .create_user(CreateUser {
                username: username.to_string(),
                role: Some(role),
                ..Default::default()
            })
            .await
            .unwrap();
        token(user.id, username, role)
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

    async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match body {
            Some(value) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}

fn token(user_id: i64, username: &str, role: Role) -> String {
    let now = chrono::Utc::now().timestamp();
    UserClaims {
        sub: username.to_string(),
        user_id,
        role,
        exp: now + 3600,
        iat: now,
    }
    .create_token(SECRET)
    .unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::new();

    let (status, body) = app.send(Method::GET, "/api/v1/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let app = TestApp::new();

    let (status, body) = app.send(Method::GET, "/api/v1/loans/current", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "NotAuthorized");

    let forged = token(1, "reader", Role::Admin).replace('.', "x");
    let (status, _) = app
        .send(Method::GET, "/api/v1/loans/current", Some(&forged), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_borrow_and_return() {
    let app = TestApp::new();
    let reader = app.member("reader", Role::User).await;
    let book = app.book("Dune").await;

    let (status, body) = app
        .send(Method::POST, "/api/v1/loans", Some(&reader), Some(json!({ "book_id": book })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["due_date"], "2024-03-31");
    assert_eq!(body["state"], "ACTIVE");
    assert_eq!(body["book"]["status"], "BORROWED");
    assert_eq!(body["user"]["username"], "reader");

    let (status, body) = app
        .send(Method::GET, "/api/v1/loans/current", Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));

    let (status, body) = app
        .send(Method::POST, "/api/v1/loans/return", Some(&reader), Some(json!({ "book_id": book })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "RETURNED");
    assert_eq!(body["return_date"], "2024-03-01");

    let (status, body) = app
        .send(Method::POST, "/api/v1/loans/return", Some(&reader), Some(json!({ "book_id": book })))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 6);
}

#[tokio::test]
async fn test_lending_errors_carry_codes() {
    let app = TestApp::new();
    let reader = app.member("reader", Role::User).await;
    let other = app.member("other", Role::User).await;
    let book = app.book("Dune").await;

    let (status, body) = app
        .send(Method::POST, "/api/v1/loans", Some(&reader), Some(json!({ "book_id": 9999 })))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 5);

    app.send(Method::POST, "/api/v1/loans", Some(&reader), Some(json!({ "book_id": book })))
        .await;
    let (status, body) = app
        .send(Method::POST, "/api/v1/loans", Some(&other), Some(json!({ "book_id": book })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BookNotAvailable");
}

#[tokio::test]
async fn test_admin_routes_require_admin() {
    let app = TestApp::new();
    let reader = app.member("reader", Role::User).await;
    let admin = app.member("librarian", Role::Admin).await;

    let (status, _) = app
        .send(Method::GET, "/api/v1/admin/loans/lost", Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .send(Method::GET, "/api/v1/admin/loans/lost", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = app
        .send(Method::POST, "/api/v1/books", Some(&reader), Some(json!({ "name": "Emma" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .send(Method::POST, "/api/v1/books", Some(&admin), Some(json!({ "name": "Emma" })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "ACTIVE");

    let (status, _) = app
        .send(Method::GET, "/api/v1/admin/users/9999/loans/current", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_member_profile_and_user_admin() {
    let app = TestApp::new();
    let admin = app.member("librarian", Role::Admin).await;

    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/users",
            Some(&admin),
            Some(json!({ "username": "newcomer", "email": "new@example.org" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["borrowing_privilege"], "FULL");
    assert_eq!(body["lost_book_count"], 0);
    assert_eq!(body["role"], "USER");
    let id = body["id"].as_i64().unwrap();

    let newcomer = token(id, "newcomer", Role::User);
    let (status, body) = app.send(Method::GET, "/api/v1/users/me", Some(&newcomer), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "newcomer");

    let (status, _) = app
        .send(
            Method::POST,
            "/api/v1/users",
            Some(&admin),
            Some(json!({ "username": "newcomer" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .send(Method::DELETE, &format!("/api/v1/users/{}", id), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app
        .send(Method::GET, &format!("/api/v1/users/{}", id), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_book_search() {
    let app = TestApp::new();
    let reader = app.member("reader", Role::User).await;
    app.book("Dune").await;
    app.book("Emma").await;

    let (status, body) = app.send(Method::GET, "/api/v1/books", Some(&reader), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(2));

    let (status, body) = app
        .send(Method::GET, "/api/v1/books?name=emma", Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "Emma");

    let (status, _) = app
        .send(Method::GET, "/api/v1/books?genre=Poetry", Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_book_deletion_is_admin_only_and_guarded() {
    let app = TestApp::new();
    let reader = app.member("reader", Role::User).await;
    let admin = app.member("librarian", Role::Admin).await;
    let spare = app.book("Emma").await;
    let lent = app.book("Dune").await;

    let (status, _) = app
        .send(Method::DELETE, &format!("/api/v1/books/{}", spare), Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    app.send(Method::POST, "/api/v1/loans", Some(&reader), Some(json!({ "book_id": lent })))
        .await;
    let (status, body) = app
        .send(Method::DELETE, &format!("/api/v1/books/{}", lent), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Duplicate");

    let (status, _) = app
        .send(Method::DELETE, &format!("/api/v1/books/{}", spare), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app
        .send(Method::GET, &format!("/api/v1/books/{}", spare), Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_user_listing_and_profile_updates() {
    let app = TestApp::new();
    let reader = app.member("reader", Role::User).await;
    let other = app.member("other", Role::User).await;
    let admin = app.member("librarian", Role::Admin).await;
    let me = app
        .services
        .users
        .search(&UserQuery {
            username: Some("reader".to_string()),
            ..Default::default()
        })
        .await
        .unwrap()[0]
        .id;

    let (status, _) = app.send(Method::GET, "/api/v1/users", Some(&reader), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app.send(Method::GET, "/api/v1/users", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(3));

    let (status, body) = app
        .send(Method::GET, "/api/v1/users?username=OTHER", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["username"], "other");

    // A member can edit their own profile but not someone else's
    let (status, body) = app
        .send(
            Method::PUT,
            &format!("/api/v1/users/{}", me),
            Some(&reader),
            Some(json!({ "first_name": "Ada" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["first_name"], "Ada");
    assert_eq!(body["borrowing_privilege"], "FULL");

    let (status, _) = app
        .send(
            Method::PUT,
            &format!("/api/v1/users/{}", me),
            Some(&other),
            Some(json!({ "first_name": "Mallory" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .send(
            Method::PUT,
            &format!("/api/v1/users/{}", me),
            Some(&admin),
            Some(json!({ "username": "other" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
