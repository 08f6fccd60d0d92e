//! Shelfmark library lending server
//!
//! A REST JSON API over a library catalog and its loan ledger: members borrow
//! and return books under a privilege policy, and a daily sweep turns loans
//! that were never brought back into lost books.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub services: Arc<services::Services>,
}
