//! Book catalog models

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use super::enums::BookStatus;

/// Full catalog record. Associations are kept as sets of foreign keys so a
/// book never embeds (or cycles back through) its authors and publishers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Book {
    pub id: i64,
    pub name: String,
    pub status: BookStatus,
    #[schema(value_type = Vec<i64>)]
    pub author_ids: BTreeSet<i64>,
    #[schema(value_type = Vec<i64>)]
    pub publisher_ids: BTreeSet<i64>,
    #[schema(value_type = Vec<i64>)]
    pub genre_ids: BTreeSet<i64>,
}

/// Book summary embedded in loan records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct BookShort {
    pub id: i64,
    pub name: String,
    pub status: BookStatus,
}

impl From<&Book> for BookShort {
    fn from(book: &Book) -> Self {
        Self {
            id: book.id,
            name: book.name.clone(),
            status: book.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Author {
    pub id: i64,
    pub pen_name: Option<String>,
    pub first_name: String,
    pub second_name: Option<String>,
}

impl Author {
    /// Substring match on any of the author's names, ignoring case
    pub fn matches(&self, criteria: &str) -> bool {
        let needle = criteria.to_lowercase();
        [Some(&self.first_name), self.pen_name.as_ref(), self.second_name.as_ref()]
            .into_iter()
            .flatten()
            .any(|name| name.to_lowercase().contains(&needle))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Publisher {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Genre {
    pub id: i64,
    pub name: String,
}

/// Create book request. New books always enter circulation as `ACTIVE`.
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct CreateBook {
    #[validate(length(min = 1, max = 255, message = "Book name cannot be empty"))]
    pub name: String,
    #[serde(default)]
    #[schema(value_type = Vec<i64>)]
    pub author_ids: BTreeSet<i64>,
    #[serde(default)]
    #[schema(value_type = Vec<i64>)]
    pub publisher_ids: BTreeSet<i64>,
    #[serde(default)]
    #[schema(value_type = Vec<i64>)]
    pub genre_ids: BTreeSet<i64>,
}

/// Update book request. `None` leaves a field untouched; a provided set
/// replaces the whole association.
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateBook {
    #[validate(length(min = 1, max = 255, message = "Book name cannot be empty"))]
    pub name: Option<String>,
    #[schema(value_type = Option<Vec<i64>>)]
    pub author_ids: Option<BTreeSet<i64>>,
    #[schema(value_type = Option<Vec<i64>>)]
    pub publisher_ids: Option<BTreeSet<i64>>,
    #[schema(value_type = Option<Vec<i64>>)]
    pub genre_ids: Option<BTreeSet<i64>>,
}

/// Book search parameters; the first criterion present wins
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct BookQuery {
    /// Exact name, case-insensitive
    pub name: Option<String>,
    /// Substring of an author's pen, first or second name
    pub author: Option<String>,
    /// Genre name
    pub genre: Option<String>,
    /// Publisher name
    pub publisher: Option<String>,
}
