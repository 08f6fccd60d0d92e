//! Catalog management service

use validator::Validate;

use crate::{
    error::{AppError, AppResult},
    models::book::{Book, BookQuery, CreateBook, UpdateBook},
    repository::Repository,
};

#[derive(Clone)]
pub struct CatalogService {
    repository: Repository,
}

impl CatalogService {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    pub async fn list_books(&self) -> AppResult<Vec<Book>> {
        self.repository.books.list_books().await
    }

    /// Get book by ID with its associations
    pub async fn get_book(&self, id: i64) -> AppResult<Book> {
        self.repository
            .books
            .find_book(id)
            .await?
            .ok_or(AppError::BookNotFound(id))
    }

    /// Exact name lookup, ignoring case
    pub async fn find_by_name(&self, name: &str) -> AppResult<Book> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Book name cannot be empty".to_string()));
        }
        self.repository
            .books
            .find_book_by_name(name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book '{}' not found", name)))
    }

    /// Search by the first criterion present: name, author, genre, publisher.
    /// Without any criterion the whole catalog is listed.
    pub async fn search(&self, query: &BookQuery) -> AppResult<Vec<Book>> {
        if let Some(name) = &query.name {
            return Ok(vec![self.find_by_name(name).await?]);
        }
        if let Some(author) = &query.author {
            return self.search_by_author(author).await;
        }
        if let Some(genre) = &query.genre {
            return self.search_by_genre(genre).await;
        }
        if let Some(publisher) = &query.publisher {
            return self.search_by_publisher(publisher).await;
        }
        self.list_books().await
    }

    /// Books by any author whose pen, first or second name contains `criteria`
    pub async fn search_by_author(&self, criteria: &str) -> AppResult<Vec<Book>> {
        let criteria = criteria.trim();
        if criteria.is_empty() {
            return Ok(Vec::new());
        }

        let authors = self.repository.books.find_authors_matching(criteria).await?;
        if authors.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = authors.iter().map(|author| author.id).collect();
        self.repository.books.find_books_by_authors(&ids).await
    }

    pub async fn search_by_genre(&self, name: &str) -> AppResult<Vec<Book>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(Vec::new());
        }

        let genre = self
            .repository
            .books
            .find_genre_by_name(name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Genre '{}' not found", name)))?;

        self.repository.books.find_books_by_genre(genre.id).await
    }

    pub async fn search_by_publisher(&self, name: &str) -> AppResult<Vec<Book>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(Vec::new());
        }

        let publisher = self
            .repository
            .books
            .find_publisher_by_name(name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Publisher '{}' not found", name)))?;

        self.repository.books.find_books_by_publisher(publisher.id).await
    }

    /// Add a book to the catalog. It enters circulation as `ACTIVE`.
    pub async fn create_book(&self, book: CreateBook) -> AppResult<Book> {
        book.validate()?;
        let name = book.name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Book name cannot be empty".to_string()));
        }

        if self.repository.books.find_book_by_name(name).await?.is_some() {
            return Err(AppError::Conflict(format!("Book '{}' already exists", name)));
        }

        let created = self.repository.books.create_book(&book).await?;
        tracing::info!(book_id = created.id, name = %created.name, "Book added to catalog");
        Ok(created)
    }

    /// Rename a book or replace its associations. Status is left alone.
    pub async fn update_book(&self, id: i64, update: UpdateBook) -> AppResult<Book> {
        update.validate()?;
        if let Some(name) = update.name.as_deref().map(str::trim) {
            if name.is_empty() {
                return Err(AppError::Validation("Book name cannot be empty".to_string()));
            }
            if let Some(existing) = self.repository.books.find_book_by_name(name).await? {
                if existing.id != id {
                    return Err(AppError::Conflict(format!("Book '{}' already exists", name)));
                }
            }
        }

        if !self.repository.books.book_exists(id).await? {
            return Err(AppError::BookNotFound(id));
        }

        self.repository.books.update_book(id, &update).await
    }

    /// Remove a book from the catalog. A book that is out, or that any loan
    /// still references, is refused with `Conflict`.
    pub async fn delete_book(&self, id: i64) -> AppResult<()> {
        self.repository.books.delete_book(id).await?;
        tracing::info!(book_id = id, "Book removed from catalog");
        Ok(())
    }
}
