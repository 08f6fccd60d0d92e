//! Books repository for database operations

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Transaction};

use super::{constraint_error, like_pattern, BookStore};
use crate::{
    error::{AppError, AppResult},
    models::{
        book::{Author, Book, BookShort, CreateBook, Genre, Publisher, UpdateBook},
        enums::BookStatus,
    },
};

/// Join tables as (table, foreign key column)
const AUTHOR_LINKS: (&str, &str) = ("book_authors", "author_id");
const PUBLISHER_LINKS: (&str, &str) = ("book_publishers", "publisher_id");
const GENRE_LINKS: (&str, &str) = ("book_genres", "genre_id");

#[derive(Clone)]
pub struct BooksRepository {
    pool: Pool<Postgres>,
}

impl BooksRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Attach association ids to bare book rows, keeping row order
    async fn with_associations(&self, rows: Vec<BookShort>) -> AppResult<Vec<Book>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();

        let authors = self.links(AUTHOR_LINKS, &ids).await?;
        let publishers = self.links(PUBLISHER_LINKS, &ids).await?;
        let genres = self.links(GENRE_LINKS, &ids).await?;

        Ok(rows
            .into_iter()
            .map(|row| Book {
                author_ids: authors.get(&row.id).cloned().unwrap_or_default(),
                publisher_ids: publishers.get(&row.id).cloned().unwrap_or_default(),
                genre_ids: genres.get(&row.id).cloned().unwrap_or_default(),
                id: row.id,
                name: row.name,
                status: row.status,
            })
            .collect())
    }

    async fn links(
        &self,
        (table, column): (&str, &str),
        book_ids: &[i64],
    ) -> AppResult<BTreeMap<i64, BTreeSet<i64>>> {
        let sql = format!("SELECT book_id, {column} FROM {table} WHERE book_id = ANY($1)");
        let pairs = sqlx::query_as::<_, (i64, i64)>(&sql)
            .bind(book_ids)
            .fetch_all(&self.pool)
            .await?;

        let mut map: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
        for (book_id, linked_id) in pairs {
            map.entry(book_id).or_default().insert(linked_id);
        }
        Ok(map)
    }

    async fn replace_links(
        tx: &mut Transaction<'_, Postgres>,
        (table, column): (&str, &str),
        book_id: i64,
        linked_ids: &BTreeSet<i64>,
    ) -> AppResult<()> {
        sqlx::query(&format!("DELETE FROM {table} WHERE book_id = $1"))
            .bind(book_id)
            .execute(&mut **tx)
            .await?;

        if linked_ids.is_empty() {
            return Ok(());
        }

        let linked_ids: Vec<i64> = linked_ids.iter().copied().collect();
        sqlx::query(&format!(
            "INSERT INTO {table} (book_id, {column}) SELECT $1, UNNEST($2::BIGINT[])"
        ))
        .bind(book_id)
        .bind(&linked_ids)
        .execute(&mut **tx)
        .await
        .map_err(constraint_error)?;

        Ok(())
    }

    async fn fetch_books(&self, sql: &str, bind: Option<i64>) -> AppResult<Vec<Book>> {
        let mut query = sqlx::query_as::<_, BookShort>(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        self.with_associations(rows).await
    }
}

#[async_trait]
impl BookStore for BooksRepository {
    async fn find_book(&self, id: i64) -> AppResult<Option<Book>> {
        let books = self
            .fetch_books("SELECT id, name, status FROM books WHERE id = $1", Some(id))
            .await?;
        Ok(books.into_iter().next())
    }

    async fn book_exists(&self, id: i64) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM books WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn find_book_by_name(&self, name: &str) -> AppResult<Option<Book>> {
        let row = sqlx::query_as::<_, BookShort>(
            "SELECT id, name, status FROM books WHERE LOWER(name) = LOWER($1)",
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;

        let books = self.with_associations(row.into_iter().collect()).await?;
        Ok(books.into_iter().next())
    }

    async fn list_books(&self) -> AppResult<Vec<Book>> {
        self.fetch_books("SELECT id, name, status FROM books ORDER BY id", None)
            .await
    }

    async fn find_authors_matching(&self, criteria: &str) -> AppResult<Vec<Author>> {
        let authors = sqlx::query_as::<_, Author>(
            r#"
            SELECT id, pen_name, first_name, second_name
            FROM authors
            WHERE pen_name ILIKE $1 ESCAPE '\'
               OR first_name ILIKE $1 ESCAPE '\'
               OR second_name ILIKE $1 ESCAPE '\'
            ORDER BY id
            "#,
        )
        .bind(like_pattern(criteria.trim()))
        .fetch_all(&self.pool)
        .await?;
        Ok(authors)
    }

    async fn find_genre_by_name(&self, name: &str) -> AppResult<Option<Genre>> {
        let genre = sqlx::query_as::<_, Genre>(
            "SELECT id, name FROM genres WHERE LOWER(name) = LOWER($1)",
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(genre)
    }

    async fn find_publisher_by_name(&self, name: &str) -> AppResult<Option<Publisher>> {
        let publisher = sqlx::query_as::<_, Publisher>(
            "SELECT id, name FROM publishers WHERE LOWER(name) = LOWER($1)",
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(publisher)
    }

    async fn find_books_by_authors(&self, author_ids: &[i64]) -> AppResult<Vec<Book>> {
        let rows = sqlx::query_as::<_, BookShort>(
            r#"
            SELECT DISTINCT b.id, b.name, b.status
            FROM books b
            JOIN book_authors ba ON ba.book_id = b.id
            WHERE ba.author_id = ANY($1)
            ORDER BY b.id
            "#,
        )
        .bind(author_ids)
        .fetch_all(&self.pool)
        .await?;
        self.with_associations(rows).await
    }

    async fn find_books_by_genre(&self, genre_id: i64) -> AppResult<Vec<Book>> {
        self.fetch_books(
            r#"
            SELECT b.id, b.name, b.status
            FROM books b
            JOIN book_genres bg ON bg.book_id = b.id
            WHERE bg.genre_id = $1
            ORDER BY b.id
            "#,
            Some(genre_id),
        )
        .await
    }

    async fn find_books_by_publisher(&self, publisher_id: i64) -> AppResult<Vec<Book>> {
        self.fetch_books(
            r#"
            SELECT b.id, b.name, b.status
            FROM books b
            JOIN book_publishers bp ON bp.book_id = b.id
            WHERE bp.publisher_id = $1
            ORDER BY b.id
            "#,
            Some(publisher_id),
        )
        .await
    }

    async fn create_book(&self, book: &CreateBook) -> AppResult<Book> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, BookShort>(
            "INSERT INTO books (name, status) VALUES ($1, $2) RETURNING id, name, status",
        )
        .bind(book.name.trim())
        .bind(BookStatus::Active)
        .fetch_one(&mut *tx)
        .await
        .map_err(constraint_error)?;

        Self::replace_links(&mut tx, AUTHOR_LINKS, row.id, &book.author_ids).await?;
        Self::replace_links(&mut tx, PUBLISHER_LINKS, row.id, &book.publisher_ids).await?;
        Self::replace_links(&mut tx, GENRE_LINKS, row.id, &book.genre_ids).await?;

        tx.commit().await?;

        Ok(Book {
            id: row.id,
            name: row.name,
            status: row.status,
            author_ids: book.author_ids.clone(),
            publisher_ids: book.publisher_ids.clone(),
            genre_ids: book.genre_ids.clone(),
        })
    }

    async fn update_book(&self, id: i64, update: &UpdateBook) -> AppResult<Book> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE books SET name = COALESCE($2, name) WHERE id = $1")
            .bind(id)
            .bind(update.name.as_deref().map(str::trim))
            .execute(&mut *tx)
            .await
            .map_err(constraint_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::BookNotFound(id));
        }

        if let Some(ids) = &update.author_ids {
            Self::replace_links(&mut tx, AUTHOR_LINKS, id, ids).await?;
        }
        if let Some(ids) = &update.publisher_ids {
            Self::replace_links(&mut tx, PUBLISHER_LINKS, id, ids).await?;
        }
        if let Some(ids) = &update.genre_ids {
            Self::replace_links(&mut tx, GENRE_LINKS, id, ids).await?;
        }

        tx.commit().await?;

        self.find_book(id).await?.ok_or(AppError::BookNotFound(id))
    }

    async fn delete_book(&self, id: i64) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        // Lock the row so a concurrent borrow cannot slip in between the
        // checks and the delete
        let status: Option<BookStatus> =
            sqlx::query_scalar("SELECT status FROM books WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        match status {
            None => return Err(AppError::BookNotFound(id)),
            Some(BookStatus::Borrowed) => {
                return Err(AppError::Conflict(format!("Book {} is currently borrowed", id)))
            }
            Some(_) => {}
        }

        let referenced: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM loans WHERE book_id = $1)")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        if referenced {
            return Err(AppError::Conflict(format!("Book {} has loan records", id)));
        }

        sqlx::query("DELETE FROM books WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(constraint_error)?;

        tx.commit().await?;
        Ok(())
    }
}
