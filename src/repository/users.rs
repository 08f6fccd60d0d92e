//! Users repository for database operations

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use super::{constraint_error, like_pattern, UserStore};
use crate::{
    error::{AppError, AppResult},
    models::{
        enums::{BookStatus, BorrowingPrivilege},
        user::{CreateUser, UpdateUser, User},
    },
};

const USER_COLUMNS: &str =
    "id, username, email, first_name, last_name, role, lost_book_count, borrowing_privilege";

#[derive(Clone)]
pub struct UsersRepository {
    pool: Pool<Postgres>,
}

impl UsersRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn find_users_where(&self, column: &str, fragment: &str) -> AppResult<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE {column} ILIKE $1 ESCAPE '\\' ORDER BY id"
        ))
        .bind(like_pattern(fragment.trim()))
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }
}

#[async_trait]
impl UserStore for UsersRepository {
    async fn find_user(&self, id: i64) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn list_users(&self) -> AppResult<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    async fn find_user_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE LOWER(username) = LOWER($1)"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1)"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn find_users_by_first_name(&self, fragment: &str) -> AppResult<Vec<User>> {
        self.find_users_where("first_name", fragment).await
    }

    async fn find_users_by_last_name(&self, fragment: &str) -> AppResult<Vec<User>> {
        self.find_users_where("last_name", fragment).await
    }

    async fn create_user(&self, user: &CreateUser) -> AppResult<User> {
        let created = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (username, email, first_name, last_name, role, lost_book_count, borrowing_privilege)
            VALUES ($1, $2, $3, $4, $5, 0, $6)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(user.username.trim())
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.role.unwrap_or_default())
        .bind(BorrowingPrivilege::Full)
        .fetch_one(&self.pool)
        .await
        .map_err(constraint_error)?;

        Ok(created)
    }

    async fn update_user(&self, id: i64, update: &UpdateUser) -> AppResult<User> {
        let updated = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users SET
                username = COALESCE($2, username),
                email = COALESCE($3, email),
                first_name = COALESCE($4, first_name),
                last_name = COALESCE($5, last_name)
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(update.username.as_deref().map(str::trim))
        .bind(&update.email)
        .bind(&update.first_name)
        .bind(&update.last_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(constraint_error)?;

        updated.ok_or(AppError::UserNotFound(id))
    }

    async fn delete_user(&self, id: i64) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        // Books still out with this member go back on the shelf
        sqlx::query(
            r#"
            UPDATE books SET status = $2
            WHERE id IN (
                SELECT book_id FROM loans
                WHERE user_id = $1 AND return_date IS NULL AND lost = FALSE
            )
            "#,
        )
        .bind(id)
        .bind(BookStatus::Active)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::UserNotFound(id));
        }

        tx.commit().await?;
        Ok(())
    }
}
