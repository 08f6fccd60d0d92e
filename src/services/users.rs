//! Member management service

use validator::Validate;

use crate::{
    error::{AppError, AppResult},
    models::user::{CreateUser, UpdateUser, User, UserQuery},
    repository::Repository,
};

#[derive(Clone)]
pub struct UsersService {
    repository: Repository,
}

impl UsersService {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    pub async fn get_user(&self, id: i64) -> AppResult<User> {
        self.repository
            .users
            .find_user(id)
            .await?
            .ok_or(AppError::UserNotFound(id))
    }

    pub async fn list_users(&self) -> AppResult<Vec<User>> {
        self.repository.users.list_users().await
    }

    /// Look members up by the first criterion present: username, email,
    /// first name, last name. Username and email are exact and fail with
    /// `NotFound`; names match a substring. Without any criterion every
    /// member is listed.
    pub async fn search(&self, query: &UserQuery) -> AppResult<Vec<User>> {
        if let Some(username) = &query.username {
            let user = self
                .repository
                .users
                .find_user_by_username(username.trim())
                .await?
                .ok_or_else(|| AppError::NotFound(format!("User '{}' not found", username.trim())))?;
            return Ok(vec![user]);
        }
        if let Some(email) = &query.email {
            let user = self
                .repository
                .users
                .find_user_by_email(email.trim())
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("No user with email '{}'", email.trim()))
                })?;
            return Ok(vec![user]);
        }
        if let Some(first_name) = &query.first_name {
            return self.repository.users.find_users_by_first_name(first_name).await;
        }
        if let Some(last_name) = &query.last_name {
            return self.repository.users.find_users_by_last_name(last_name).await;
        }
        self.list_users().await
    }

    /// Register a member. New members start at `FULL` privilege with no
    /// lost books.
    pub async fn create_user(&self, mut user: CreateUser) -> AppResult<User> {
        user.username = user.username.trim().to_string();
        user.validate()?;

        if self
            .repository
            .users
            .find_user_by_username(&user.username)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(format!(
                "Username '{}' is taken",
                user.username
            )));
        }

        let created = self.repository.users.create_user(&user).await?;
        tracing::info!(user_id = created.id, username = %created.username, "User created");
        Ok(created)
    }

    /// Change profile fields. Privilege and lost count are never touched here.
    pub async fn update_user(&self, id: i64, mut update: UpdateUser) -> AppResult<User> {
        update.username = update.username.map(|username| username.trim().to_string());
        update.validate()?;

        if let Some(username) = &update.username {
            if let Some(existing) = self.repository.users.find_user_by_username(username).await? {
                if existing.id != id {
                    return Err(AppError::Conflict(format!("Username '{}' is taken", username)));
                }
            }
        }

        let updated = self.repository.users.update_user(id, &update).await?;
        tracing::info!(user_id = id, "User profile updated");
        Ok(updated)
    }

    /// Delete a member together with their loans
    pub async fn delete_user(&self, id: i64) -> AppResult<()> {
        self.repository.users.delete_user(id).await?;
        tracing::info!(user_id = id, "User deleted");
        Ok(())
    }
}
