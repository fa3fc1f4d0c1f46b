use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{NewUser, User, UserFilter};
use crate::errors::IdentityField;

#[derive(Debug, Error)]
pub enum RepoError {
    /// A unique key already exists; nothing was written.
    #[error("{0} already exists")]
    Conflict(IdentityField),
    /// Connection, pool or timeout failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store error: {0}")]
    Backend(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Persistence for user records.
#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>>;
    async fn find_by_username(&self, username: &str) -> RepoResult<Option<User>>;
    async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>>;
    /// Insert atomically; fails with `Conflict` if username or email is taken.
    async fn insert_unique(&self, user: NewUser) -> RepoResult<User>;
    /// Newest first.
    async fn list(&self, filter: &UserFilter) -> RepoResult<Vec<User>>;
    /// `None` when no record has this id.
    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        updated_at: OffsetDateTime,
    ) -> RepoResult<Option<User>>;
    async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        updated_at: OffsetDateTime,
    ) -> RepoResult<Option<User>>;
}
