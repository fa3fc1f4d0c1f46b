use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::repo::{RepoError, RepoResult, UserRepo};
use crate::auth::repo_types::{NewUser, User, UserFilter};
use crate::errors::IdentityField;

const UNIQUE_VIOLATION: &str = "23505";
const USERNAME_CONSTRAINT: &str = "users_username_key";
const EMAIL_CONSTRAINT: &str = "users_email_key";

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    email: String,
    password_hash: String,
    roles: Vec<String>,
    is_active: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<UserRow> for User {
    fn from(r: UserRow) -> Self {
        Self {
            id: r.id,
            username: r.username,
            email: r.email,
            password_hash: r.password_hash,
            roles: r.roles.into_iter().collect(),
            is_active: r.is_active,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Postgres-backed store; uniqueness is enforced by the table constraints.
#[derive(Clone)]
pub struct PgUserRepo {
    db: PgPool,
}

impl PgUserRepo {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn connect(url: &str, max_connections: u32, timeout: Duration) -> anyhow::Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect(url)
            .await
            .context("connect to database")?;
        Ok(Self { db })
    }

    pub fn pool(&self) -> &PgPool {
        &self.db
    }

    /// Apply `migrations/`. Failure is fatal: without the unique constraints
    /// racing sign-ups could both commit.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.db)
            .await
            .context("run migrations")?;
        info!("migrations applied");
        Ok(())
    }

    async fn find_one(&self, sql: &'static str, key: &str) -> RepoResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(sql)
            .bind(key)
            .fetch_optional(&self.db)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(User::from))
    }
}

fn conflict_field(constraint: Option<&str>) -> Option<IdentityField> {
    match constraint {
        Some(USERNAME_CONSTRAINT) => Some(IdentityField::Username),
        Some(EMAIL_CONSTRAINT) => Some(IdentityField::Email),
        _ => None,
    }
}

fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::Database(db) => {
            let field = if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
                conflict_field(db.constraint())
            } else {
                None
            };
            match field {
                Some(field) => RepoError::Conflict(field),
                None => RepoError::Backend(db.to_string()),
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => RepoError::Unavailable(err.to_string()),
        other => RepoError::Backend(other.to_string()),
    }
}

/// `%` and `_` in user input match literally.
fn like_pattern(search: &str) -> String {
    let mut escaped = String::with_capacity(search.len() + 2);
    escaped.push('%');
    for c in search.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[async_trait]
impl UserRepo for PgUserRepo {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, username, email, password_hash, roles, is_active, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.map(User::from))
    }

    async fn find_by_username(&self, username: &str) -> RepoResult<Option<User>> {
        self.find_one(
            r#"
            SELECT id, username, email, password_hash, roles, is_active, created_at, updated_at
            FROM users
            WHERE username = $1
            "#,
            username,
        )
        .await
    }

    async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        self.find_one(
            r#"
            SELECT id, username, email, password_hash, roles, is_active, created_at, updated_at
            FROM users
            WHERE email = $1
            "#,
            email,
        )
        .await
    }

    async fn insert_unique(&self, user: NewUser) -> RepoResult<User> {
        let roles: Vec<String> = user.roles.into_iter().collect();
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (id, username, email, password_hash, roles, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING id, username, email, password_hash, roles, is_active, created_at, updated_at
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(roles)
        .bind(user.created_at)
        .fetch_one(&self.db)
        .await
        .map_err(map_sqlx_error)?;
        debug!(user_id = %row.id, "user row inserted");
        Ok(row.into())
    }

    async fn list(&self, filter: &UserFilter) -> RepoResult<Vec<User>> {
        let pattern = filter.search.as_deref().map(like_pattern);
        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, username, email, password_hash, roles, is_active, created_at, updated_at
            FROM users
            WHERE $1::text IS NULL OR username ILIKE $1 OR email ILIKE $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(pattern)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.db)
        .await
        .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        updated_at: OffsetDateTime,
    ) -> RepoResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            UPDATE users
            SET password_hash = $2, updated_at = $3
            WHERE id = $1
            RETURNING id, username, email, password_hash, roles, is_active, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(password_hash)
        .bind(updated_at)
        .fetch_optional(&self.db)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.map(User::from))
    }

    async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        updated_at: OffsetDateTime,
    ) -> RepoResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            UPDATE users
            SET is_active = $2, updated_at = $3
            WHERE id = $1
            RETURNING id, username, email, password_hash, roles, is_active, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(active)
        .bind(updated_at)
        .fetch_optional(&self.db)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.map(User::from))
    }
}
