use std::marker::PhantomData;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRef, FromRequest, FromRequestParts, Request},
    http::request::Parts,
    Json,
};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::auth::claims::Claims;
use crate::auth::jwt::JwtKeys;
use crate::auth::repo_types::{ROLE_ADMIN, ROLE_TEACHER};
use crate::errors::AuthError;

/// Validated access-token claims of the caller.
pub struct AuthUser(pub Claims);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = JwtKeys::from_ref(state);

        // Read Authorization header
        let auth = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or(AuthError::InvalidToken)?;

        // Expect "Bearer <token>"
        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .ok_or(AuthError::InvalidToken)?;

        let claims = keys.verify_access(token).map_err(|e| {
            warn!(error = %e, "invalid or expired token");
            AuthError::InvalidToken
        })?;

        Ok(AuthUser(claims))
    }
}

/// Roles allowed through a [`RequireRole`] guard; holding any one is enough.
pub trait RolePolicy {
    const ROLES: &'static [&'static str];
}

/// Teachers and administrators.
pub struct Staff;

impl RolePolicy for Staff {
    const ROLES: &'static [&'static str] = &[ROLE_ADMIN, ROLE_TEACHER];
}

pub struct Admin;

impl RolePolicy for Admin {
    const ROLES: &'static [&'static str] = &[ROLE_ADMIN];
}

/// An authenticated caller holding one of `P::ROLES`.
///
/// A missing or bad token is still `InvalidToken` (401); a valid token
/// without a matching role is `Forbidden` (403).
pub struct RequireRole<P>(pub Claims, pub PhantomData<P>);

#[async_trait]
impl<S, P> FromRequestParts<S> for RequireRole<P>
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
    P: RolePolicy + Send + Sync + 'static,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let AuthUser(claims) = AuthUser::from_request_parts(parts, state).await?;
        if !claims.has_any_role(P::ROLES) {
            warn!(user_id = %claims.sub, required = ?P::ROLES, "role check failed");
            return Err(AuthError::Forbidden);
        }
        Ok(RequireRole(claims, PhantomData))
    }
}

/// `axum::Json` whose rejections come back as `validation_failed` bodies
/// instead of axum's plain-text 415/422 responses.
pub struct ValidJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ValidJson(value))
    }
}

impl From<JsonRejection> for AuthError {
    fn from(rejection: JsonRejection) -> Self {
        debug!(error = %rejection.body_text(), "request body rejected");
        let message = match rejection {
            JsonRejection::JsonDataError(err) => {
                format!("invalid request body: {}", first_line(&err.body_text()))
            }
            JsonRejection::JsonSyntaxError(err) => {
                format!("malformed JSON: {}", first_line(&err.body_text()))
            }
            JsonRejection::MissingJsonContentType(_) => {
                "expected Content-Type: application/json".to_string()
            }
            JsonRejection::BytesRejection(_) => "failed to read request body".to_string(),
            _ => "unreadable request body".to_string(),
        };
        AuthError::ValidationFailed(message)
    }
}

fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or_default().chars().take(200).collect()
}
