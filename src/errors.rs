//! Error kinds returned by the credential service and their HTTP mapping.
use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::auth::repo::RepoError;

/// Which unique field collided during sign-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityField {
    Username,
    Email,
}

impl fmt::Display for IdentityField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityField::Username => f.write_str("username"),
            IdentityField::Email => f.write_str("email"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{field} is already taken")]
    DuplicateIdentity { field: IdentityField },

    /// Unknown identity and wrong password share this variant.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("insufficient role for this operation")]
    Forbidden,

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("user not found")]
    NotFound,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::DuplicateIdentity { .. } => "duplicate_identity",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::InvalidToken => "invalid_token",
            AuthError::Forbidden => "forbidden",
            AuthError::ValidationFailed(_) => "validation_failed",
            AuthError::NotFound => "not_found",
            AuthError::StoreUnavailable(_) => "store_unavailable",
            AuthError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::DuplicateIdentity { .. } => StatusCode::CONFLICT,
            AuthError::InvalidCredentials | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            AuthError::NotFound => StatusCode::NOT_FOUND,
            AuthError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to a client.
    fn public_message(&self) -> String {
        match self {
            AuthError::StoreUnavailable(_) => "Service temporarily unavailable".into(),
            AuthError::Internal(_) => "Internal server error".into(),
            other => other.to_string(),
        }
    }
}

impl From<RepoError> for AuthError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::Conflict(field) => AuthError::DuplicateIdentity { field },
            RepoError::Unavailable(msg) => AuthError::StoreUnavailable(msg),
            RepoError::Backend(msg) => AuthError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorDetail<'a> {
    kind: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<IdentityField>,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if let AuthError::Internal(e) = &self {
            error!(error = %e, "internal error");
        }
        let field = match &self {
            AuthError::DuplicateIdentity { field } => Some(*field),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind(),
                message: self.public_message(),
                field,
            },
        };
        (self.status_code(), Json(body)).into_response()
    }
}
