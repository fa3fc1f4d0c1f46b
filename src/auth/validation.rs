use lazy_static::lazy_static;
use regex::Regex;

use crate::auth::repo_types::{EMAIL_MAX_CHARS, USERNAME_MAX_CHARS};
use crate::errors::AuthError;

pub const PASSWORD_MIN_CHARS: usize = 6;
/// Upper bound on hashing input.
pub const PASSWORD_MAX_BYTES: usize = 128;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_string()
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn validate_username(username: &str) -> Result<(), AuthError> {
    let len = username.chars().count();
    if len == 0 {
        return Err(AuthError::ValidationFailed("username must not be blank".into()));
    }
    if len > USERNAME_MAX_CHARS {
        return Err(AuthError::ValidationFailed(format!(
            "username must be at most {USERNAME_MAX_CHARS} characters"
        )));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), AuthError> {
    let len = email.chars().count();
    if len == 0 {
        return Err(AuthError::ValidationFailed("email must not be blank".into()));
    }
    if len > EMAIL_MAX_CHARS {
        return Err(AuthError::ValidationFailed(format!(
            "email must be at most {EMAIL_MAX_CHARS} characters"
        )));
    }
    if !is_valid_email(email) {
        return Err(AuthError::ValidationFailed("invalid email".into()));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < PASSWORD_MIN_CHARS {
        return Err(AuthError::ValidationFailed(format!(
            "password must be at least {PASSWORD_MIN_CHARS} characters"
        )));
    }
    if password.len() > PASSWORD_MAX_BYTES {
        return Err(AuthError::ValidationFailed("password too long".into()));
    }
    Ok(())
}
