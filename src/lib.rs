//! Credential service: account sign-up with uniqueness enforcement, Argon2
//! password hashing, and JWT session issuance behind a small axum API.

pub mod app;
pub mod auth;
pub mod config;
pub mod errors;
pub mod state;

pub use auth::services::CredentialService;
pub use errors::{AuthError, IdentityField};
