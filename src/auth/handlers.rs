use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{
            ChangePasswordRequest, ListUsersQuery, PublicUser, RefreshRequest, Session,
            SetActiveRequest, SignInRequest, SignUpRequest,
        },
        extractors::{Admin, AuthUser, RequireRole, Staff, ValidJson},
    },
    errors::AuthError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(sign_up))
        .route("/auth/signin", post(sign_in))
        .route("/auth/refresh", post(refresh))
}

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/me", get(get_me))
        .route("/auth/password", put(change_password))
}

/// Routes gated on staff or admin roles.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/users", get(list_users))
        .route("/auth/users/:id/active", put(set_active))
}

#[instrument(skip(state, payload))]
pub async fn sign_up(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<SignUpRequest>,
) -> Result<(StatusCode, Json<PublicUser>), AuthError> {
    info!(username = %payload.username, "sign up request");
    let user = state
        .service
        .register_user(&payload.username, &payload.email, &payload.password)
        .await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

#[instrument(skip(state, payload))]
pub async fn sign_in(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<SignInRequest>,
) -> Result<Json<Session>, AuthError> {
    let session = state
        .service
        .authenticate_user(&payload.username_or_email, &payload.password)
        .await?;
    Ok(Json(session))
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<RefreshRequest>,
) -> Result<Json<Session>, AuthError> {
    let session = state.service.refresh_session(&payload.refresh_token).await?;
    Ok(Json(session))
}

#[instrument(skip_all, fields(user_id = %claims.sub))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<Json<PublicUser>, AuthError> {
    let user = state.service.current_user(claims.sub).await?;
    Ok(Json(user.into()))
}

#[instrument(skip_all, fields(user_id = %claims.sub))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ValidJson(payload): ValidJson<ChangePasswordRequest>,
) -> Result<Json<PublicUser>, AuthError> {
    let user = state
        .service
        .change_password(claims.sub, &payload.current_password, &payload.new_password)
        .await?;
    Ok(Json(user.into()))
}

#[instrument(skip_all, fields(user_id = %claims.sub))]
pub async fn list_users(
    State(state): State<AppState>,
    RequireRole(claims, _): RequireRole<Staff>,
    query: Result<Query<ListUsersQuery>, QueryRejection>,
) -> Result<Json<Vec<PublicUser>>, AuthError> {
    let Query(query) = query.map_err(|e| AuthError::ValidationFailed(e.body_text()))?;
    let users = state.service.list_users(query.into()).await?;
    Ok(Json(users.into_iter().map(PublicUser::from).collect()))
}

#[instrument(skip_all, fields(user_id = %claims.sub))]
pub async fn set_active(
    State(state): State<AppState>,
    RequireRole(claims, _): RequireRole<Admin>,
    target: Result<Path<Uuid>, PathRejection>,
    ValidJson(payload): ValidJson<SetActiveRequest>,
) -> Result<Json<PublicUser>, AuthError> {
    let Path(target) = target.map_err(|e| AuthError::ValidationFailed(e.body_text()))?;
    info!(target_id = %target, active = payload.active, "changing account activity");
    let user = state.service.set_active(target, payload.active).await?;
    Ok(Json(user.into()))
}
