//! Password registration, login and credential lifecycle.

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::net::SocketAddr;

use crate::{
    dtos::{
        auth::{LoginRequest, LogoutRequest, RefreshRequest, RegisterRequest, RevokeAllResponse},
        MessageResponse,
    },
    handlers::client_meta,
    middleware::AuthUser,
    models::{SessionInfo, UserResponse},
    services::{AuthResult, Registration, TokenPair},
    utils::{Password, ValidatedJson},
    AppState,
};
use service_core::error::AppError;

/// Register a new user.
///
/// POST /auth/register
pub async fn register(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResult>), AppError> {
    let meta = client_meta(&headers, connect_info);
    let result = state
        .auth
        .register(
            Registration {
                username: req.username,
                email: req.email,
                password: Password::new(req.password),
                display_name: req.display_name,
            },
            &meta,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(result)))
}

/// Log in with username or email.
///
/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<Json<AuthResult>, AppError> {
    let meta = client_meta(&headers, connect_info);
    let result = state
        .auth
        .login(&req.login, &Password::new(req.password), &meta)
        .await?;
    Ok(Json(result))
}

/// Exchange a refresh token for a new pair.
///
/// POST /auth/refresh
pub async fn refresh(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let meta = client_meta(&headers, connect_info);
    let pair = state.tokens.rotate(&req.refresh_token, &meta).await?;
    Ok(Json(pair))
}

/// POST /auth/logout
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    ValidatedJson(req): ValidatedJson<LogoutRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    state.tokens.revoke_one(&req.refresh_token).await?;
    Ok(Json(MessageResponse::new("Logged out")))
}

/// POST /auth/logout-all
pub async fn logout_all(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<RevokeAllResponse>, AppError> {
    let revoked_sessions = state.tokens.revoke_all(user.user_id()).await?;
    Ok(Json(RevokeAllResponse { revoked_sessions }))
}

/// GET /auth/sessions
pub async fn sessions(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<SessionInfo>>, AppError> {
    Ok(Json(state.tokens.list_sessions(user.user_id()).await?))
}

/// GET /auth/me
pub async fn me(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<UserResponse>, AppError> {
    Ok(Json(state.auth.get_user(user.user_id()).await?))
}
