//! Federated login through configured OpenID Connect providers.

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::net::SocketAddr;
use validator::Validate;

use crate::{
    dtos::auth::{AuthorizeQuery, OidcCallbackRequest},
    handlers::client_meta,
    middleware::AuthUser,
    models::IdentityResponse,
    services::{AuthorizationRequest, FederatedLogin},
    utils::ValidatedJson,
    AppState,
};
use service_core::error::AppError;

/// Start an authorization-code flow with PKCE.
///
/// GET /auth/oidc/:provider/authorize?redirect_uri=
pub async fn authorize(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Json<AuthorizationRequest>, AppError> {
    query.validate()?;
    let request = state
        .federation
        .begin_authorization(&provider, &query.redirect_uri)
        .await?;
    Ok(Json(request))
}

/// Complete the flow and sign in, linking or creating the principal.
///
/// POST /auth/oidc/:provider/callback
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<OidcCallbackRequest>,
) -> Result<Json<FederatedLogin>, AppError> {
    let meta = client_meta(&headers, connect_info);
    let login = state
        .federation
        .callback(&provider, &req.code, &req.state, &meta)
        .await?;
    Ok(Json(login))
}

/// GET /auth/identities
pub async fn list_identities(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<IdentityResponse>>, AppError> {
    Ok(Json(state.federation.list_identities(user.user_id()).await?))
}

/// DELETE /auth/identities/:provider
pub async fn unlink(
    State(state): State<AppState>,
    user: AuthUser,
    Path(provider): Path<String>,
) -> Result<StatusCode, AppError> {
    state.federation.unlink(user.user_id(), &provider).await?;
    Ok(StatusCode::NO_CONTENT)
}
