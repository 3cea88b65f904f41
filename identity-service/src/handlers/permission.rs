use axum::{
    extract::{Query, State},
    Json,
};
use validator::Validate;

use crate::{
    dtos::access::{CheckQuery, CheckResponse, MyPermissionsResponse, ResourceQuery},
    middleware::AuthUser,
    models::Permission,
    AppState,
};
use service_core::error::AppError;

/// GET /permissions
pub async fn list_permissions(
    State(state): State<AppState>,
    _user: AuthUser,
) -> Result<Json<Vec<Permission>>, AppError> {
    Ok(Json(state.permissions.list_permissions().await?))
}

/// GET /permissions/check?code=&resource_type=&resource_id=
pub async fn check(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<CheckQuery>,
) -> Result<Json<CheckResponse>, AppError> {
    query.validate()?;
    let allowed = state
        .permissions
        .has_permission(
            user.user_id(),
            query.resource_type,
            query.resource_id,
            &query.code,
        )
        .await?;
    Ok(Json(CheckResponse {
        code: query.code,
        allowed,
    }))
}

/// GET /permissions/mine?resource_type=&resource_id=
pub async fn mine(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ResourceQuery>,
) -> Result<Json<MyPermissionsResponse>, AppError> {
    let permissions = state
        .permissions
        .effective_permissions(user.user_id(), query.resource_type, query.resource_id)
        .await?;
    Ok(Json(MyPermissionsResponse {
        resource_type: query.resource_type,
        resource_id: query.resource_id,
        permissions,
    }))
}
