//! Role management. Reads need `organization:view`, writes `role:manage`,
//! both in the organization that owns the role.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    dtos::access::{CreateRoleRequest, UpdateRoleRequest},
    middleware::AuthUser,
    models::{ResourceType, RoleWithPermissions},
    services::{AccessError, NewRole},
    store::RoleUpdate,
    utils::ValidatedJson,
    AppState,
};
use service_core::error::AppError;

/// GET /organizations/:org_id/roles
pub async fn list_roles(
    State(state): State<AppState>,
    user: AuthUser,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Vec<RoleWithPermissions>>, AppError> {
    state
        .permissions
        .authorize(user.user_id(), ResourceType::Organization, org_id, "organization:view")
        .await?;
    Ok(Json(state.permissions.list_roles(org_id).await?))
}

/// POST /organizations/:org_id/roles
pub async fn create_role(
    State(state): State<AppState>,
    user: AuthUser,
    Path(org_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<CreateRoleRequest>,
) -> Result<(StatusCode, Json<RoleWithPermissions>), AppError> {
    state
        .permissions
        .authorize(user.user_id(), ResourceType::Organization, org_id, "role:manage")
        .await?;

    let role = state
        .permissions
        .create_role(
            org_id,
            NewRole {
                role_name: req.role_name,
                description: req.description,
                scope: req.scope,
                permissions: req.permissions,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(role)))
}

/// GET /roles/:role_id
pub async fn get_role(
    State(state): State<AppState>,
    user: AuthUser,
    Path(role_id): Path<Uuid>,
) -> Result<Json<RoleWithPermissions>, AppError> {
    let role = state.permissions.get_role(role_id).await?;
    if let Some(org_id) = role.role.organization_id {
        gate(&state, &user, org_id, "organization:view").await?;
    }
    Ok(Json(role))
}

/// PATCH /roles/:role_id
pub async fn update_role(
    State(state): State<AppState>,
    user: AuthUser,
    Path(role_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdateRoleRequest>,
) -> Result<Json<RoleWithPermissions>, AppError> {
    let existing = state.permissions.get_role(role_id).await?;
    let org_id = existing
        .role
        .organization_id
        .ok_or(AccessError::CannotModifySystemRole)?;
    gate(&state, &user, org_id, "role:manage").await?;

    let updated = state
        .permissions
        .update_role(
            role_id,
            RoleUpdate {
                role_name: req.role_name,
                description: req.description,
                permissions: req.permissions,
            },
        )
        .await?;
    Ok(Json(updated))
}

/// DELETE /roles/:role_id
pub async fn delete_role(
    State(state): State<AppState>,
    user: AuthUser,
    Path(role_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let existing = state.permissions.get_role(role_id).await?;
    let org_id = existing
        .role
        .organization_id
        .ok_or(AccessError::CannotModifySystemRole)?;
    gate(&state, &user, org_id, "role:manage").await?;

    state.permissions.delete_role(role_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn gate(state: &AppState, user: &AuthUser, org_id: Uuid, code: &str) -> Result<(), AppError> {
    state
        .permissions
        .authorize(user.user_id(), ResourceType::Organization, org_id, code)
        .await
        .map_err(AppError::from)
}
