//! Membership administration, subject to the last-owner guard.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    dtos::access::AssignRoleRequest,
    middleware::AuthUser,
    models::{Membership, ResourceType},
    utils::ValidatedJson,
    AppState,
};
use service_core::error::AppError;

/// PUT /organizations/:org_id/members/:user_id
pub async fn assign_org_member(
    State(state): State<AppState>,
    actor: AuthUser,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
    ValidatedJson(req): ValidatedJson<AssignRoleRequest>,
) -> Result<Json<Membership>, AppError> {
    let role_id = req.role_id.ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!("role_id is required for organization members"))
    })?;

    state
        .permissions
        .authorize(actor.user_id(), ResourceType::Organization, org_id, "member:manage")
        .await?;
    state
        .permissions
        .check_owner_change(actor.user_id(), org_id, user_id, Some(role_id))
        .await?;

    let membership = state
        .permissions
        .assign_org_role(org_id, user_id, role_id)
        .await?;
    Ok(Json(membership))
}

/// DELETE /organizations/:org_id/members/:user_id
pub async fn remove_org_member(
    State(state): State<AppState>,
    actor: AuthUser,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    state
        .permissions
        .authorize(actor.user_id(), ResourceType::Organization, org_id, "member:manage")
        .await?;
    state
        .permissions
        .check_owner_change(actor.user_id(), org_id, user_id, None)
        .await?;

    state.permissions.remove_org_member(org_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /projects/:project_id/members/:user_id
pub async fn assign_project_member(
    State(state): State<AppState>,
    actor: AuthUser,
    Path((project_id, user_id)): Path<(Uuid, Uuid)>,
    ValidatedJson(req): ValidatedJson<AssignRoleRequest>,
) -> Result<Json<Membership>, AppError> {
    state
        .permissions
        .authorize(
            actor.user_id(),
            ResourceType::Project,
            project_id,
            "project:manage_members",
        )
        .await?;

    let membership = state
        .permissions
        .assign_project_role(project_id, user_id, req.role_id)
        .await?;
    Ok(Json(membership))
}

/// DELETE /projects/:project_id/members/:user_id
pub async fn remove_project_member(
    State(state): State<AppState>,
    actor: AuthUser,
    Path((project_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    state
        .permissions
        .authorize(
            actor.user_id(),
            ResourceType::Project,
            project_id,
            "project:manage_members",
        )
        .await?;

    state
        .permissions
        .remove_project_member(project_id, user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
