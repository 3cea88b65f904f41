use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;
use validator::Validate;

use crate::models::ResourceType;

#[derive(Debug, Deserialize)]
pub struct ResourceQuery {
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CheckQuery {
    #[validate(length(min = 1, message = "Permission code is required"))]
    pub code: String,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub code: String,
    pub allowed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MyPermissionsResponse {
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub permissions: BTreeSet<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRoleRequest {
    #[validate(length(min = 1, max = 64, message = "Role name must be 1-64 characters"))]
    pub role_name: String,

    #[validate(length(max = 500))]
    pub description: Option<String>,

    pub scope: ResourceType,

    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateRoleRequest {
    #[validate(length(min = 1, max = 64, message = "Role name must be 1-64 characters"))]
    pub role_name: Option<String>,

    #[validate(length(max = 500))]
    pub description: Option<String>,

    pub permissions: Option<Vec<String>>,
}

/// `role_id: null` on a project membership clears the override.
#[derive(Debug, Deserialize, Validate)]
pub struct AssignRoleRequest {
    pub role_id: Option<Uuid>,
}
