//! Membership model - a principal's role on an organization or project.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::permission::ResourceType;
use super::role::SystemRole;

/// Resource kinds a membership can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberScope {
    Organization,
    Project,
}

impl MemberScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberScope::Organization => "organization",
            MemberScope::Project => "project",
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        match self {
            MemberScope::Organization => ResourceType::Organization,
            MemberScope::Project => ResourceType::Project,
        }
    }
}

/// Membership entity. At most one row per `(scope, resource, user)`.
///
/// Rows written before the role table existed carry only `legacy_role`;
/// new writes always set `role_id` and clear `legacy_role`. A project row
/// that resolves to no role means "inherit from the organization".
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Membership {
    pub membership_id: Uuid,
    pub scope_code: String,
    pub resource_id: Uuid,
    pub user_id: Uuid,
    pub role_id: Option<Uuid>,
    pub legacy_role: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Membership {
    pub fn new(scope: MemberScope, resource_id: Uuid, user_id: Uuid, role_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            membership_id: Uuid::new_v4(),
            scope_code: scope.as_str().to_string(),
            resource_id,
            user_id,
            role_id,
            legacy_role: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// A row carrying only a pre-migration role string.
    pub fn legacy(scope: MemberScope, resource_id: Uuid, user_id: Uuid, legacy_role: &str) -> Self {
        let mut membership = Self::new(scope, resource_id, user_id, None);
        membership.legacy_role = Some(legacy_role.to_string());
        membership
    }

    pub fn scope(&self) -> Option<MemberScope> {
        match self.scope_code.as_str() {
            "organization" => Some(MemberScope::Organization),
            "project" => Some(MemberScope::Project),
            _ => None,
        }
    }

    /// The explicit role reference, or the system role the legacy string maps to.
    pub fn effective_role_id(&self) -> Option<Uuid> {
        if let Some(role_id) = self.role_id {
            return Some(role_id);
        }
        let scope = self.scope()?.resource_type();
        self.legacy_role
            .as_deref()
            .and_then(|legacy| SystemRole::from_legacy(scope, legacy))
            .map(|role| role.id())
    }

    /// Whether this membership resolves to `role`.
    pub fn holds(&self, role: SystemRole) -> bool {
        self.effective_role_id() == Some(role.id())
    }
}
