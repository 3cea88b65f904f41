//! Role model - named permission bundles, either system-wide or organization-owned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::permission::{all_permission_codes, ResourceType};

/// Role entity.
///
/// `organization_id == None` marks a system role shared by every
/// organization; system roles cannot be edited or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub role_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub role_name: String,
    pub description: Option<String>,
    pub is_system: bool,
    pub scope_code: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Role {
    /// Create a custom organization-owned role.
    pub fn new(
        organization_id: Uuid,
        role_name: String,
        description: Option<String>,
        scope: ResourceType,
    ) -> Self {
        let now = Utc::now();
        Self {
            role_id: Uuid::new_v4(),
            organization_id: Some(organization_id),
            role_name,
            description,
            is_system: false,
            scope_code: scope.as_str().to_string(),
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn scope(&self) -> Option<ResourceType> {
        self.scope_code.parse().ok()
    }

    /// Whether members of `organization_id` may be assigned this role.
    pub fn is_visible_to(&self, organization_id: Uuid) -> bool {
        self.organization_id
            .map_or(true, |org| org == organization_id)
    }
}

/// Role with its permission codes.
#[derive(Debug, Clone, Serialize)]
pub struct RoleWithPermissions {
    #[serde(flatten)]
    pub role: Role,
    pub permissions: Vec<String>,
}

/// Built-in roles seeded with fixed ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemRole {
    Owner,
    Admin,
    Member,
    Guest,
    ProjectAdmin,
    ProjectMember,
    ProjectViewer,
}

const MEMBER_PERMISSIONS: &[&str] = &[
    "organization:view",
    "member:view",
    "project:create",
    "project:view",
    "sprint:view",
    "board:view",
    "board:create",
    "board:edit",
    "card:view",
    "card:create",
    "card:edit",
    "card:move",
    "comment:create",
];

const GUEST_PERMISSIONS: &[&str] = &[
    "organization:view",
    "project:view",
    "sprint:view",
    "board:view",
    "card:view",
    "comment:create",
];

const PROJECT_ADMIN_PERMISSIONS: &[&str] = &[
    "project:view",
    "project:edit",
    "project:delete",
    "project:manage_members",
    "sprint:view",
    "sprint:manage",
    "board:view",
    "board:create",
    "board:edit",
    "board:delete",
    "card:view",
    "card:create",
    "card:edit",
    "card:move",
    "card:delete",
    "comment:create",
];

const PROJECT_MEMBER_PERMISSIONS: &[&str] = &[
    "project:view",
    "sprint:view",
    "board:view",
    "board:create",
    "board:edit",
    "card:view",
    "card:create",
    "card:edit",
    "card:move",
    "comment:create",
];

const PROJECT_VIEWER_PERMISSIONS: &[&str] =
    &["project:view", "sprint:view", "board:view", "card:view"];

impl SystemRole {
    pub const ALL: [SystemRole; 7] = [
        SystemRole::Owner,
        SystemRole::Admin,
        SystemRole::Member,
        SystemRole::Guest,
        SystemRole::ProjectAdmin,
        SystemRole::ProjectMember,
        SystemRole::ProjectViewer,
    ];

    pub const fn id(&self) -> Uuid {
        match self {
            SystemRole::Owner => Uuid::from_u128(0x5e5e_0000_0000_4000_8000_0000_0000_0001),
            SystemRole::Admin => Uuid::from_u128(0x5e5e_0000_0000_4000_8000_0000_0000_0002),
            SystemRole::Member => Uuid::from_u128(0x5e5e_0000_0000_4000_8000_0000_0000_0003),
            SystemRole::Guest => Uuid::from_u128(0x5e5e_0000_0000_4000_8000_0000_0000_0004),
            SystemRole::ProjectAdmin => Uuid::from_u128(0x5e5e_0000_0000_4000_8000_0000_0000_0011),
            SystemRole::ProjectMember => Uuid::from_u128(0x5e5e_0000_0000_4000_8000_0000_0000_0012),
            SystemRole::ProjectViewer => Uuid::from_u128(0x5e5e_0000_0000_4000_8000_0000_0000_0013),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SystemRole::Owner => "Owner",
            SystemRole::Admin => "Admin",
            SystemRole::Member => "Member",
            SystemRole::Guest => "Guest",
            SystemRole::ProjectAdmin => "Project Admin",
            SystemRole::ProjectMember => "Project Member",
            SystemRole::ProjectViewer => "Project Viewer",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            SystemRole::Owner => "Full control of the organization, including deletion",
            SystemRole::Admin => "Manages members, roles and projects",
            SystemRole::Member => "Works on projects and boards",
            SystemRole::Guest => "Read-only access with commenting",
            SystemRole::ProjectAdmin => "Full control of a single project",
            SystemRole::ProjectMember => "Works on boards within a project",
            SystemRole::ProjectViewer => "Read-only access to a project",
        }
    }

    pub fn scope(&self) -> ResourceType {
        match self {
            SystemRole::Owner | SystemRole::Admin | SystemRole::Member | SystemRole::Guest => {
                ResourceType::Organization
            }
            SystemRole::ProjectAdmin | SystemRole::ProjectMember | SystemRole::ProjectViewer => {
                ResourceType::Project
            }
        }
    }

    pub fn permissions(&self) -> Vec<&'static str> {
        match self {
            SystemRole::Owner => all_permission_codes().collect(),
            SystemRole::Admin => all_permission_codes()
                .filter(|code| *code != "organization:delete")
                .collect(),
            SystemRole::Member => MEMBER_PERMISSIONS.to_vec(),
            SystemRole::Guest => GUEST_PERMISSIONS.to_vec(),
            SystemRole::ProjectAdmin => PROJECT_ADMIN_PERMISSIONS.to_vec(),
            SystemRole::ProjectMember => PROJECT_MEMBER_PERMISSIONS.to_vec(),
            SystemRole::ProjectViewer => PROJECT_VIEWER_PERMISSIONS.to_vec(),
        }
    }

    /// Lower-case role strings written by the pre-role-table schema that map to this role.
    pub fn legacy_names(&self) -> &'static [&'static str] {
        match self {
            SystemRole::Owner => &["owner"],
            SystemRole::Admin => &["admin"],
            SystemRole::Member => &["member"],
            SystemRole::Guest => &["guest", "viewer"],
            SystemRole::ProjectAdmin => &["admin", "lead"],
            SystemRole::ProjectMember => &["member", "editor"],
            SystemRole::ProjectViewer => &["viewer", "guest"],
        }
    }

    /// Map a legacy role string to a system role of the given scope.
    pub fn from_legacy(scope: ResourceType, legacy: &str) -> Option<SystemRole> {
        let legacy = legacy.trim().to_lowercase();
        SystemRole::ALL
            .into_iter()
            .filter(|role| role.scope() == scope)
            .find(|role| role.legacy_names().contains(&legacy.as_str()))
    }

    pub fn from_id(role_id: Uuid) -> Option<SystemRole> {
        SystemRole::ALL.into_iter().find(|role| role.id() == role_id)
    }

    /// The seeded entity for this role.
    pub fn to_role(&self) -> Role {
        let seeded = DateTime::<Utc>::UNIX_EPOCH;
        Role {
            role_id: self.id(),
            organization_id: None,
            role_name: self.name().to_string(),
            description: Some(self.description().to_string()),
            is_system: true,
            scope_code: self.scope().as_str().to_string(),
            created_utc: seeded,
            updated_utc: seeded,
        }
    }
}
