//! Permission model and the seeded permission catalog.
//!
//! Authorization is always decided by permission code, never by role name.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Kind of resource a permission (or role) applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Organization,
    Project,
    Board,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Organization => "organization",
            ResourceType::Project => "project",
            ResourceType::Board => "board",
        }
    }
}

impl std::str::FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "organization" | "org" => Ok(ResourceType::Organization),
            "project" => Ok(ResourceType::Project),
            "board" => Ok(ResourceType::Board),
            _ => Err(format!("Invalid resource type: {}", s)),
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Permission {
    pub code: String,
    pub name: String,
    pub description: String,
    pub resource_type: String,
}

struct PermissionSeed {
    code: &'static str,
    name: &'static str,
    description: &'static str,
    resource_type: ResourceType,
}

const fn seed(
    code: &'static str,
    name: &'static str,
    description: &'static str,
    resource_type: ResourceType,
) -> PermissionSeed {
    PermissionSeed {
        code,
        name,
        description,
        resource_type,
    }
}

const CATALOG: &[PermissionSeed] = &[
    seed("organization:view", "View organization", "See organization settings and metadata", ResourceType::Organization),
    seed("organization:manage", "Manage organization", "Edit organization settings", ResourceType::Organization),
    seed("organization:delete", "Delete organization", "Permanently delete the organization", ResourceType::Organization),
    seed("member:view", "View members", "List organization members", ResourceType::Organization),
    seed("member:invite", "Invite members", "Invite new members to the organization", ResourceType::Organization),
    seed("member:manage", "Manage members", "Change member roles and remove members", ResourceType::Organization),
    seed("role:manage", "Manage roles", "Create, edit and delete custom roles", ResourceType::Organization),
    seed("project:create", "Create projects", "Create projects in the organization", ResourceType::Organization),
    seed("project:view", "View project", "See the project and its settings", ResourceType::Project),
    seed("project:edit", "Edit project", "Edit project settings", ResourceType::Project),
    seed("project:delete", "Delete project", "Delete the project", ResourceType::Project),
    seed("project:manage_members", "Manage project members", "Assign project-specific roles", ResourceType::Project),
    seed("sprint:view", "View sprints", "See sprints and their scope", ResourceType::Project),
    seed("sprint:manage", "Manage sprints", "Create, start and close sprints", ResourceType::Project),
    seed("board:view", "View boards", "See boards and their columns", ResourceType::Board),
    seed("board:create", "Create boards", "Create boards in a project", ResourceType::Board),
    seed("board:edit", "Edit boards", "Rename boards and edit columns", ResourceType::Board),
    seed("board:delete", "Delete boards", "Delete boards", ResourceType::Board),
    seed("card:view", "View cards", "See cards", ResourceType::Board),
    seed("card:create", "Create cards", "Create cards on a board", ResourceType::Board),
    seed("card:edit", "Edit cards", "Edit card content and assignees", ResourceType::Board),
    seed("card:move", "Move cards", "Move cards between columns", ResourceType::Board),
    seed("card:delete", "Delete cards", "Delete cards", ResourceType::Board),
    seed("comment:create", "Comment", "Comment on cards", ResourceType::Board),
];

/// The full permission catalog as entities.
pub fn permission_catalog() -> Vec<Permission> {
    CATALOG
        .iter()
        .map(|p| Permission {
            code: p.code.to_string(),
            name: p.name.to_string(),
            description: p.description.to_string(),
            resource_type: p.resource_type.as_str().to_string(),
        })
        .collect()
}

/// Every code in the catalog.
pub fn all_permission_codes() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|p| p.code)
}

pub fn is_known_permission(code: &str) -> bool {
    CATALOG.iter().any(|p| p.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_codes_are_unique() {
        let codes: HashSet<&str> = all_permission_codes().collect();
        assert_eq!(codes.len(), CATALOG.len());
    }

    #[test]
    fn test_codes_are_namespaced() {
        for code in all_permission_codes() {
            assert!(code.contains(':'), "{} has no namespace", code);
        }
    }

    #[test]
    fn test_resource_type_parsing() {
        assert_eq!("org".parse::<ResourceType>(), Ok(ResourceType::Organization));
        assert_eq!("Board".parse::<ResourceType>(), Ok(ResourceType::Board));
        assert!("sprint".parse::<ResourceType>().is_err());
    }
}
