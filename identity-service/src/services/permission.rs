//! Permission resolution and role/membership administration.
//!
//! Organization scope resolves through the org membership. A project
//! membership carrying a role replaces the organization result outright,
//! otherwise the project inherits from its owning organization. Boards
//! resolve through their project.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    models::{
        is_known_permission, MemberScope, Membership, Permission, ResourceType, Role,
        RoleWithPermissions, SystemRole,
    },
    services::AccessError,
    store::{AccessStore, GuardOutcome, RoleDeleteOutcome, RoleUpdate, StoreError},
};

/// Input for `PermissionService::create_role`.
#[derive(Debug, Clone)]
pub struct NewRole {
    pub role_name: String,
    pub description: Option<String>,
    pub scope: ResourceType,
    pub permissions: Vec<String>,
}

#[derive(Clone)]
pub struct PermissionService {
    store: Arc<dyn AccessStore>,
}

impl PermissionService {
    pub fn new(store: Arc<dyn AccessStore>) -> Self {
        Self { store }
    }

    pub async fn effective_permissions(
        &self,
        user_id: Uuid,
        resource_type: ResourceType,
        resource_id: Uuid,
    ) -> Result<BTreeSet<String>, AccessError> {
        match resource_type {
            ResourceType::Organization => self.organization_permissions(user_id, resource_id).await,
            ResourceType::Project => self.project_permissions(user_id, resource_id).await,
            ResourceType::Board => match self.store.find_board(resource_id).await? {
                Some(board) => self.project_permissions(user_id, board.project_id).await,
                None => Ok(BTreeSet::new()),
            },
        }
    }

    async fn organization_permissions(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
    ) -> Result<BTreeSet<String>, AccessError> {
        let membership = self
            .store
            .find_membership(MemberScope::Organization, organization_id, user_id)
            .await?;
        self.membership_permissions(membership.as_ref()).await
    }

    async fn project_permissions(
        &self,
        user_id: Uuid,
        project_id: Uuid,
    ) -> Result<BTreeSet<String>, AccessError> {
        let Some(project) = self.store.find_project(project_id).await? else {
            return Ok(BTreeSet::new());
        };

        let membership = self
            .store
            .find_membership(MemberScope::Project, project_id, user_id)
            .await?;
        if membership
            .as_ref()
            .and_then(Membership::effective_role_id)
            .is_some()
        {
            return self.membership_permissions(membership.as_ref()).await;
        }

        self.organization_permissions(user_id, project.organization_id)
            .await
    }

    async fn membership_permissions(
        &self,
        membership: Option<&Membership>,
    ) -> Result<BTreeSet<String>, AccessError> {
        let Some(role_id) = membership.and_then(Membership::effective_role_id) else {
            return Ok(BTreeSet::new());
        };
        Ok(self
            .store
            .role_permissions(role_id)
            .await?
            .into_iter()
            .collect())
    }

    pub async fn has_permission(
        &self,
        user_id: Uuid,
        resource_type: ResourceType,
        resource_id: Uuid,
        code: &str,
    ) -> Result<bool, AccessError> {
        Ok(self
            .effective_permissions(user_id, resource_type, resource_id)
            .await?
            .contains(code))
    }

    /// `PermissionDenied` unless the user holds `code` on the resource.
    pub async fn authorize(
        &self,
        user_id: Uuid,
        resource_type: ResourceType,
        resource_id: Uuid,
        code: &str,
    ) -> Result<(), AccessError> {
        if self
            .has_permission(user_id, resource_type, resource_id, code)
            .await?
        {
            Ok(())
        } else {
            tracing::debug!(
                user_id = %user_id,
                resource_type = %resource_type,
                resource_id = %resource_id,
                code = code,
                "Permission denied"
            );
            Err(AccessError::PermissionDenied(code.to_string()))
        }
    }

    pub async fn list_permissions(&self) -> Result<Vec<Permission>, AccessError> {
        Ok(self.store.list_permissions().await?)
    }

    pub async fn list_roles(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<RoleWithPermissions>, AccessError> {
        let roles = self.store.list_roles(organization_id).await?;
        let mut result = Vec::with_capacity(roles.len());
        for role in roles {
            let permissions = self.store.role_permissions(role.role_id).await?;
            result.push(RoleWithPermissions { role, permissions });
        }
        Ok(result)
    }

    pub async fn get_role(&self, role_id: Uuid) -> Result<RoleWithPermissions, AccessError> {
        let role = self
            .store
            .find_role(role_id)
            .await?
            .ok_or(AccessError::RoleNotFound)?;
        let permissions = self.store.role_permissions(role_id).await?;
        Ok(RoleWithPermissions { role, permissions })
    }

    #[instrument(skip(self, new_role), fields(role_name = %new_role.role_name))]
    pub async fn create_role(
        &self,
        organization_id: Uuid,
        new_role: NewRole,
    ) -> Result<RoleWithPermissions, AccessError> {
        if new_role.scope == ResourceType::Board {
            return Err(AccessError::RoleScopeMismatch(
                "custom roles are organization or project scoped".to_string(),
            ));
        }
        let role_name = checked_role_name(&new_role.role_name)?;
        let permissions = validated_codes(new_role.permissions)?;

        let role = Role::new(organization_id, role_name, new_role.description, new_role.scope);
        self.store
            .insert_role(&role, &permissions)
            .await
            .map_err(role_conflict)?;

        tracing::info!(role_id = %role.role_id, organization_id = %organization_id, "Role created");
        Ok(RoleWithPermissions { role, permissions })
    }

    #[instrument(skip(self, update))]
    pub async fn update_role(
        &self,
        role_id: Uuid,
        mut update: RoleUpdate,
    ) -> Result<RoleWithPermissions, AccessError> {
        let role = self
            .store
            .find_role(role_id)
            .await?
            .ok_or(AccessError::RoleNotFound)?;
        if role.is_system {
            return Err(AccessError::CannotModifySystemRole);
        }

        if let Some(name) = update.role_name.take() {
            update.role_name = Some(checked_role_name(&name)?);
        }
        if let Some(codes) = update.permissions.take() {
            update.permissions = Some(validated_codes(codes)?);
        }

        let updated = self
            .store
            .update_role(role_id, update, chrono::Utc::now())
            .await
            .map_err(role_conflict)?
            .ok_or(AccessError::RoleNotFound)?;

        tracing::info!("Role updated");
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn delete_role(&self, role_id: Uuid) -> Result<(), AccessError> {
        if SystemRole::from_id(role_id).is_some() {
            return Err(AccessError::CannotModifySystemRole);
        }
        let role = self
            .store
            .find_role(role_id)
            .await?
            .ok_or(AccessError::RoleNotFound)?;
        if role.is_system {
            return Err(AccessError::CannotModifySystemRole);
        }

        match self.store.delete_role(role_id).await? {
            RoleDeleteOutcome::Deleted => {
                tracing::info!("Role deleted");
                Ok(())
            }
            RoleDeleteOutcome::InUse => Err(AccessError::RoleInUse),
            RoleDeleteOutcome::NotFound => Err(AccessError::RoleNotFound),
        }
    }

    /// Only an owner may grant the Owner role or change an owner's membership.
    pub async fn check_owner_change(
        &self,
        actor_id: Uuid,
        organization_id: Uuid,
        target_id: Uuid,
        new_role: Option<Uuid>,
    ) -> Result<(), AccessError> {
        let target = self
            .store
            .find_membership(MemberScope::Organization, organization_id, target_id)
            .await?;
        let touches_owner = new_role == Some(SystemRole::Owner.id())
            || target.as_ref().is_some_and(|m| m.holds(SystemRole::Owner));
        if !touches_owner {
            return Ok(());
        }

        let actor = self
            .store
            .find_membership(MemberScope::Organization, organization_id, actor_id)
            .await?;
        if actor.as_ref().is_some_and(|m| m.holds(SystemRole::Owner)) {
            Ok(())
        } else {
            Err(AccessError::CannotDeleteOwnerAssignment)
        }
    }

    async fn assignable_role(
        &self,
        role_id: Uuid,
        organization_id: Uuid,
        scope: ResourceType,
    ) -> Result<Role, AccessError> {
        let role = self
            .store
            .find_role(role_id)
            .await?
            .filter(|r| r.is_visible_to(organization_id))
            .ok_or(AccessError::RoleNotFound)?;
        if role.scope() != Some(scope) {
            return Err(AccessError::RoleScopeMismatch(format!(
                "role {} is {}-scoped, expected {}",
                role.role_name, role.scope_code, scope
            )));
        }
        Ok(role)
    }

    #[instrument(skip(self))]
    pub async fn assign_org_role(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<Membership, AccessError> {
        self.assignable_role(role_id, organization_id, ResourceType::Organization)
            .await?;

        let membership = guarded(
            self.store
                .upsert_member_guarded(
                    MemberScope::Organization,
                    organization_id,
                    user_id,
                    Some(role_id),
                )
                .await?,
        )?;
        tracing::info!("Organization role assigned");
        Ok(membership)
    }

    /// `None` clears the project override so the member inherits their
    /// organization role.
    #[instrument(skip(self))]
    pub async fn assign_project_role(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        role_id: Option<Uuid>,
    ) -> Result<Membership, AccessError> {
        let project = self
            .store
            .find_project(project_id)
            .await?
            .ok_or(AccessError::ResourceNotFound)?;
        if let Some(role_id) = role_id {
            self.assignable_role(role_id, project.organization_id, ResourceType::Project)
                .await?;
        }

        let membership = guarded(
            self.store
                .upsert_member_guarded(MemberScope::Project, project_id, user_id, role_id)
                .await?,
        )?;
        tracing::info!("Project role assigned");
        Ok(membership)
    }

    #[instrument(skip(self))]
    pub async fn remove_org_member(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), AccessError> {
        guarded(
            self.store
                .remove_member_guarded(MemberScope::Organization, organization_id, user_id)
                .await?,
        )?;
        tracing::info!("Organization member removed");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove_project_member(
        &self,
        project_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), AccessError> {
        guarded(
            self.store
                .remove_member_guarded(MemberScope::Project, project_id, user_id)
                .await?,
        )?;
        tracing::info!("Project member removed");
        Ok(())
    }

    /// Organization that owns a project, for authorization checks.
    pub async fn project_organization(&self, project_id: Uuid) -> Result<Uuid, AccessError> {
        self.store
            .find_project(project_id)
            .await?
            .map(|p| p.organization_id)
            .ok_or(AccessError::ResourceNotFound)
    }
}

fn guarded<T>(outcome: GuardOutcome<T>) -> Result<T, AccessError> {
    match outcome {
        GuardOutcome::Applied(value) => Ok(value),
        GuardOutcome::LastOwner => {
            tracing::warn!("Refused to remove the last owner");
            Err(AccessError::LastOwnerViolation)
        }
        GuardOutcome::NotFound => Err(AccessError::MemberNotFound),
    }
}

fn role_conflict(err: StoreError) -> AccessError {
    match err {
        StoreError::Conflict(_) => AccessError::RoleNameTaken,
        other => AccessError::Store(other),
    }
}

/// System role names are visible in every organization and cannot be reused.
fn checked_role_name(raw: &str) -> Result<String, AccessError> {
    let name = raw.trim();
    if SystemRole::ALL
        .iter()
        .any(|r| r.name().eq_ignore_ascii_case(name))
    {
        return Err(AccessError::RoleNameTaken);
    }
    Ok(name.to_string())
}

/// Every code must exist in the catalog. Duplicates collapse.
fn validated_codes(codes: Vec<String>) -> Result<Vec<String>, AccessError> {
    let mut seen = BTreeSet::new();
    for code in codes {
        let code = code.trim().to_string();
        if !is_known_permission(&code) {
            return Err(AccessError::InvalidPermissionCode(code));
        }
        seen.insert(code);
    }
    Ok(seen.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Board, Project};
    use crate::store::MemoryStore;

    async fn fixture() -> (PermissionService, Arc<MemoryStore>, Project) {
        let store = Arc::new(MemoryStore::new());
        let project = Project {
            project_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
        };
        store.upsert_project(&project).await.unwrap();
        (PermissionService::new(store.clone()), store, project)
    }

    #[tokio::test]
    async fn test_legacy_role_string_resolves() {
        let (service, store, project) = fixture().await;
        let user = Uuid::new_v4();
        store
            .insert_membership(Membership::legacy(
                MemberScope::Organization,
                project.organization_id,
                user,
                "viewer",
            ))
            .await;

        let perms = service
            .effective_permissions(user, ResourceType::Organization, project.organization_id)
            .await
            .unwrap();
        assert!(perms.contains("card:view"));
        assert!(!perms.contains("card:edit"));
    }

    #[tokio::test]
    async fn test_board_resolves_through_project() {
        let (service, store, project) = fixture().await;
        let user = Uuid::new_v4();
        let board = Board {
            board_id: Uuid::new_v4(),
            project_id: project.project_id,
        };
        store.upsert_board(&board).await.unwrap();
        service
            .assign_org_role(project.organization_id, user, SystemRole::Member.id())
            .await
            .unwrap();

        assert!(service
            .has_permission(user, ResourceType::Board, board.board_id, "card:move")
            .await
            .unwrap());
        assert!(!service
            .has_permission(user, ResourceType::Board, Uuid::new_v4(), "card:move")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unknown_permission_code_rejected() {
        let (service, _, project) = fixture().await;
        let result = service
            .create_role(
                project.organization_id,
                NewRole {
                    role_name: "Triage".to_string(),
                    description: None,
                    scope: ResourceType::Project,
                    permissions: vec!["card:view".to_string(), "card:teleport".to_string()],
                },
            )
            .await;
        assert!(matches!(result, Err(AccessError::InvalidPermissionCode(code)) if code == "card:teleport"));
    }

    #[tokio::test]
    async fn test_system_role_name_reserved() {
        let (service, _, project) = fixture().await;
        let result = service
            .create_role(
                project.organization_id,
                NewRole {
                    role_name: "owner".to_string(),
                    description: None,
                    scope: ResourceType::Organization,
                    permissions: vec![],
                },
            )
            .await;
        assert!(matches!(result, Err(AccessError::RoleNameTaken)));
    }

    #[tokio::test]
    async fn test_project_role_on_org_scope_rejected() {
        let (service, _, project) = fixture().await;
        let result = service
            .assign_org_role(
                project.organization_id,
                Uuid::new_v4(),
                SystemRole::ProjectViewer.id(),
            )
            .await;
        assert!(matches!(result, Err(AccessError::RoleScopeMismatch(_))));
    }

    #[tokio::test]
    async fn test_only_owner_may_grant_owner() {
        let (service, _, project) = fixture().await;
        let org = project.organization_id;
        let owner = Uuid::new_v4();
        let admin = Uuid::new_v4();
        service.assign_org_role(org, owner, SystemRole::Owner.id()).await.unwrap();
        service.assign_org_role(org, admin, SystemRole::Admin.id()).await.unwrap();

        let target = Uuid::new_v4();
        assert!(matches!(
            service
                .check_owner_change(admin, org, target, Some(SystemRole::Owner.id()))
                .await,
            Err(AccessError::CannotDeleteOwnerAssignment)
        ));
        assert!(service
            .check_owner_change(owner, org, target, Some(SystemRole::Owner.id()))
            .await
            .is_ok());
        assert!(service
            .check_owner_change(admin, org, target, Some(SystemRole::Member.id()))
            .await
            .is_ok());
    }
}
