//! Process-local store.
//!
//! All state sits behind a single `RwLock`; every trait method holds the
//! lock for its whole duration, which makes each of them atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    violates_last_holder, AccessStore, CredentialStore, GuardOutcome, IdentityStore,
    RoleDeleteOutcome, RoleUpdate, RotationOutcome, StoreError, StoreHealth, UnlinkOutcome,
    UserStore,
};
use crate::models::{
    permission_catalog, Board, FederatedIdentity, MemberScope, Membership, Permission, Project,
    RefreshSession, Role, RoleWithPermissions, SessionDraft, SystemRole, User,
};

type MembershipKey = (MemberScope, Uuid, Uuid);

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    sessions: HashMap<Uuid, RefreshSession>,
    session_by_hash: HashMap<String, Uuid>,
    identities: HashMap<Uuid, FederatedIdentity>,
    permissions: Vec<Permission>,
    roles: HashMap<Uuid, Role>,
    role_permissions: HashMap<Uuid, BTreeSet<String>>,
    memberships: HashMap<MembershipKey, Membership>,
    projects: HashMap<Uuid, Project>,
    boards: HashMap<Uuid, Board>,
}

impl MemoryState {
    fn username_taken(&self, username: &str) -> bool {
        self.users
            .values()
            .any(|u| u.username.eq_ignore_ascii_case(username))
    }

    fn email_taken(&self, email: Option<&str>) -> bool {
        email.is_some_and(|email| {
            self.users
                .values()
                .any(|u| u.email.as_deref().is_some_and(|e| e.eq_ignore_ascii_case(email)))
        })
    }

    fn check_user_unique(&self, user: &User) -> Result<(), StoreError> {
        if self.username_taken(&user.username) {
            return Err(StoreError::Conflict("username".to_string()));
        }
        if self.email_taken(user.email.as_deref()) {
            return Err(StoreError::Conflict("email".to_string()));
        }
        Ok(())
    }

    fn identity_taken(&self, issuer: &str, subject: &str) -> bool {
        self.identities
            .values()
            .any(|i| i.issuer == issuer && i.subject == subject)
    }

    fn role_name_taken(&self, organization_id: Option<Uuid>, name: &str, except: Option<Uuid>) -> bool {
        self.roles.values().any(|r| {
            r.organization_id == organization_id
                && r.role_name.eq_ignore_ascii_case(name)
                && Some(r.role_id) != except
        })
    }

    fn revoke_all(&mut self, user_id: Uuid, now: DateTime<Utc>) -> u64 {
        let mut revoked = 0;
        for session in self.sessions.values_mut() {
            if session.user_id == user_id && session.revoked_utc.is_none() {
                session.revoked_utc = Some(now);
                revoked += 1;
            }
        }
        revoked
    }

    fn members_of(&self, scope: MemberScope, resource_id: Uuid) -> Vec<Membership> {
        self.memberships
            .values()
            .filter(|m| m.scope() == Some(scope) && m.resource_id == resource_id)
            .cloned()
            .collect()
    }
}

/// In-memory implementation of every store seam, seeded with the
/// permission catalog and system roles.
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut state = MemoryState {
            permissions: permission_catalog(),
            ..MemoryState::default()
        };
        for system_role in SystemRole::ALL {
            let role = system_role.to_role();
            state.role_permissions.insert(
                role.role_id,
                system_role.permissions().into_iter().map(String::from).collect(),
            );
            state.roles.insert(role.role_id, role);
        }
        Self {
            state: RwLock::new(state),
        }
    }

    /// Write a membership row as-is, bypassing the guard. Used to load rows
    /// written by other services, including legacy role strings.
    pub async fn insert_membership(&self, membership: Membership) {
        let Some(scope) = membership.scope() else {
            return;
        };
        let key = (scope, membership.resource_id, membership.user_id);
        self.state.write().await.memberships.insert(key, membership);
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_user_unique(user)?;
        state.users.insert(user.user_id, user.clone());
        Ok(())
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.state.read().await.users.get(&user_id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .find(|u| u.email.as_deref().is_some_and(|e| e.eq_ignore_ascii_case(email)))
            .cloned())
    }

    async fn update_user_profile(
        &self,
        user_id: Uuid,
        display_name: Option<String>,
        avatar_url: Option<String>,
    ) -> Result<(), StoreError> {
        if let Some(user) = self.state.write().await.users.get_mut(&user_id) {
            user.display_name = display_name;
            user.avatar_url = avatar_url;
            user.updated_utc = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn insert_session(&self, session: &RefreshSession) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.session_by_hash.contains_key(&session.token_hash) {
            return Err(StoreError::Conflict("token_hash".to_string()));
        }
        state
            .session_by_hash
            .insert(session.token_hash.clone(), session.session_id);
        state.sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn rotate_credential(
        &self,
        presented_hash: &str,
        replacement: SessionDraft,
        now: DateTime<Utc>,
    ) -> Result<RotationOutcome, StoreError> {
        let mut state = self.state.write().await;

        let Some(session) = state
            .session_by_hash
            .get(presented_hash)
            .and_then(|id| state.sessions.get(id))
            .cloned()
        else {
            return Ok(RotationOutcome::NotFound);
        };
        let user_id = session.user_id;

        if session.is_revoked() {
            let revoked = state.revoke_all(user_id, now);
            return Ok(RotationOutcome::Reused { user_id, revoked });
        }
        if session.is_expired_at(now) {
            let revoked = state.revoke_all(user_id, now);
            return Ok(RotationOutcome::Expired { user_id, revoked });
        }

        let next = replacement.into_session(user_id);
        if state.session_by_hash.contains_key(&next.token_hash) {
            return Err(StoreError::Conflict("token_hash".to_string()));
        }
        if let Some(old) = state.sessions.get_mut(&session.session_id) {
            old.revoked_utc = Some(now);
            old.replaced_by = Some(next.session_id);
        }
        state
            .session_by_hash
            .insert(next.token_hash.clone(), next.session_id);
        state.sessions.insert(next.session_id, next);

        Ok(RotationOutcome::Rotated { user_id })
    }

    async fn revoke_session_by_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let Some(id) = state.session_by_hash.get(token_hash).copied() else {
            return Ok(false);
        };
        match state.sessions.get_mut(&id) {
            Some(session) if session.revoked_utc.is_none() => {
                session.revoked_utc = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(self.state.write().await.revoke_all(user_id, now))
    }

    async fn list_active_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshSession>, StoreError> {
        let state = self.state.read().await;
        let mut sessions: Vec<RefreshSession> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_valid_at(now))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        Ok(sessions)
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn find_identity(
        &self,
        issuer: &str,
        subject: &str,
    ) -> Result<Option<FederatedIdentity>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .identities
            .values()
            .find(|i| i.issuer == issuer && i.subject == subject)
            .cloned())
    }

    async fn insert_identity(&self, identity: &FederatedIdentity) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.identity_taken(&identity.issuer, &identity.subject) {
            return Err(StoreError::Conflict("identity".to_string()));
        }
        state.identities.insert(identity.identity_id, identity.clone());
        Ok(())
    }

    async fn insert_user_with_identity(
        &self,
        user: &User,
        identity: &FederatedIdentity,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_user_unique(user)?;
        if state.identity_taken(&identity.issuer, &identity.subject) {
            return Err(StoreError::Conflict("identity".to_string()));
        }
        state.users.insert(user.user_id, user.clone());
        state.identities.insert(identity.identity_id, identity.clone());
        Ok(())
    }

    async fn update_identity_claims(
        &self,
        identity_id: Uuid,
        email: Option<String>,
        email_verified: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(identity) = self.state.write().await.identities.get_mut(&identity_id) {
            identity.email = email;
            identity.email_verified = email_verified;
            identity.updated_utc = now;
        }
        Ok(())
    }

    async fn list_identities(&self, user_id: Uuid) -> Result<Vec<FederatedIdentity>, StoreError> {
        let state = self.state.read().await;
        let mut identities: Vec<FederatedIdentity> = state
            .identities
            .values()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect();
        identities.sort_by(|a, b| a.created_utc.cmp(&b.created_utc));
        Ok(identities)
    }

    async fn delete_identity_guarded(
        &self,
        user_id: Uuid,
        issuer: &str,
    ) -> Result<UnlinkOutcome, StoreError> {
        let mut state = self.state.write().await;
        let Some(identity_id) = state
            .identities
            .values()
            .find(|i| i.user_id == user_id && i.issuer == issuer)
            .map(|i| i.identity_id)
        else {
            return Ok(UnlinkOutcome::NotFound);
        };

        let has_password = state
            .users
            .get(&user_id)
            .is_some_and(|u| u.has_password());
        let linked = state
            .identities
            .values()
            .filter(|i| i.user_id == user_id)
            .count();
        if !has_password && linked <= 1 {
            return Ok(UnlinkOutcome::LastLoginMethod);
        }

        state.identities.remove(&identity_id);
        Ok(UnlinkOutcome::Removed)
    }
}

#[async_trait]
impl AccessStore for MemoryStore {
    async fn list_permissions(&self) -> Result<Vec<Permission>, StoreError> {
        Ok(self.state.read().await.permissions.clone())
    }

    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, StoreError> {
        Ok(self.state.read().await.roles.get(&role_id).cloned())
    }

    async fn list_roles(&self, organization_id: Uuid) -> Result<Vec<Role>, StoreError> {
        let state = self.state.read().await;
        let mut roles: Vec<Role> = state
            .roles
            .values()
            .filter(|r| r.is_visible_to(organization_id))
            .cloned()
            .collect();
        roles.sort_by(|a, b| {
            b.is_system
                .cmp(&a.is_system)
                .then_with(|| a.role_name.cmp(&b.role_name))
        });
        Ok(roles)
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .role_permissions
            .get(&role_id)
            .map(|codes| codes.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_role(&self, role: &Role, permissions: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.role_name_taken(role.organization_id, &role.role_name, None) {
            return Err(StoreError::Conflict("role_name".to_string()));
        }
        state
            .role_permissions
            .insert(role.role_id, permissions.iter().cloned().collect());
        state.roles.insert(role.role_id, role.clone());
        Ok(())
    }

    async fn update_role(
        &self,
        role_id: Uuid,
        update: RoleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<RoleWithPermissions>, StoreError> {
        let mut state = self.state.write().await;
        let Some(organization_id) = state.roles.get(&role_id).map(|r| r.organization_id) else {
            return Ok(None);
        };
        if let Some(name) = update.role_name.as_deref() {
            if state.role_name_taken(organization_id, name, Some(role_id)) {
                return Err(StoreError::Conflict("role_name".to_string()));
            }
        }
        if let Some(permissions) = update.permissions {
            state
                .role_permissions
                .insert(role_id, permissions.into_iter().collect());
        }
        let Some(role) = state.roles.get_mut(&role_id) else {
            return Ok(None);
        };
        if let Some(name) = update.role_name {
            role.role_name = name;
        }
        if let Some(description) = update.description {
            role.description = Some(description);
        }
        role.updated_utc = now;
        let role = role.clone();

        let permissions = state
            .role_permissions
            .get(&role_id)
            .map(|codes| codes.iter().cloned().collect())
            .unwrap_or_default();
        Ok(Some(RoleWithPermissions { role, permissions }))
    }

    async fn delete_role(&self, role_id: Uuid) -> Result<RoleDeleteOutcome, StoreError> {
        let mut state = self.state.write().await;
        if !state.roles.contains_key(&role_id) {
            return Ok(RoleDeleteOutcome::NotFound);
        }
        if state
            .memberships
            .values()
            .any(|m| m.role_id == Some(role_id))
        {
            return Ok(RoleDeleteOutcome::InUse);
        }
        state.roles.remove(&role_id);
        state.role_permissions.remove(&role_id);
        Ok(RoleDeleteOutcome::Deleted)
    }

    async fn find_membership(
        &self,
        scope: MemberScope,
        resource_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Membership>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .memberships
            .get(&(scope, resource_id, user_id))
            .cloned())
    }

    async fn upsert_member_guarded(
        &self,
        scope: MemberScope,
        resource_id: Uuid,
        user_id: Uuid,
        role_id: Option<Uuid>,
    ) -> Result<GuardOutcome<Membership>, StoreError> {
        let mut state = self.state.write().await;
        let members = state.members_of(scope, resource_id);
        if violates_last_holder(&members, scope, user_id, role_id, false) {
            return Ok(GuardOutcome::LastOwner);
        }

        let now = Utc::now();
        let membership = state
            .memberships
            .entry((scope, resource_id, user_id))
            .and_modify(|m| {
                m.role_id = role_id;
                m.legacy_role = None;
                m.updated_utc = now;
            })
            .or_insert_with(|| Membership::new(scope, resource_id, user_id, role_id))
            .clone();
        Ok(GuardOutcome::Applied(membership))
    }

    async fn remove_member_guarded(
        &self,
        scope: MemberScope,
        resource_id: Uuid,
        user_id: Uuid,
    ) -> Result<GuardOutcome<()>, StoreError> {
        let mut state = self.state.write().await;
        let key = (scope, resource_id, user_id);
        if !state.memberships.contains_key(&key) {
            return Ok(GuardOutcome::NotFound);
        }
        let members = state.members_of(scope, resource_id);
        if violates_last_holder(&members, scope, user_id, None, true) {
            return Ok(GuardOutcome::LastOwner);
        }
        state.memberships.remove(&key);
        Ok(GuardOutcome::Applied(()))
    }

    async fn find_project(&self, project_id: Uuid) -> Result<Option<Project>, StoreError> {
        Ok(self.state.read().await.projects.get(&project_id).copied())
    }

    async fn find_board(&self, board_id: Uuid) -> Result<Option<Board>, StoreError> {
        Ok(self.state.read().await.boards.get(&board_id).copied())
    }

    async fn upsert_project(&self, project: &Project) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .projects
            .insert(project.project_id, *project);
        Ok(())
    }

    async fn upsert_board(&self, board: &Board) -> Result<(), StoreError> {
        self.state.write().await.boards.insert(board.board_id, *board);
        Ok(())
    }
}

#[async_trait]
impl StoreHealth for MemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
