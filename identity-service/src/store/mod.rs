//! Persistence seam.
//!
//! Every sequence that must observe and modify state atomically (token
//! rotation, last-owner guarded membership changes, role permission
//! replacement, identity unlinking) is a single trait method, so each
//! backend is responsible for running it under one lock or transaction.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Board, FederatedIdentity, MemberScope, Membership, Permission, Project, RefreshSession, Role,
    RoleWithPermissions, SessionDraft, SystemRole, User,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Unique constraint violated; carries the logical field name
    /// (`username`, `email`, `identity`, `role_name`).
    #[error("Conflict on {0}")]
    Conflict(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Result of presenting a refresh token for rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Replacement stored, presented record revoked and chained to it.
    Rotated { user_id: Uuid },
    /// Presented record was already revoked; all of the user's records were revoked.
    Reused { user_id: Uuid, revoked: u64 },
    /// Presented record had expired; all of the user's records were revoked.
    Expired { user_id: Uuid, revoked: u64 },
    NotFound,
}

/// Result of a membership change subject to the last-owner guard.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome<T> {
    Applied(T),
    /// The change would leave the resource without a holder of its guarded role.
    LastOwner,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleDeleteOutcome {
    Deleted,
    InUse,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkOutcome {
    Removed,
    /// The identity is the user's only way to sign in.
    LastLoginMethod,
    NotFound,
}

/// Partial update of a custom role. `permissions` replaces the whole set.
#[derive(Debug, Clone, Default)]
pub struct RoleUpdate {
    pub role_name: Option<String>,
    pub description: Option<String>,
    pub permissions: Option<Vec<String>>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;
    /// Case-insensitive.
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;
    /// Case-insensitive.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn update_user_profile(
        &self,
        user_id: Uuid,
        display_name: Option<String>,
        avatar_url: Option<String>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn insert_session(&self, session: &RefreshSession) -> Result<(), StoreError>;

    /// Atomically resolve `presented_hash` and either chain `replacement`
    /// onto it or, for a revoked or expired record, revoke every active
    /// record of its owner.
    async fn rotate_credential(
        &self,
        presented_hash: &str,
        replacement: SessionDraft,
        now: DateTime<Utc>,
    ) -> Result<RotationOutcome, StoreError>;

    /// Returns whether a record was newly revoked.
    async fn revoke_session_by_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Returns the number of records newly revoked.
    async fn revoke_all_sessions(&self, user_id: Uuid, now: DateTime<Utc>)
        -> Result<u64, StoreError>;

    /// Non-revoked, unexpired records, newest first.
    async fn list_active_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshSession>, StoreError>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_identity(
        &self,
        issuer: &str,
        subject: &str,
    ) -> Result<Option<FederatedIdentity>, StoreError>;

    async fn insert_identity(&self, identity: &FederatedIdentity) -> Result<(), StoreError>;

    /// Insert a new principal together with its first identity.
    async fn insert_user_with_identity(
        &self,
        user: &User,
        identity: &FederatedIdentity,
    ) -> Result<(), StoreError>;

    async fn update_identity_claims(
        &self,
        identity_id: Uuid,
        email: Option<String>,
        email_verified: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Oldest first.
    async fn list_identities(&self, user_id: Uuid) -> Result<Vec<FederatedIdentity>, StoreError>;

    /// Remove the user's identity for `issuer` unless it is their last login method.
    async fn delete_identity_guarded(
        &self,
        user_id: Uuid,
        issuer: &str,
    ) -> Result<UnlinkOutcome, StoreError>;
}

#[async_trait]
pub trait AccessStore: Send + Sync {
    async fn list_permissions(&self) -> Result<Vec<Permission>, StoreError>;

    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, StoreError>;
    /// System roles plus the organization's custom roles.
    async fn list_roles(&self, organization_id: Uuid) -> Result<Vec<Role>, StoreError>;
    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, StoreError>;
    async fn insert_role(&self, role: &Role, permissions: &[String]) -> Result<(), StoreError>;
    /// Returns `None` when the role does not exist.
    async fn update_role(
        &self,
        role_id: Uuid,
        update: RoleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<RoleWithPermissions>, StoreError>;
    async fn delete_role(&self, role_id: Uuid) -> Result<RoleDeleteOutcome, StoreError>;

    async fn find_membership(
        &self,
        scope: MemberScope,
        resource_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Membership>, StoreError>;

    /// Create or replace a membership's role, refusing to demote the last
    /// holder of the scope's guarded role. Always clears the legacy role string.
    async fn upsert_member_guarded(
        &self,
        scope: MemberScope,
        resource_id: Uuid,
        user_id: Uuid,
        role_id: Option<Uuid>,
    ) -> Result<GuardOutcome<Membership>, StoreError>;

    /// Delete a membership, refusing to remove the last holder of the guarded role.
    async fn remove_member_guarded(
        &self,
        scope: MemberScope,
        resource_id: Uuid,
        user_id: Uuid,
    ) -> Result<GuardOutcome<()>, StoreError>;

    async fn find_project(&self, project_id: Uuid) -> Result<Option<Project>, StoreError>;
    async fn find_board(&self, board_id: Uuid) -> Result<Option<Board>, StoreError>;
    async fn upsert_project(&self, project: &Project) -> Result<(), StoreError>;
    async fn upsert_board(&self, board: &Board) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;
}

/// The store seams, all backed by one implementation.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub identities: Arc<dyn IdentityStore>,
    pub access: Arc<dyn AccessStore>,
    pub health: Arc<dyn StoreHealth>,
}

impl Stores {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: UserStore + CredentialStore + IdentityStore + AccessStore + StoreHealth + 'static,
    {
        Self {
            users: backend.clone(),
            credentials: backend.clone(),
            identities: backend.clone(),
            access: backend.clone(),
            health: backend,
        }
    }
}

/// Role whose last holder may not be demoted or removed. Projects have none:
/// organization owners keep project rights through inheritance.
pub fn guarded_role(scope: MemberScope) -> Option<SystemRole> {
    match scope {
        MemberScope::Organization => Some(SystemRole::Owner),
        MemberScope::Project => None,
    }
}

/// Whether moving `user_id` to `new_role` (`None` with `removing` for a
/// deletion) would leave `members` without a holder of the guarded role.
pub(crate) fn violates_last_holder(
    members: &[Membership],
    scope: MemberScope,
    user_id: Uuid,
    new_role: Option<Uuid>,
    removing: bool,
) -> bool {
    let Some(guarded) = guarded_role(scope) else {
        return false;
    };
    let Some(current) = members.iter().find(|m| m.user_id == user_id) else {
        return false;
    };
    if !current.holds(guarded) {
        return false;
    }
    if !removing && new_role == Some(guarded.id()) {
        return false;
    }
    !members
        .iter()
        .any(|m| m.user_id != user_id && m.holds(guarded))
}
