//! PostgreSQL store.
//!
//! Invariant-bearing operations run in one transaction and lock the rows
//! they read with `SELECT ... FOR UPDATE` before writing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
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

/// Map unique-constraint violations to `StoreError::Conflict` with the
/// logical field the constraint protects.
fn map_conflict(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.is_unique_violation() {
            let field = match db_err.constraint() {
                Some("users_username_key") => "username",
                Some("users_email_key") => "email",
                Some("federated_identities_issuer_subject_key") => "identity",
                Some("roles_scope_name_key") => "role_name",
                Some("refresh_sessions_token_hash_key") => "token_hash",
                Some(other) => other,
                None => "unknown",
            };
            return StoreError::Conflict(field.to_string());
        }
    }
    StoreError::Database(err)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool, run migrations and seed the system catalog.
    #[instrument(skip(database_url))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, StoreError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        let store = Self::new(pool);
        store.run_migrations().await?;
        store.seed_system_catalog().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Upsert the permission catalog and system roles with their bundles.
    #[instrument(skip(self))]
    pub async fn seed_system_catalog(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for permission in permission_catalog() {
            sqlx::query(
                r#"
                INSERT INTO permissions (code, name, description, resource_type)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (code) DO UPDATE
                SET name = EXCLUDED.name,
                    description = EXCLUDED.description,
                    resource_type = EXCLUDED.resource_type
                "#,
            )
            .bind(&permission.code)
            .bind(&permission.name)
            .bind(&permission.description)
            .bind(&permission.resource_type)
            .execute(&mut *tx)
            .await?;
        }

        for system_role in SystemRole::ALL {
            let role = system_role.to_role();
            sqlx::query(
                r#"
                INSERT INTO roles (role_id, organization_id, role_name, description, is_system, scope_code, created_utc, updated_utc)
                VALUES ($1, NULL, $2, $3, TRUE, $4, $5, $5)
                ON CONFLICT (role_id) DO UPDATE
                SET role_name = EXCLUDED.role_name,
                    description = EXCLUDED.description,
                    scope_code = EXCLUDED.scope_code
                "#,
            )
            .bind(role.role_id)
            .bind(&role.role_name)
            .bind(&role.description)
            .bind(&role.scope_code)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

            let codes: Vec<String> = system_role
                .permissions()
                .into_iter()
                .map(String::from)
                .collect();
            replace_role_permissions(&mut tx, role.role_id, &codes).await?;
        }

        tx.commit().await?;
        info!("System roles and permission catalog seeded");
        Ok(())
    }
}

async fn replace_role_permissions(
    tx: &mut Transaction<'_, Postgres>,
    role_id: Uuid,
    codes: &[String],
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
        .bind(role_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query(
        "INSERT INTO role_permissions (role_id, permission_code) SELECT $1, UNNEST($2::text[])",
    )
    .bind(role_id)
    .bind(codes)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn revoke_all_in(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "UPDATE refresh_sessions SET revoked_utc = $2 WHERE user_id = $1 AND revoked_utc IS NULL",
    )
    .bind(user_id)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

/// Lock and return every membership row of a resource.
async fn lock_members(
    tx: &mut Transaction<'_, Postgres>,
    scope: MemberScope,
    resource_id: Uuid,
) -> Result<Vec<Membership>, StoreError> {
    let members = sqlx::query_as::<_, Membership>(
        "SELECT * FROM memberships WHERE scope_code = $1 AND resource_id = $2 FOR UPDATE",
    )
    .bind(scope.as_str())
    .bind(resource_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(members)
}

async fn insert_user_in(tx: &mut Transaction<'_, Postgres>, user: &User) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO users (user_id, username, email, email_verified, password_hash, display_name, avatar_url, created_utc, updated_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(user.user_id)
    .bind(&user.username)
    .bind(&user.email)
    .bind(user.email_verified)
    .bind(&user.password_hash)
    .bind(&user.display_name)
    .bind(&user.avatar_url)
    .bind(user.created_utc)
    .bind(user.updated_utc)
    .execute(&mut **tx)
    .await
    .map_err(map_conflict)?;
    Ok(())
}

async fn insert_identity_in(
    tx: &mut Transaction<'_, Postgres>,
    identity: &FederatedIdentity,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO federated_identities (identity_id, user_id, provider_slug, issuer, subject, email, email_verified, created_utc, updated_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(identity.identity_id)
    .bind(identity.user_id)
    .bind(&identity.provider_slug)
    .bind(&identity.issuer)
    .bind(&identity.subject)
    .bind(&identity.email)
    .bind(identity.email_verified)
    .bind(identity.created_utc)
    .bind(identity.updated_utc)
    .execute(&mut **tx)
    .await
    .map_err(map_conflict)?;
    Ok(())
}

#[async_trait]
impl UserStore for PgStore {
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_user_in(&mut tx, user).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let user =
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE LOWER(username) = LOWER($1)")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE LOWER(email) = LOWER($1)")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn update_user_profile(
        &self,
        user_id: Uuid,
        display_name: Option<String>,
        avatar_url: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE users SET display_name = $2, avatar_url = $3, updated_utc = $4 WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(display_name)
        .bind(avatar_url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn insert_session(&self, session: &RefreshSession) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_sessions (session_id, user_id, token_hash, expiry_utc, revoked_utc, replaced_by, user_agent, ip_address, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(session.session_id)
        .bind(session.user_id)
        .bind(&session.token_hash)
        .bind(session.expiry_utc)
        .bind(session.revoked_utc)
        .bind(session.replaced_by)
        .bind(&session.user_agent)
        .bind(&session.ip_address)
        .bind(session.created_utc)
        .execute(&self.pool)
        .await
        .map_err(map_conflict)?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn rotate_credential(
        &self,
        presented_hash: &str,
        replacement: SessionDraft,
        now: DateTime<Utc>,
    ) -> Result<RotationOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let presented = sqlx::query_as::<_, RefreshSession>(
            "SELECT * FROM refresh_sessions WHERE token_hash = $1 FOR UPDATE",
        )
        .bind(presented_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(presented) = presented else {
            tx.rollback().await?;
            return Ok(RotationOutcome::NotFound);
        };
        let user_id = presented.user_id;

        if presented.is_revoked() {
            let revoked = revoke_all_in(&mut tx, user_id, now).await?;
            tx.commit().await?;
            return Ok(RotationOutcome::Reused { user_id, revoked });
        }
        if presented.is_expired_at(now) {
            let revoked = revoke_all_in(&mut tx, user_id, now).await?;
            tx.commit().await?;
            return Ok(RotationOutcome::Expired { user_id, revoked });
        }

        let next = replacement.into_session(user_id);
        sqlx::query(
            r#"
            INSERT INTO refresh_sessions (session_id, user_id, token_hash, expiry_utc, user_agent, ip_address, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(next.session_id)
        .bind(user_id)
        .bind(&next.token_hash)
        .bind(next.expiry_utc)
        .bind(&next.user_agent)
        .bind(&next.ip_address)
        .bind(next.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(map_conflict)?;

        sqlx::query(
            "UPDATE refresh_sessions SET revoked_utc = $2, replaced_by = $3 WHERE session_id = $1",
        )
        .bind(presented.session_id)
        .bind(now)
        .bind(next.session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RotationOutcome::Rotated { user_id })
    }

    async fn revoke_session_by_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE refresh_sessions SET revoked_utc = $2 WHERE token_hash = $1 AND revoked_utc IS NULL",
        )
        .bind(token_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let revoked = revoke_all_in(&mut tx, user_id, now).await?;
        tx.commit().await?;
        Ok(revoked)
    }

    async fn list_active_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshSession>, StoreError> {
        let sessions = sqlx::query_as::<_, RefreshSession>(
            r#"
            SELECT * FROM refresh_sessions
            WHERE user_id = $1 AND revoked_utc IS NULL AND expiry_utc > $2
            ORDER BY created_utc DESC
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }
}

#[async_trait]
impl IdentityStore for PgStore {
    async fn find_identity(
        &self,
        issuer: &str,
        subject: &str,
    ) -> Result<Option<FederatedIdentity>, StoreError> {
        let identity = sqlx::query_as::<_, FederatedIdentity>(
            "SELECT * FROM federated_identities WHERE issuer = $1 AND subject = $2",
        )
        .bind(issuer)
        .bind(subject)
        .fetch_optional(&self.pool)
        .await?;
        Ok(identity)
    }

    async fn insert_identity(&self, identity: &FederatedIdentity) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_identity_in(&mut tx, identity).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all, fields(user_id = %user.user_id))]
    async fn insert_user_with_identity(
        &self,
        user: &User,
        identity: &FederatedIdentity,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_user_in(&mut tx, user).await?;
        insert_identity_in(&mut tx, identity).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_identity_claims(
        &self,
        identity_id: Uuid,
        email: Option<String>,
        email_verified: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE federated_identities SET email = $2, email_verified = $3, updated_utc = $4 WHERE identity_id = $1",
        )
        .bind(identity_id)
        .bind(email)
        .bind(email_verified)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_identities(&self, user_id: Uuid) -> Result<Vec<FederatedIdentity>, StoreError> {
        let identities = sqlx::query_as::<_, FederatedIdentity>(
            "SELECT * FROM federated_identities WHERE user_id = $1 ORDER BY created_utc",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(identities)
    }

    async fn delete_identity_guarded(
        &self,
        user_id: Uuid,
        issuer: &str,
    ) -> Result<UnlinkOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let has_password: Option<bool> = sqlx::query_scalar(
            "SELECT password_hash IS NOT NULL FROM users WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let identities = sqlx::query_as::<_, FederatedIdentity>(
            "SELECT * FROM federated_identities WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        let Some(target) = identities.iter().find(|i| i.issuer == issuer) else {
            tx.rollback().await?;
            return Ok(UnlinkOutcome::NotFound);
        };
        if !has_password.unwrap_or(false) && identities.len() <= 1 {
            tx.rollback().await?;
            return Ok(UnlinkOutcome::LastLoginMethod);
        }

        sqlx::query("DELETE FROM federated_identities WHERE identity_id = $1")
            .bind(target.identity_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(UnlinkOutcome::Removed)
    }
}

#[async_trait]
impl AccessStore for PgStore {
    async fn list_permissions(&self) -> Result<Vec<Permission>, StoreError> {
        let permissions =
            sqlx::query_as::<_, Permission>("SELECT * FROM permissions ORDER BY resource_type, code")
                .fetch_all(&self.pool)
                .await?;
        Ok(permissions)
    }

    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, StoreError> {
        let role = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE role_id = $1")
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(role)
    }

    async fn list_roles(&self, organization_id: Uuid) -> Result<Vec<Role>, StoreError> {
        let roles = sqlx::query_as::<_, Role>(
            r#"
            SELECT * FROM roles
            WHERE organization_id IS NULL OR organization_id = $1
            ORDER BY is_system DESC, role_name
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(roles)
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, StoreError> {
        let codes = sqlx::query_scalar::<_, String>(
            "SELECT permission_code FROM role_permissions WHERE role_id = $1 ORDER BY permission_code",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(codes)
    }

    #[instrument(skip_all, fields(role_id = %role.role_id))]
    async fn insert_role(&self, role: &Role, permissions: &[String]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO roles (role_id, organization_id, role_name, description, is_system, scope_code, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(role.role_id)
        .bind(role.organization_id)
        .bind(&role.role_name)
        .bind(&role.description)
        .bind(role.is_system)
        .bind(&role.scope_code)
        .bind(role.created_utc)
        .bind(role.updated_utc)
        .execute(&mut *tx)
        .await
        .map_err(map_conflict)?;
        replace_role_permissions(&mut tx, role.role_id, permissions).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, update))]
    async fn update_role(
        &self,
        role_id: Uuid,
        update: RoleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<RoleWithPermissions>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT role_id FROM roles WHERE role_id = $1 FOR UPDATE")
                .bind(role_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let role = sqlx::query_as::<_, Role>(
            r#"
            UPDATE roles
            SET role_name = COALESCE($2, role_name),
                description = COALESCE($3, description),
                updated_utc = $4
            WHERE role_id = $1
            RETURNING *
            "#,
        )
        .bind(role_id)
        .bind(update.role_name)
        .bind(update.description)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_conflict)?;

        if let Some(codes) = update.permissions {
            replace_role_permissions(&mut tx, role_id, &codes).await?;
        }

        let permissions = sqlx::query_scalar::<_, String>(
            "SELECT permission_code FROM role_permissions WHERE role_id = $1 ORDER BY permission_code",
        )
        .bind(role_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(RoleWithPermissions { role, permissions }))
    }

    async fn delete_role(&self, role_id: Uuid) -> Result<RoleDeleteOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT role_id FROM roles WHERE role_id = $1 FOR UPDATE")
                .bind(role_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            tx.rollback().await?;
            return Ok(RoleDeleteOutcome::NotFound);
        }

        let in_use: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM memberships WHERE role_id = $1)")
                .bind(role_id)
                .fetch_one(&mut *tx)
                .await?;
        if in_use {
            tx.rollback().await?;
            return Ok(RoleDeleteOutcome::InUse);
        }

        let deleted = sqlx::query("DELETE FROM roles WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await;
        match deleted {
            Ok(_) => {}
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_foreign_key_violation() => {
                tx.rollback().await?;
                return Ok(RoleDeleteOutcome::InUse);
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(RoleDeleteOutcome::Deleted)
    }

    async fn find_membership(
        &self,
        scope: MemberScope,
        resource_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Membership>, StoreError> {
        let membership = sqlx::query_as::<_, Membership>(
            "SELECT * FROM memberships WHERE scope_code = $1 AND resource_id = $2 AND user_id = $3",
        )
        .bind(scope.as_str())
        .bind(resource_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(membership)
    }

    #[instrument(skip(self))]
    async fn upsert_member_guarded(
        &self,
        scope: MemberScope,
        resource_id: Uuid,
        user_id: Uuid,
        role_id: Option<Uuid>,
    ) -> Result<GuardOutcome<Membership>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let members = lock_members(&mut tx, scope, resource_id).await?;
        if violates_last_holder(&members, scope, user_id, role_id, false) {
            tx.rollback().await?;
            return Ok(GuardOutcome::LastOwner);
        }

        let now = Utc::now();
        let membership = sqlx::query_as::<_, Membership>(
            r#"
            INSERT INTO memberships (membership_id, scope_code, resource_id, user_id, role_id, legacy_role, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, NULL, $6, $6)
            ON CONFLICT (scope_code, resource_id, user_id) DO UPDATE
            SET role_id = EXCLUDED.role_id,
                legacy_role = NULL,
                updated_utc = EXCLUDED.updated_utc
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(scope.as_str())
        .bind(resource_id)
        .bind(user_id)
        .bind(role_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(GuardOutcome::Applied(membership))
    }

    #[instrument(skip(self))]
    async fn remove_member_guarded(
        &self,
        scope: MemberScope,
        resource_id: Uuid,
        user_id: Uuid,
    ) -> Result<GuardOutcome<()>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let members = lock_members(&mut tx, scope, resource_id).await?;
        if !members.iter().any(|m| m.user_id == user_id) {
            tx.rollback().await?;
            return Ok(GuardOutcome::NotFound);
        }
        if violates_last_holder(&members, scope, user_id, None, true) {
            tx.rollback().await?;
            return Ok(GuardOutcome::LastOwner);
        }

        sqlx::query(
            "DELETE FROM memberships WHERE scope_code = $1 AND resource_id = $2 AND user_id = $3",
        )
        .bind(scope.as_str())
        .bind(resource_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(GuardOutcome::Applied(()))
    }

    async fn find_project(&self, project_id: Uuid) -> Result<Option<Project>, StoreError> {
        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE project_id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(project)
    }

    async fn find_board(&self, board_id: Uuid) -> Result<Option<Board>, StoreError> {
        let board = sqlx::query_as::<_, Board>("SELECT * FROM boards WHERE board_id = $1")
            .bind(board_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(board)
    }

    async fn upsert_project(&self, project: &Project) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO projects (project_id, organization_id) VALUES ($1, $2)
            ON CONFLICT (project_id) DO UPDATE SET organization_id = EXCLUDED.organization_id
            "#,
        )
        .bind(project.project_id)
        .bind(project.organization_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_board(&self, board: &Board) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO boards (board_id, project_id) VALUES ($1, $2)
            ON CONFLICT (board_id) DO UPDATE SET project_id = EXCLUDED.project_id
            "#,
        )
        .bind(board.board_id)
        .bind(board.project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StoreHealth for PgStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClientMeta;

    async fn test_store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        PgStore::connect(&url, 2, 1).await.expect("connect")
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn test_pg_rotation_is_single_use() {
        let store = test_store().await;
        let user = User::new_local(
            format!("pg_{}", &Uuid::new_v4().simple().to_string()[..8]),
            None,
            "hash".to_string(),
            None,
        );
        store.insert_user(&user).await.unwrap();
        let first = RefreshSession::new(user.user_id, &Uuid::new_v4().to_string(), 30, &ClientMeta::default());
        store.insert_session(&first).await.unwrap();

        let now = Utc::now();
        let draft = SessionDraft::new(&Uuid::new_v4().to_string(), 30, &ClientMeta::default());
        assert_eq!(
            store.rotate_credential(&first.token_hash, draft, now).await.unwrap(),
            RotationOutcome::Rotated { user_id: user.user_id }
        );
        let draft = SessionDraft::new(&Uuid::new_v4().to_string(), 30, &ClientMeta::default());
        assert!(matches!(
            store.rotate_credential(&first.token_hash, draft, now).await.unwrap(),
            RotationOutcome::Reused { .. }
        ));
        assert!(store
            .list_active_sessions(user.user_id, now)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn test_pg_last_owner_guard() {
        let store = test_store().await;
        let user = User::new_local(
            format!("pg_{}", &Uuid::new_v4().simple().to_string()[..8]),
            None,
            "hash".to_string(),
            None,
        );
        store.insert_user(&user).await.unwrap();
        let org = Uuid::new_v4();
        store
            .upsert_member_guarded(MemberScope::Organization, org, user.user_id, Some(SystemRole::Owner.id()))
            .await
            .unwrap();
        assert_eq!(
            store
                .remove_member_guarded(MemberScope::Organization, org, user.user_id)
                .await
                .unwrap(),
            GuardOutcome::LastOwner
        );
    }
}
