//! Credential pair issuance, rotation and revocation.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    models::{ClientMeta, RefreshSession, SessionDraft, SessionInfo},
    services::{AccessTokenClaims, JwtService, TokenError},
    store::{CredentialStore, RotationOutcome},
    utils::random_token,
};

/// Bytes of entropy in a refresh token.
pub const REFRESH_TOKEN_BYTES: usize = 32;

/// Access/refresh pair returned to clients. The refresh token is only ever
/// visible here; the store keeps its hash.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Clone)]
pub struct TokenService {
    jwt: JwtService,
    credentials: Arc<dyn CredentialStore>,
    refresh_token_ttl_days: i64,
}

impl TokenService {
    pub fn new(
        jwt: JwtService,
        credentials: Arc<dyn CredentialStore>,
        refresh_token_ttl_days: i64,
    ) -> Self {
        Self {
            jwt,
            credentials,
            refresh_token_ttl_days,
        }
    }

    fn pair(&self, user_id: Uuid, refresh_token: String) -> Result<TokenPair, TokenError> {
        Ok(TokenPair {
            access_token: self.jwt.generate_access_token(user_id)?,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.jwt.access_token_ttl_seconds(),
        })
    }

    pub async fn issue_pair(
        &self,
        user_id: Uuid,
        meta: &ClientMeta,
    ) -> Result<TokenPair, TokenError> {
        let refresh_token = random_token(REFRESH_TOKEN_BYTES);
        let session = RefreshSession::new(user_id, &refresh_token, self.refresh_token_ttl_days, meta);
        self.credentials.insert_session(&session).await?;

        tracing::debug!(user_id = %user_id, session_id = %session.session_id, "Issued credential pair");
        self.pair(user_id, refresh_token)
    }

    pub fn validate_access(&self, access_token: &str) -> Result<AccessTokenClaims, TokenError> {
        self.jwt
            .validate_access_token(access_token)
            .map_err(|_| TokenError::InvalidAccessToken)
    }

    /// Exchange a refresh token for a new pair. A token can be rotated once;
    /// presenting it again revokes every session of its owner.
    pub async fn rotate(
        &self,
        refresh_token: &str,
        meta: &ClientMeta,
    ) -> Result<TokenPair, TokenError> {
        let next_token = random_token(REFRESH_TOKEN_BYTES);
        let draft = SessionDraft::new(&next_token, self.refresh_token_ttl_days, meta);
        let presented_hash = RefreshSession::hash_token(refresh_token);

        match self
            .credentials
            .rotate_credential(&presented_hash, draft, Utc::now())
            .await?
        {
            RotationOutcome::Rotated { user_id } => {
                tracing::info!(user_id = %user_id, "Refresh token rotated");
                self.pair(user_id, next_token)
            }
            RotationOutcome::Reused { user_id, revoked } => {
                tracing::warn!(
                    user_id = %user_id,
                    revoked_sessions = revoked,
                    "Revoked refresh token presented again; all sessions revoked"
                );
                Err(TokenError::RefreshTokenRevoked)
            }
            RotationOutcome::Expired { user_id, revoked } => {
                tracing::info!(
                    user_id = %user_id,
                    revoked_sessions = revoked,
                    "Expired refresh token presented; sessions revoked"
                );
                Err(TokenError::InvalidRefreshToken)
            }
            RotationOutcome::NotFound => Err(TokenError::InvalidRefreshToken),
        }
    }

    /// Idempotent.
    pub async fn revoke_one(&self, refresh_token: &str) -> Result<(), TokenError> {
        let hash = RefreshSession::hash_token(refresh_token);
        if self
            .credentials
            .revoke_session_by_hash(&hash, Utc::now())
            .await?
        {
            tracing::info!("Refresh token revoked");
        }
        Ok(())
    }

    /// Idempotent; returns the number of sessions newly revoked.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u64, TokenError> {
        let revoked = self
            .credentials
            .revoke_all_sessions(user_id, Utc::now())
            .await?;
        tracing::info!(user_id = %user_id, revoked_sessions = revoked, "All sessions revoked");
        Ok(revoked)
    }

    pub async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<SessionInfo>, TokenError> {
        let sessions = self
            .credentials
            .list_active_sessions(user_id, Utc::now())
            .await?;
        Ok(sessions.into_iter().map(SessionInfo::from).collect())
    }
}
