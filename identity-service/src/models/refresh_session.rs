//! Refresh session model - one row per issued refresh token.
//!
//! Rotating a token revokes its row and points `replaced_by` at the row of
//! its successor, so every login session is an auditable chain.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Client metadata recorded with every issued credential.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMeta {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl ClientMeta {
    pub fn new(user_agent: Option<String>, ip_address: Option<String>) -> Self {
        Self {
            user_agent,
            ip_address,
        }
    }
}

/// Refresh session entity.
#[derive(Debug, Clone, FromRow)]
pub struct RefreshSession {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expiry_utc: DateTime<Utc>,
    pub revoked_utc: Option<DateTime<Utc>>,
    pub replaced_by: Option<Uuid>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl RefreshSession {
    /// Create a new refresh session for the given raw token.
    pub fn new(user_id: Uuid, token: &str, expiry_days: i64, meta: &ClientMeta) -> Self {
        SessionDraft::new(token, expiry_days, meta).into_session(user_id)
    }

    /// SHA-256 hex digest of a raw refresh token.
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_utc <= now
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_utc.is_some()
    }

    /// Check if session is valid (not expired, not revoked).
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired_at(now)
    }
}

/// A session whose owner is not yet known.
///
/// Rotation mints the replacement before the store has resolved the
/// presented token, so the owner is filled in by the store.
#[derive(Debug, Clone)]
pub struct SessionDraft {
    pub session_id: Uuid,
    pub token_hash: String,
    pub expiry_utc: DateTime<Utc>,
    pub meta: ClientMeta,
    pub created_utc: DateTime<Utc>,
}

impl SessionDraft {
    pub fn new(token: &str, expiry_days: i64, meta: &ClientMeta) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            token_hash: RefreshSession::hash_token(token),
            expiry_utc: now + Duration::days(expiry_days),
            meta: meta.clone(),
            created_utc: now,
        }
    }

    pub fn into_session(self, user_id: Uuid) -> RefreshSession {
        RefreshSession {
            session_id: self.session_id,
            user_id,
            token_hash: self.token_hash,
            expiry_utc: self.expiry_utc,
            revoked_utc: None,
            replaced_by: None,
            user_agent: self.meta.user_agent,
            ip_address: self.meta.ip_address,
            created_utc: self.created_utc,
        }
    }
}

/// Session info for API responses.
#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
}

impl From<RefreshSession> for SessionInfo {
    fn from(s: RefreshSession) -> Self {
        Self {
            session_id: s.session_id,
            user_agent: s.user_agent,
            ip_address: s.ip_address,
            created_utc: s.created_utc,
            expiry_utc: s.expiry_utc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_stores_hash_not_token() {
        let session = RefreshSession::new(Uuid::new_v4(), "token_abc", 7, &ClientMeta::default());
        assert_ne!(session.token_hash, "token_abc");
        assert_eq!(session.token_hash, RefreshSession::hash_token("token_abc"));
        assert_eq!(session.token_hash.len(), 64);
        assert!(session.is_valid_at(Utc::now()));
    }

    #[test]
    fn test_session_expiry() {
        let mut session = RefreshSession::new(Uuid::new_v4(), "t", 7, &ClientMeta::default());
        session.expiry_utc = Utc::now() - Duration::seconds(1);
        assert!(session.is_expired_at(Utc::now()));
        assert!(!session.is_valid_at(Utc::now()));
    }

    #[test]
    fn test_session_revocation() {
        let mut session = RefreshSession::new(Uuid::new_v4(), "t", 7, &ClientMeta::default());
        session.revoked_utc = Some(Utc::now());
        assert!(session.is_revoked());
        assert!(!session.is_valid_at(Utc::now()));
    }
}
