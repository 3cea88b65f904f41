//! Federated identity model - a provider account linked to a local user.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Link between an external `(issuer, subject)` pair and a local user.
/// The pair is globally unique.
#[derive(Debug, Clone, FromRow)]
pub struct FederatedIdentity {
    pub identity_id: Uuid,
    pub user_id: Uuid,
    pub provider_slug: String,
    pub issuer: String,
    pub subject: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl FederatedIdentity {
    pub fn new(
        user_id: Uuid,
        provider_slug: String,
        issuer: String,
        subject: String,
        email: Option<String>,
        email_verified: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            identity_id: Uuid::new_v4(),
            user_id,
            provider_slug,
            issuer,
            subject,
            email,
            email_verified,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// True when the provider reports different email metadata than stored.
    pub fn claims_changed(&self, email: Option<&str>, email_verified: bool) -> bool {
        self.email.as_deref() != email || self.email_verified != email_verified
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityResponse {
    pub identity_id: Uuid,
    pub provider: String,
    pub issuer: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl From<FederatedIdentity> for IdentityResponse {
    fn from(i: FederatedIdentity) -> Self {
        Self {
            identity_id: i.identity_id,
            provider: i.provider_slug,
            issuer: i.issuer,
            email: i.email,
            email_verified: i.email_verified,
            created_utc: i.created_utc,
            updated_utc: i.updated_utc,
        }
    }
}
