//! User model - a principal that can hold credentials, identities and memberships.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// User entity.
///
/// `password_hash` is absent for accounts created through federated login;
/// such principals can only authenticate through a linked provider.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub password_hash: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl User {
    /// Create a password-backed user.
    pub fn new_local(
        username: String,
        email: Option<String>,
        password_hash: String,
        display_name: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: Uuid::new_v4(),
            username,
            email,
            email_verified: false,
            password_hash: Some(password_hash),
            display_name,
            avatar_url: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Create a federation-only user (no password).
    pub fn new_federated(
        username: String,
        email: Option<String>,
        email_verified: bool,
        display_name: Option<String>,
        avatar_url: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: Uuid::new_v4(),
            username,
            email_verified: email.is_some() && email_verified,
            email,
            password_hash: None,
            display_name,
            avatar_url,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Whether password login is possible for this user.
    pub fn has_password(&self) -> bool {
        self.password_hash.is_some()
    }

    /// Convert to sanitized response (no sensitive fields).
    pub fn sanitized(&self) -> UserResponse {
        UserResponse::from(self.clone())
    }
}

/// User response for API (without sensitive fields).
#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub user_id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub has_password: bool,
    pub created_utc: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(u: User) -> Self {
        Self {
            has_password: u.has_password(),
            user_id: u.user_id,
            username: u.username,
            email: u.email,
            email_verified: u.email_verified,
            display_name: u.display_name,
            avatar_url: u.avatar_url,
            created_utc: u.created_utc,
        }
    }
}
