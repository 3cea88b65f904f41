//! Password registration and login.

use std::sync::Arc;

use crate::{
    models::{ClientMeta, User, UserResponse},
    services::{TokenError, TokenPair, TokenService},
    store::{StoreError, UserStore},
    utils::{hash_password, verify_password, Password, PasswordHashString},
};

/// Input for `AuthService::register`.
#[derive(Debug, Clone)]
pub struct Registration {
    pub username: String,
    pub email: Option<String>,
    pub password: Password,
    pub display_name: Option<String>,
}

/// A principal together with freshly issued credentials.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuthResult {
    pub user: UserResponse,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    tokens: TokenService,
}

impl AuthService {
    pub fn new(users: Arc<dyn UserStore>, tokens: TokenService) -> Self {
        Self { users, tokens }
    }

    pub async fn register(
        &self,
        registration: Registration,
        meta: &ClientMeta,
    ) -> Result<AuthResult, TokenError> {
        let username = registration.username.trim().to_string();
        let email = registration
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());

        if self.users.find_user_by_username(&username).await?.is_some() {
            return Err(TokenError::UsernameTaken);
        }
        if let Some(email) = email.as_deref() {
            if self.users.find_user_by_email(email).await?.is_some() {
                return Err(TokenError::EmailTaken);
            }
        }

        let password_hash = hash_password(&registration.password)?;
        let user = User::new_local(
            username,
            email,
            password_hash.into_string(),
            registration.display_name,
        );

        self.users.insert_user(&user).await.map_err(|e| match e {
            StoreError::Conflict(field) if field == "email" => TokenError::EmailTaken,
            StoreError::Conflict(_) => TokenError::UsernameTaken,
            other => TokenError::Store(other),
        })?;

        tracing::info!(user_id = %user.user_id, "User registered");

        let tokens = self.tokens.issue_pair(user.user_id, meta).await?;
        Ok(AuthResult {
            user: user.sanitized(),
            tokens,
        })
    }

    /// `login` matches a username first, then an email address.
    pub async fn login(
        &self,
        login: &str,
        password: &Password,
        meta: &ClientMeta,
    ) -> Result<AuthResult, TokenError> {
        let login = login.trim();
        let user = match self.users.find_user_by_username(login).await? {
            Some(user) => Some(user),
            None if login.contains('@') => self.users.find_user_by_email(login).await?,
            None => None,
        };

        let Some(user) = user else {
            tracing::info!("Login failed: unknown principal");
            return Err(TokenError::InvalidCredentials);
        };

        let Some(stored_hash) = user.password_hash.clone() else {
            tracing::info!(user_id = %user.user_id, "Password login attempted on federated account");
            return Err(TokenError::PasswordLoginDisabled);
        };

        if !verify_password(password, &PasswordHashString::new(stored_hash))? {
            tracing::info!(user_id = %user.user_id, "Login failed: wrong password");
            return Err(TokenError::InvalidCredentials);
        }

        tracing::info!(user_id = %user.user_id, "User logged in");

        let tokens = self.tokens.issue_pair(user.user_id, meta).await?;
        Ok(AuthResult {
            user: user.sanitized(),
            tokens,
        })
    }

    pub async fn get_user(&self, user_id: uuid::Uuid) -> Result<UserResponse, TokenError> {
        self.users
            .find_user_by_id(user_id)
            .await?
            .map(|u| u.sanitized())
            .ok_or(TokenError::UserNotFound)
    }
}
