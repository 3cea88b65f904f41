use service_core::error::AppError;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Password login is disabled for this account")]
    PasswordLoginDisabled,

    #[error("Invalid or expired access token")]
    InvalidAccessToken,

    #[error("Invalid or expired refresh token")]
    InvalidRefreshToken,

    #[error("Refresh token has been revoked")]
    RefreshTokenRevoked,

    #[error("Username already taken")]
    UsernameTaken,

    #[error("Email already registered")]
    EmailTaken,

    #[error("User not found")]
    UserNotFound,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum FederationError {
    #[error("Unknown identity provider: {0}")]
    ProviderNotFound(String),

    #[error("Invalid or unknown state")]
    InvalidState,

    #[error("Authorization attempt expired")]
    StateExpired,

    #[error("Code exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("Invalid ID token: {0}")]
    InvalidIdToken(String),

    #[error("ID token nonce mismatch")]
    NonceMismatch,

    #[error("Identity is already linked")]
    IdentityLinkFailed,

    #[error("Could not create principal: {0}")]
    PrincipalCreationFailed(String),

    #[error("Identity provider timed out")]
    ProviderTimeout,

    #[error("Identity provider unreachable: {0}")]
    ProviderUnreachable(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Identity not found")]
    IdentityNotFound,

    #[error("Cannot unlink the last login method")]
    CannotUnlinkLastLoginMethod,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("Role not found")]
    RoleNotFound,

    #[error("System roles cannot be modified")]
    CannotModifySystemRole,

    #[error("Only an owner can grant or revoke the Owner role")]
    CannotDeleteOwnerAssignment,

    #[error("Cannot remove or demote the last owner")]
    LastOwnerViolation,

    #[error("Invalid permission code: {0}")]
    InvalidPermissionCode(String),

    #[error("Missing permission: {0}")]
    PermissionDenied(String),

    #[error("Role name already taken")]
    RoleNameTaken,

    #[error("Role is still assigned to members")]
    RoleInUse,

    #[error("Role scope does not match: {0}")]
    RoleScopeMismatch(String),

    #[error("Resource not found")]
    ResourceNotFound,

    #[error("Membership not found")]
    MemberNotFound,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(field) => {
                AppError::Conflict(anyhow::anyhow!("Conflict on {}", field))
            }
            StoreError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            StoreError::Migration(e) => AppError::DatabaseError(anyhow::Error::new(e)),
        }
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::InvalidCredentials
            | TokenError::InvalidAccessToken
            | TokenError::InvalidRefreshToken
            | TokenError::RefreshTokenRevoked => AppError::AuthError(anyhow::anyhow!(err)),
            TokenError::PasswordLoginDisabled => AppError::Forbidden(anyhow::anyhow!(err)),
            TokenError::UsernameTaken | TokenError::EmailTaken => {
                AppError::Conflict(anyhow::anyhow!(err))
            }
            TokenError::UserNotFound => AppError::NotFound(anyhow::anyhow!(err)),
            TokenError::Store(e) => e.into(),
            TokenError::Internal(e) => AppError::InternalError(e),
        }
    }
}

impl From<FederationError> for AppError {
    fn from(err: FederationError) -> Self {
        match err {
            FederationError::ProviderNotFound(_) | FederationError::IdentityNotFound => {
                AppError::NotFound(anyhow::anyhow!(err))
            }
            FederationError::InvalidState | FederationError::StateExpired => {
                AppError::BadRequest(anyhow::anyhow!(err))
            }
            FederationError::TokenExchangeFailed(_) | FederationError::ProviderUnreachable(_) => {
                AppError::BadGateway(err.to_string())
            }
            FederationError::InvalidIdToken(_) | FederationError::NonceMismatch => {
                AppError::AuthError(anyhow::anyhow!(err))
            }
            FederationError::IdentityLinkFailed | FederationError::CannotUnlinkLastLoginMethod => {
                AppError::Conflict(anyhow::anyhow!(err))
            }
            FederationError::PrincipalCreationFailed(_) => {
                AppError::InternalError(anyhow::anyhow!(err))
            }
            FederationError::ProviderTimeout => AppError::GatewayTimeout(err.to_string()),
            FederationError::Cancelled => AppError::ServiceUnavailable,
            FederationError::Token(e) => e.into(),
            FederationError::Store(e) => e.into(),
        }
    }
}

impl From<AccessError> for AppError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::RoleNotFound
            | AccessError::ResourceNotFound
            | AccessError::MemberNotFound => AppError::NotFound(anyhow::anyhow!(err)),
            AccessError::CannotModifySystemRole
            | AccessError::CannotDeleteOwnerAssignment
            | AccessError::PermissionDenied(_) => AppError::Forbidden(anyhow::anyhow!(err)),
            AccessError::LastOwnerViolation
            | AccessError::RoleNameTaken
            | AccessError::RoleInUse => AppError::Conflict(anyhow::anyhow!(err)),
            AccessError::InvalidPermissionCode(_) | AccessError::RoleScopeMismatch(_) => {
                AppError::BadRequest(anyhow::anyhow!(err))
            }
            AccessError::Store(e) => e.into(),
        }
    }
}
