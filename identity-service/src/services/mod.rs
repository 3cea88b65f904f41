pub mod auth;
pub mod error;
pub mod federation;
pub mod jwt;
pub mod oidc;
pub mod permission;
pub mod pkce;
pub mod token;

pub use auth::{AuthResult, AuthService, Registration};
pub use error::{AccessError, FederationError, TokenError};
pub use federation::{AuthorizationRequest, FederatedLogin, FederationService};
pub use jwt::{AccessTokenClaims, JwtService};
pub use oidc::{
    CodeExchange, HttpProviderGateway, IdTokenClaims, ProviderDirectory, ProviderGateway,
    ProviderMetadata, TokenResponse,
};
pub use permission::{NewRole, PermissionService};
pub use pkce::{PkceAttempt, PkceStateStore};
pub use token::{TokenPair, TokenService};
