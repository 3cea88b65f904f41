//! Federated login: authorization-code flow with PKCE and account resolution.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    config::ProviderConfig,
    models::{ClientMeta, FederatedIdentity, IdentityResponse, User, UserResponse},
    services::{
        oidc::{CodeExchange, IdTokenClaims, ProviderDirectory},
        pkce::{PkceAttempt, PkceStateStore},
        FederationError, TokenPair, TokenService,
    },
    store::{IdentityStore, StoreError, UnlinkOutcome, UserStore},
    utils::{pkce_challenge, random_hex, random_token},
};

const STATE_BYTES: usize = 32;
const VERIFIER_BYTES: usize = 32;
const NONCE_BYTES: usize = 16;

pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 32;
const MAX_USERNAME_SUFFIXES: u32 = 50;
const MAX_CREATE_ATTEMPTS: usize = 5;

/// Where to send the browser, and the state it will come back with.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    pub auth_url: String,
    pub state: String,
}

/// Result of a completed federated login.
#[derive(Debug, Clone, Serialize)]
pub struct FederatedLogin {
    pub user: UserResponse,
    pub is_new_user: bool,
    pub linked_to_existing: bool,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

struct Resolved {
    user: User,
    is_new_user: bool,
    linked_to_existing: bool,
}

#[derive(Clone)]
pub struct FederationService {
    directory: Arc<ProviderDirectory>,
    pkce: Arc<PkceStateStore>,
    users: Arc<dyn UserStore>,
    identities: Arc<dyn IdentityStore>,
    tokens: TokenService,
}

impl FederationService {
    pub fn new(
        directory: Arc<ProviderDirectory>,
        pkce: Arc<PkceStateStore>,
        users: Arc<dyn UserStore>,
        identities: Arc<dyn IdentityStore>,
        tokens: TokenService,
    ) -> Self {
        Self {
            directory,
            pkce,
            users,
            identities,
            tokens,
        }
    }

    #[instrument(skip(self, redirect_uri), fields(provider = %provider_slug))]
    pub async fn begin_authorization(
        &self,
        provider_slug: &str,
        redirect_uri: &str,
    ) -> Result<AuthorizationRequest, FederationError> {
        let provider = self.directory.provider(provider_slug)?;
        let metadata = self.directory.metadata(provider, None).await?;

        let state = random_token(STATE_BYTES);
        let code_verifier = random_token(VERIFIER_BYTES);
        let nonce = random_token(NONCE_BYTES);
        let challenge = pkce_challenge(&code_verifier);
        let scope = provider.scopes.join(" ");

        let auth_url = reqwest::Url::parse_with_params(
            &metadata.authorization_endpoint,
            &[
                ("response_type", "code"),
                ("client_id", provider.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("scope", scope.as_str()),
                ("state", state.as_str()),
                ("nonce", nonce.as_str()),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| {
            FederationError::ProviderUnreachable(format!("Invalid authorization endpoint: {}", e))
        })?;

        self.pkce.insert(
            state.clone(),
            PkceAttempt::new(
                provider.slug.clone(),
                code_verifier,
                nonce,
                redirect_uri.to_string(),
            ),
        );

        tracing::info!("Authorization started");
        Ok(AuthorizationRequest {
            auth_url: auth_url.into(),
            state,
        })
    }

    pub async fn callback(
        &self,
        provider_slug: &str,
        code: &str,
        state: &str,
        meta: &ClientMeta,
    ) -> Result<FederatedLogin, FederationError> {
        self.callback_with_cancel(provider_slug, code, state, meta, None)
            .await
    }

    /// The attempt is consumed before any provider call, so a cancelled or
    /// failed callback cannot be replayed with the same state.
    #[instrument(skip(self, code, state, meta, cancel), fields(provider = %provider_slug))]
    pub async fn callback_with_cancel(
        &self,
        provider_slug: &str,
        code: &str,
        state: &str,
        meta: &ClientMeta,
        cancel: Option<&CancellationToken>,
    ) -> Result<FederatedLogin, FederationError> {
        let attempt = self.pkce.take(state).ok_or(FederationError::InvalidState)?;
        if attempt.is_expired(self.pkce.ttl()) {
            tracing::info!("Authorization attempt expired");
            return Err(FederationError::StateExpired);
        }
        if attempt.provider_slug != provider_slug {
            tracing::warn!(expected = %attempt.provider_slug, "State presented to the wrong provider");
            return Err(FederationError::InvalidState);
        }

        let provider = self.directory.provider(provider_slug)?;
        let metadata = self.directory.metadata(provider, cancel).await?;

        let exchange = CodeExchange {
            code: code.to_string(),
            code_verifier: attempt.code_verifier.clone(),
            redirect_uri: attempt.redirect_uri.clone(),
            client_id: provider.client_id.clone(),
            client_secret: provider.client_secret.clone(),
        };
        let response = self
            .directory
            .exchange_code(&metadata, &exchange, cancel)
            .await?;
        let id_token = response.id_token.ok_or_else(|| {
            FederationError::TokenExchangeFailed("Token response carried no id_token".to_string())
        })?;

        let claims = self
            .directory
            .verify_id_token(provider, &metadata, &id_token, &attempt.nonce, cancel)
            .await?;

        let resolved = self.resolve_account(provider, &claims).await?;
        let tokens = self.tokens.issue_pair(resolved.user.user_id, meta).await?;

        tracing::info!(
            user_id = %resolved.user.user_id,
            is_new_user = resolved.is_new_user,
            linked_to_existing = resolved.linked_to_existing,
            "Federated login completed"
        );

        Ok(FederatedLogin {
            user: resolved.user.sanitized(),
            is_new_user: resolved.is_new_user,
            linked_to_existing: resolved.linked_to_existing,
            tokens,
        })
    }

    async fn resolve_account(
        &self,
        provider: &ProviderConfig,
        claims: &IdTokenClaims,
    ) -> Result<Resolved, FederationError> {
        let issuer = provider.issuer_url.as_str();
        let email = normalized_email(claims.email.as_deref());

        if let Some(user) = self.linked_user(issuer, claims, email.as_deref()).await? {
            return Ok(Resolved {
                user,
                is_new_user: false,
                linked_to_existing: false,
            });
        }

        // Only a provider-verified email may attach to an existing account.
        if let (Some(email), true) = (email.as_deref(), claims.email_verified) {
            if let Some(user) = self.users.find_user_by_email(email).await? {
                if let Some(user) = self.link_existing(provider, claims, user, email).await? {
                    return Ok(Resolved {
                        user,
                        is_new_user: false,
                        linked_to_existing: true,
                    });
                }
                return self.resolve_raced(issuer, claims, Some(email)).await;
            }
        }

        match self
            .create_principal(provider, claims, email.as_deref())
            .await?
        {
            Some(user) => Ok(Resolved {
                user,
                is_new_user: true,
                linked_to_existing: false,
            }),
            None => self.resolve_raced(issuer, claims, email.as_deref()).await,
        }
    }

    /// The principal already linked to `(issuer, sub)`, with its
    /// stored claims and profile refreshed.
    async fn linked_user(
        &self,
        issuer: &str,
        claims: &IdTokenClaims,
        email: Option<&str>,
    ) -> Result<Option<User>, FederationError> {
        match self.identities.find_identity(issuer, &claims.sub).await? {
            Some(identity) => Ok(Some(self.refresh_linked(identity, claims, email).await?)),
            None => Ok(None),
        }
    }

    /// A concurrent login for the same subject stored the identity after the
    /// first lookup missed; resolve through the identity it stored.
    async fn resolve_raced(
        &self,
        issuer: &str,
        claims: &IdTokenClaims,
        email: Option<&str>,
    ) -> Result<Resolved, FederationError> {
        let user = self
            .linked_user(issuer, claims, email)
            .await?
            .ok_or(FederationError::IdentityLinkFailed)?;
        tracing::info!(user_id = %user.user_id, "Provider identity linked concurrently; reusing principal");
        Ok(Resolved {
            user,
            is_new_user: false,
            linked_to_existing: false,
        })
    }

    async fn refresh_linked(
        &self,
        identity: FederatedIdentity,
        claims: &IdTokenClaims,
        email: Option<&str>,
    ) -> Result<User, FederationError> {
        let mut user = self
            .users
            .find_user_by_id(identity.user_id)
            .await?
            .ok_or(FederationError::IdentityLinkFailed)?;

        if identity.claims_changed(email, claims.email_verified) {
            self.identities
                .update_identity_claims(
                    identity.identity_id,
                    email.map(str::to_string),
                    claims.email_verified,
                    Utc::now(),
                )
                .await?;
        }

        let display_name = display_name(claims).or_else(|| user.display_name.clone());
        let avatar_url = claims.picture.clone().or_else(|| user.avatar_url.clone());
        if display_name != user.display_name || avatar_url != user.avatar_url {
            self.users
                .update_user_profile(user.user_id, display_name.clone(), avatar_url.clone())
                .await?;
            user.display_name = display_name;
            user.avatar_url = avatar_url;
            tracing::debug!(user_id = %user.user_id, "Profile refreshed from provider claims");
        }

        Ok(user)
    }

    /// Attach the identity to an account found by verified email. Returns
    /// `None` when the identity was stored concurrently.
    /// The local email keeps its own verification state.
    async fn link_existing(
        &self,
        provider: &ProviderConfig,
        claims: &IdTokenClaims,
        user: User,
        email: &str,
    ) -> Result<Option<User>, FederationError> {
        let identity = FederatedIdentity::new(
            user.user_id,
            provider.slug.clone(),
            provider.issuer_url.clone(),
            claims.sub.clone(),
            Some(email.to_string()),
            true,
        );

        match self.identities.insert_identity(&identity).await {
            Ok(()) => {}
            Err(StoreError::Conflict(field)) if field == "identity" => return Ok(None),
            Err(StoreError::Conflict(_)) => return Err(FederationError::IdentityLinkFailed),
            Err(e) => return Err(e.into()),
        }

        tracing::warn!(
            user_id = %user.user_id,
            provider = %provider.slug,
            local_email_verified = user.email_verified,
            "Provider identity linked to existing account by verified email"
        );
        Ok(Some(user))
    }

    async fn create_principal(
        &self,
        provider: &ProviderConfig,
        claims: &IdTokenClaims,
        email: Option<&str>,
    ) -> Result<Option<User>, FederationError> {
        let base = username_base(email, display_name(claims).as_deref());

        // The email goes on the principal only if nobody owns it yet.
        let mut principal_email = match email {
            Some(e) if self.users.find_user_by_email(e).await?.is_none() => Some(e.to_string()),
            _ => None,
        };

        for _ in 0..MAX_CREATE_ATTEMPTS {
            let username = self.unique_username(&base).await?;
            let user = User::new_federated(
                username,
                principal_email.clone(),
                claims.email_verified,
                display_name(claims),
                claims.picture.clone(),
            );
            let identity = FederatedIdentity::new(
                user.user_id,
                provider.slug.clone(),
                provider.issuer_url.clone(),
                claims.sub.clone(),
                email.map(str::to_string),
                claims.email_verified,
            );

            match self
                .identities
                .insert_user_with_identity(&user, &identity)
                .await
            {
                Ok(()) => {
                    tracing::info!(user_id = %user.user_id, "Principal created from provider identity");
                    return Ok(Some(user));
                }
                Err(StoreError::Conflict(field)) if field == "username" => continue,
                Err(StoreError::Conflict(field)) if field == "email" => {
                    principal_email = None;
                    continue;
                }
                Err(StoreError::Conflict(field)) if field == "identity" => return Ok(None),
                Err(StoreError::Conflict(_)) => return Err(FederationError::IdentityLinkFailed),
                Err(e) => return Err(FederationError::PrincipalCreationFailed(e.to_string())),
            }
        }

        Err(FederationError::PrincipalCreationFailed(
            "Could not allocate a unique username".to_string(),
        ))
    }

    async fn unique_username(&self, base: &str) -> Result<String, FederationError> {
        if self.users.find_user_by_username(base).await?.is_none() {
            return Ok(base.to_string());
        }
        for n in 2..(2 + MAX_USERNAME_SUFFIXES) {
            let candidate = with_suffix(base, n);
            if self.users.find_user_by_username(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Ok(random_username())
    }

    pub async fn list_identities(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<IdentityResponse>, FederationError> {
        Ok(self
            .identities
            .list_identities(user_id)
            .await?
            .into_iter()
            .map(IdentityResponse::from)
            .collect())
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn unlink(&self, user_id: Uuid, provider_slug: &str) -> Result<(), FederationError> {
        let provider = self.directory.provider(provider_slug)?;
        match self
            .identities
            .delete_identity_guarded(user_id, &provider.issuer_url)
            .await?
        {
            UnlinkOutcome::Removed => {
                tracing::info!(provider = %provider_slug, "Identity unlinked");
                Ok(())
            }
            UnlinkOutcome::LastLoginMethod => Err(FederationError::CannotUnlinkLastLoginMethod),
            UnlinkOutcome::NotFound => Err(FederationError::IdentityNotFound),
        }
    }
}

fn normalized_email(email: Option<&str>) -> Option<String> {
    email
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty() && e.contains('@'))
}

fn display_name(claims: &IdTokenClaims) -> Option<String> {
    claims
        .name
        .clone()
        .or_else(|| claims.preferred_username.clone())
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
}

/// Lower-case, keep `[a-z0-9_.-]`, whitespace becomes `_`, cut to 32 chars.
/// `None` when fewer than 3 characters survive.
pub fn sanitize_username(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '.' | '-' => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .take(USERNAME_MAX_LEN)
        .collect();

    if cleaned.len() >= USERNAME_MIN_LEN {
        Some(cleaned)
    } else {
        None
    }
}

/// Email local part, then display name, then a random `user_<hex>`.
pub fn username_base(email: Option<&str>, display_name: Option<&str>) -> String {
    email
        .and_then(|e| e.split('@').next())
        .and_then(sanitize_username)
        .or_else(|| display_name.and_then(sanitize_username))
        .unwrap_or_else(random_username)
}

fn random_username() -> String {
    format!("user_{}", random_hex(4))
}

fn with_suffix(base: &str, n: u32) -> String {
    let suffix = n.to_string();
    let keep = USERNAME_MAX_LEN.saturating_sub(suffix.len());
    let stem: String = base.chars().take(keep).collect();
    format!("{}{}", stem, suffix)
}
