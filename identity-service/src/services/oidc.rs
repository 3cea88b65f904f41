//! OpenID Connect provider plumbing: discovery, code exchange, key sets and
//! ID token verification.
//!
//! Network access goes through [`ProviderGateway`] so the federation flow can
//! run against a scripted provider in tests. [`ProviderDirectory`] owns the
//! per-provider discovery/JWKS cache and applies the timeout and
//! cancellation policy to every call, whatever gateway is plugged in.

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{
    decode, decode_header,
    jwk::{Jwk, JwkSet},
    Algorithm, DecodingKey, Validation,
};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;
use crate::services::FederationError;

/// Subset of the discovery document the flow relies on.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
}

/// Token endpoint response. Only the ID token is consumed.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Form parameters of an authorization-code exchange.
#[derive(Clone)]
pub struct CodeExchange {
    pub code: String,
    pub code_verifier: String,
    pub redirect_uri: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
}

impl std::fmt::Debug for CodeExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeExchange")
            .field("redirect_uri", &self.redirect_uri)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Verified ID token claims.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub email_verified: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
}

/// Some providers send `email_verified` as the string `"true"`.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        Text(String),
    }

    Ok(match Option::<BoolOrString>::deserialize(deserializer)? {
        Some(BoolOrString::Bool(b)) => b,
        Some(BoolOrString::Text(s)) => s.eq_ignore_ascii_case("true"),
        None => false,
    })
}

#[async_trait]
pub trait ProviderGateway: Send + Sync {
    async fn fetch_metadata(&self, discovery_url: &str)
        -> Result<ProviderMetadata, FederationError>;

    async fn exchange_code(
        &self,
        token_endpoint: &str,
        exchange: &CodeExchange,
    ) -> Result<TokenResponse, FederationError>;

    async fn fetch_jwks(&self, jwks_uri: &str) -> Result<JwkSet, FederationError>;
}

/// `reqwest`-backed gateway.
#[derive(Clone)]
pub struct HttpProviderGateway {
    client: reqwest::Client,
}

impl HttpProviderGateway {
    pub fn new(timeout: Duration) -> Result<Self, FederationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FederationError::ProviderUnreachable(e.to_string()))?;
        Ok(Self { client })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, FederationError> {
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(FederationError::ProviderUnreachable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| FederationError::ProviderUnreachable(format!("Malformed response from {}: {}", url, e)))
    }
}

fn transport_error(err: reqwest::Error) -> FederationError {
    if err.is_timeout() {
        FederationError::ProviderTimeout
    } else {
        FederationError::ProviderUnreachable(err.to_string())
    }
}

#[async_trait]
impl ProviderGateway for HttpProviderGateway {
    async fn fetch_metadata(
        &self,
        discovery_url: &str,
    ) -> Result<ProviderMetadata, FederationError> {
        self.get_json(discovery_url).await
    }

    async fn exchange_code(
        &self,
        token_endpoint: &str,
        exchange: &CodeExchange,
    ) -> Result<TokenResponse, FederationError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", exchange.code.as_str()),
            ("redirect_uri", exchange.redirect_uri.as_str()),
            ("code_verifier", exchange.code_verifier.as_str()),
            ("client_id", exchange.client_id.as_str()),
            ("client_secret", exchange.client_secret.expose_secret().as_str()),
        ];

        let response = self
            .client
            .post(token_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(FederationError::TokenExchangeFailed(format!(
                "token endpoint returned {}: {}",
                status, snippet
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| FederationError::TokenExchangeFailed(format!("Malformed token response: {}", e)))
    }

    async fn fetch_jwks(&self, jwks_uri: &str) -> Result<JwkSet, FederationError> {
        self.get_json(jwks_uri).await
    }
}

/// Run a provider call under the HTTP timeout and an optional caller token.
pub(crate) async fn bounded<T, F>(
    timeout: Duration,
    cancel: Option<&CancellationToken>,
    fut: F,
) -> Result<T, FederationError>
where
    F: Future<Output = Result<T, FederationError>>,
{
    let timed = async {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| FederationError::ProviderTimeout)?
    };

    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(FederationError::Cancelled),
            result = timed => result,
        },
        None => timed.await,
    }
}

struct CachedProvider {
    metadata: ProviderMetadata,
    fetched_at: Instant,
}

struct CachedKeys {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Configured providers plus their cached discovery documents and key sets.
pub struct ProviderDirectory {
    gateway: Arc<dyn ProviderGateway>,
    providers: HashMap<String, ProviderConfig>,
    metadata: DashMap<String, CachedProvider>,
    keys: DashMap<String, CachedKeys>,
    cache_ttl: Duration,
    http_timeout: Duration,
}

impl ProviderDirectory {
    pub fn new(
        gateway: Arc<dyn ProviderGateway>,
        providers: Vec<ProviderConfig>,
        cache_ttl: Duration,
        http_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            providers: providers
                .into_iter()
                .map(|p| (p.slug.clone(), p))
                .collect(),
            metadata: DashMap::new(),
            keys: DashMap::new(),
            cache_ttl,
            http_timeout,
        }
    }

    pub fn provider(&self, slug: &str) -> Result<&ProviderConfig, FederationError> {
        self.providers
            .get(slug)
            .ok_or_else(|| FederationError::ProviderNotFound(slug.to_string()))
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Discovery document, with the token endpoint override applied.
    pub async fn metadata(
        &self,
        provider: &ProviderConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<ProviderMetadata, FederationError> {
        if let Some(cached) = self.metadata.get(&provider.slug) {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.metadata.clone());
            }
        }

        let url = provider.discovery_url();
        let mut metadata = bounded(
            self.http_timeout,
            cancel,
            self.gateway.fetch_metadata(&url),
        )
        .await?;

        if let Some(endpoint) = &provider.token_endpoint_override {
            tracing::debug!(provider = %provider.slug, "Token endpoint overridden");
            metadata.token_endpoint = endpoint.clone();
        }

        tracing::info!(provider = %provider.slug, "Provider metadata refreshed");
        self.metadata.insert(
            provider.slug.clone(),
            CachedProvider {
                metadata: metadata.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(metadata)
    }

    pub async fn exchange_code(
        &self,
        metadata: &ProviderMetadata,
        exchange: &CodeExchange,
        cancel: Option<&CancellationToken>,
    ) -> Result<TokenResponse, FederationError> {
        bounded(
            self.http_timeout,
            cancel,
            self.gateway.exchange_code(&metadata.token_endpoint, exchange),
        )
        .await
    }

    async fn key_set(
        &self,
        provider: &ProviderConfig,
        metadata: &ProviderMetadata,
        force_refresh: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<JwkSet, FederationError> {
        if !force_refresh {
            if let Some(cached) = self.keys.get(&provider.slug) {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        let keys = bounded(
            self.http_timeout,
            cancel,
            self.gateway.fetch_jwks(&metadata.jwks_uri),
        )
        .await?;

        tracing::debug!(provider = %provider.slug, keys = keys.keys.len(), "JWKS refreshed");
        self.keys.insert(
            provider.slug.clone(),
            CachedKeys {
                keys: keys.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(keys)
    }

    async fn signing_key(
        &self,
        provider: &ProviderConfig,
        metadata: &ProviderMetadata,
        kid: Option<&str>,
        alg: Algorithm,
        cancel: Option<&CancellationToken>,
    ) -> Result<DecodingKey, FederationError> {
        let keys = self.key_set(provider, metadata, false, cancel).await?;
        let jwk = match select_key(&keys, kid, alg) {
            Some(jwk) => jwk.clone(),
            None if kid.is_some() => {
                // Provider may have rotated its keys since the last fetch.
                let refreshed = self.key_set(provider, metadata, true, cancel).await?;
                select_key(&refreshed, kid, alg).cloned().ok_or_else(|| {
                    FederationError::InvalidIdToken("No matching signing key".to_string())
                })?
            }
            None => {
                return Err(FederationError::InvalidIdToken(
                    "No matching signing key".to_string(),
                ))
            }
        };

        DecodingKey::from_jwk(&jwk)
            .map_err(|e| FederationError::InvalidIdToken(format!("Unusable signing key: {}", e)))
    }

    /// Verify signature, issuer, audience, expiry and nonce of an ID token.
    pub async fn verify_id_token(
        &self,
        provider: &ProviderConfig,
        metadata: &ProviderMetadata,
        id_token: &str,
        expected_nonce: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<IdTokenClaims, FederationError> {
        let header = decode_header(id_token)
            .map_err(|e| FederationError::InvalidIdToken(e.to_string()))?;

        let key = match header.alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                DecodingKey::from_secret(provider.client_secret.expose_secret().as_bytes())
            }
            alg => {
                self.signing_key(provider, metadata, header.kid.as_deref(), alg, cancel)
                    .await?
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[provider.client_id.as_str()]);
        validation.set_issuer(&accepted_issuers(provider, metadata));
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let claims = decode::<IdTokenClaims>(id_token, &key, &validation)
            .map_err(|e| FederationError::InvalidIdToken(e.to_string()))?
            .claims;

        let nonce_matches = claims
            .nonce
            .as_deref()
            .map(|n| bool::from(n.as_bytes().ct_eq(expected_nonce.as_bytes())))
            .unwrap_or(false);
        if !nonce_matches {
            return Err(FederationError::NonceMismatch);
        }

        Ok(claims)
    }
}

fn accepted_issuers(provider: &ProviderConfig, metadata: &ProviderMetadata) -> Vec<String> {
    let mut issuers = vec![provider.issuer_url.clone(), metadata.issuer.clone()];
    let trimmed = provider.issuer_url.trim_end_matches('/').to_string();
    issuers.push(format!("{}/", trimmed));
    issuers.push(trimmed);
    issuers.sort();
    issuers.dedup();
    issuers
}

fn select_key<'a>(keys: &'a JwkSet, kid: Option<&str>, alg: Algorithm) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => keys.find(kid),
        None => {
            let mut candidates = keys.keys.iter().filter(|k| {
                k.common
                    .key_algorithm
                    .as_ref()
                    .map_or(true, |ka| format!("{:?}", ka) == format!("{:?}", alg))
            });
            let first = candidates.next();
            // Ambiguous without a kid.
            if candidates.next().is_some() {
                None
            } else {
                first
            }
        }
    }
}
