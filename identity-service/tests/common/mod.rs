#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use identity_service::{
    build_router,
    config::{
        parse_providers, DatabaseConfig, Environment, IdentityConfig, OidcConfig,
        RateLimitConfig, SecurityConfig, TokenConfig,
    },
    services::{
        CodeExchange, FederationError, ProviderGateway, ProviderMetadata, TokenResponse,
    },
    store::{MemoryStore, Stores},
    AppState,
};
use jsonwebtoken::{encode, jwk::JwkSet, Algorithm, EncodingKey, Header};
use secrecy::Secret;
use service_core::axum::Router;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PROVIDER: &str = "acme";
pub const ISSUER: &str = "https://id.acme.test";
pub const CLIENT_ID: &str = "identity-service-test";
pub const CLIENT_SECRET: &str = "acme-client-secret";
pub const REDIRECT_URI: &str = "https://app.example.com/oidc/callback";
pub const SIGNING_SECRET: &str = "integration-test-signing-secret-0123456789";
pub const ACCESS_TTL: i64 = 900;

const TEST_RSA_PEM: &[u8] = include_bytes!("../fixtures/test_rsa.pem");
const TEST_RSA_MODULUS: &str = "1gi0xwb4LYWpsxqDtD-HFZrRC2sQ2tPuH-iqVL4FkCTzImnaqEWlSqMmsCdT7SCXOQ0rXbTf7yd-Mw5-RdJyw_cszk--ZRRWiQ0QoWaBv8pIGMxlV47C3cpoM2-KB5MGUF3R8hS4qHxsPzlS4ecAdP_iHpyTxDnLtG38Qdh9IwQf5ZEHYId2vUroZDNQz18B5kWa7GfvT0SiA2GeHoQJfE9jpFSqADr2c0uYuxhIn8Ig2ZnKSplCLrumePyI0-0ECShLle0JSDVogT-ssdgEua2mASxsBMA8i58S-f_qSAGFpeZS8zz89VcqckNoHHegV6QB7WUbkN42AVc9H5jSpQ";

pub fn test_config() -> IdentityConfig {
    let providers = parse_providers(&format!(
        r#"[{{"slug":"{}","name":"Acme ID","issuer_url":"{}","client_id":"{}","client_secret":"{}"}}]"#,
        PROVIDER, ISSUER, CLIENT_ID, CLIENT_SECRET
    ))
    .unwrap();

    IdentityConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "identity-service".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: None,
            max_connections: 5,
            min_connections: 1,
        },
        token: TokenConfig {
            signing_secret: Secret::new(SIGNING_SECRET.to_string()),
            access_token_ttl_seconds: ACCESS_TTL,
            refresh_token_ttl_days: 30,
        },
        oidc: OidcConfig {
            pkce_state_ttl_seconds: 600,
            pkce_sweep_interval_seconds: 60,
            http_timeout_seconds: 2,
            metadata_cache_seconds: 3600,
            providers,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        },
        rate_limit: RateLimitConfig {
            login_attempts: 100,
            login_window_seconds: 60,
            register_attempts: 100,
            register_window_seconds: 60,
        },
    }
}

/// Claims the scripted provider puts into the ID token for one code.
#[derive(Debug, Clone, Default)]
pub struct IdTokenSpec {
    pub sub: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub nonce: String,
    pub audience: Option<String>,
    pub kid: Option<String>,
}

impl IdTokenSpec {
    pub fn new(sub: &str, nonce: &str) -> Self {
        Self {
            sub: sub.to_string(),
            nonce: nonce.to_string(),
            ..Self::default()
        }
    }

    pub fn email(mut self, email: &str, verified: bool) -> Self {
        self.email = Some(email.to_string());
        self.email_verified = verified;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// In-process stand-in for an OpenID provider, signing RS256 ID tokens.
pub struct MockGateway {
    codes: Mutex<HashMap<String, IdTokenSpec>>,
    pub exchanges: Mutex<Vec<CodeExchange>>,
    pub metadata_fetches: AtomicUsize,
    pub jwks_fetches: AtomicUsize,
    /// Keys served before the first refetch; `None` serves the real key.
    stale_keys: Mutex<Option<JwkSet>>,
    delay: Mutex<Option<Duration>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            codes: Mutex::new(HashMap::new()),
            exchanges: Mutex::new(Vec::new()),
            metadata_fetches: AtomicUsize::new(0),
            jwks_fetches: AtomicUsize::new(0),
            stale_keys: Mutex::new(None),
            delay: Mutex::new(None),
        }
    }

    pub fn script(&self, code: &str, spec: IdTokenSpec) {
        self.codes.lock().unwrap().insert(code.to_string(), spec);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Serve a key set without the signing key until the next fetch.
    pub fn serve_stale_keys_once(&self) {
        *self.stale_keys.lock().unwrap() = Some(JwkSet { keys: vec![] });
    }

    pub fn last_exchange(&self) -> Option<CodeExchange> {
        self.exchanges.lock().unwrap().last().cloned()
    }

    async fn maybe_delay(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

pub fn test_key_set() -> JwkSet {
    serde_json::from_value(serde_json::json!({
        "keys": [{
            "kty": "RSA",
            "kid": "test-key-1",
            "use": "sig",
            "alg": "RS256",
            "n": TEST_RSA_MODULUS,
            "e": "AQAB",
        }]
    }))
    .unwrap()
}

pub fn mint_id_token(spec: &IdTokenSpec) -> String {
    let now = Utc::now().timestamp();
    let mut claims = serde_json::json!({
        "iss": ISSUER,
        "sub": spec.sub,
        "aud": spec.audience.clone().unwrap_or_else(|| CLIENT_ID.to_string()),
        "iat": now,
        "exp": now + 300,
        "nonce": spec.nonce,
        "email_verified": spec.email_verified,
    });
    if let Some(email) = &spec.email {
        claims["email"] = serde_json::json!(email);
    }
    if let Some(name) = &spec.name {
        claims["name"] = serde_json::json!(name);
    }
    if let Some(picture) = &spec.picture {
        claims["picture"] = serde_json::json!(picture);
    }

    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(spec.kid.clone().unwrap_or_else(|| "test-key-1".to_string()));
    let key = EncodingKey::from_rsa_pem(TEST_RSA_PEM).unwrap();
    encode(&header, &claims, &key).unwrap()
}

#[async_trait]
impl ProviderGateway for MockGateway {
    async fn fetch_metadata(
        &self,
        discovery_url: &str,
    ) -> Result<ProviderMetadata, FederationError> {
        assert_eq!(
            discovery_url,
            format!("{}/.well-known/openid-configuration", ISSUER)
        );
        self.metadata_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderMetadata {
            issuer: ISSUER.to_string(),
            authorization_endpoint: format!("{}/authorize", ISSUER),
            token_endpoint: format!("{}/token", ISSUER),
            jwks_uri: format!("{}/jwks", ISSUER),
        })
    }

    async fn exchange_code(
        &self,
        _token_endpoint: &str,
        exchange: &CodeExchange,
    ) -> Result<TokenResponse, FederationError> {
        self.maybe_delay().await;
        self.exchanges.lock().unwrap().push(exchange.clone());
        let spec = self
            .codes
            .lock()
            .unwrap()
            .remove(&exchange.code)
            .ok_or_else(|| FederationError::TokenExchangeFailed("invalid_grant".to_string()))?;
        Ok(TokenResponse {
            id_token: Some(mint_id_token(&spec)),
            access_token: Some("provider-access-token".to_string()),
            token_type: Some("Bearer".to_string()),
        })
    }

    async fn fetch_jwks(&self, _jwks_uri: &str) -> Result<JwkSet, FederationError> {
        self.jwks_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(stale) = self.stale_keys.lock().unwrap().take() {
            return Ok(stale);
        }
        Ok(test_key_set())
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<MockGateway>,
}

impl TestApp {
    pub fn router(&self) -> Router {
        build_router(self.state.clone()).unwrap()
    }
}

pub fn test_app() -> TestApp {
    test_app_with(test_config())
}

pub fn test_app_with(config: IdentityConfig) -> TestApp {
    test_app_with_stores(config, |store| Stores::from_backend(store))
}

/// Like [`test_app_with`], letting the caller wrap individual store seams.
pub fn test_app_with_stores(
    config: IdentityConfig,
    stores: impl FnOnce(Arc<MemoryStore>) -> Stores,
) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    let pkce = Arc::new(identity_service::services::PkceStateStore::new(
        config.oidc.pkce_state_ttl(),
    ));
    let state = AppState::new(
        config,
        stores(store.clone()),
        gateway.clone(),
        pkce,
    );
    TestApp {
        state,
        store,
        gateway,
    }
}

/// Value of query parameter `name` in `url`.
pub fn query_param(url: &str, name: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Begin an authorization and return `(state, nonce)`.
pub async fn begin(app: &TestApp) -> (String, String) {
    let request = app
        .state
        .federation
        .begin_authorization(PROVIDER, REDIRECT_URI)
        .await
        .unwrap();
    let nonce = query_param(&request.auth_url, "nonce").unwrap();
    (request.state, nonce)
}
