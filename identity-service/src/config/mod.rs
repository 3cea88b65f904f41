use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Minimum length of the HS256 signing secret, in bytes.
pub const MIN_SIGNING_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub token: TokenConfig,
    pub oidc: OidcConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Unset selects the in-memory store.
    pub url: Option<Secret<String>>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub signing_secret: Secret<String>,
    pub access_token_ttl_seconds: i64,
    pub refresh_token_ttl_days: i64,
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub pkce_state_ttl_seconds: u64,
    pub pkce_sweep_interval_seconds: u64,
    pub http_timeout_seconds: u64,
    pub metadata_cache_seconds: u64,
    pub providers: Vec<ProviderConfig>,
}

impl OidcConfig {
    pub fn pkce_state_ttl(&self) -> Duration {
        Duration::from_secs(self.pkce_state_ttl_seconds)
    }

    pub fn pkce_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.pkce_sweep_interval_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn metadata_cache(&self) -> Duration {
        Duration::from_secs(self.metadata_cache_seconds)
    }
}

/// One configured OpenID Connect provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub slug: String,
    pub name: String,
    pub issuer_url: String,
    /// Defaults to `{issuer_url}/.well-known/openid-configuration`.
    #[serde(default)]
    pub discovery_url: Option<String>,
    pub client_id: String,
    pub client_secret: Secret<String>,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Replaces the discovered token endpoint, e.g. when the provider is
    /// reached through an internal hostname.
    #[serde(default)]
    pub token_endpoint_override: Option<String>,
}

fn default_scopes() -> Vec<String> {
    vec![
        "openid".to_string(),
        "email".to_string(),
        "profile".to_string(),
    ]
}

impl ProviderConfig {
    pub fn discovery_url(&self) -> String {
        self.discovery_url.clone().unwrap_or_else(|| {
            format!(
                "{}/.well-known/openid-configuration",
                self.issuer_url.trim_end_matches('/')
            )
        })
    }
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
    pub register_attempts: u32,
    pub register_window_seconds: u64,
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("identity-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
            database: DatabaseConfig {
                url: if is_prod {
                    Some(Secret::new(get_env("DATABASE_URL", None, true)?))
                } else {
                    env::var("DATABASE_URL")
                        .ok()
                        .filter(|v| !v.is_empty())
                        .map(Secret::new)
                },
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            token: TokenConfig {
                signing_secret: Secret::new(get_env("TOKEN_SIGNING_SECRET", None, is_prod)?),
                access_token_ttl_seconds: parse_env("ACCESS_TOKEN_TTL_SECONDS", "900", is_prod)?,
                refresh_token_ttl_days: parse_env("REFRESH_TOKEN_TTL_DAYS", "30", is_prod)?,
            },
            oidc: OidcConfig {
                pkce_state_ttl_seconds: parse_env("PKCE_STATE_TTL_SECONDS", "600", is_prod)?,
                pkce_sweep_interval_seconds: parse_env(
                    "PKCE_SWEEP_INTERVAL_SECONDS",
                    "60",
                    is_prod,
                )?,
                http_timeout_seconds: parse_env("OIDC_HTTP_TIMEOUT_SECONDS", "10", is_prod)?,
                metadata_cache_seconds: parse_env("OIDC_METADATA_CACHE_SECONDS", "3600", is_prod)?,
                providers: parse_providers(&get_env("OIDC_PROVIDERS", Some("[]"), is_prod)?)?,
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            },
            rate_limit: RateLimitConfig {
                login_attempts: parse_env("RATE_LIMIT_LOGIN_ATTEMPTS", "5", is_prod)?,
                login_window_seconds: parse_env("RATE_LIMIT_LOGIN_WINDOW_SECONDS", "900", is_prod)?,
                register_attempts: parse_env("RATE_LIMIT_REGISTER_ATTEMPTS", "3", is_prod)?,
                register_window_seconds: parse_env(
                    "RATE_LIMIT_REGISTER_WINDOW_SECONDS",
                    "3600",
                    is_prod,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(config_error("PORT must be greater than 0"));
        }

        if self.token.signing_secret.expose_secret().len() < MIN_SIGNING_SECRET_BYTES {
            return Err(config_error(format!(
                "TOKEN_SIGNING_SECRET must be at least {} bytes",
                MIN_SIGNING_SECRET_BYTES
            )));
        }

        if self.token.access_token_ttl_seconds <= 0 {
            return Err(config_error("ACCESS_TOKEN_TTL_SECONDS must be positive"));
        }

        if self.token.refresh_token_ttl_days <= 0 {
            return Err(config_error("REFRESH_TOKEN_TTL_DAYS must be positive"));
        }

        if self.oidc.pkce_state_ttl_seconds == 0
            || self.oidc.pkce_sweep_interval_seconds == 0
            || self.oidc.http_timeout_seconds == 0
        {
            return Err(config_error(
                "PKCE_STATE_TTL_SECONDS, PKCE_SWEEP_INTERVAL_SECONDS and OIDC_HTTP_TIMEOUT_SECONDS must be positive",
            ));
        }

        let mut slugs = HashSet::new();
        for provider in &self.oidc.providers {
            if !slugs.insert(provider.slug.as_str()) {
                return Err(config_error(format!(
                    "Duplicate OIDC provider slug: {}",
                    provider.slug
                )));
            }
        }

        if self.environment == Environment::Prod
            && self.security.allowed_origins.iter().any(|o| o == "*")
        {
            return Err(config_error(
                "Wildcard CORS origin not allowed in production",
            ));
        }

        Ok(())
    }

    pub fn provider(&self, slug: &str) -> Option<&ProviderConfig> {
        self.oidc.providers.iter().find(|p| p.slug == slug)
    }
}

fn config_error(message: impl std::fmt::Display) -> AppError {
    AppError::ConfigError(anyhow::anyhow!("{}", message))
}

/// Parse the `OIDC_PROVIDERS` JSON array.
pub fn parse_providers(raw: &str) -> Result<Vec<ProviderConfig>, AppError> {
    serde_json::from_str(raw)
        .map_err(|e| config_error(format!("OIDC_PROVIDERS is not a valid provider list: {}", e)))
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(config_error(format!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(config_error(format!("{} is required but not set", key)))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .trim()
        .parse()
        .map_err(|e: T::Err| config_error(format!("{} is invalid: {}", key, e)))
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
