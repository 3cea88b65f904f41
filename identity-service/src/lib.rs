pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

use service_core::axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post, put},
    Json, Router,
};
use service_core::middleware::{
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::{request_id_middleware, REQUEST_ID_HEADER},
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::IdentityConfig;
use crate::services::{
    AuthService, FederationService, JwtService, PermissionService, PkceStateStore,
    ProviderDirectory, ProviderGateway, TokenService,
};
use crate::store::Stores;
use service_core::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<IdentityConfig>,
    pub stores: Stores,
    pub tokens: TokenService,
    pub auth: AuthService,
    pub federation: FederationService,
    pub permissions: PermissionService,
    pub pkce: Arc<PkceStateStore>,
    pub login_rate_limiter: IpRateLimiter,
    pub register_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wire every service onto one set of stores.
    pub fn new(
        config: IdentityConfig,
        stores: Stores,
        gateway: Arc<dyn ProviderGateway>,
        pkce: Arc<PkceStateStore>,
    ) -> Self {
        let jwt = JwtService::new(
            &config.token.signing_secret,
            config.token.access_token_ttl_seconds,
        );
        let tokens = TokenService::new(
            jwt,
            stores.credentials.clone(),
            config.token.refresh_token_ttl_days,
        );
        let auth = AuthService::new(stores.users.clone(), tokens.clone());

        let directory = Arc::new(ProviderDirectory::new(
            gateway,
            config.oidc.providers.clone(),
            config.oidc.metadata_cache(),
            config.oidc.http_timeout(),
        ));
        let federation = FederationService::new(
            directory,
            pkce.clone(),
            stores.users.clone(),
            stores.identities.clone(),
            tokens.clone(),
        );
        let permissions = PermissionService::new(stores.access.clone());

        let login_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.login_attempts,
            config.rate_limit.login_window_seconds,
        );
        let register_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.register_attempts,
            config.rate_limit.register_window_seconds,
        );

        Self {
            config: Arc::new(config),
            stores,
            tokens,
            auth,
            federation,
            permissions,
            pkce,
            login_rate_limiter,
            register_rate_limiter,
        }
    }
}

pub fn build_router(state: AppState) -> Result<Router, AppError> {
    let login_route = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let register_route = Router::new()
        .route("/auth/register", post(handlers::auth::register))
        .layer(from_fn_with_state(
            state.register_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let authenticated = Router::new()
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/logout-all", post(handlers::auth::logout_all))
        .route("/auth/sessions", get(handlers::auth::sessions))
        .route("/auth/me", get(handlers::auth::me))
        .route("/auth/identities", get(handlers::oidc::list_identities))
        .route(
            "/auth/identities/:provider",
            delete(handlers::oidc::unlink),
        )
        .route("/permissions", get(handlers::permission::list_permissions))
        .route("/permissions/check", get(handlers::permission::check))
        .route("/permissions/mine", get(handlers::permission::mine))
        .route(
            "/organizations/:org_id/roles",
            get(handlers::role::list_roles).post(handlers::role::create_role),
        )
        .route(
            "/roles/:role_id",
            get(handlers::role::get_role)
                .patch(handlers::role::update_role)
                .delete(handlers::role::delete_role),
        )
        .route(
            "/organizations/:org_id/members/:user_id",
            put(handlers::member::assign_org_member).delete(handlers::member::remove_org_member),
        )
        .route(
            "/projects/:project_id/members/:user_id",
            put(handlers::member::assign_project_member)
                .delete(handlers::member::remove_project_member),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let origins = state
        .config
        .security
        .allowed_origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Invalid CORS origin '{}': {}", o, e))
            })
        })
        .collect::<Result<Vec<HeaderValue>, AppError>>()?;

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route(
            "/auth/oidc/:provider/authorize",
            get(handlers::oidc::authorize),
        )
        .route(
            "/auth/oidc/:provider/callback",
            post(handlers::oidc::callback),
        )
        .merge(login_route)
        .merge(register_route)
        .merge(authenticated)
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    HeaderName::from_static(REQUEST_ID_HEADER),
                ]),
        );

    Ok(app)
}

pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.stores.health.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Store health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "store": "up",
            "pending_authorizations": state.pkce.len(),
        }
    })))
}
