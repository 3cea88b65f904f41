use identity_service::{
    build_router,
    config::IdentityConfig,
    services::{HttpProviderGateway, PkceStateStore},
    store::{MemoryStore, PgStore, Stores},
    AppState,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::observability::{init_tracing, shutdown_tracing};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        providers = config.oidc.providers.len(),
        "Starting identity service"
    );

    let stores = match &config.database.url {
        Some(url) => {
            let store = PgStore::connect(
                url.expose_secret(),
                config.database.max_connections,
                config.database.min_connections,
            )
            .await?;
            tracing::info!("PostgreSQL store initialized");
            Stores::from_backend(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using the in-memory store, data will not survive a restart");
            Stores::from_backend(Arc::new(MemoryStore::new()))
        }
    };

    let gateway = HttpProviderGateway::new(config.oidc.http_timeout())?;
    let pkce = Arc::new(PkceStateStore::start(
        config.oidc.pkce_state_ttl(),
        config.oidc.pkce_sweep_interval(),
    ));

    let addr = config.common.socket_addr();
    let state = AppState::new(config, stores, Arc::new(gateway), pkce.clone());
    let app = build_router(state)?;

    tracing::info!(address = %addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let served = service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    pkce.shutdown().await;
    tracing::info!("Service shutdown complete");
    shutdown_tracing();

    served.map_err(AppError::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
