use identity_service::{
    build_router,
    config::IdentityConfig,
    db,
    repository::Repositories,
    services::{JwtService, RedisService, TracingAuditSink},
    AppState, Backends,
};
use service_core::observability::logging::init_tracing;
use std::{net::SocketAddr, sync::Arc};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), service_core::error::AppError> {
    // Load configuration - fail fast if invalid
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity service"
    );

    let store = Arc::new(db::connect(&config.database, config.store.timeout()).await?);
    tracing::info!("Database initialized successfully");

    let redis = Arc::new(
        RedisService::new(&config.redis, config.revocation.watermark_retention_seconds).await?,
    );
    tracing::info!("Redis service initialized");

    let jwt = JwtService::new(&config.jwt)?;
    tracing::info!(algorithm = ?config.jwt.algorithm, "JWT service initialized");

    let backends = Backends {
        repos: Repositories::from_store(store),
        revocation: redis.clone(),
        counters: redis.clone(),
        cache_health: redis,
    };
    let state = AppState::new(config.clone(), backends, jwt, Arc::new(TracingAuditSink));

    state.rbac.ensure_system_catalog().await?;
    tracing::info!("System roles and permissions in place");

    let app = build_router(state).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
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
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
