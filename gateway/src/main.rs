//! Elder-care gateway edge

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use eldercare_gateway::{
    build_router,
    config::{Config, StoreBackend},
    memory_store::MemoryStore,
    production, redis_client::RedisClient,
    store::EdgeStore,
    telemetry, AppState,
};

/// How long startup waits for the first Redis connection.
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, load_error) = match Config::load() {
        Ok(c) => (c, None),
        Err(e) => (Config::default(), Some(e)),
    };

    telemetry::init_telemetry(&config.telemetry).context("failed to initialize telemetry")?;

    if let Some(e) = load_error {
        tracing::warn!(error = %e, "Failed to load configuration, using defaults");
    }

    config.validate().context("invalid configuration")?;
    production::enforce_production_validation(&config).map_err(anyhow::Error::msg)?;
    config.log_summary();

    let store = connect_store(&config).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config, store).context("failed to initialize gateway state")?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", bind_addr))?;

    tracing::info!(addr = %bind_addr, "Gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    telemetry::shutdown_telemetry();
    Ok(())
}

async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn EdgeStore>> {
    match config.store.backend {
        StoreBackend::Redis => {
            let client = tokio::time::timeout(
                REDIS_CONNECT_TIMEOUT,
                RedisClient::new(&config.store.redis_url, config.store.key_prefix.clone()),
            )
            .await
            .context("timed out connecting to Redis")?
            .context("failed to connect to Redis")?;
            Ok(Arc::new(client))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; limits and blacklist are per instance");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
