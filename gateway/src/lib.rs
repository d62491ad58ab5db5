//! Elder-care gateway edge: library crate
//!
//! Exposes the edge filters, shared-store backends and router so that
//! integration tests can drive a complete gateway without the binary's
//! startup sequence.

pub mod admin;
pub mod audit;
pub mod auth;
pub mod blacklist;
pub mod config;
pub mod distributed_lock;
pub mod error;
pub mod filter_chain;
pub mod memory_store;
pub mod metrics;
pub mod middleware;
pub mod path_match;
pub mod policy;
pub mod production;
pub mod proxy;
pub mod rate_key;
pub mod redis_client;
pub mod scripts;
pub mod sliding_window;
pub mod store;
pub mod telemetry;
pub mod token_bucket;

use axum::{
    extract::{FromRef, State},
    http::{header, HeaderValue},
    middleware as axum_middleware,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::audit::AuditLogger;
use crate::blacklist::BlacklistGate;
use crate::config::{Config, SecurityConfig};
use crate::filter_chain::EdgeFilters;
use crate::proxy::{ProxyError, UpstreamProxy};
use crate::store::EdgeStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn EdgeStore>,
    pub filters: Arc<EdgeFilters>,
    pub blacklist: BlacklistGate,
    pub proxy: Arc<UpstreamProxy>,
    pub audit: AuditLogger,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn EdgeStore>) -> Result<Self, ProxyError> {
        let audit = AuditLogger::default();
        let filters = EdgeFilters::new(&config, store.clone(), audit.clone());
        Ok(Self {
            blacklist: BlacklistGate::new(store.clone(), config.store.timeout()),
            proxy: Arc::new(UpstreamProxy::new(&config)?),
            filters: Arc::new(filters),
            config: Arc::new(config),
            store,
            audit,
            start_time: Instant::now(),
        })
    }
}

impl FromRef<AppState> for Arc<UpstreamProxy> {
    fn from_ref(state: &AppState) -> Self {
        state.proxy.clone()
    }
}

/// Full gateway router: local endpoints, the edge pipeline, and the
/// upstream fallback.
pub fn build_router(state: AppState) -> Router {
    metrics::register_metrics();

    let edge = admin::routes()
        .fallback(proxy::forward)
        .layer(axum_middleware::from_fn_with_state(
            state.filters.clone(),
            filter_chain::edge_filter,
        ));

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(edge)
        .with_state(state.clone());

    if state.config.security.cors_enabled {
        app = app.layer(cors_layer(&state.config.security));
    }

    app.layer(axum_middleware::from_fn(middleware::request_logging))
        .layer(axum_middleware::from_fn(middleware::request_id))
}

fn cors_layer(security: &SecurityConfig) -> CorsLayer {
    if security.is_cors_permissive() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = security
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    store_backend: &'static str,
    store_connected: bool,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_connected = matches!(
        tokio::time::timeout(state.config.store.timeout(), state.store.ping()).await,
        Ok(Ok(true))
    );

    Json(HealthResponse {
        status: if store_connected { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        store_backend: state.store.backend_name(),
        store_connected,
    })
}

async fn metrics_handler() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
        .into_response()
}
