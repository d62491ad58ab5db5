//! Administrative blacklist endpoints.
//!
//! Mounted under `/api/v1/admin/blacklist/:scope/:id`. Access control is the
//! edge filter's job: the default configuration lists `/api/v1/admin/**` as a
//! super-admin path, so handlers can trust the injected `X-User-Id`.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEvent, AuditOutcome};
use crate::auth::USER_ID_HEADER;
use crate::blacklist::{blacklist_key, BlacklistEntry, BlacklistScope};
use crate::error::GatewayError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct BlacklistRequest {
    pub reason: String,
    /// Seconds; absent or `<= 0` blacklists permanently.
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BlacklistResponse {
    pub scope: BlacklistScope,
    pub id: String,
    #[serde(flatten)]
    pub entry: BlacklistEntry,
}

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/api/v1/admin/blacklist/:scope/:id",
        get(get_entry).put(add_entry).delete(remove_entry),
    )
}

fn parse_scope(scope: &str) -> Result<BlacklistScope, GatewayError> {
    scope.parse().map_err(GatewayError::BadRequest)
}

fn actor(headers: &HeaderMap) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

fn store_error(e: crate::store::StoreError) -> GatewayError {
    tracing::error!(error = %e, "Blacklist administration failed");
    GatewayError::StoreUnavailable
}

async fn get_entry(
    State(state): State<AppState>,
    Path((scope, id)): Path<(String, String)>,
) -> Result<Json<BlacklistResponse>, GatewayError> {
    let scope = parse_scope(&scope)?;
    match state.blacklist.entry(scope, &id).await.map_err(store_error)? {
        Some(entry) => Ok(Json(BlacklistResponse { scope, id, entry })),
        None => Err(GatewayError::NotFound(blacklist_key(scope, &id))),
    }
}

async fn add_entry(
    State(state): State<AppState>,
    Path((scope, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Result<Json<BlacklistRequest>, JsonRejection>,
) -> Result<StatusCode, GatewayError> {
    let scope = parse_scope(&scope)?;
    let Json(body) = body.map_err(|e| GatewayError::BadRequest(e.body_text()))?;
    if body.reason.trim().is_empty() {
        return Err(GatewayError::BadRequest("reason must not be empty".to_string()));
    }
    let ttl_secs = body.ttl_secs.unwrap_or(0);

    state
        .blacklist
        .add(scope, &id, &body.reason, ttl_secs)
        .await
        .map_err(store_error)?;

    state
        .audit
        .log(
            AuditEvent::new(AuditAction::BlacklistAdd, AuditOutcome::Success, actor(&headers))
                .with_resource(blacklist_key(scope, &id))
                .with_details(format!("reason={} ttl_secs={}", body.reason, ttl_secs)),
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

async fn remove_entry(
    State(state): State<AppState>,
    Path((scope, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, GatewayError> {
    let scope = parse_scope(&scope)?;
    let removed = state
        .blacklist
        .remove(scope, &id)
        .await
        .map_err(store_error)?;

    if !removed {
        return Err(GatewayError::NotFound(blacklist_key(scope, &id)));
    }

    state
        .audit
        .log(
            AuditEvent::new(AuditAction::BlacklistRemove, AuditOutcome::Success, actor(&headers))
                .with_resource(blacklist_key(scope, &id)),
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}
