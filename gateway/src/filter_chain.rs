//! The ordered edge pipeline run before any request reaches a backend.
//!
//! Stages run in [`EDGE_PIPELINE`] order. The first stage that rejects ends
//! the request with its structured error; a request that passes every stage
//! continues to the router with its verified identity attached.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Request, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::audit::{AuditAction, AuditEvent, AuditLogger, AuditOutcome};
use crate::auth::{inject_identity, strip_identity_headers, Authenticator, Claims};
use crate::blacklist::{BlacklistGate, BlacklistScope};
use crate::config::{Config, FailurePolicy};
use crate::error::GatewayError;
use crate::metrics;
use crate::middleware::RequestId;
use crate::path_match;
use crate::policy::PolicyResolver;
use crate::rate_key;
use crate::store::{EdgeStore, StoreError};
use crate::token_bucket::TokenBucketLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStage {
    Authenticate,
    Blacklist,
    RateLimit,
}

impl FilterStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterStage::Authenticate => "authenticate",
            FilterStage::Blacklist => "blacklist",
            FilterStage::RateLimit => "rate_limit",
        }
    }
}

pub const EDGE_PIPELINE: [FilterStage; 3] = [
    FilterStage::Authenticate,
    FilterStage::Blacklist,
    FilterStage::RateLimit,
];

/// What the stages know about one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub path: String,
    pub client_ip: String,
    pub identity: Option<Claims>,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn new(path: impl Into<String>, client_ip: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            client_ip: client_ip.into(),
            identity: None,
            request_id: None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|c| c.subject())
    }

    fn actor(&self) -> &str {
        self.user_id().unwrap_or(&self.client_ip)
    }
}

pub struct EdgeFilters {
    authenticator: Authenticator,
    blacklist: BlacklistGate,
    blacklist_enabled: bool,
    blacklist_on_error: FailurePolicy,
    policies: PolicyResolver,
    limiter: TokenBucketLimiter,
    rate_limit_enabled: bool,
    rate_limit_on_error: FailurePolicy,
    audit: AuditLogger,
}

impl EdgeFilters {
    pub fn new(config: &Config, store: Arc<dyn EdgeStore>, audit: AuditLogger) -> Self {
        let timeout = config.store.timeout();
        Self {
            authenticator: Authenticator::from_config(&config.auth),
            blacklist: BlacklistGate::new(store.clone(), timeout),
            blacklist_enabled: config.blacklist.enabled,
            blacklist_on_error: config.blacklist.on_store_error,
            policies: PolicyResolver::new(&config.rate_limit.policies, config.rate_limit.fallback.clone()),
            limiter: TokenBucketLimiter::new(store, timeout),
            rate_limit_enabled: config.rate_limit.enabled,
            rate_limit_on_error: config.rate_limit.on_store_error,
            audit,
        }
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    /// Run every stage in order, stopping at the first rejection.
    pub async fn run(&self, ctx: &mut RequestContext, headers: &HeaderMap) -> Result<(), GatewayError> {
        for stage in EDGE_PIPELINE {
            let result = match stage {
                FilterStage::Authenticate => self.authenticate(ctx, headers),
                FilterStage::Blacklist => self.check_blacklist(ctx).await,
                FilterStage::RateLimit => self.check_rate_limit(ctx).await,
            };

            if let Err(e) = result {
                self.audit_rejection(stage, ctx, &e).await;
                return Err(e);
            }
        }
        Ok(())
    }

    fn authenticate(&self, ctx: &mut RequestContext, headers: &HeaderMap) -> Result<(), GatewayError> {
        ctx.identity = self.authenticator.authenticate(&ctx.path, headers)?;
        Ok(())
    }

    async fn check_blacklist(&self, ctx: &RequestContext) -> Result<(), GatewayError> {
        if !self.blacklist_enabled {
            return Ok(());
        }

        let mut checks = vec![(BlacklistScope::Ip, ctx.client_ip.as_str())];
        if let Some(user) = ctx.user_id() {
            checks.push((BlacklistScope::User, user));
        }

        for (scope, id) in checks {
            match self.blacklist.is_blacklisted(scope, id).await {
                Ok(false) => {}
                Ok(true) => {
                    metrics::record_blacklist_hit(scope.as_str());
                    tracing::warn!(scope = %scope, id = %id, path = %ctx.path, "Blacklisted request rejected");
                    return Err(GatewayError::Blacklisted(scope));
                }
                Err(e) => {
                    return self
                        .on_store_failure(FilterStage::Blacklist, self.blacklist_on_error, ctx, e)
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn check_rate_limit(&self, ctx: &RequestContext) -> Result<(), GatewayError> {
        if !self.rate_limit_enabled {
            return Ok(());
        }

        let policy = self.policies.resolve(&ctx.path);
        let key = rate_key::build_key(&policy, &ctx.client_ip, ctx.user_id());

        match self
            .limiter
            .try_consume(&key, policy.replenish_rate, policy.burst_capacity)
            .await
        {
            Ok(outcome) if outcome.allowed => {
                tracing::debug!(key = %key, remaining = outcome.remaining_tokens, "Token consumed");
                Ok(())
            }
            Ok(_) => {
                metrics::record_rate_limited(policy.key_strategy.as_str());
                tracing::warn!(
                    key = %key,
                    rate = policy.replenish_rate,
                    burst = policy.burst_capacity,
                    "Rate limit exceeded"
                );
                Err(GatewayError::RateLimited)
            }
            Err(e) => {
                self.on_store_failure(FilterStage::RateLimit, self.rate_limit_on_error, ctx, e)
                    .await
            }
        }
    }

    async fn on_store_failure(
        &self,
        stage: FilterStage,
        policy: FailurePolicy,
        ctx: &RequestContext,
        error: StoreError,
    ) -> Result<(), GatewayError> {
        match policy {
            FailurePolicy::FailOpen => {
                metrics::record_fail_open(stage.as_str());
                tracing::warn!(stage = stage.as_str(), error = %error, path = %ctx.path, "Store unavailable, admitting request");
                self.audit
                    .log(
                        self.event(AuditAction::StoreFailOpen, AuditOutcome::Success, ctx)
                            .with_details(format!("{}: {}", stage.as_str(), error)),
                    )
                    .await;
                Ok(())
            }
            FailurePolicy::FailClosed => {
                tracing::error!(stage = stage.as_str(), error = %error, path = %ctx.path, "Store unavailable, rejecting request");
                Err(GatewayError::StoreUnavailable)
            }
        }
    }

    async fn audit_rejection(&self, stage: FilterStage, ctx: &RequestContext, error: &GatewayError) {
        let action = match error {
            GatewayError::Unauthenticated(_) => AuditAction::AuthFailure,
            GatewayError::Unauthorized => AuditAction::AccessDenied,
            GatewayError::Blacklisted(_) => AuditAction::Blacklisted,
            GatewayError::RateLimited => AuditAction::RateLimited,
            GatewayError::StoreUnavailable => AuditAction::StoreFailClosed,
            _ => return,
        };
        self.audit
            .log(
                self.event(action, AuditOutcome::Denied, ctx)
                    .with_details(format!("{}: {}", stage.as_str(), error)),
            )
            .await;
    }

    fn event(&self, action: AuditAction, outcome: AuditOutcome, ctx: &RequestContext) -> AuditEvent {
        let mut event = AuditEvent::new(action, outcome, ctx.actor())
            .with_client_ip(ctx.client_ip.clone())
            .with_resource(ctx.path.clone());
        if let Some(id) = &ctx.request_id {
            event = event.with_request_id(id.clone());
        }
        event
    }
}

/// Replace the request path with its canonical form, keeping the query.
fn rewrite_path(req: &mut Request<Body>, path: &str) -> Result<(), GatewayError> {
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };

    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|_| GatewayError::BadRequest("Invalid request path".to_string()))?,
    );
    *req.uri_mut() =
        Uri::from_parts(parts).map_err(|e| GatewayError::Internal(format!("uri rewrite: {}", e)))?;
    Ok(())
}

/// Axum middleware running [`EdgeFilters`] in front of the router.
///
/// The path is canonicalized first and rewritten on the request, so every
/// stage and the proxy see the same string. Client-supplied `X-User-*`
/// headers are always dropped, and the bearer credential is consumed here
/// rather than forwarded.
pub async fn edge_filter(
    State(filters): State<Arc<EdgeFilters>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let request_id = req.extensions().get::<RequestId>().map(|id| id.0.clone());

    let path = match path_match::canonicalize(req.uri().path()) {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(path = %req.uri().path(), error = %e, "Rejected non-canonical path");
            return GatewayError::BadRequest(format!("Invalid request path: {}", e)).into_response();
        }
    };
    if path != req.uri().path() {
        if let Err(e) = rewrite_path(&mut req, &path) {
            return e.into_response();
        }
    }

    strip_identity_headers(req.headers_mut());

    let mut ctx = RequestContext::new(path, rate_key::client_ip(req.headers(), peer));
    ctx.request_id = request_id;

    if let Err(e) = filters.run(&mut ctx, req.headers()).await {
        return e.into_response();
    }

    let headers = req.headers_mut();
    headers.remove(header::AUTHORIZATION);
    if let Some(claims) = &ctx.identity {
        inject_identity(headers, claims);
    }

    next.run(req).await
}
