//! End-to-end tests for the edge pipeline.
//!
//! Each test builds the full gateway router over the in-memory store and
//! points every route at a real echo service on a random local port. The
//! echo service reports what it received so tests can assert on what the
//! gateway forwarded.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::{Json, Response};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;

use eldercare_gateway::{
    auth::{Role, TokenValidator},
    blacklist::{BlacklistEntry, BlacklistScope},
    build_router,
    config::{Config, FailurePolicy, StoreBackend},
    memory_store::MemoryStore,
    policy::{KeyStrategy, RateLimitPolicy},
    store::{BucketOutcome, EdgeStore, StoreError, WindowOutcome},
    AppState,
};

// ── Test Helpers ────────────────────────────────────────────────

async fn echo(req: Request<Body>) -> Json<Value> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Json(json!({
        "method": req.method().as_str(),
        "path": req.uri().path(),
        "query": req.uri().query(),
        "user_id": header("x-user-id"),
        "user_role": header("x-user-role"),
        "user_name": header("x-user-name"),
        "authorization": header("authorization"),
    }))
}

/// Start the echo upstream on a random port and return its base URL.
async fn start_upstream() -> String {
    let app = Router::new().fallback(echo);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://127.0.0.1:{}", addr.port())
}

/// Default configuration with every route pointed at `upstream` and slow
/// buckets so timing cannot refill them mid-test.
fn test_config(upstream: &str) -> Config {
    let mut config = Config::default();
    config.store.backend = StoreBackend::Memory;
    for route in &mut config.routes.upstreams {
        route.url = upstream.to_string();
    }
    config.rate_limit.policies = vec![
        RateLimitPolicy::new("/api/auth/**", 1, 3, KeyStrategy::User),
        RateLimitPolicy::new("/api/v1/history/**", 1, 2, KeyStrategy::Ip),
    ];
    config
}

struct Gateway {
    app: Router,
    state: AppState,
    tokens: TokenValidator,
}

impl Gateway {
    fn new(config: Config, store: Arc<dyn EdgeStore>) -> Self {
        let tokens = TokenValidator::new(config.auth.jwt_secret.as_bytes(), 0);
        let state = AppState::new(config, store).unwrap();
        Self {
            app: build_router(state.clone()),
            state,
            tokens,
        }
    }

    async fn start() -> Self {
        let upstream = start_upstream().await;
        Self::new(test_config(&upstream), Arc::new(MemoryStore::new()))
    }

    fn token(&self, subject: &str, role: Role) -> String {
        self.tokens
            .issue(subject, role, Some("Test User"), Duration::from_secs(600))
            .unwrap()
    }

    async fn send(&self, req: Request<Body>) -> Response {
        self.app.clone().oneshot(req).await.unwrap()
    }

    async fn get(&self, uri: &str, token: Option<&str>, ip: &str) -> Response {
        let mut builder = Request::builder().uri(uri).header("x-forwarded-for", ip);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }
}

async fn body_json(resp: Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn assert_rejection(resp: Response, status: StatusCode) -> Value {
    assert_eq!(resp.status(), status);
    let json = body_json(resp).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["code"], status.as_u16());
    assert!(json["message"].is_string());
    assert!(json["timestamp"].is_string());
    json
}

/// A store whose every call fails, as if Redis were unreachable.
struct UnreachableStore;

#[async_trait]
impl EdgeStore for UnreachableStore {
    fn backend_name(&self) -> &'static str {
        "unreachable"
    }

    async fn consume_token(&self, _: &str, _: u32, _: u32, _: i64) -> Result<BucketOutcome, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }

    async fn admit_in_window(
        &self,
        _: &str,
        _: u64,
        _: u64,
        _: i64,
        _: &str,
    ) -> Result<WindowOutcome, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }

    async fn exists(&self, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }

    async fn put_blacklist_entry(&self, _: &str, _: &BlacklistEntry, _: i64) -> Result<(), StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }

    async fn get_blacklist_entry(&self, _: &str) -> Result<Option<BlacklistEntry>, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }

    async fn delete(&self, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }

    async fn acquire_lock(&self, _: &str, _: &str, _: u64) -> Result<bool, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }

    async fn release_lock(&self, _: &str, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }

    async fn ping(&self) -> Result<bool, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }
}

// ── Authentication ──────────────────────────────────────────────

#[tokio::test]
async fn public_path_is_forwarded_without_credential() {
    let gw = Gateway::start().await;

    let resp = gw.get("/api/auth/login?next=home", None, "10.0.0.1").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("x-request-id").is_some());

    let json = body_json(resp).await;
    assert_eq!(json["path"], "/api/auth/login");
    assert_eq!(json["query"], "next=home");
    assert_eq!(json["user_id"], Value::Null);
}

#[tokio::test]
async fn forged_identity_header_is_not_forwarded() {
    let gw = Gateway::start().await;

    let req = Request::builder()
        .uri("/api/auth/login")
        .header("x-user-id", "999")
        .header("x-user-role", "SUPER_ADMIN")
        .body(Body::empty())
        .unwrap();
    let json = body_json(gw.send(req).await).await;

    assert_eq!(json["user_id"], Value::Null);
    assert_eq!(json["user_role"], Value::Null);
}

#[tokio::test]
async fn missing_credential_is_401() {
    let gw = Gateway::start().await;

    let resp = gw.get("/api/v1/devices/3", None, "10.0.0.1").await;
    let json = assert_rejection(resp, StatusCode::UNAUTHORIZED).await;
    assert!(json.get("retryAfter").is_none());
}

#[tokio::test]
async fn expired_credential_is_401_for_every_role() {
    let gw = Gateway::start().await;
    let secret = gw.state.config.auth.jwt_secret.clone();

    for role in ["SUPER_ADMIN", "ADMIN", "CAREGIVER"] {
        let claims = json!({
            "sub": "5",
            "role": role,
            "iat": chrono::Utc::now().timestamp() - 7200,
            "exp": chrono::Utc::now().timestamp() - 60,
        });
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let resp = gw.get("/api/v1/alerts/1", Some(&token), "10.0.0.1").await;
        assert_rejection(resp, StatusCode::UNAUTHORIZED).await;
    }
}

#[tokio::test]
async fn role_gates_admin_paths() {
    let gw = Gateway::start().await;

    let caregiver = gw.token("21", Role::Caregiver);
    let resp = gw
        .get("/api/v1/admin/blacklist/ip/10.0.0.9", Some(&caregiver), "10.0.0.1")
        .await;
    assert_rejection(resp, StatusCode::FORBIDDEN).await;

    let resp = gw.get("/api/v1/alerts/rules/4", Some(&caregiver), "10.0.0.1").await;
    assert_rejection(resp, StatusCode::FORBIDDEN).await;

    let root = gw.token("1", Role::SuperAdmin);
    let resp = gw.get("/api/v1/alerts/rules/4", Some(&root), "10.0.0.1").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = gw
        .get("/api/v1/admin/blacklist/ip/10.0.0.9", Some(&root), "10.0.0.1")
        .await;
    // Admitted; there is simply no entry.
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn verified_identity_replaces_credential_upstream() {
    let gw = Gateway::start().await;
    let token = gw.token("42", Role::FamilyMember);

    let req = Request::builder()
        .uri("/api/v1/monitoring/elder/7")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header("x-user-id", "999")
        .body(Body::empty())
        .unwrap();
    let resp = gw.send(req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let json = body_json(resp).await;
    assert_eq!(json["user_id"], "42");
    assert_eq!(json["user_role"], "FAMILY_MEMBER");
    assert_eq!(json["user_name"], "Test User");
    assert_eq!(json["authorization"], Value::Null);
}

// ── Path canonicalization ───────────────────────────────────────

#[tokio::test]
async fn dot_segments_cannot_escape_a_public_prefix() {
    let gw = Gateway::start().await;

    for uri in [
        "/api/auth/../v1/users/5",
        "/api/auth/%2e%2e/v1/users/5",
        "/api/auth/./login",
        "/api/auth%2F..%2Fv1/users/5",
    ] {
        let resp = gw.get(uri, None, "10.0.0.1").await;
        assert_rejection(resp, StatusCode::BAD_REQUEST).await;
    }
}

#[tokio::test]
async fn encoded_admin_path_still_needs_admin_role() {
    let gw = Gateway::start().await;

    let caregiver = gw.token("21", Role::Caregiver);
    let resp = gw.get("/api/v1/alerts/%72ules/4", Some(&caregiver), "10.0.0.1").await;
    assert_rejection(resp, StatusCode::FORBIDDEN).await;

    let resp = gw.get("/api/v1/alerts/rules;x=1/4", Some(&caregiver), "10.0.0.1").await;
    assert_rejection(resp, StatusCode::BAD_REQUEST).await;

    let resp = gw.get("/api/v1//alerts/rules/4", Some(&caregiver), "10.0.0.1").await;
    assert_rejection(resp, StatusCode::BAD_REQUEST).await;

    // An admin reaches the resource under its canonical path.
    let admin = gw.token("2", Role::Admin);
    let resp = gw
        .get("/api/v1/alerts/%72ules/4?page=1", Some(&admin), "10.0.0.1")
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["path"], "/api/v1/alerts/rules/4");
    assert_eq!(json["query"], "page=1");
}

// ── Blacklist ───────────────────────────────────────────────────

#[tokio::test]
async fn blacklisted_ip_rejected_until_removed() {
    let gw = Gateway::start().await;
    gw.state
        .blacklist
        .add(BlacklistScope::Ip, "203.0.113.5", "scraping", 0)
        .await
        .unwrap();

    for _ in 0..3 {
        let resp = gw.get("/api/auth/login", None, "203.0.113.5").await;
        assert_rejection(resp, StatusCode::FORBIDDEN).await;
    }
    // Other clients are unaffected.
    let resp = gw.get("/api/auth/login", None, "203.0.113.6").await;
    assert_eq!(resp.status(), StatusCode::OK);

    gw.state.blacklist.remove(BlacklistScope::Ip, "203.0.113.5").await.unwrap();
    let resp = gw.get("/api/auth/login", None, "203.0.113.5").await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn blacklisted_user_rejected_from_any_ip() {
    let gw = Gateway::start().await;
    let token = gw.token("77", Role::Elderly);
    gw.state
        .blacklist
        .add(BlacklistScope::User, "77", "compromised", 0)
        .await
        .unwrap();

    for ip in ["10.0.0.1", "10.0.0.2"] {
        let resp = gw.get("/api/v1/devices/1", Some(&token), ip).await;
        assert_rejection(resp, StatusCode::FORBIDDEN).await;
    }
}

// ── Rate limiting ───────────────────────────────────────────────

#[tokio::test]
async fn exhausted_bucket_is_429_with_retry_after() {
    let gw = Gateway::start().await;
    let token = gw.token("u1", Role::Elderly);

    for _ in 0..3 {
        let resp = gw.get("/api/auth/refresh", Some(&token), "10.0.0.1").await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = gw.get("/api/auth/refresh", Some(&token), "10.0.0.1").await;
    assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "60");
    let json = assert_rejection(resp, StatusCode::TOO_MANY_REQUESTS).await;
    assert_eq!(json["retryAfter"], 60);

    // The bucket is per user, not per address.
    let other = gw.token("u2", Role::Elderly);
    let resp = gw.get("/api/auth/refresh", Some(&other), "10.0.0.1").await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn rejected_requests_consume_no_tokens() {
    let gw = Gateway::start().await;
    let token = gw.token("8", Role::Doctor);
    gw.state
        .blacklist
        .add(BlacklistScope::Ip, "198.51.100.4", "port scan", 0)
        .await
        .unwrap();

    for _ in 0..10 {
        let resp = gw.get("/api/v1/history/8", Some(&token), "198.51.100.4").await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
    gw.state.blacklist.remove(BlacklistScope::Ip, "198.51.100.4").await.unwrap();

    // Burst of two is still intact.
    for _ in 0..2 {
        let resp = gw.get("/api/v1/history/8", Some(&token), "198.51.100.4").await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let resp = gw.get("/api/v1/history/8", Some(&token), "198.51.100.4").await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
}

// ── Store failures ──────────────────────────────────────────────

#[tokio::test]
async fn unreachable_store_fails_open_by_default() {
    let upstream = start_upstream().await;
    let gw = Gateway::new(test_config(&upstream), Arc::new(UnreachableStore));

    let resp = gw.get("/api/auth/login", None, "10.0.0.1").await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn unreachable_store_fails_closed_when_configured() {
    let upstream = start_upstream().await;
    let mut config = test_config(&upstream);
    config.blacklist.on_store_error = FailurePolicy::FailClosed;
    let gw = Gateway::new(config, Arc::new(UnreachableStore));

    let resp = gw.get("/api/auth/login", None, "10.0.0.1").await;
    assert_rejection(resp, StatusCode::SERVICE_UNAVAILABLE).await;
}

#[tokio::test]
async fn authentication_never_depends_on_the_store() {
    let upstream = start_upstream().await;
    let gw = Gateway::new(test_config(&upstream), Arc::new(UnreachableStore));

    let resp = gw.get("/api/v1/devices/1", None, "10.0.0.1").await;
    assert_rejection(resp, StatusCode::UNAUTHORIZED).await;
}

// ── Admin endpoints ─────────────────────────────────────────────

#[tokio::test]
async fn admin_blacklist_lifecycle() {
    let gw = Gateway::start().await;
    let root = gw.token("1", Role::SuperAdmin);
    let uri = "/api/v1/admin/blacklist/ip/192.0.2.50";

    let req = Request::builder()
        .method("PUT")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", root))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"reason":"credential stuffing","ttl_secs":3600}"#))
        .unwrap();
    assert_eq!(gw.send(req).await.status(), StatusCode::NO_CONTENT);

    let resp = gw.get(uri, Some(&root), "10.0.0.1").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["scope"], "ip");
    assert_eq!(json["reason"], "credential stuffing");
    assert!(json["ttl_secs"].as_i64().unwrap() <= 3600);

    let resp = gw.get("/api/auth/login", None, "192.0.2.50").await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = Request::builder()
        .method("DELETE")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", root))
        .body(Body::empty())
        .unwrap();
    assert_eq!(gw.send(req).await.status(), StatusCode::NO_CONTENT);

    let resp = gw.get("/api/auth/login", None, "192.0.2.50").await;
    assert_eq!(resp.status(), StatusCode::OK);

    let adds = gw
        .state
        .audit
        .get_by_action(eldercare_gateway::audit::AuditAction::BlacklistAdd, 10)
        .await;
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].actor, "1");
}

#[tokio::test]
async fn admin_rejects_unknown_scope() {
    let gw = Gateway::start().await;
    let root = gw.token("1", Role::SuperAdmin);

    let resp = gw
        .get("/api/v1/admin/blacklist/device/abc", Some(&root), "10.0.0.1")
        .await;
    assert_rejection(resp, StatusCode::BAD_REQUEST).await;
}

#[tokio::test]
async fn admin_errors_are_structured() {
    let gw = Gateway::start().await;
    let root = gw.token("1", Role::SuperAdmin);
    let uri = "/api/v1/admin/blacklist/user/404";

    let resp = gw.get(uri, Some(&root), "10.0.0.1").await;
    assert_rejection(resp, StatusCode::NOT_FOUND).await;

    let req = Request::builder()
        .method("DELETE")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", root))
        .body(Body::empty())
        .unwrap();
    assert_rejection(gw.send(req).await, StatusCode::NOT_FOUND).await;

    let req = Request::builder()
        .method("PUT")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", root))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"reason": "#))
        .unwrap();
    assert_rejection(gw.send(req).await, StatusCode::BAD_REQUEST).await;

    let req = Request::builder()
        .method("PUT")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", root))
        .body(Body::from(r#"{"reason":"spam"}"#))
        .unwrap();
    // Missing content type.
    assert_rejection(gw.send(req).await, StatusCode::BAD_REQUEST).await;
}

// ── Routing and local endpoints ─────────────────────────────────

#[tokio::test]
async fn unrouted_path_is_404() {
    let gw = Gateway::start().await;
    let token = gw.token("3", Role::Doctor);

    let resp = gw.get("/api/v9/unknown", Some(&token), "10.0.0.1").await;
    assert_rejection(resp, StatusCode::NOT_FOUND).await;
}

#[tokio::test]
async fn dead_upstream_is_502() {
    // Bind and drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
    drop(listener);

    let gw = Gateway::new(test_config(&dead), Arc::new(MemoryStore::new()));
    let resp = gw.get("/api/auth/login", None, "10.0.0.1").await;
    assert_rejection(resp, StatusCode::BAD_GATEWAY).await;
}

#[tokio::test]
async fn slow_upstream_hits_configured_timeout() {
    let slow = Router::new().fallback(|| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        "late"
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
    tokio::spawn(async move {
        axum::serve(listener, slow).await.unwrap();
    });

    let mut config = test_config(&url);
    config.proxy.timeout_secs = 1;
    let gw = Gateway::new(config, Arc::new(MemoryStore::new()));

    let resp = gw.get("/api/auth/login", None, "10.0.0.1").await;
    assert_rejection(resp, StatusCode::GATEWAY_TIMEOUT).await;
}

#[tokio::test]
async fn health_reports_store() {
    let gw = Gateway::start().await;

    let resp = gw.get("/health", None, "10.0.0.1").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["store_backend"], "memory");
}

#[tokio::test]
async fn metrics_are_exposed() {
    let gw = Gateway::start().await;
    gw.get("/api/v1/devices/1", None, "10.0.0.1").await;

    let resp = gw.get("/metrics", None, "10.0.0.1").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let text = String::from_utf8(
        resp.into_body().collect().await.unwrap().to_bytes().to_vec(),
    )
    .unwrap();
    assert!(text.contains("auth_failures_total"));
}
