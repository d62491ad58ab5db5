use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::Instrument;

use crate::metrics;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation id carried in request extensions and echoed on the response.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Longest inbound request id that is propagated as-is.
const MAX_REQUEST_ID_LEN: usize = 128;

fn inbound_request_id(req: &Request<Body>) -> Option<String> {
    let value = req.headers().get(REQUEST_ID_HEADER)?.to_str().ok()?;
    let well_formed = !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    well_formed.then(|| value.to_string())
}

/// Propagate a well-formed inbound `X-Request-ID`, otherwise assign a UUID.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let request_id =
        inbound_request_id(&req).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Request logging middleware - logs requests and records metrics
pub async fn request_logging(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let request_id = req.extensions().get::<RequestId>().map(|id| id.0.clone());

    let span = tracing::info_span!(
        "http_request",
        otel.kind = "server",
        http.method = %method,
        http.route = %path,
        request_id = request_id.as_deref().unwrap_or("-"),
    );

    metrics::HTTP_REQUESTS_IN_FLIGHT.inc();
    let response = next.run(req).instrument(span.clone()).await;
    metrics::HTTP_REQUESTS_IN_FLIGHT.dec();

    let duration = start.elapsed();
    let status = response.status().as_u16();

    let endpoint = normalize_endpoint(&path);
    metrics::record_request(&method, &endpoint, status, duration.as_secs_f64());

    span.in_scope(|| {
        tracing::info!(
            status,
            duration_ms = duration.as_millis() as u64,
            "request completed"
        );
    });

    response
}

/// Collapse ids in paths so metric labels stay bounded,
/// e.g. /api/v1/users/42 -> /api/v1/users/:id
pub fn normalize_endpoint(path: &str) -> String {
    path.split('/')
        .map(|part| {
            let numeric = !part.is_empty() && part.chars().all(|c| c.is_ascii_digit());
            if numeric || uuid::Uuid::parse_str(part).is_ok() {
                ":id"
            } else if part.len() > 40 {
                ":token"
            } else {
                part
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
