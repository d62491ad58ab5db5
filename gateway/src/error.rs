use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::blacklist::BlacklistScope;

/// Seconds a throttled client is told to wait, both in the body and in `Retry-After`.
pub const RETRY_AFTER_SECS: u64 = 60;

/// Terminal outcomes of the edge filter chain and the proxy.
///
/// Messages are intentionally coarse: callers never learn why a credential
/// was rejected, only that it was.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(&'static str),

    #[error("Insufficient permissions")]
    Unauthorized,

    #[error("Blacklisted {0}")]
    Blacklisted(BlacklistScope),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Shared store unavailable")]
    StoreUnavailable,

    #[error("No upstream route for {0}")]
    NoRoute(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream timeout")]
    UpstreamTimeout,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub const MISSING_CREDENTIAL: &str = "Missing or malformed bearer credential";
pub const INVALID_CREDENTIAL: &str = "Credential is invalid or has expired";

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Unauthorized | GatewayError::Blacklisted(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoRoute(_) | GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message shown to the client.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Unauthenticated(msg) => (*msg).to_string(),
            // Blacklisting is indistinguishable from a role failure to the caller.
            GatewayError::Unauthorized | GatewayError::Blacklisted(_) => {
                "Insufficient permissions".to_string()
            }
            GatewayError::RateLimited => "Too many requests, please retry later".to_string(),
            GatewayError::StoreUnavailable => "Service temporarily unavailable".to_string(),
            GatewayError::NoRoute(_) => "No service is routed for this path".to_string(),
            GatewayError::NotFound(_) => "Resource not found".to_string(),
            GatewayError::Upstream(_) => "Upstream service unavailable".to_string(),
            GatewayError::UpstreamTimeout => "Upstream service timed out".to_string(),
            GatewayError::BadRequest(msg) => msg.clone(),
            GatewayError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

/// JSON body written for every rejection.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub code: u16,
    pub message: String,
    pub timestamp: String,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorBody {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code: status.as_u16(),
            message: message.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            retry_after: None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            GatewayError::Upstream(detail) => {
                tracing::warn!(detail = %detail, "Upstream request failed");
            }
            GatewayError::Internal(detail) => {
                tracing::error!("Internal error: {}", detail);
            }
            _ => {}
        }

        let mut body = ErrorBody::new(status, self.public_message());
        if matches!(self, GatewayError::RateLimited) {
            body.retry_after = Some(RETRY_AFTER_SECS);
        }

        let mut response = (status, Json(body)).into_response();
        if matches!(self, GatewayError::RateLimited) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unauthenticated_body_shape() {
        let response = GatewayError::Unauthenticated(INVALID_CREDENTIAL).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());

        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], 401);
        assert_eq!(json["message"], INVALID_CREDENTIAL);
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
        assert!(json.get("retryAfter").is_none());
    }

    #[tokio::test]
    async fn rate_limited_carries_retry_after() {
        let response = GatewayError::RateLimited.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "60");

        let json = body_json(response).await;
        assert_eq!(json["code"], 429);
        assert_eq!(json["retryAfter"], 60);
    }

    #[tokio::test]
    async fn blacklisted_looks_like_insufficient_role() {
        let denied = body_json(GatewayError::Unauthorized.into_response()).await;

        for scope in [BlacklistScope::Ip, BlacklistScope::User] {
            let response = GatewayError::Blacklisted(scope).into_response();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            let json = body_json(response).await;
            assert_eq!(json["code"], 403);
            assert_eq!(json["message"], denied["message"]);
        }
    }

    #[tokio::test]
    async fn not_found_hides_resource_key() {
        let response = GatewayError::NotFound("blacklist:ip:10.0.0.1".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["code"], 404);
        assert_eq!(json["message"], "Resource not found");
    }

    #[test]
    fn internal_detail_is_not_exposed() {
        let err = GatewayError::Internal("redis://secret@host".to_string());
        assert_eq!(err.public_message(), "Internal server error");
        let err = GatewayError::Upstream("connect refused 10.0.0.3:8081".to_string());
        assert!(!err.public_message().contains("10.0.0.3"));
    }
}
