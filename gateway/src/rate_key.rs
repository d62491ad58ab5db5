//! Rate-limit key construction and client address extraction.

use axum::http::HeaderMap;
use std::net::SocketAddr;

use crate::policy::{KeyStrategy, RateLimitPolicy};

const ANONYMOUS: &str = "anonymous";
const UNKNOWN_IP: &str = "unknown";

/// Store key of the bucket that `policy` charges for this request.
pub fn build_key(policy: &RateLimitPolicy, client_ip: &str, user_id: Option<&str>) -> String {
    let user = user_id.unwrap_or(ANONYMOUS);
    match policy.key_strategy {
        KeyStrategy::Ip => format!("rate_limit:ip:{}", client_ip),
        KeyStrategy::User => format!("rate_limit:user:{}", user),
        KeyStrategy::Path => format!("rate_limit:path:{}", policy.path),
        KeyStrategy::Combined => {
            format!("rate_limit:combined:{}:{}:{}", client_ip, user, policy.path)
        }
    }
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}
