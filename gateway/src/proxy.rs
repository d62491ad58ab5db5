//! Path-prefix reverse proxy to the backend services.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, Request},
    response::Response,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{Config, RouteConfig};
use crate::error::GatewayError;
use crate::metrics;
use crate::path_match::{PathPattern, PathTable};

/// Headers that describe one hop and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub base_url: String,
}

/// Route table compiled once; the most specific pattern wins.
#[derive(Debug, Clone)]
pub struct RouteTable {
    table: PathTable<Upstream>,
}

impl RouteTable {
    pub fn new(routes: &[RouteConfig]) -> Self {
        let table = PathTable::new(routes.iter().map(|r| {
            (
                PathPattern::parse(&r.path),
                Upstream {
                    name: r.name.clone(),
                    base_url: r.url.trim_end_matches('/').to_string(),
                },
            )
        }));
        Self { table }
    }

    pub fn lookup(&self, path: &str) -> Option<&Upstream> {
        self.table.lookup(path)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to build upstream HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

pub struct UpstreamProxy {
    routes: RouteTable,
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl UpstreamProxy {
    pub fn new(config: &Config) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(config.proxy.timeout())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            routes: RouteTable::new(&config.routes.upstreams),
            client,
            max_body_bytes: config.proxy.max_body_bytes(),
        })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub async fn forward(&self, req: Request<Body>) -> Result<Response, GatewayError> {
        let path = req.uri().path().to_string();
        let upstream = self
            .routes
            .lookup(&path)
            .ok_or_else(|| GatewayError::NoRoute(path.clone()))?;

        let mut url = format!("{}{}", upstream.base_url, path);
        if let Some(query) = req.uri().query() {
            url.push('?');
            url.push_str(query);
        }

        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|_| GatewayError::BadRequest("Request body too large".to_string()))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        let start = Instant::now();
        let result = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await;
        let elapsed = start.elapsed().as_secs_f64();

        let upstream_resp = match result {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                metrics::record_upstream(&upstream.name, "timeout", elapsed);
                tracing::warn!(upstream = %upstream.name, path = %path, "Upstream timed out");
                return Err(GatewayError::UpstreamTimeout);
            }
            Err(e) => {
                metrics::record_upstream(&upstream.name, "error", elapsed);
                return Err(GatewayError::Upstream(format!("{}: {}", upstream.name, e)));
            }
        };

        let status = upstream_resp.status();
        metrics::record_upstream(&upstream.name, status.as_str(), elapsed);
        tracing::debug!(upstream = %upstream.name, status = status.as_u16(), "Forwarded request");

        let mut response_headers = upstream_resp.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream_resp.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Fallback handler: everything not served locally goes upstream.
pub async fn forward(
    State(proxy): State<Arc<UpstreamProxy>>,
    req: Request<Body>,
) -> Result<Response, GatewayError> {
    proxy.forward(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_default_config() {
        let proxy = UpstreamProxy::new(&Config::default()).unwrap();
        assert_eq!(proxy.routes().len(), 7);
        assert_eq!(proxy.max_body_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn default_routes() {
        let config = Config::default();
        let routes = RouteTable::new(&config.routes.upstreams);

        let upstream = routes.lookup("/api/v1/devices/12/readings").unwrap();
        assert_eq!(upstream.name, "device-service");
        assert_eq!(upstream.base_url, "http://localhost:8082");

        assert_eq!(routes.lookup("/api/auth/login").unwrap().base_url, "http://localhost:8081");
        assert_eq!(routes.lookup("/api/v1/notifications").unwrap().name, "notification-service");
        assert!(routes.lookup("/api/v2/devices").is_none());
        assert_eq!(routes.len(), 7);
    }

    #[test]
    fn specific_route_overrides_broad_one() {
        let routes = RouteTable::new(&[
            RouteConfig {
                name: "api".to_string(),
                path: "/api/**".to_string(),
                url: "http://api:80/".to_string(),
            },
            RouteConfig {
                name: "export".to_string(),
                path: "/api/history/export/**".to_string(),
                url: "http://export:80".to_string(),
            },
        ]);
        assert_eq!(routes.lookup("/api/history/export/x").unwrap().name, "export");
        assert_eq!(routes.lookup("/api/history").unwrap().base_url, "http://api:80");
    }

    #[test]
    fn hop_by_hop_headers_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::HOST, "gateway".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONTENT_TYPE).is_some());
    }
}
