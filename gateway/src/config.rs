use config::{Config as ConfigLoader, ConfigError, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::policy::RateLimitPolicy;

/// Development signing key. Production mode refuses to start with it.
pub const DEV_JWT_SECRET: &str = "eldercare-dev-secret-do-not-use-in-production";

/// HS256 keys shorter than the hash output are rejected.
pub const MIN_JWT_SECRET_BYTES: usize = 32;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub blacklist: BlacklistConfig,
    pub routes: RoutesConfig,
    pub proxy: ProxyConfig,
    pub security: SecurityConfig,
    pub telemetry: TelemetryConfig,
}

/// Validation errors for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid port: {0}")]
    InvalidPort(u16),
    #[error("JWT secret must be at least {MIN_JWT_SECRET_BYTES} bytes, got {0}")]
    WeakJwtSecret(usize),
    #[error("Invalid store URL: {0}")]
    InvalidStoreUrl(String),
    #[error("Store timeout must be > 0")]
    InvalidStoreTimeout,
    #[error("Invalid rate limit for {0}: replenish_rate must be > 0")]
    InvalidRateLimit(String),
    #[error("Duplicate rate limit pattern: {0}")]
    DuplicatePolicy(String),
    #[error("Duplicate route pattern: {0}")]
    DuplicateRoute(String),
    #[error("Invalid upstream URL for route {0}: {1}")]
    InvalidRouteUrl(String, String),
    #[error("Proxy timeout must be > 0")]
    InvalidProxyTimeout,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    pub key_prefix: String,
    /// Upper bound for one store round-trip.
    pub timeout_ms: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: String::new(),
            timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// Clock skew tolerated on `exp`.
    pub leeway_secs: u64,
    pub public_paths: Vec<String>,
    pub admin_paths: Vec<String>,
    pub super_admin_paths: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
            leeway_secs: 0,
            public_paths: strings(&[
                "/health",
                "/metrics",
                "/api/auth/**",
                "/api/v1/users/login",
                "/api/v1/users/register",
                "/actuator/**",
            ]),
            admin_paths: strings(&[
                "/api/v1/users/statistics",
                "/api/v1/alerts/rules/**",
                "/api/v1/devices/manage/**",
            ]),
            super_admin_paths: strings(&["/api/v1/admin/**"]),
        }
    }
}

/// What a store-backed stage does when the store cannot answer.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    FailOpen,
    FailClosed,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub on_store_error: FailurePolicy,
    pub policies: Vec<RateLimitPolicy>,
    pub fallback: RateLimitPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_store_error: FailurePolicy::FailOpen,
            policies: RateLimitPolicy::defaults(),
            fallback: RateLimitPolicy::default_fallback(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BlacklistConfig {
    pub enabled: bool,
    pub on_store_error: FailurePolicy,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_store_error: FailurePolicy::FailOpen,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub name: String,
    /// `prefix/**` or an exact path.
    pub path: String,
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RoutesConfig {
    pub upstreams: Vec<RouteConfig>,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        let route = |name: &str, path: &str, port: u16| RouteConfig {
            name: name.to_string(),
            path: path.to_string(),
            url: format!("http://localhost:{}", port),
        };
        Self {
            upstreams: vec![
                route("user-service", "/api/auth/**", 8081),
                route("user-service", "/api/v1/users/**", 8081),
                route("device-service", "/api/v1/devices/**", 8082),
                route("monitoring-service", "/api/v1/monitoring/**", 8083),
                route("alert-service", "/api/v1/alerts/**", 8084),
                route("history-service", "/api/v1/history/**", 8085),
                route("notification-service", "/api/v1/notifications/**", 8086),
            ],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    pub timeout_secs: u64,
    pub max_body_mb: u64,
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_body_bytes(&self) -> usize {
        (self.max_body_mb * 1024 * 1024) as usize
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_body_mb: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub cors_enabled: bool,
    /// Empty denies all cross-origin requests.
    pub allowed_origins: Vec<String>,
}

impl SecurityConfig {
    pub fn is_cors_permissive(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub service_name: String,
    pub otlp_endpoint: Option<String>,
    pub sample_rate: f64,
}

impl TelemetryConfig {
    /// `OTEL_EXPORTER_OTLP_ENDPOINT` wins over the configured endpoint.
    pub fn get_otlp_endpoint(&self) -> Option<String> {
        std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.otlp_endpoint.clone())
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "eldercare-gateway".to_string(),
            otlp_endpoint: None,
            sample_rate: 1.0,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (ELDERCARE__SERVER__PORT, etc.)
    /// 2. Config file specified by ELDERCARE_CONFIG_PATH
    /// 3. gateway/config.toml
    /// 4. config.toml in current directory
    /// 5. Default values
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_paths(&["config", "gateway/config"])
    }

    pub fn load_from_paths(paths: &[&str]) -> Result<Self, ConfigError> {
        let mut builder = ConfigLoader::builder();

        for path in paths {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        if let Ok(custom_path) = std::env::var("ELDERCARE_CONFIG_PATH") {
            if Path::new(&custom_path).exists() {
                builder = builder.add_source(File::with_name(&custom_path).required(true));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ELDERCARE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.server.port == 0 {
            return Err(ConfigValidationError::InvalidPort(self.server.port));
        }

        let secret_len = self.auth.jwt_secret.len();
        if secret_len < MIN_JWT_SECRET_BYTES {
            return Err(ConfigValidationError::WeakJwtSecret(secret_len));
        }

        if self.store.backend == StoreBackend::Redis
            && !self.store.redis_url.starts_with("redis://")
            && !self.store.redis_url.starts_with("rediss://")
        {
            return Err(ConfigValidationError::InvalidStoreUrl(
                self.store.redis_url.clone(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(ConfigValidationError::InvalidStoreTimeout);
        }

        let mut seen = HashSet::new();
        for policy in self
            .rate_limit
            .policies
            .iter()
            .chain(std::iter::once(&self.rate_limit.fallback))
        {
            if policy.replenish_rate == 0 {
                return Err(ConfigValidationError::InvalidRateLimit(policy.path.clone()));
            }
            if !seen.insert(policy.path.trim()) {
                return Err(ConfigValidationError::DuplicatePolicy(policy.path.clone()));
            }
        }

        let mut seen = HashSet::new();
        for route in &self.routes.upstreams {
            if !seen.insert(route.path.trim()) {
                return Err(ConfigValidationError::DuplicateRoute(route.path.clone()));
            }
            if reqwest::Url::parse(&route.url).is_err()
                || !(route.url.starts_with("http://") || route.url.starts_with("https://"))
            {
                return Err(ConfigValidationError::InvalidRouteUrl(
                    route.name.clone(),
                    route.url.clone(),
                ));
            }
        }

        if self.proxy.timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidProxyTimeout);
        }

        Ok(())
    }

    pub fn log_summary(&self) {
        tracing::info!(
            host = %self.server.host,
            port = self.server.port,
            "Server"
        );
        tracing::info!(
            backend = ?self.store.backend,
            prefix = %self.store.key_prefix,
            timeout_ms = self.store.timeout_ms,
            "Shared store"
        );
        tracing::info!(
            public = self.auth.public_paths.len(),
            admin = self.auth.admin_paths.len(),
            super_admin = self.auth.super_admin_paths.len(),
            leeway_secs = self.auth.leeway_secs,
            "Authentication"
        );
        if self.rate_limit.enabled {
            tracing::info!(
                policies = self.rate_limit.policies.len(),
                fallback_rate = self.rate_limit.fallback.replenish_rate,
                fallback_burst = self.rate_limit.fallback.burst_capacity,
                on_store_error = ?self.rate_limit.on_store_error,
                "Rate limiting"
            );
        } else {
            tracing::info!("Rate limiting: disabled");
        }
        tracing::info!(
            enabled = self.blacklist.enabled,
            on_store_error = ?self.blacklist.on_store_error,
            "Blacklist"
        );
        for route in &self.routes.upstreams {
            tracing::info!(name = %route.name, path = %route.path, url = %route.url, "Route");
        }
    }
}
