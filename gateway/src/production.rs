//! Production Mode Validation
//!
//! Fails startup in production mode when the edge would run with a
//! development credential or with state that is not shared between replicas.

use crate::config::{Config, StoreBackend, DEV_JWT_SECRET};
use std::env;

#[derive(Debug, Default)]
pub struct ProductionValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ProductionValidation {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

/// `ELDERCARE_PRODUCTION=true|1` or `ELDERCARE_ENV=production|prod`.
pub fn is_production_mode() -> bool {
    env::var("ELDERCARE_PRODUCTION")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
        || env::var("ELDERCARE_ENV")
            .map(|v| v == "production" || v == "prod")
            .unwrap_or(false)
}

pub fn validate_production_config(config: &Config) -> ProductionValidation {
    let mut validation = ProductionValidation::default();

    if config.auth.jwt_secret == DEV_JWT_SECRET {
        validation.add_error(
            "JWT secret is the development default. Set ELDERCARE__AUTH__JWT_SECRET",
        );
    }

    if config.store.backend == StoreBackend::Memory {
        validation.add_error(
            "In-memory store keeps blacklist and rate limits per instance. Use the redis backend",
        );
    }

    if config.security.is_cors_permissive() {
        validation.add_error("CORS allows all origins (*). List specific origins instead");
    }

    if config.rate_limit.on_store_error == crate::config::FailurePolicy::FailOpen {
        validation.add_warning("Rate limiting fails open when Redis is unreachable");
    }
    if config.blacklist.on_store_error == crate::config::FailurePolicy::FailOpen {
        validation.add_warning("Blacklist checks fail open when Redis is unreachable");
    }

    if !config.rate_limit.enabled {
        validation.add_warning("Rate limiting is disabled");
    }

    validation.add_warning(
        "Client IPs are taken from X-Forwarded-For; only deploy behind a proxy that overwrites it",
    );

    validation
}

/// Fail on errors in production mode; log them as warnings otherwise.
pub fn enforce_production_validation(config: &Config) -> Result<(), String> {
    let in_production = is_production_mode();
    let validation = validate_production_config(config);

    for warning in &validation.warnings {
        tracing::warn!("Production warning: {}", warning);
    }

    if !validation.has_errors() {
        if in_production {
            tracing::info!("Production validation passed");
        }
        return Ok(());
    }

    if in_production {
        for error in &validation.errors {
            tracing::error!("Production validation error: {}", error);
        }
        return Err(format!(
            "Production validation failed with {} error(s):\n  - {}",
            validation.errors.len(),
            validation.errors.join("\n  - ")
        ));
    }

    for error in &validation.errors {
        tracing::warn!("Would fail in production: {}", error);
    }
    Ok(())
}
