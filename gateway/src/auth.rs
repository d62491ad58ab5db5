//! Bearer-token authentication and role-based path authorization.
//!
//! Tokens are HS256 JWTs issued by the user service. A request on a public
//! path passes anonymously; anything else needs a valid token, and admin or
//! super-admin paths additionally need the matching role. On success the
//! verified identity is forwarded upstream as `X-User-*` headers.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::AuthConfig;
use crate::error::{GatewayError, INVALID_CREDENTIAL, MISSING_CREDENTIAL};
use crate::metrics;
use crate::path_match::PathMatcher;

pub const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");
pub const USER_ROLE_HEADER: HeaderName = HeaderName::from_static("x-user-role");
pub const USER_NAME_HEADER: HeaderName = HeaderName::from_static("x-user-name");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    SuperAdmin,
    Admin,
    FamilyMember,
    Caregiver,
    Doctor,
    Elderly,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "SUPER_ADMIN",
            Role::Admin => "ADMIN",
            Role::FamilyMember => "FAMILY_MEMBER",
            Role::Caregiver => "CAREGIVER",
            Role::Doctor => "DOCTOR",
            Role::Elderly => "ELDERLY",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUPER_ADMIN" => Ok(Role::SuperAdmin),
            "ADMIN" => Ok(Role::Admin),
            "FAMILY_MEMBER" => Ok(Role::FamilyMember),
            "CAREGIVER" => Ok(Role::Caregiver),
            "DOCTOR" => Ok(Role::Doctor),
            "ELDERLY" => Ok(Role::Elderly),
            _ => Err(TokenError::UnknownRole),
        }
    }
}

/// Claims as they appear on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
    exp: i64,
}

/// A verified identity. Only [`TokenValidator::validate`] constructs one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    subject: String,
    role: Role,
    display_name: String,
    issued_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

impl Claims {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token has expired")]
    Expired,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token carries an unknown role")]
    UnknownRole,
    #[error("token could not be encoded: {0}")]
    Encoding(String),
}

impl TokenError {
    /// Label for the auth-failure metric.
    pub fn reason(&self) -> &'static str {
        match self {
            TokenError::Malformed => "malformed",
            TokenError::Expired => "expired",
            TokenError::InvalidSignature => "invalid_signature",
            TokenError::UnknownRole => "unknown_role",
            TokenError::Encoding(_) => "encoding",
        }
    }
}

/// HS256 verifier and issuer sharing one secret with the user service.
#[derive(Clone)]
pub struct TokenValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(secret: &[u8], leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                _ => TokenError::Malformed,
            },
        )?;
        let wire = data.claims;

        let role = wire.role.parse::<Role>()?;
        let expires_at = Utc
            .timestamp_opt(wire.exp, 0)
            .single()
            .ok_or(TokenError::Malformed)?;
        let issued_at = wire.iat.and_then(|iat| Utc.timestamp_opt(iat, 0).single());
        let display_name = wire
            .username
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| wire.sub.clone());

        Ok(Claims {
            subject: wire.sub,
            role,
            display_name,
            issued_at,
            expires_at,
        })
    }

    /// Issue a token in the user service's format.
    pub fn issue(
        &self,
        subject: &str,
        role: Role,
        username: Option<&str>,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            sub: subject.to_string(),
            role: role.as_str().to_string(),
            username: username.map(str::to_string),
            iat: Some(now),
            exp: now + ttl.as_secs() as i64,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Encoding(e.to_string()))
    }
}

/// Path classes compiled from configuration.
#[derive(Debug, Clone)]
pub struct AccessRules {
    public: PathMatcher,
    admin: PathMatcher,
    super_admin: PathMatcher,
}

impl AccessRules {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            public: PathMatcher::new(&config.public_paths),
            admin: PathMatcher::new(&config.admin_paths),
            super_admin: PathMatcher::new(&config.super_admin_paths),
        }
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.public.matches(path)
    }

    /// Whether `role` may access `path`. Super-admin paths are checked first.
    pub fn permits(&self, path: &str, role: Role) -> bool {
        if self.super_admin.matches(path) {
            return role == Role::SuperAdmin;
        }
        if self.admin.matches(path) {
            return role.is_admin();
        }
        true
    }
}

#[derive(Clone)]
pub struct Authenticator {
    validator: TokenValidator,
    rules: AccessRules,
}

impl Authenticator {
    pub fn new(validator: TokenValidator, rules: AccessRules) -> Self {
        Self { validator, rules }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            TokenValidator::new(config.jwt_secret.as_bytes(), config.leeway_secs),
            AccessRules::from_config(config),
        )
    }

    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// Decide whether the request may proceed and under which identity.
    ///
    /// Public paths never reject; a valid token there still yields an
    /// identity so per-user limits apply.
    pub fn authenticate(
        &self,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<Option<Claims>, GatewayError> {
        if self.rules.is_public(path) {
            return Ok(bearer_token(headers).and_then(|token| self.validator.validate(token).ok()));
        }

        let Some(token) = bearer_token(headers) else {
            metrics::record_auth_failure("missing");
            return Err(GatewayError::Unauthenticated(MISSING_CREDENTIAL));
        };

        let claims = self.validator.validate(token).map_err(|e| {
            metrics::record_auth_failure(e.reason());
            tracing::debug!(path = %path, reason = e.reason(), "Rejected credential");
            GatewayError::Unauthenticated(INVALID_CREDENTIAL)
        })?;

        if !self.rules.permits(path, claims.role()) {
            metrics::record_auth_failure("insufficient_role");
            return Err(GatewayError::Unauthorized);
        }

        Ok(Some(claims))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Drop identity headers a client may have forged.
pub fn strip_identity_headers(headers: &mut HeaderMap) {
    headers.remove(USER_ID_HEADER);
    headers.remove(USER_ROLE_HEADER);
    headers.remove(USER_NAME_HEADER);
}

pub fn inject_identity(headers: &mut HeaderMap, claims: &Claims) {
    let pairs = [
        (USER_ID_HEADER, claims.subject()),
        (USER_ROLE_HEADER, claims.role().as_str()),
        (USER_NAME_HEADER, claims.display_name()),
    ];
    for (name, value) in pairs {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => {
                tracing::warn!(header = %name, "Identity value is not a valid header, omitted");
            }
        }
    }
}
