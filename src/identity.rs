//! Request identity resolution.
//!
//! Requests are grouped under `user:<sub>` when they carry a verified access
//! token and under `ip:<peer>` otherwise. Resolution never fails: any token
//! problem silently downgrades to the address-based identity.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderMap};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Key under which requests share counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Identity of an authenticated user.
    pub fn user(id: &str) -> Self {
        Self(format!("user:{id}"))
    }

    /// Identity of an anonymous caller.
    pub fn ip(addr: impl fmt::Display) -> Self {
        Self(format!("ip:{addr}"))
    }

    /// Used when neither a token nor a peer address is available.
    pub fn unknown() -> Self {
        Self::ip("unknown")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_user(&self) -> bool {
        self.0.starts_with("user:")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Claims this service reads from a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(rename = "type", default)]
    pub token_type: String,
    pub exp: u64,
}

/// Reasons a bearer token was not accepted.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no verification key configured")]
    NoKey,
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// Verifies a bearer token and returns its claims.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, TokenError>;
}

/// HMAC-SHA256 JWT verification with a shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn hs256(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(data.claims)
    }
}

/// Rejects every token. Used when no secret is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVerifier;

impl TokenVerifier for NoVerifier {
    fn verify(&self, _token: &str) -> Result<Claims, TokenError> {
        Err(TokenError::NoKey)
    }
}

/// Derives the [`Identity`] of an inbound request.
#[derive(Clone)]
pub struct IdentityResolver {
    verifier: Arc<dyn TokenVerifier>,
}

impl IdentityResolver {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// Build a resolver from an optional HS256 secret.
    pub fn from_secret(secret: Option<&str>) -> Self {
        match secret {
            Some(secret) => Self::new(Arc::new(JwtVerifier::hs256(secret))),
            None => Self::new(Arc::new(NoVerifier)),
        }
    }

    /// Resolve the identity for a request's headers and peer address.
    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Identity {
        if let Some(token) = bearer_token(headers) {
            match self.verifier.verify(token) {
                Ok(claims) if claims.token_type == "access" => return Identity::user(&claims.sub),
                Ok(claims) => {
                    debug!(token_type = %claims.token_type, "Ignoring non-access token");
                }
                Err(e) => {
                    debug!(error = %e, "Bearer token rejected, using peer address");
                }
            }
        }

        match peer {
            Some(addr) => Identity::ip(addr.ip()),
            None => Identity::unknown(),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
