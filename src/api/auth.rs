//! Bearer token checking for shell sessions.
//!
//! Sessions never issue tokens; they only need a way to turn the `token`
//! query parameter into [`Claims`] and to ask, repeatedly, whether those
//! claims still hold. [`TokenChecker`] is that capability and [`JwtChecker`]
//! is the HS256 implementation the server wires in.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{DecodingKey, Validation};
use thiserror::Error;

use crate::config::JwtConfig;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing token")]
    Missing,

    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Wire format of the JWT payload.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct TokenClaims {
    /// Subject (user id)
    sub: String,
    /// Username (for display/auditing)
    #[serde(default)]
    usr: String,
    /// Issuer
    #[serde(default)]
    iss: String,
    /// Issued-at unix seconds
    iat: i64,
    /// Expiration unix seconds
    exp: i64,
}

/// Identity and validity window of an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub subject: String,
    pub username: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Claims {
    /// True while `at` lies inside `[issued_at, expires_at)`.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.issued_at && at < self.expires_at
    }
}

/// Parses a raw bearer token into claims.
pub trait TokenChecker: Send + Sync {
    fn parse_token(&self, token: &str) -> Result<Claims, AuthError>;
}

/// HS256 JWT checker bound to one secret and issuer.
pub struct JwtChecker {
    key: DecodingKey,
    validation: Validation,
}

impl JwtChecker {
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::default();
        validation.set_issuer(&[config.issuer.as_str()]);
        Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }
}

impl TokenChecker for JwtChecker {
    fn parse_token(&self, token: &str) -> Result<Claims, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = jsonwebtoken::decode::<TokenClaims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;
        let claims = data.claims;

        let issued_at = timestamp(claims.iat)?;
        let expires_at = timestamp(claims.exp)?;
        Ok(Claims {
            subject: claims.sub,
            username: claims.usr,
            issued_at,
            expires_at,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, AuthError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| AuthError::Invalid(format!("timestamp out of range: {}", secs)))
}

/// Short, log-safe prefix of a token.
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    if token.chars().count() > 8 {
        format!("{}…", prefix)
    } else {
        prefix
    }
}
