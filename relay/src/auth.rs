//! Connection credentials.
//!
//! The relay does not authorize anything itself. It captures the credential
//! presented when a stream is opened, checks that later submissions present
//! the same one, and forwards it to the backend service.
//!
//! Accepted forms:
//! - `Authorization: Bearer <token>`
//! - `Authorization: token <key>:<secret>`
//! - `Authorization: Basic base64(<key>:<secret>)`
//! - `X-API-Key: <token>` or `X-API-Key: <key>:<secret>`

use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::fmt;
use thiserror::Error;

/// Header carrying an API key as an alternative to `Authorization`.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Errors raised while reading credentials from request headers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("No credentials provided")]
    Missing,

    #[error("Unsupported authorization scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Malformed credentials")]
    Malformed,
}

/// Credential captured from the connection that opened a session.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthContext {
    /// Opaque bearer token
    Bearer(String),
    /// Composite `key:secret` credential
    KeyPair { key: String, secret: String },
}

impl AuthContext {
    /// Extract the credential from request headers.
    ///
    /// `Authorization` takes precedence over `X-API-Key`.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, CredentialError> {
        if let Some(value) = headers.get(header::AUTHORIZATION) {
            let value = value.to_str().map_err(|_| CredentialError::Malformed)?;
            return Self::parse_authorization(value);
        }

        if let Some(value) = headers.get(API_KEY_HEADER) {
            let value = value.to_str().map_err(|_| CredentialError::Malformed)?;
            return Self::parse_api_key(value);
        }

        Err(CredentialError::Missing)
    }

    /// Parse an `Authorization` header value.
    pub fn parse_authorization(value: &str) -> Result<Self, CredentialError> {
        let (scheme, rest) = value
            .trim()
            .split_once(' ')
            .ok_or(CredentialError::Malformed)?;
        let rest = rest.trim();

        match scheme.to_ascii_lowercase().as_str() {
            "bearer" => {
                if rest.is_empty() {
                    return Err(CredentialError::Malformed);
                }
                Ok(Self::Bearer(rest.to_string()))
            }
            "token" => Self::parse_key_pair(rest),
            "basic" => {
                let decoded = STANDARD
                    .decode(rest)
                    .map_err(|_| CredentialError::Malformed)?;
                let decoded = String::from_utf8(decoded).map_err(|_| CredentialError::Malformed)?;
                Self::parse_key_pair(&decoded)
            }
            other => Err(CredentialError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Parse an `X-API-Key` header value.
    pub fn parse_api_key(value: &str) -> Result<Self, CredentialError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(CredentialError::Malformed);
        }
        if value.contains(':') {
            Self::parse_key_pair(value)
        } else {
            Ok(Self::Bearer(value.to_string()))
        }
    }

    /// The pair is sent on as a header value, so control characters are refused.
    fn parse_key_pair(value: &str) -> Result<Self, CredentialError> {
        if value.chars().any(char::is_control) {
            return Err(CredentialError::Malformed);
        }
        match value.split_once(':') {
            Some((key, secret)) if !key.is_empty() && !secret.is_empty() => Ok(Self::KeyPair {
                key: key.to_string(),
                secret: secret.to_string(),
            }),
            _ => Err(CredentialError::Malformed),
        }
    }

    /// `Authorization` header value sent to the backend service.
    pub fn header_value(&self) -> String {
        match self {
            Self::Bearer(token) => format!("Bearer {token}"),
            Self::KeyPair { key, secret } => format!("token {key}:{secret}"),
        }
    }

    /// Short label for logs. Never contains the secret.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bearer(_) => "bearer",
            Self::KeyPair { .. } => "key_pair",
        }
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Self::KeyPair { key, .. } => f
                .debug_struct("KeyPair")
                .field("key", key)
                .field("secret", &"<redacted>")
                .finish(),
        }
    }
}
