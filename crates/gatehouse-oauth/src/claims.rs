//! Unverified ID token claim decoding.
//!
//! The core only needs the claims for display and expiry tracking; signature
//! verification is the provider's job at the token endpoint (the tokens come
//! straight from a TLS exchange we initiated), so the payload segment is
//! decoded without verification.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::{OAuthError, Result};

/// Decoded ID token payload.
///
/// Standard claims are surfaced as typed fields; anything else the provider
/// includes (email, name, ...) is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,

    /// Subject (stable user identifier).
    #[serde(default)]
    pub sub: Option<String>,

    /// Expiry, seconds since epoch.
    #[serde(default)]
    pub exp: Option<i64>,

    /// Issued-at, seconds since epoch.
    #[serde(default)]
    pub iat: Option<i64>,

    /// All other claims.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Decode the payload segment of a JWT without verifying its signature.
pub fn decode_unverified(token: &str) -> Result<IdTokenClaims> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload)) = (segments.next(), segments.next()) else {
        return Err(OAuthError::MalformedToken(
            "expected header.payload.signature".to_string(),
        ));
    };

    // Tolerate tokens that include base64 padding.
    let payload = payload.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| OAuthError::MalformedToken(format!("payload is not base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| OAuthError::MalformedToken(format!("payload is not a claims object: {e}")))
}

/// Whether a decoded claims object represents a currently valid identity at
/// `now` (seconds since epoch): present, carries `exp`, and `exp` is strictly
/// in the future.
///
/// Time-dependent; callers must re-evaluate on every check rather than
/// caching the answer.
pub fn is_authenticated_at(claims: Option<&IdTokenClaims>, now: i64) -> bool {
    matches!(claims.and_then(|c| c.exp), Some(exp) if now < exp)
}
