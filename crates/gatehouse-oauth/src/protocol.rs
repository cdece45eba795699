//! Token endpoint protocol: authorization URL assembly, the code→token
//! exchange, and the refresh-token grant.
//!
//! Each exchange call issues exactly one request. Authorization codes are
//! single-use by provider contract; re-invoking with a consumed code fails
//! and the error propagates to the session layer unmasked.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OAuthError, Result};

/// Successful token endpoint payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub access_token: String,
    pub id_token: String,
    /// Providers may omit this on refresh; the session keeps its current one.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds, relative to receipt.
    pub expires_in: u64,
}

/// OAuth error payload from the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenErrorPayload {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Build the authorization redirect URL.
///
/// The caller supplies a freshly generated `state` and the challenge derived
/// from a freshly generated verifier; persisting both for the callback is the
/// session layer's job.
pub fn build_authorization_url(
    authorization_endpoint: &str,
    client_id: &str,
    state: &str,
    scope: &str,
    redirect_uri: &str,
    code_challenge: &str,
) -> String {
    let params = [
        ("response_type", "code"),
        ("client_id", client_id),
        ("state", state),
        ("scope", scope),
        ("redirect_uri", redirect_uri),
        ("code_challenge", code_challenge),
        ("code_challenge_method", "S256"),
    ];

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    format!("{authorization_endpoint}?{query}")
}

/// Exchange an authorization code (plus PKCE verifier) for tokens.
///
/// Form-encoded POST; one attempt, no retry.
pub async fn exchange_code(
    client: &reqwest::Client,
    token_endpoint: &str,
    code: &str,
    client_id: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> Result<TokenPayload> {
    debug!(endpoint = %token_endpoint, "exchanging authorization code for tokens");
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("client_id", client_id),
        ("redirect_uri", redirect_uri),
        ("code_verifier", code_verifier),
    ];

    let response = client.post(token_endpoint).form(&form).send().await?;
    let status = response.status();
    let body = response.text().await?;
    decode_token_response(status.as_u16(), &body)
}

/// Exchange a refresh token for a fresh token set.
///
/// Form-encoded POST; one attempt, no retry. When the caller still holds an
/// access token it is sent as a bearer header, matching the provider contract
/// this core was built against.
pub async fn refresh_grant(
    client: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    refresh_token: &str,
    bearer: Option<&str>,
) -> Result<TokenPayload> {
    debug!(endpoint = %token_endpoint, "refreshing tokens");
    let form = [
        ("grant_type", "refresh_token"),
        ("client_id", client_id),
        ("refresh_token", refresh_token),
    ];

    let mut request = client.post(token_endpoint).form(&form);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    decode_token_response(status.as_u16(), &body)
}

/// Decode a token endpoint response body into a tagged result.
///
/// An `error` field in the body wins over the HTTP status (some providers
/// return OAuth errors with 200); otherwise a non-2xx status fails, and a
/// 2xx body must match [`TokenPayload`] exactly.
fn decode_token_response(status: u16, body: &str) -> Result<TokenPayload> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| OAuthError::MalformedResponse(format!("not JSON: {e}")))?;

    if value.get("error").is_some() {
        let payload: TokenErrorPayload = serde_json::from_value(value)
            .map_err(|e| OAuthError::MalformedResponse(format!("bad error payload: {e}")))?;
        return Err(OAuthError::Provider {
            error: payload.error,
            error_description: payload.error_description,
        });
    }

    if !(200..300).contains(&status) {
        return Err(OAuthError::Http {
            status,
            body: body.to_string(),
        });
    }

    serde_json::from_value(value)
        .map_err(|e| OAuthError::MalformedResponse(format!("bad token payload: {e}")))
}
