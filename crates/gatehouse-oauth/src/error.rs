//! Error types for the OAuth protocol layer.

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, OAuthError>;

/// Errors that can occur while talking to the identity provider.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// Network/transport error (the request itself failed).
    #[error("network error: {0}")]
    Network(String),

    /// The token endpoint returned an OAuth error body.
    #[error("{error}: {}", error_description.as_deref().unwrap_or("no description"))]
    Provider {
        error: String,
        error_description: Option<String>,
    },

    /// Non-success HTTP status without a parseable OAuth error body.
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The provider's response did not match the expected schema.
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    /// An ID token could not be decoded.
    #[error("malformed ID token: {0}")]
    MalformedToken(String),
}

impl From<reqwest::Error> for OAuthError {
    fn from(e: reqwest::Error) -> Self {
        OAuthError::Network(e.to_string())
    }
}
