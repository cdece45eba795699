//! Error types for the session core.

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors raised by the auth session state machine.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The static auth context is incomplete.
    #[error(transparent)]
    Config(#[from] gatehouse_config::ConfigError),

    /// The protocol layer failed (exchange rejection, transport, decode).
    #[error(transparent)]
    OAuth(#[from] gatehouse_oauth::OAuthError),

    /// No token endpoint is known (discovery document absent or incomplete).
    #[error("no token endpoint available")]
    NoTokenEndpoint,

    /// The provider redirected back with an `error` query parameter.
    #[error("error encountered during sign-in: {0}")]
    ProviderCallback(String),

    /// The callback carried no authorization code.
    #[error("callback carried no authorization code")]
    MissingCode,

    /// No PKCE state was stored for this sign-in attempt.
    #[error("no stored PKCE state for this sign-in attempt")]
    MissingStoredState,

    /// The redirect's `state` did not match the stored one.
    #[error("PKCE state mismatch")]
    StateMismatch,

    /// No PKCE verifier was stored for this sign-in attempt.
    #[error("no stored PKCE verifier for this sign-in attempt")]
    MissingVerifier,

    /// The provider advertised an end-session endpoint that is not a URL.
    #[error("invalid end-session endpoint: {0}")]
    InvalidEndpoint(String),

    /// The configured application URL is not a parseable URL, so no message
    /// origin can be derived from it.
    #[error("invalid application URL: {0}")]
    InvalidApplicationUrl(String),
}
