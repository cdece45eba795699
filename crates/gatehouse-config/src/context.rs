//! The static auth context: identity-provider and application URLs.
//!
//! The context is read-only environment data. It is loaded once at startup
//! and handed by reference to every component that needs it; nothing in the
//! auth core mutates it at runtime.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default OAuth scope requested during sign-in.
pub const DEFAULT_AUTH_SCOPE: &str = "openid email";

/// Static configuration for the auth core.
///
/// All URL fields are origins or absolute URLs as the identity provider
/// expects them. Fields default to empty strings so that partial configs can
/// be deserialized; [`AuthContext::validate`] reports the first missing
/// required field before any flow is started.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthContext {
    /// Origin of the embedding application. Also the allow-listed origin for
    /// cross-window handoff messages.
    pub application_url: String,

    /// URL of the provider's OpenID discovery document
    /// (`.../.well-known/openid-configuration`).
    pub openid_config_url: String,

    /// OAuth client ID registered with the provider.
    pub client_id: String,

    /// Scope string sent with the authorization request.
    pub scope: String,

    /// Where the provider should send the user after RP-initiated logout.
    pub post_sign_out_url: String,

    /// The application's registered redirect URI for the code callback.
    pub auth_callback_url: String,
}

impl Default for AuthContext {
    fn default() -> Self {
        Self {
            application_url: String::new(),
            openid_config_url: String::new(),
            client_id: String::new(),
            scope: DEFAULT_AUTH_SCOPE.to_string(),
            post_sign_out_url: String::new(),
            auth_callback_url: String::new(),
        }
    }
}

impl AuthContext {
    /// Parse a context from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Check that every field required for sign-in is present.
    ///
    /// Returns the first missing field; callers log it and abort the
    /// operation without touching the network or the session.
    pub fn validate(&self) -> Result<()> {
        if self.application_url.is_empty() {
            return Err(ConfigError::MissingField {
                field: "application_url",
            });
        }
        if self.openid_config_url.is_empty() {
            return Err(ConfigError::MissingField {
                field: "openid_config_url",
            });
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::MissingField { field: "client_id" });
        }
        if self.auth_callback_url.is_empty() {
            return Err(ConfigError::MissingField {
                field: "auth_callback_url",
            });
        }
        Ok(())
    }

    /// Check the fields needed for RP-initiated sign-out.
    pub fn validate_for_sign_out(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(ConfigError::MissingField { field: "client_id" });
        }
        if self.post_sign_out_url.is_empty() {
            return Err(ConfigError::MissingField {
                field: "post_sign_out_url",
            });
        }
        Ok(())
    }
}
