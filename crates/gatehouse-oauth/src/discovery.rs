//! OpenID provider discovery document fetch-and-cache.
//!
//! A plain cached GET: the document is fetched at most once per expiry
//! window, with an in-flight guard so concurrent callers don't stampede the
//! provider.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{OAuthError, Result};

/// How long a fetched discovery document is considered fresh (3 hours).
pub const DISCOVERY_CACHE_TTL_SECS: i64 = 3 * 60 * 60;

/// The subset of the OIDC discovery document the auth core uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenIdConfig {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    /// Absent when the provider does not support RP-initiated logout.
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
}

#[derive(Debug, Default)]
struct CacheState {
    is_fetching: bool,
    has_attempted: bool,
    data: Option<OpenIdConfig>,
    /// Epoch seconds after which `data` is stale.
    expiry: Option<i64>,
}

/// Time-boxed cache around the discovery document GET.
#[derive(Debug)]
pub struct OpenIdConfigCache {
    url: String,
    http: reqwest::Client,
    state: RwLock<CacheState>,
}

impl OpenIdConfigCache {
    /// Create a cache for the document at `url`.
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Current document, if one is cached and fresh.
    pub async fn get(&self) -> Option<OpenIdConfig> {
        let state = self.state.read().await;
        match (&state.data, state.expiry) {
            (Some(data), Some(expiry)) if Utc::now().timestamp() < expiry => Some(data.clone()),
            _ => None,
        }
    }

    /// Whether a fetch has completed (successfully or not) at least once.
    pub async fn has_attempted(&self) -> bool {
        self.state.read().await.has_attempted
    }

    /// Fetch the document unless a fresh copy is cached or a fetch is
    /// already in flight.
    ///
    /// Returns the cached/fetched document, or `None` when skipped because
    /// another fetch is mid-flight and nothing is cached yet.
    pub async fn fetch_if_necessary(&self) -> Result<Option<OpenIdConfig>> {
        {
            let mut state = self.state.write().await;
            let now = Utc::now().timestamp();
            if let (Some(data), Some(expiry)) = (&state.data, state.expiry) {
                if now < expiry {
                    return Ok(Some(data.clone()));
                }
            }
            if state.is_fetching {
                return Ok(state.data.clone());
            }
            state.is_fetching = true;
        }

        debug!(url = %self.url, "fetching OpenID configuration");
        let result = self.fetch().await;

        let mut state = self.state.write().await;
        state.is_fetching = false;
        state.has_attempted = true;
        match result {
            Ok(config) => {
                state.data = Some(config.clone());
                state.expiry = Some(Utc::now().timestamp() + DISCOVERY_CACHE_TTL_SECS);
                Ok(Some(config))
            }
            Err(e) => {
                warn!(url = %self.url, err = %e, "OpenID configuration fetch failed");
                state.data = None;
                state.expiry = None;
                Err(e)
            }
        }
    }

    async fn fetch(&self) -> Result<OpenIdConfig> {
        let response = self.http.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OAuthError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        response
            .json::<OpenIdConfig>()
            .await
            .map_err(|e| OAuthError::MalformedResponse(format!("bad discovery document: {e}")))
    }
}
