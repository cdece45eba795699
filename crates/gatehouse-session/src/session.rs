//! The auth session state machine.
//!
//! [`AuthSession`] is the single authoritative owner of the session record
//! (tokens, expiry, decoded claims). Every mutation happens inside one of the
//! defined transitions: token handoff, token refresh, session invalidation,
//! or sign-out. Other components read snapshots but never mutate.
//!
//! Transitions are all-or-nothing: a session is either fully populated
//! (authenticated) or fully cleared — no partial token set survives a
//! transition boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info};
use url::Url;

use gatehouse_config::AuthContext;
use gatehouse_oauth::claims::{self, IdTokenClaims};
use gatehouse_oauth::discovery::OpenIdConfigCache;
use gatehouse_oauth::{pkce, protocol};

use crate::error::{Result, SessionError};
use crate::permissions::{FetchOutcome, PermissionCache, ResourcePermissions};
use crate::resource::Resource;
use crate::store::{
    KeyStore, PKCE_STATE_KEY, PKCE_VERIFIER_KEY, POST_AUTH_REDIRECT_KEY, WAS_SIGNED_IN_KEY,
};

/// Where the user lands after a callback when no return path was stored.
pub const DEFAULT_POST_AUTH_PATH: &str = "/overview";

/// Events emitted as transitions complete, for embedders that need to refetch
/// user-dependent data or react to invalidation.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// A token handoff completed. `new_identity` is true when the session had
    /// no decoded claims before this handoff.
    SignedIn { new_identity: bool },
    /// A silent refresh completed.
    TokensRefreshed,
    /// A handoff or refresh was rejected; the session was fully cleared.
    SessionInvalidated { reason: String },
    /// Explicit sign-out completed.
    SignedOut,
    /// Background worker heartbeat; embedders refetch user-dependent data.
    Heartbeat,
}

/// Point-in-time copy of the session record and its transition flags.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub id_token: Option<String>,
    /// Always the decoded form of `id_token`; recomputed whenever it changes.
    pub id_token_claims: Option<IdTokenClaims>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Epoch seconds at which the access token expires.
    pub session_expiry: Option<i64>,

    pub is_handing_off: bool,
    pub handoff_error: String,
    pub is_refreshing: bool,
    pub refresh_error: String,
    /// Whether the current sign-in attempt was triggered automatically.
    pub is_auto_authenticating: bool,
    /// Whether user-dependent data has been fetched for this identity.
    pub has_attempted_user_data: bool,
}

/// Query parameters delivered to the callback URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    /// Parse from a raw query string (with or without the leading `?`).
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        for (k, v) in url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
            match k.as_ref() {
                "code" => params.code = Some(v.into_owned()),
                "state" => params.state = Some(v.into_owned()),
                "error" => params.error = Some(v.into_owned()),
                _ => {}
            }
        }
        params
    }
}

/// Outcome of handling the provider's redirect back to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackResult {
    /// Handoff succeeded; navigate to `redirect_to`.
    SignedIn { redirect_to: String },
    /// A valid session already exists; navigate home instead of
    /// re-authenticating.
    AlreadyAuthenticated { redirect_to: String },
}

/// Outcome of a sign-out request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOut {
    /// Provider supports RP-initiated logout; navigate to this URL.
    Redirect(String),
    /// No end-session endpoint; only the local session was cleared.
    LocalOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Handoff,
    Refresh,
}

/// The auth session core.
///
/// Explicitly owned and injectable: construct one, wrap it in an [`Arc`], and
/// hand clones to every consumer. There is no global singleton.
#[derive(Debug)]
pub struct AuthSession {
    context: AuthContext,
    discovery: OpenIdConfigCache,
    store: Arc<dyn KeyStore>,
    permissions: PermissionCache,
    http: reqwest::Client,
    state: RwLock<SessionSnapshot>,
    events: broadcast::Sender<AuthEvent>,
}

impl AuthSession {
    /// Create a session core from a static auth context and a durable store.
    pub fn new(context: AuthContext, store: Arc<dyn KeyStore>) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        let discovery = OpenIdConfigCache::new(http.clone(), context.openid_config_url.clone());
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            context,
            discovery,
            store,
            permissions: PermissionCache::new(http.clone()),
            http,
            state: RwLock::new(SessionSnapshot::default()),
            events,
        })
    }

    /// The static auth context this session was built with.
    pub fn context(&self) -> &AuthContext {
        &self.context
    }

    /// The OpenID discovery cache.
    pub fn discovery(&self) -> &OpenIdConfigCache {
        &self.discovery
    }

    /// The identity-bound permission cache.
    pub fn permissions(&self) -> &PermissionCache {
        &self.permissions
    }

    /// Subscribe to transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }

    /// Copy of the current session record and flags.
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.state.read().await.clone()
    }

    /// Current access token, if authenticated.
    pub async fn access_token(&self) -> Option<String> {
        self.state.read().await.access_token.clone()
    }

    /// `("Authorization", "Bearer <token>")` for outbound requests, when a
    /// token is held.
    pub async fn authorization_header(&self) -> Option<(String, String)> {
        self.access_token()
            .await
            .map(|t| ("Authorization".to_string(), format!("Bearer {t}")))
    }

    /// Record that user-dependent data was fetched for the current identity.
    ///
    /// Cleared again when a handoff establishes a new identity, signalling
    /// the embedder to refetch.
    pub async fn mark_user_data_attempted(&self) {
        self.state.write().await.has_attempted_user_data = true;
    }

    /// Whether the session holds a currently valid identity.
    ///
    /// Recomputed from the decoded `exp` claim on every call — the answer is
    /// time-dependent and must not be cached.
    pub async fn is_authenticated(&self) -> bool {
        self.is_authenticated_at(epoch_secs()).await
    }

    /// [`Self::is_authenticated`] evaluated at an explicit clock reading.
    pub async fn is_authenticated_at(&self, now: i64) -> bool {
        claims::is_authenticated_at(self.state.read().await.id_token_claims.as_ref(), now)
    }

    /// Build the authorization redirect URL for a fresh sign-in attempt.
    ///
    /// Generates independent `state` and `verifier`, persists both (plus
    /// `current_path` for the post-auth redirect) in the durable store, and
    /// derives the S256 challenge. The caller navigates to the returned URL.
    pub async fn build_sign_in_url(&self, current_path: &str) -> Result<String> {
        self.context.validate()?;
        let config = self
            .discovery
            .fetch_if_necessary()
            .await?
            .ok_or(SessionError::NoTokenEndpoint)?;

        let state = pkce::generate_state();
        let verifier = pkce::generate_verifier();
        self.store.set(PKCE_STATE_KEY, &state);
        self.store.set(PKCE_VERIFIER_KEY, &verifier);
        self.store.set(POST_AUTH_REDIRECT_KEY, current_path);

        Ok(protocol::build_authorization_url(
            &config.authorization_endpoint,
            &self.context.client_id,
            &state,
            &self.context.scope,
            &self.context.auth_callback_url,
            &pkce::challenge_from_verifier(&verifier),
        ))
    }

    /// Handle the provider's redirect back to the callback URL.
    ///
    /// Validates the returned `state` against the stored PKCE material
    /// (consuming it read-once), then performs the token handoff. Any
    /// validation failure aborts the attempt, clears the "was signed in"
    /// marker, and performs no token exchange.
    pub async fn handle_callback(&self, params: &CallbackParams) -> Result<CallbackResult> {
        if self.is_authenticated().await {
            return Ok(CallbackResult::AlreadyAuthenticated {
                redirect_to: DEFAULT_POST_AUTH_PATH.to_string(),
            });
        }

        if let Some(error) = &params.error {
            error!(err = %error, "provider returned an error on callback");
            self.abort_sign_in().await;
            return Err(SessionError::ProviderCallback(error.clone()));
        }

        let Some(code) = params.code.clone() else {
            self.abort_sign_in().await;
            return Err(SessionError::MissingCode);
        };
        let Some(stored_state) = self.store.pop(PKCE_STATE_KEY) else {
            error!("callback received with no stored PKCE state");
            self.abort_sign_in().await;
            return Err(SessionError::MissingStoredState);
        };
        if params.state.as_deref() != Some(stored_state.as_str()) {
            error!("callback state does not match stored PKCE state");
            self.abort_sign_in().await;
            return Err(SessionError::StateMismatch);
        }
        let Some(verifier) = self.store.pop(PKCE_VERIFIER_KEY) else {
            error!("callback received with no stored PKCE verifier");
            self.abort_sign_in().await;
            return Err(SessionError::MissingVerifier);
        };

        self.token_handoff(&code, &verifier).await?;

        let redirect_to = self
            .store
            .pop(POST_AUTH_REDIRECT_KEY)
            .unwrap_or_else(|| DEFAULT_POST_AUTH_PATH.to_string());
        Ok(CallbackResult::SignedIn { redirect_to })
    }

    /// Exchange a validated `(code, verifier)` pair for tokens.
    ///
    /// One attempt; authorization codes are single-use, and a rejection fully
    /// clears the session.
    pub async fn token_handoff(&self, code: &str, verifier: &str) -> Result<()> {
        self.context.validate()?;
        let config = self
            .discovery
            .fetch_if_necessary()
            .await?
            .ok_or(SessionError::NoTokenEndpoint)?;

        self.state.write().await.is_handing_off = true;

        match protocol::exchange_code(
            &self.http,
            &config.token_endpoint,
            code,
            &self.context.client_id,
            &self.context.auth_callback_url,
            verifier,
        )
        .await
        {
            Ok(payload) => self.apply_success(payload, Flow::Handoff).await,
            Err(e) => {
                self.invalidate(Flow::Handoff, e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Attempt a silent token refresh.
    ///
    /// Guarded: proceeds only when a token endpoint is known, no refresh is
    /// in flight, and a refresh token is held — otherwise a silent no-op
    /// (`Ok(false)`). A rejection invalidates the whole session, exactly as a
    /// handoff rejection does.
    pub async fn refresh_tokens(&self) -> Result<bool> {
        let Some(config) = self.discovery.get().await else {
            error!("no token endpoint available; skipping token refresh");
            return Ok(false);
        };

        let (refresh_token, bearer) = {
            let mut state = self.state.write().await;
            if state.is_refreshing {
                return Ok(false);
            }
            let Some(refresh_token) = state.refresh_token.clone() else {
                debug!("no refresh token held; skipping token refresh");
                return Ok(false);
            };
            state.is_refreshing = true;
            (refresh_token, state.access_token.clone())
        };

        match protocol::refresh_grant(
            &self.http,
            &config.token_endpoint,
            &self.context.client_id,
            &refresh_token,
            bearer.as_deref(),
        )
        .await
        {
            Ok(payload) => {
                self.apply_success(payload, Flow::Refresh).await?;
                Ok(true)
            }
            Err(e) => {
                self.invalidate(Flow::Refresh, e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Sign out, clearing the session and permission cache.
    ///
    /// When the provider advertises an end-session endpoint, returns the
    /// RP-initiated logout URL for the caller to navigate to; otherwise only
    /// the local clear happens.
    pub async fn sign_out(&self) -> Result<SignOut> {
        self.context.validate_for_sign_out()?;

        let end_session = self
            .discovery
            .get()
            .await
            .and_then(|c| c.end_session_endpoint);
        let id_token = self.state.read().await.id_token.clone();

        {
            let mut state = self.state.write().await;
            clear_session_record(&mut state);
            state.refresh_error.clear();
        }
        self.permissions.clear().await;
        self.store.remove(WAS_SIGNED_IN_KEY);
        self.emit(AuthEvent::SignedOut);
        info!("signed out");

        let Some(endpoint) = end_session else {
            return Ok(SignOut::LocalOnly);
        };
        let mut url = Url::parse(&endpoint)
            .map_err(|e| SessionError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = &id_token {
                query.append_pair("id_token_hint", token);
            }
            query.append_pair("client_id", &self.context.client_id);
            query.append_pair("post_logout_redirect_uri", &self.context.post_sign_out_url);
        }
        Ok(SignOut::Redirect(url.to_string()))
    }

    /// Whether auto re-authentication should fire: unauthenticated, not
    /// already auto-authenticating, authorization endpoint known, and the
    /// durable "was signed in" marker present.
    pub async fn should_auto_authenticate(&self) -> bool {
        if self.is_authenticated().await {
            return false;
        }
        if self.state.read().await.is_auto_authenticating {
            return false;
        }
        if self.discovery.get().await.is_none() {
            return false;
        }
        self.store.get(WAS_SIGNED_IN_KEY).as_deref() == Some("true")
    }

    /// Begin auto re-authentication if the gate allows it.
    ///
    /// Consumes the "was signed in" marker up front so a failed attempt can't
    /// loop, and resets the auto flag on failure.
    pub async fn auto_sign_in_url(&self, current_path: &str) -> Result<Option<String>> {
        if !self.should_auto_authenticate().await {
            return Ok(None);
        }
        debug!("auto-authenticating");
        self.store.remove(WAS_SIGNED_IN_KEY);
        self.state.write().await.is_auto_authenticating = true;

        match self.build_sign_in_url(current_path).await {
            Ok(url) => Ok(Some(url)),
            Err(e) => {
                self.state.write().await.is_auto_authenticating = false;
                Err(e)
            }
        }
    }

    /// Batch-fetch permissions with the session's current access token.
    pub async fn fetch_resource_permissions(
        &self,
        resources: &[Resource],
        authz_url: &str,
    ) -> FetchOutcome {
        let token = self.access_token().await;
        self.permissions
            .fetch(resources, authz_url, token.as_deref())
            .await
    }

    /// Current cached permission state for one resource.
    pub async fn resource_permissions(&self, resource: &Resource) -> ResourcePermissions {
        self.permissions.snapshot(resource).await
    }

    /// Whether the signed-in user holds `permission` on `resource`.
    pub async fn has_resource_permission(
        &self,
        resource: &Resource,
        authz_url: &str,
        permission: &str,
    ) -> bool {
        let token = self.access_token().await;
        self.permissions
            .has_permission(resource, authz_url, token.as_deref(), permission)
            .await
    }

    /// Abort a sign-in attempt before any exchange: clear the re-auth marker
    /// and the auto flag so a broken callback can't loop.
    async fn abort_sign_in(&self) {
        self.store.remove(WAS_SIGNED_IN_KEY);
        self.state.write().await.is_auto_authenticating = false;
    }

    async fn apply_success(&self, payload: protocol::TokenPayload, flow: Flow) -> Result<()> {
        let claims = match claims::decode_unverified(&payload.id_token) {
            Ok(claims) => claims,
            Err(e) => {
                // An undecodable ID token is an exchange rejection.
                self.invalidate(flow, e.to_string()).await;
                return Err(e.into());
            }
        };

        let now = epoch_secs();
        {
            let mut state = self.state.write().await;
            let new_identity = state.id_token_claims.is_none();
            match flow {
                Flow::Handoff => {
                    if new_identity {
                        // Fresh identity: user-dependent data must be refetched.
                        state.has_attempted_user_data = false;
                    }
                    state.is_handing_off = false;
                    state.handoff_error.clear();
                    state.is_auto_authenticating = false;
                }
                Flow::Refresh => state.is_refreshing = false,
            }
            state.session_expiry = Some(now + payload.expires_in as i64);
            state.id_token = Some(payload.id_token);
            state.id_token_claims = Some(claims);
            state.access_token = Some(payload.access_token);
            // Providers may omit the refresh token on refresh; keep ours.
            if let Some(refresh_token) = payload.refresh_token {
                state.refresh_token = Some(refresh_token);
            }

            self.store.set(WAS_SIGNED_IN_KEY, "true");
            match flow {
                Flow::Handoff => {
                    info!(new_identity, "token handoff completed");
                    self.emit(AuthEvent::SignedIn { new_identity });
                }
                Flow::Refresh => {
                    debug!("tokens refreshed");
                    self.emit(AuthEvent::TokensRefreshed);
                }
            }
        }
        Ok(())
    }

    /// Terminal failure transition: clear the whole session record, the
    /// permission cache, and the re-auth marker in one step.
    async fn invalidate(&self, flow: Flow, reason: String) {
        error!(err = %reason, "session invalidated");
        {
            let mut state = self.state.write().await;
            clear_session_record(&mut state);
            match flow {
                Flow::Handoff => {
                    state.handoff_error = reason.clone();
                    state.is_handing_off = false;
                    state.is_auto_authenticating = false;
                }
                Flow::Refresh => {
                    state.refresh_error = reason.clone();
                    state.is_refreshing = false;
                }
            }
        }
        self.permissions.clear().await;
        self.store.remove(WAS_SIGNED_IN_KEY);
        self.emit(AuthEvent::SessionInvalidated { reason });
    }
}

/// Clear every token-derived field together — never partially.
fn clear_session_record(state: &mut SessionSnapshot) {
    state.id_token = None;
    state.id_token_claims = None;
    state.access_token = None;
    state.refresh_token = None;
    state.session_expiry = None;
}

fn epoch_secs() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::project;
    use crate::store::MemoryStore;
    use crate::testing::{FakeIdp, IdpOptions, spawn_idp};

    fn test_context(idp: &FakeIdp) -> AuthContext {
        AuthContext {
            application_url: "https://app.example.org".to_string(),
            openid_config_url: format!("{}/.well-known/openid-configuration", idp.base),
            client_id: "app-client".to_string(),
            scope: "openid email".to_string(),
            post_sign_out_url: "https://app.example.org/signed-out".to_string(),
            auth_callback_url: "https://app.example.org/callback".to_string(),
        }
    }

    fn session_with_store(idp: &FakeIdp) -> (Arc<AuthSession>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let session = AuthSession::new(test_context(idp), store.clone());
        (session, store)
    }

    /// Run the full redirect round trip against the fake provider.
    async fn sign_in(session: &AuthSession, store: &MemoryStore) -> Result<CallbackResult> {
        session.build_sign_in_url("/projects/p1").await?;
        let state = store.get(PKCE_STATE_KEY).unwrap();
        session
            .handle_callback(&CallbackParams {
                code: Some("C1".to_string()),
                state: Some(state),
                error: None,
            })
            .await
    }

    #[test]
    fn callback_params_parse_from_query() {
        let params = CallbackParams::from_query("?code=C1&state=S1&other=x");
        assert_eq!(params.code.as_deref(), Some("C1"));
        assert_eq!(params.state.as_deref(), Some("S1"));
        assert_eq!(params.error, None);

        let params = CallbackParams::from_query("error=access_denied");
        assert_eq!(params.error.as_deref(), Some("access_denied"));
    }

    #[tokio::test]
    async fn sign_in_url_persists_pkce_material() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, store) = session_with_store(&idp);

        let url = session.build_sign_in_url("/projects/p1").await.unwrap();

        let state = store.get(PKCE_STATE_KEY).unwrap();
        let verifier = store.get(PKCE_VERIFIER_KEY).unwrap();
        assert_eq!(
            store.get(POST_AUTH_REDIRECT_KEY).as_deref(),
            Some("/projects/p1")
        );
        assert_ne!(state, verifier);

        assert!(url.starts_with(&format!("{}/authorize?", idp.base)));
        assert!(url.contains(&format!("state={state}")));
        assert!(url.contains(&format!(
            "code_challenge={}",
            pkce::challenge_from_verifier(&verifier)
        )));
        assert!(url.contains("code_challenge_method=S256"));
    }

    #[tokio::test]
    async fn fresh_attempts_use_fresh_material() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, store) = session_with_store(&idp);

        session.build_sign_in_url("/").await.unwrap();
        let first_verifier = store.get(PKCE_VERIFIER_KEY).unwrap();
        session.build_sign_in_url("/").await.unwrap();
        let second_verifier = store.get(PKCE_VERIFIER_KEY).unwrap();
        assert_ne!(first_verifier, second_verifier);
    }

    #[tokio::test]
    async fn callback_round_trip_signs_in() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, store) = session_with_store(&idp);

        let result = sign_in(&session, &store).await.unwrap();
        assert_eq!(
            result,
            CallbackResult::SignedIn {
                redirect_to: "/projects/p1".to_string()
            }
        );

        assert!(session.is_authenticated().await);
        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.access_token.as_deref(), Some("AT1"));
        assert_eq!(snapshot.refresh_token.as_deref(), Some("RT1"));
        assert!(snapshot.id_token.is_some());
        assert!(snapshot.id_token_claims.is_some());
        assert!(snapshot.session_expiry.unwrap() > epoch_secs());
        assert!(!snapshot.is_handing_off);

        // PKCE material was consumed read-once; the re-auth marker is set.
        assert_eq!(store.get(PKCE_STATE_KEY), None);
        assert_eq!(store.get(PKCE_VERIFIER_KEY), None);
        assert_eq!(store.get(WAS_SIGNED_IN_KEY).as_deref(), Some("true"));
        assert_eq!(idp.exchange_hits(), 1);

        assert_eq!(
            session.authorization_header().await,
            Some(("Authorization".to_string(), "Bearer AT1".to_string()))
        );
    }

    #[tokio::test]
    async fn state_mismatch_aborts_without_exchange() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, store) = session_with_store(&idp);

        session.build_sign_in_url("/").await.unwrap();
        store.set(WAS_SIGNED_IN_KEY, "true");

        let err = session
            .handle_callback(&CallbackParams {
                code: Some("C1".to_string()),
                state: Some("not-the-stored-state".to_string()),
                error: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::StateMismatch));
        assert_eq!(idp.exchange_hits(), 0);
        assert!(!session.is_authenticated().await);
        assert_eq!(store.get(WAS_SIGNED_IN_KEY), None);
    }

    #[tokio::test]
    async fn provider_error_param_aborts_attempt() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, store) = session_with_store(&idp);
        store.set(WAS_SIGNED_IN_KEY, "true");

        let err = session
            .handle_callback(&CallbackParams {
                error: Some("access_denied".to_string()),
                ..CallbackParams::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::ProviderCallback(_)));
        assert_eq!(idp.exchange_hits(), 0);
        assert_eq!(store.get(WAS_SIGNED_IN_KEY), None);
    }

    #[tokio::test]
    async fn missing_verifier_is_a_validation_failure() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, store) = session_with_store(&idp);

        session.build_sign_in_url("/").await.unwrap();
        let state = store.get(PKCE_STATE_KEY).unwrap();
        store.remove(PKCE_VERIFIER_KEY);

        let err = session
            .handle_callback(&CallbackParams {
                code: Some("C1".to_string()),
                state: Some(state),
                error: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::MissingVerifier));
        assert_eq!(idp.exchange_hits(), 0);
    }

    #[tokio::test]
    async fn rejected_handoff_clears_everything_at_once() {
        let idp = spawn_idp(IdpOptions {
            fail_exchange: true,
            ..IdpOptions::default()
        })
        .await;
        let (session, store) = session_with_store(&idp);

        let err = sign_in(&session, &store).await.unwrap_err();
        assert!(matches!(err, SessionError::OAuth(_)));

        let snapshot = session.snapshot().await;
        assert!(snapshot.id_token.is_none());
        assert!(snapshot.id_token_claims.is_none());
        assert!(snapshot.access_token.is_none());
        assert!(snapshot.refresh_token.is_none());
        assert!(snapshot.session_expiry.is_none());
        assert!(!snapshot.is_handing_off);
        assert!(!snapshot.is_auto_authenticating);
        assert!(snapshot.handoff_error.contains("invalid_grant"));
        assert_eq!(store.get(WAS_SIGNED_IN_KEY), None);
    }

    #[tokio::test]
    async fn refresh_updates_tokens_and_keeps_refresh_token() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, store) = session_with_store(&idp);
        sign_in(&session, &store).await.unwrap();

        let mut events = session.subscribe();
        let refreshed = session.refresh_tokens().await.unwrap();
        assert!(refreshed);

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.access_token.as_deref(), Some("AT2"));
        // The fake provider omits refresh_token on refresh; ours is kept.
        assert_eq!(snapshot.refresh_token.as_deref(), Some("RT1"));
        assert!(!snapshot.is_refreshing);
        assert_eq!(idp.refresh_hits(), 1);

        assert!(matches!(
            events.try_recv().unwrap(),
            AuthEvent::TokensRefreshed
        ));
    }

    #[tokio::test]
    async fn refresh_is_a_silent_noop_without_a_refresh_token() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, _store) = session_with_store(&idp);
        session.discovery().fetch_if_necessary().await.unwrap();

        assert!(!session.refresh_tokens().await.unwrap());
        assert_eq!(idp.refresh_hits(), 0);
    }

    #[tokio::test]
    async fn refresh_is_a_silent_noop_without_a_token_endpoint() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, _store) = session_with_store(&idp);

        // Discovery never fetched: the condition fails before any network call.
        assert!(!session.refresh_tokens().await.unwrap());
        assert_eq!(idp.refresh_hits(), 0);
    }

    #[tokio::test]
    async fn rejected_refresh_invalidates_session_and_permissions() {
        let idp = spawn_idp(IdpOptions {
            fail_refresh: true,
            ..IdpOptions::default()
        })
        .await;
        let (session, store) = session_with_store(&idp);
        sign_in(&session, &store).await.unwrap();

        // Permissions are identity-bound; populate, then watch them drop.
        let resource = project("p1");
        session
            .fetch_resource_permissions(std::slice::from_ref(&resource), &idp.base)
            .await;
        assert!(session.resource_permissions(&resource).await.has_attempted);

        let err = session.refresh_tokens().await.unwrap_err();
        assert!(matches!(err, SessionError::OAuth(_)));

        let snapshot = session.snapshot().await;
        assert!(snapshot.access_token.is_none());
        assert!(snapshot.refresh_token.is_none());
        assert!(snapshot.id_token.is_none());
        assert!(snapshot.id_token_claims.is_none());
        assert!(!snapshot.refresh_error.is_empty());
        assert!(!session.resource_permissions(&resource).await.has_attempted);
        assert_eq!(store.get(WAS_SIGNED_IN_KEY), None);
    }

    #[tokio::test]
    async fn sign_out_redirects_to_end_session_endpoint() {
        let idp = spawn_idp(IdpOptions {
            end_session: true,
            ..IdpOptions::default()
        })
        .await;
        let (session, store) = session_with_store(&idp);
        sign_in(&session, &store).await.unwrap();
        let id_token = session.snapshot().await.id_token.unwrap();

        let result = session.sign_out().await.unwrap();
        let SignOut::Redirect(url) = result else {
            panic!("expected redirect, got {result:?}");
        };
        assert!(url.starts_with(&format!("{}/logout?", idp.base)));
        assert!(url.contains(&format!("id_token_hint={id_token}")));
        assert!(url.contains("client_id=app-client"));
        assert!(url.contains("post_logout_redirect_uri=https%3A%2F%2Fapp.example.org%2Fsigned-out"));

        assert!(!session.is_authenticated().await);
        assert_eq!(store.get(WAS_SIGNED_IN_KEY), None);
    }

    #[tokio::test]
    async fn sign_out_without_end_session_is_local_only() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, store) = session_with_store(&idp);
        sign_in(&session, &store).await.unwrap();

        assert_eq!(session.sign_out().await.unwrap(), SignOut::LocalOnly);
        assert!(session.snapshot().await.access_token.is_none());
    }

    #[tokio::test]
    async fn auto_authentication_fires_once_per_marker() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, store) = session_with_store(&idp);
        session.discovery().fetch_if_necessary().await.unwrap();
        store.set(WAS_SIGNED_IN_KEY, "true");

        let url = session.auto_sign_in_url("/projects/p1").await.unwrap();
        assert!(url.is_some());
        assert!(session.snapshot().await.is_auto_authenticating);
        // The marker was consumed; a second attempt is gated off.
        assert_eq!(session.auto_sign_in_url("/").await.unwrap(), None);
    }

    #[tokio::test]
    async fn auto_authentication_requires_marker_and_discovery() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, store) = session_with_store(&idp);

        // No discovery document cached yet.
        store.set(WAS_SIGNED_IN_KEY, "true");
        assert!(!session.should_auto_authenticate().await);

        session.discovery().fetch_if_necessary().await.unwrap();
        assert!(session.should_auto_authenticate().await);

        store.remove(WAS_SIGNED_IN_KEY);
        assert!(!session.should_auto_authenticate().await);
    }

    #[tokio::test]
    async fn authentication_expires_with_the_id_token() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, store) = session_with_store(&idp);
        sign_in(&session, &store).await.unwrap();

        let exp = session
            .snapshot()
            .await
            .id_token_claims
            .unwrap()
            .exp
            .unwrap();
        assert!(session.is_authenticated_at(exp - 1).await);
        assert!(!session.is_authenticated_at(exp).await);
        assert!(!session.is_authenticated_at(exp + 3600).await);
    }

    #[tokio::test]
    async fn user_data_flag_survives_refresh_but_not_a_new_identity() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, store) = session_with_store(&idp);

        sign_in(&session, &store).await.unwrap();
        assert!(!session.snapshot().await.has_attempted_user_data);

        session.mark_user_data_attempted().await;
        assert!(session.snapshot().await.has_attempted_user_data);

        // Same identity: a refresh keeps the flag.
        session.refresh_tokens().await.unwrap();
        assert!(session.snapshot().await.has_attempted_user_data);

        // Sign out and back in: the fresh identity resets it.
        session.sign_out().await.unwrap();
        sign_in(&session, &store).await.unwrap();
        assert!(!session.snapshot().await.has_attempted_user_data);
    }

    #[tokio::test]
    async fn callback_while_authenticated_short_circuits() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let (session, store) = session_with_store(&idp);
        sign_in(&session, &store).await.unwrap();

        let result = session
            .handle_callback(&CallbackParams {
                code: Some("C2".to_string()),
                state: Some("irrelevant".to_string()),
                error: None,
            })
            .await
            .unwrap();
        assert_eq!(
            result,
            CallbackResult::AlreadyAuthenticated {
                redirect_to: DEFAULT_POST_AUTH_PATH.to_string()
            }
        );
        assert_eq!(idp.exchange_hits(), 1);
    }

    #[tokio::test]
    async fn incomplete_context_blocks_sign_in_before_network() {
        let idp = spawn_idp(IdpOptions::default()).await;
        let mut context = test_context(&idp);
        context.client_id.clear();
        let session = AuthSession::new(context, Arc::new(MemoryStore::new()));

        let err = session.build_sign_in_url("/").await.unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
        assert!(!session.discovery().has_attempted().await);
    }
}
