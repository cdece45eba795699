//! Cross-window handoff channel.
//!
//! Sign-in can run in a separate window: the popup completes the provider
//! redirect and sends `{code, verifier}` back to the opener, which performs
//! the token handoff itself so the session lives in the opener's process.
//! Messages are accepted only from the application's own origin, and outgoing
//! messages always carry an explicit target origin — never a wildcard.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Result, SessionError};
use crate::session::AuthSession;
use crate::store::{KeyStore, SIGN_IN_POPUP_KEY};

/// Discriminator value of a handoff result message.
pub const AUTH_RESULT_TYPE: &str = "authResult";

/// Width of the sign-in popup window.
pub const SIGN_IN_POPUP_WIDTH: i32 = 800;

/// Height of the sign-in popup window.
pub const SIGN_IN_POPUP_HEIGHT: i32 = 600;

/// The payload a sign-in popup sends back to its opener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResultMessage {
    /// Always [`AUTH_RESULT_TYPE`].
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
    pub verifier: String,
}

impl AuthResultMessage {
    pub fn new(code: impl Into<String>, verifier: impl Into<String>) -> Self {
        Self {
            kind: AUTH_RESULT_TYPE.to_string(),
            code: code.into(),
            verifier: verifier.into(),
        }
    }
}

/// A message received from another window, tagged with its sender origin.
#[derive(Debug, Clone)]
pub struct WindowMessage {
    pub origin: String,
    pub payload: serde_json::Value,
}

/// An outbound window message with an explicit target origin.
///
/// The embedder delivers this through its windowing layer; `target_origin`
/// must be passed through verbatim so delivery fails closed if the opener was
/// navigated elsewhere.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub target_origin: String,
    pub payload: serde_json::Value,
}

/// Build the message a popup sends its opener after the provider redirect.
///
/// The target origin is the application's own origin, derived from
/// `application_url`.
pub fn auth_result_message(
    application_url: &str,
    code: &str,
    verifier: &str,
) -> Result<OutgoingMessage> {
    Ok(OutgoingMessage {
        target_origin: origin_of(application_url)?,
        payload: serde_json::to_value(AuthResultMessage::new(code, verifier))
            .unwrap_or_default(),
    })
}

/// Opener-side listener that turns accepted handoff messages into token
/// handoffs on the owned session.
#[derive(Debug)]
pub struct HandoffListener {
    session: Arc<AuthSession>,
    allowed_origin: String,
}

impl HandoffListener {
    /// Create a listener allow-listed to the session's application origin.
    pub fn new(session: Arc<AuthSession>) -> Result<Self> {
        let allowed_origin = origin_of(&session.context().application_url)?;
        Ok(Self {
            session,
            allowed_origin,
        })
    }

    /// The only origin this listener accepts messages from.
    pub fn allowed_origin(&self) -> &str {
        &self.allowed_origin
    }

    /// Validate a window message against the channel contract.
    ///
    /// Accepted only when the sender origin matches the application origin
    /// exactly and the payload is a well-formed auth result with a non-empty
    /// code and verifier. Everything else is silently ignored; arbitrary
    /// windows can post messages and a reject must not disturb the session.
    pub fn accept(&self, message: &WindowMessage) -> Option<AuthResultMessage> {
        if message.origin != self.allowed_origin {
            debug!(origin = %message.origin, "window message from foreign origin ignored");
            return None;
        }
        let result: AuthResultMessage = serde_json::from_value(message.payload.clone()).ok()?;
        if result.kind != AUTH_RESULT_TYPE || result.code.is_empty() || result.verifier.is_empty()
        {
            return None;
        }
        Some(result)
    }

    /// Handle one window message.
    ///
    /// Returns `Ok(true)` when an accepted message drove a successful token
    /// handoff, `Ok(false)` when the message was ignored, and the handoff
    /// error when the exchange itself was rejected.
    pub async fn handle(&self, message: &WindowMessage) -> Result<bool> {
        let Some(result) = self.accept(message) else {
            return Ok(false);
        };
        self.session
            .token_handoff(&result.code, &result.verifier)
            .await?;
        Ok(true)
    }

    /// Drain a message stream until the sender side closes.
    pub fn spawn(self, mut messages: mpsc::Receiver<WindowMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                match self.handle(&message).await {
                    Ok(true) => debug!("handoff message accepted"),
                    Ok(false) => {}
                    Err(e) => warn!(err = %e, "handoff from window message failed"),
                }
            }
            debug!("handoff channel closed");
        })
    }
}

/// Position and size for the sign-in popup, centered on the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowMetrics {
    pub width: i32,
    pub height: i32,
    pub top: i32,
    pub left: i32,
}

/// Compute the popup geometry for a screen of the given size.
pub fn popup_metrics(screen_width: i32, screen_height: i32) -> WindowMetrics {
    WindowMetrics {
        width: SIGN_IN_POPUP_WIDTH,
        height: SIGN_IN_POPUP_HEIGHT,
        top: screen_height / 2 - 350,
        left: screen_width / 2 - 400,
    }
}

impl WindowMetrics {
    /// Feature string for the embedder's window-open call.
    pub fn window_features(&self) -> String {
        format!(
            "popup=yes,width={},height={},top={},left={}",
            self.width, self.height, self.top, self.left
        )
    }
}

/// Record that this window opened a sign-in popup, so the callback page knows
/// to message its opener instead of navigating.
pub fn mark_popup_opened(store: &dyn KeyStore) {
    store.set(SIGN_IN_POPUP_KEY, "true");
}

/// Consume the popup marker (read-once).
pub fn popup_was_opened(store: &dyn KeyStore) -> bool {
    store.pop(SIGN_IN_POPUP_KEY).as_deref() == Some("true")
}

fn origin_of(application_url: &str) -> Result<String> {
    let url = Url::parse(application_url)
        .map_err(|e| SessionError::InvalidApplicationUrl(format!("{application_url}: {e}")))?;
    Ok(url.origin().ascii_serialization())
}
