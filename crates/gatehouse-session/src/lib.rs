//! Client-side OAuth2 Authorization Code + PKCE session core.
//!
//! This crate owns the session record and its transitions: building the
//! authorization redirect, validating the callback, exchanging the code for
//! tokens, refreshing them in the background, and signing out. Alongside the
//! session it carries the identity-bound resource permission cache, the
//! durable key store for flow markers, and the cross-window handoff channel
//! for popup-based sign-in.
//!
//! Construct an [`AuthSession`] from a [`gatehouse_config::AuthContext`] and
//! a [`KeyStore`], hand out `Arc` clones, and optionally spawn a
//! [`SessionWorker`] for periodic refresh.

pub mod channel;
pub mod error;
pub mod permissions;
pub mod resource;
pub mod session;
pub mod store;
pub mod worker;

pub use channel::{AuthResultMessage, HandoffListener, OutgoingMessage, WindowMessage};
pub use error::{Result, SessionError};
pub use permissions::{FetchOutcome, PermissionCache, ResourcePermissions};
pub use resource::{Resource, make_resource_key};
pub use session::{
    AuthEvent, AuthSession, CallbackParams, CallbackResult, DEFAULT_POST_AUTH_PATH,
    SessionSnapshot, SignOut,
};
pub use store::{FileStore, KeyStore, MemoryStore};
pub use worker::{DEFAULT_HEARTBEAT, SessionWorker};
