//! OAuth 2.0 authorization code + PKCE protocol layer for Gatehouse.
//!
//! Protocol leaves only — no session state lives here. The session core in
//! `gatehouse-session` orchestrates these pieces.
//!
//! # Components
//!
//! - [`pkce`] — secure random `state`/`verifier` generation, S256 challenge
//! - [`discovery`] — OpenID discovery document fetch with a time-boxed cache
//! - [`protocol`] — authorization URL assembly, code exchange, refresh grant
//! - [`claims`] — unverified ID token payload decoding and expiry checks

pub mod claims;
pub mod discovery;
pub mod error;
pub mod pkce;
pub mod protocol;

pub use claims::{IdTokenClaims, decode_unverified, is_authenticated_at};
pub use discovery::{DISCOVERY_CACHE_TTL_SECS, OpenIdConfig, OpenIdConfigCache};
pub use error::{OAuthError, Result};
pub use protocol::{TokenErrorPayload, TokenPayload, build_authorization_url};
