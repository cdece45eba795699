//! PKCE (RFC 7636) primitives: secure random strings and the S256 challenge.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Number of random bytes drawn for `state` and `verifier` strings.
pub const RANDOM_STRING_BYTES: usize = 32;

/// Generate a hex-encoded string of `len` cryptographically secure random
/// bytes (so the returned string is `2 * len` characters long).
///
/// `rand::rng()` is a CSPRNG; `state` and `verifier` must each be generated
/// independently per sign-in attempt.
pub fn secure_random_string(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a fresh PKCE `state` parameter.
pub fn generate_state() -> String {
    secure_random_string(RANDOM_STRING_BYTES)
}

/// Generate a fresh PKCE code verifier.
pub fn generate_verifier() -> String {
    secure_random_string(RANDOM_STRING_BYTES)
}

/// Compute `code_challenge = base64url_nopad(sha256(verifier))`.
///
/// Deterministic for a given verifier; the output is 43 URL-safe characters
/// with no `+`, `/`, or trailing `=`.
pub fn challenge_from_verifier(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}
