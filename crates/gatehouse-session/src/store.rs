//! Durable key store for flow-scoped markers.
//!
//! The analog of the browser's local storage: a handful of short-lived string
//! keys, each written by exactly one step of a flow and consumed (read, then
//! deleted) by exactly one later step. Tokens are NEVER written here — only
//! PKCE material and boolean markers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

/// PKCE `state` for the in-progress sign-in attempt.
pub const PKCE_STATE_KEY: &str = "pkce_state";

/// PKCE verifier paired with [`PKCE_STATE_KEY`].
pub const PKCE_VERIFIER_KEY: &str = "pkce_verifier";

/// Marker that a previous session existed, driving auto re-authentication.
pub const WAS_SIGNED_IN_KEY: &str = "was_signed_in";

/// Path to return to once the callback completes.
pub const POST_AUTH_REDIRECT_KEY: &str = "post_auth_redirect";

/// Marker that a sign-in popup was opened by this window.
pub const SIGN_IN_POPUP_KEY: &str = "sign_in_popup";

/// Durable string-keyed store with read-once consumption.
///
/// Implementations are infallible from the caller's perspective: a backend
/// that cannot persist logs and degrades to best-effort, because losing a
/// marker only costs the user a re-authentication.
pub trait KeyStore: Send + Sync + std::fmt::Debug {
    /// Read a key without consuming it.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a key, overwriting any previous value.
    fn set(&self, key: &str, value: &str);

    /// Delete a key.
    fn remove(&self, key: &str);

    /// Read and delete a key in one step (the read-once contract).
    fn pop(&self, key: &str) -> Option<String> {
        let value = self.get(key);
        if value.is_some() {
            self.remove(key);
        }
        value
    }
}

/// In-memory store for tests and embedders that manage durability themselves.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

/// File-backed store: a JSON object rewritten on every mutation.
///
/// The value set is tiny (five short keys), so whole-file rewrites are fine.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or create) the store at `path`, loading any existing entries.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), err = %e, "key store file unreadable, starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn save(&self, entries: &HashMap<String, String>) {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(path = %self.path.display(), err = %e, "failed to create key store dir");
                    return;
                }
            }
        }
        match serde_json::to_vec_pretty(entries) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    warn!(path = %self.path.display(), err = %e, "failed to persist key store");
                }
            }
            Err(e) => warn!(err = %e, "failed to serialize key store"),
        }
    }
}

impl KeyStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
            self.save(&entries);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.remove(key).is_some() {
                self.save(&entries);
            }
        }
    }
}
