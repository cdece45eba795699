//! Auth context configuration for the Gatehouse auth core.
//!
//! Provides the static [`AuthContext`] (provider URLs, client ID, scope) and
//! TOML-based loading with:
//! - Config file layering (XDG user config + project-local overrides)
//! - `GATEHOUSE_*` environment variable overrides
//! - Completeness validation before any flow touches the network

pub mod context;
pub mod discovery;
pub mod error;

pub use context::{AuthContext, DEFAULT_AUTH_SCOPE};
pub use discovery::{load_context, load_context_file, user_config_path};
pub use error::{ConfigError, Result};
