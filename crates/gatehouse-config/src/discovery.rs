//! Config file discovery.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/gatehouse/config.toml` (XDG user config)
//! 2. `./gatehouse.toml` (project-local)
//! 3. `GATEHOUSE_*` environment variables

use std::path::{Path, PathBuf};

use crate::context::AuthContext;
use crate::error::{ConfigError, Result};

/// Default config filename for project-local config.
const PROJECT_CONFIG_FILE: &str = "gatehouse.toml";

/// Default config filename within the XDG config directory.
const USER_CONFIG_FILE: &str = "config.toml";

/// Application name for XDG directory resolution.
const APP_NAME: &str = "gatehouse";

/// Path of the user-level config file, if a config directory exists.
///
/// `GATEHOUSE_CONFIG_DIR` overrides the platform default.
pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("GATEHOUSE_CONFIG_DIR") {
        return Some(PathBuf::from(dir).join(USER_CONFIG_FILE));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME).join(USER_CONFIG_FILE))
}

/// Load an auth context from a specific file path (no discovery).
pub fn load_context_file(path: &Path) -> Result<AuthContext> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    AuthContext::from_toml(&contents)
}

/// Load the auth context by discovering config layers.
///
/// Missing files are skipped; later layers override earlier ones field by
/// field (empty fields in a later layer do not clobber earlier values).
/// Environment variables are applied last.
pub fn load_context(project_dir: Option<&Path>) -> Result<AuthContext> {
    let mut ctx = AuthContext::default();

    if let Some(path) = user_config_path() {
        if path.exists() {
            merge(&mut ctx, load_context_file(&path)?);
        }
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    if project_path.exists() {
        merge(&mut ctx, load_context_file(&project_path)?);
    }

    apply_env(&mut ctx);
    Ok(ctx)
}

/// Overlay non-empty fields from `layer` onto `base`.
fn merge(base: &mut AuthContext, layer: AuthContext) {
    if !layer.application_url.is_empty() {
        base.application_url = layer.application_url;
    }
    if !layer.openid_config_url.is_empty() {
        base.openid_config_url = layer.openid_config_url;
    }
    if !layer.client_id.is_empty() {
        base.client_id = layer.client_id;
    }
    // A layer that never mentions scope deserializes to the default; don't
    // let that clobber a custom scope from an earlier layer.
    if !layer.scope.is_empty() && layer.scope != crate::context::DEFAULT_AUTH_SCOPE {
        base.scope = layer.scope;
    }
    if !layer.post_sign_out_url.is_empty() {
        base.post_sign_out_url = layer.post_sign_out_url;
    }
    if !layer.auth_callback_url.is_empty() {
        base.auth_callback_url = layer.auth_callback_url;
    }
}

/// Apply `GATEHOUSE_*` environment overrides.
fn apply_env(ctx: &mut AuthContext) {
    let overrides: [(&str, &mut String); 6] = [
        ("GATEHOUSE_APPLICATION_URL", &mut ctx.application_url),
        ("GATEHOUSE_OPENID_CONFIG_URL", &mut ctx.openid_config_url),
        ("GATEHOUSE_CLIENT_ID", &mut ctx.client_id),
        ("GATEHOUSE_SCOPE", &mut ctx.scope),
        ("GATEHOUSE_POST_SIGN_OUT_URL", &mut ctx.post_sign_out_url),
        ("GATEHOUSE_AUTH_CALLBACK_URL", &mut ctx.auth_callback_url),
    ];
    for (var, field) in overrides {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                *field = value;
            }
        }
    }
}
