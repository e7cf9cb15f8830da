//! Top-level load path: file, then environment overrides, then validation.
//! Loading hierarchy: env > file > defaults (same order as `knhk-config`).

use std::path::Path;

use crate::env::{apply_env_overrides, load_env_overrides};
use crate::schema::{ConfigError, DflowConfig};

/// Loads configuration from an optional TOML file plus `DFLOW_*` env vars.
/// `path` is typically supplied by the context-bootstrap collaborator;
/// passing `None` yields defaults overridden only by the environment.
pub fn load_config(path: Option<&Path>) -> Result<DflowConfig, ConfigError> {
    let mut config = match path {
        Some(p) if p.exists() => load_from_file(p)?,
        _ => DflowConfig::default(),
    };

    let overrides = load_env_overrides();
    apply_env_overrides(&mut config, &overrides)?;

    config.validate()?;
    Ok(config)
}

pub fn load_from_file(path: &Path) -> Result<DflowConfig, ConfigError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
}
