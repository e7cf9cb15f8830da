//! Environment variable overrides, same `PREFIX_SECTION_KEY` convention as
//! `knhk-config::env` but rooted at `DFLOW_` and targeting the
//! `device_cuda.*` / `scheduler` fields from spec §6.

use std::collections::BTreeMap;
use std::env;

use crate::schema::{ConfigError, DflowConfig, SchedulerKind};

const PREFIX: &str = "DFLOW_";

/// Collects every `DFLOW_*` environment variable, normalized to lowercase
/// with the prefix stripped (`DFLOW_DEVICE_CUDA_ENABLED` -> `device_cuda_enabled`).
pub fn load_env_overrides() -> BTreeMap<String, String> {
    let mut overrides = BTreeMap::new();
    for (key, value) in env::vars() {
        if let Some(rest) = key.strip_prefix(PREFIX) {
            overrides.insert(rest.to_lowercase(), value);
        }
    }
    overrides
}

/// Applies overrides collected by [`load_env_overrides`] onto `config`,
/// per the `device_cuda.*` and `scheduler` keys documented in spec §6.
pub fn apply_env_overrides(
    config: &mut DflowConfig,
    overrides: &BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    for (key, value) in overrides {
        match key.as_str() {
            "scheduler" => {
                config.scheduler = match value.as_str() {
                    "ap" => SchedulerKind::Ap,
                    "pbq" => SchedulerKind::Pbq,
                    other => {
                        return Err(ConfigError::Invalid(format!(
                            "unknown scheduler kind '{other}', expected 'ap' or 'pbq'"
                        )))
                    }
                };
            }
            "device_cuda_enabled" => {
                config.device_cuda.enabled = parse(key, value)?;
            }
            "device_cuda_mask" => {
                config.device_cuda.mask = parse(key, value)?;
            }
            "device_cuda_memory_use" => {
                config.device_cuda.memory_use = parse(key, value)?;
            }
            "device_cuda_memory_number_of_blocks" => {
                config.device_cuda.memory_number_of_blocks = parse(key, value)?;
            }
            "device_cuda_memory_block_size" => {
                config.device_cuda.memory_block_size = parse(key, value)?;
            }
            "device_cuda_path" => {
                config.device_cuda.path = value.clone();
            }
            "device_cuda_verbose" => {
                config.device_cuda.verbose = parse(key, value)?;
            }
            _ => {
                // Unknown keys are ignored rather than rejected: the env
                // namespace is shared with collaborators outside the CORE
                // (CLI bootstrap, DSL compiler) that this crate doesn't know about.
            }
        }
    }
    Ok(())
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("cannot parse env override {key}={value}")))
}
