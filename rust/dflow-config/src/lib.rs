// dflow-config: configuration management for the dataflow runtime.
// TOML-based configuration with `DFLOW_*` environment variable overrides.

pub mod config;
pub mod env;
pub mod schema;

pub use config::load_config;
pub use env::{apply_env_overrides, load_env_overrides};
pub use schema::{ConfigError, DeviceCudaConfig, DflowConfig, SchedulerKind};
