//! Serde schema for the on-disk config file and its defaults.

use serde::{Deserialize, Serialize};

/// Scheduler policy selector (§6 "Scheduler selection").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Absolute-priority: one ordered list per NUMA domain.
    Ap,
    /// Priority-biased queues: per-worker hbbuffer with locality steal order.
    Pbq,
}

impl Default for SchedulerKind {
    fn default() -> Self {
        SchedulerKind::Pbq
    }
}

/// The `device_cuda.*` table from §6.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCudaConfig {
    /// Number of accelerators to activate (0 disables the offload engine).
    pub enabled: u32,
    /// Bitmask selecting which physical devices within `enabled` to use.
    pub mask: u64,
    /// Percentage (0-100) of device free memory to reserve for the pool.
    pub memory_use: u8,
    /// Explicit block count; overrides `memory_use` when >= 0 (-1 = unset).
    pub memory_number_of_blocks: i64,
    /// Segment size in bytes for the bump/free allocator.
    pub memory_block_size: u64,
    /// `;`-separated device-kernel library search paths.
    pub path: String,
    /// Log verbosity level (0 = silent .. 5 = trace), see `dflow-otel::Verbosity`.
    pub verbose: u8,
}

impl Default for DeviceCudaConfig {
    fn default() -> Self {
        Self {
            enabled: 0,
            mask: u64::MAX,
            memory_use: 90,
            memory_number_of_blocks: -1,
            memory_block_size: 32 * 1024 * 1024,
            path: String::new(),
            verbose: 1,
        }
    }
}

/// Top-level configuration document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DflowConfig {
    pub scheduler: SchedulerKind,
    pub device_cuda: DeviceCudaConfig,
}

impl Default for DflowConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::default(),
            device_cuda: DeviceCudaConfig::default(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(String),
    #[error("failed to parse config file: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl DflowConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_cuda.memory_use > 100 {
            return Err(ConfigError::Invalid(format!(
                "device_cuda.memory_use must be a percentage <= 100, got {}",
                self.device_cuda.memory_use
            )));
        }
        if self.device_cuda.memory_block_size == 0 {
            return Err(ConfigError::Invalid(
                "device_cuda.memory_block_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}
