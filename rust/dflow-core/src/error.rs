//! Error kinds (spec §7) and the scheduler-API exit codes (spec §6).

use thiserror::Error;

/// The five error kinds enumerated in spec §7.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DflowError {
    /// Fatal for the device: pending FIFO is reinjected into the CPU
    /// scheduler, `active_workers` is reset, device removed from selection.
    #[error("device {0} reported a fatal API failure")]
    DeviceApiFailure(u32),

    /// Recoverable: the caller should evict and retry; if eviction cannot
    /// free enough space, the task is rescheduled.
    #[error("device {0} memory pool exhausted")]
    MemoryExhausted(u32),

    /// Fatal for the offending task: a write was requested while another
    /// reader still holds the destination copy.
    #[error("anti-dependency detected for datum {datum} on device {device}")]
    AntiDependency { datum: u64, device: u32 },

    /// The device-kernel symbol for a task function's incarnation could
    /// not be resolved; the device is cleared from that handle's mask.
    #[error("no incarnation found for function {function} on device class {device_class}")]
    NotFound {
        function: &'static str,
        device_class: &'static str,
    },

    /// Internal signal: pool exhausted even after eviction, caller must
    /// reschedule the task. Never escapes `reserve`.
    #[error("retry: pool exhaustion for task on device {0}")]
    Retry(u32),
}

/// Scheduler API exit codes (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    ErrOutOfResource,
    ErrNotFound,
    ErrDeviceDisabled,
}

impl From<&DflowError> for ExitCode {
    fn from(err: &DflowError) -> Self {
        match err {
            DflowError::DeviceApiFailure(_) => ExitCode::ErrDeviceDisabled,
            DflowError::MemoryExhausted(_) | DflowError::Retry(_) => ExitCode::ErrOutOfResource,
            DflowError::AntiDependency { .. } => ExitCode::ErrDeviceDisabled,
            DflowError::NotFound { .. } => ExitCode::ErrNotFound,
        }
    }
}

impl From<DflowError> for ExitCode {
    fn from(err: DflowError) -> Self {
        ExitCode::from(&err)
    }
}

pub type DflowResult<T> = Result<T, DflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_error_kinds_to_exit_codes() {
        assert_eq!(
            ExitCode::from(DflowError::MemoryExhausted(0)),
            ExitCode::ErrOutOfResource
        );
        assert_eq!(
            ExitCode::from(DflowError::NotFound {
                function: "f",
                device_class: "cuda"
            }),
            ExitCode::ErrNotFound
        );
        assert_eq!(
            ExitCode::from(DflowError::DeviceApiFailure(1)),
            ExitCode::ErrDeviceDisabled
        );
    }
}
