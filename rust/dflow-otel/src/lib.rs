// dflow-otel: tracing bootstrap for the dataflow runtime
//
// Mirrors knhk-otel's std-feature gating: everything here compiles away to
// nothing when `std` is disabled so downstream no_std-curious crates can
// still depend on the log call sites.

#![cfg_attr(not(feature = "std"), no_std)]

/// Verbosity levels understood by `device_cuda.verbose` (see dflow-config).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Silent,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Verbosity {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Verbosity::Silent,
            1 => Verbosity::Error,
            2 => Verbosity::Warn,
            3 => Verbosity::Info,
            4 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }

    #[cfg(feature = "std")]
    fn filter_str(self) -> &'static str {
        match self {
            Verbosity::Silent => "off",
            Verbosity::Error => "error",
            Verbosity::Warn => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

/// Installs a process-wide `tracing` subscriber honoring `DFLOW_LOG`, or
/// falling back to `verbosity`. Intended to be called once from the
/// context-bootstrap collaborator (out of this crate's scope) before
/// `Engine::init`; calling it more than once is a no-op.
#[cfg(feature = "std")]
pub fn init_tracing(verbosity: Verbosity) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("DFLOW_LOG")
        .unwrap_or_else(|_| EnvFilter::new(verbosity.filter_str()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(not(feature = "std"))]
pub fn init_tracing(_verbosity: Verbosity) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_from_level_clamps_to_trace() {
        assert_eq!(Verbosity::from_level(0), Verbosity::Silent);
        assert_eq!(Verbosity::from_level(99), Verbosity::Trace);
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing(Verbosity::Debug);
        init_tracing(Verbosity::Trace);
    }
}
