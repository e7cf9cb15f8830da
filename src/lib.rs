// dflow: public façade over dflow-core (scheduler + offload engine),
// dflow-config (on-disk/`DFLOW_*` configuration) and dflow-otel (tracing
// bootstrap). The core scheduler and offload engine are plain OS threads
// (DESIGN.md "no async in the core loop"); the only place this crate
// touches an async runtime is `schedule_async` below, a convenience for
// callers already built on tokio.

pub use dflow_core::*;

pub use dflow_config::{
    apply_env_overrides, load_config, load_env_overrides, ConfigError, DeviceCudaConfig,
    DflowConfig, SchedulerKind,
};
pub use dflow_otel::{init_tracing, Verbosity};

use std::sync::Arc;

use dflow_core::engine::Engine;
use dflow_core::task::{DeviceClass, FlowBinding, TaskFunction, TaskId};
use dflow_core::topology::WorkerId;

/// Schedules `function` on `engine` without blocking the calling async
/// task: the (synchronous, lock-based) scheduling call runs on tokio's
/// blocking pool. The DSL-compiler collaborator named throughout spec §6
/// is out of this crate's scope but may itself be built on an async
/// runtime, which is what this exists for.
pub async fn schedule_async(
    engine: Arc<Engine>,
    worker: WorkerId,
    function: Arc<TaskFunction>,
    bindings: Vec<FlowBinding>,
    priority: i32,
    device_class: DeviceClass,
    pushout: bool,
    distance_hint: u32,
) -> Result<TaskId, tokio::task::JoinError> {
    tokio::task::spawn_blocking(move || {
        engine.schedule(
            worker,
            function,
            bindings,
            priority,
            device_class,
            pushout,
            distance_hint,
            None,
        )
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use dflow_core::engine::EngineConfig;
    use dflow_core::task::{AccessMode, FlowDecl, Incarnation};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn schedule_async_runs_on_the_blocking_pool() {
        let engine = Engine::new(EngineConfig::default());
        engine.ensure_datum(1, 64);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let function = Arc::new(TaskFunction {
            name: "noop",
            flows: vec![FlowDecl {
                index: 0,
                access: AccessMode::ReadWrite,
                name: Some("x"),
            }],
            incarnations: vec![Incarnation {
                device_class: DeviceClass::Cpu,
                dyld_name: None,
                hook: Some(Arc::new(move |_h| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                })),
                submit: None,
            }],
            key_fn: None,
        });

        let id = schedule_async(
            engine.clone(),
            0,
            function,
            vec![FlowBinding { data_in: Some(1), data_out: Some(1) }],
            0,
            DeviceClass::Cpu,
            false,
            0,
        )
        .await
        .unwrap();

        assert!(id > 0);
        assert!(engine.worker_tick(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
