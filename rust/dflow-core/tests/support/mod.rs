//! Shared constructors for the `tests/` integration suite (spec §8).

use std::sync::Arc;

use dflow_core::device::{Device, DeviceTable};
use dflow_core::mempool::MemoryPool;
use dflow_core::task::{
    AccessMode, DeviceClass, FlowBinding, FlowDecl, Incarnation, SubmitResult, Task, TaskFunction,
    TaskHandle, TaskId, TaskStatus,
};

pub fn device(index: u32, segments: usize) -> Device {
    let pool = MemoryPool::new(index, (segments as u64) * 256, 100, None, 256);
    Device::new(index, 1.0, 1.0, pool, 4, 8)
}

/// `DeviceTable` indexes positionally rather than by `Device::index`, so a
/// table exercising "device 2" against a bare host (position 0) needs a
/// filler occupying position 1 (the unused recursive device) to keep
/// positions aligned with device indices.
pub fn table(host_segments: usize, accelerator: Device) -> DeviceTable {
    DeviceTable::new(vec![device(0, host_segments), device(1, 0), accelerator])
}

/// A read-write CUDA-class task function over a single flow, with a
/// `submit` that always enqueues (no real kernel work).
pub fn rw_function(name: &'static str) -> Arc<TaskFunction> {
    Arc::new(TaskFunction {
        name,
        flows: vec![FlowDecl {
            index: 0,
            access: AccessMode::ReadWrite,
            name: Some("x"),
        }],
        incarnations: vec![Incarnation {
            device_class: DeviceClass::Cuda,
            dyld_name: None,
            hook: None,
            submit: Some(Arc::new(|_h: &TaskHandle, _dev, _stream| SubmitResult::Enqueued)),
        }],
        key_fn: None,
    })
}

/// A read-only CUDA-class task function over a single flow.
pub fn read_only_function(name: &'static str) -> Arc<TaskFunction> {
    Arc::new(TaskFunction {
        name,
        flows: vec![FlowDecl {
            index: 0,
            access: AccessMode::Read,
            name: Some("x"),
        }],
        incarnations: vec![Incarnation {
            device_class: DeviceClass::Cuda,
            dyld_name: None,
            hook: None,
            submit: Some(Arc::new(|_h: &TaskHandle, _dev, _stream| SubmitResult::Enqueued)),
        }],
        key_fn: None,
    })
}

/// A CPU-only task function whose `hook` runs a caller-supplied closure.
pub fn cpu_function(
    name: &'static str,
    hook: impl Fn(&TaskHandle) + Send + Sync + 'static,
) -> Arc<TaskFunction> {
    Arc::new(TaskFunction {
        name,
        flows: vec![FlowDecl {
            index: 0,
            access: AccessMode::ReadWrite,
            name: Some("x"),
        }],
        incarnations: vec![Incarnation {
            device_class: DeviceClass::Cpu,
            dyld_name: None,
            hook: Some(Arc::new(hook)),
            submit: None,
        }],
        key_fn: None,
    })
}

pub fn handle(id: TaskId, function: Arc<TaskFunction>, datum: u64, pushout: bool) -> Arc<TaskHandle> {
    Arc::new(TaskHandle {
        id,
        function,
        bindings: parking_lot::Mutex::new(vec![FlowBinding {
            data_in: Some(datum),
            data_out: Some(datum),
        }]),
        pushout,
    })
}

pub fn task(
    id: TaskId,
    function: Arc<TaskFunction>,
    priority: i32,
    device_class: DeviceClass,
    datum: u64,
    pushout: bool,
) -> Arc<Task> {
    Arc::new(Task {
        handle: handle(id, function, datum, pushout),
        priority,
        status: TaskStatus::Scheduled,
        device_class,
        on_complete: None,
        seq: id,
    })
}
