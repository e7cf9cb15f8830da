//! §3 data model: task descriptors and flows, plus the external task-function
//! contract consumed from the DSL-compiler collaborator (spec §6).

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::datum::DatumId;
use crate::error::DflowError;

pub type TaskId = u64;

/// Access mode for one flow, spec §3.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
    /// Control dependency: no data movement, participates in scheduling only.
    Ctl,
}

impl AccessMode {
    pub fn is_read(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn is_write(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }

    pub fn is_ctl(self) -> bool {
        matches!(self, AccessMode::Ctl)
    }
}

/// Static description of one dependency slot on a task function (spec §3, §6).
#[derive(Clone, Debug)]
pub struct FlowDecl {
    pub index: u32,
    pub access: AccessMode,
    pub name: Option<&'static str>,
}

/// Device class a task's incarnation targets (§6). Device 0 is always the
/// host CPU; device 1 is reserved for "recursive" tasks (spec §4.J); device
/// classes >= 2 are accelerators registered at context init.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DeviceClass {
    Cpu,
    Recursive,
    Cuda,
}

pub type DeviceIndex = u32;
pub const HOST_DEVICE: DeviceIndex = 0;
pub const RECURSIVE_DEVICE: DeviceIndex = 1;

/// One incarnation of a task function, specialized for a device class
/// (spec §6): a CPU `hook` or a device `submit` function, plus the
/// optional `dyld` symbol name resolved at device-registration time.
#[derive(Clone)]
pub struct Incarnation {
    pub device_class: DeviceClass,
    pub dyld_name: Option<&'static str>,
    pub hook: Option<Arc<dyn Fn(&TaskHandle) + Send + Sync>>,
    pub submit: Option<Arc<dyn Fn(&TaskHandle, DeviceIndex, u32) -> SubmitResult + Send + Sync>>,
}

impl fmt::Debug for Incarnation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incarnation")
            .field("device_class", &self.device_class)
            .field("dyld_name", &self.dyld_name)
            .field("has_hook", &self.hook.is_some())
            .field("has_submit", &self.submit.is_some())
            .finish()
    }
}

/// Result of a device `submit` call: kernels were enqueued, or the stream's
/// ring buffer had no free slot and the caller should retry later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    Enqueued,
    NoRoom,
}

/// Static array of flows plus incarnations: the task "function" named in
/// spec §6, loaded by the (out-of-scope) DSL compiler.
pub struct TaskFunction {
    pub name: &'static str,
    pub flows: Vec<FlowDecl>,
    pub incarnations: Vec<Incarnation>,
    /// Profiling identity, spec §6: `key(handle, locals) -> u64`.
    pub key_fn: Option<Arc<dyn Fn(&TaskHandle) -> u64 + Send + Sync>>,
}

impl TaskFunction {
    pub fn nb_flows(&self) -> usize {
        self.flows.len()
    }

    pub fn incarnation_for(&self, class: DeviceClass) -> Option<&Incarnation> {
        self.incarnations.iter().find(|i| i.device_class == class)
    }
}

/// Per-flow current data-copy reference (spec §3: `data_in`/`data_out`).
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowBinding {
    pub data_in: Option<DatumId>,
    pub data_out: Option<DatumId>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskStatus {
    Init,
    Ready,
    Scheduled,
    Running,
    Finished,
    Failed,
}

/// The scheduled task's identity and inputs — what a `hook`/`submit`
/// function and the offload state machine operate on. Kept separate from
/// [`Task`] so completion callbacks can be called with a cheap-to-clone
/// handle while the task itself lives in a queue.
pub struct TaskHandle {
    pub id: TaskId,
    pub function: Arc<TaskFunction>,
    /// Per-flow `data_in`/`data_out` (spec §3). Behind a mutex because
    /// epilog (4.I.5) swaps `data_out` to the host copy after a device
    /// write completes, and the handle is otherwise shared read-only
    /// across the streams driving a task's phases.
    pub bindings: Mutex<Vec<FlowBinding>>,
    /// Whether a WRITE flow's device copy should be staged back to the
    /// host eagerly (spec 4.I phase 4) rather than left on `owned_lru`.
    pub pushout: bool,
}

impl TaskHandle {
    pub fn flow_count(&self) -> usize {
        self.function.nb_flows()
    }

    pub fn binding(&self, flow_index: usize) -> FlowBinding {
        self.bindings.lock()[flow_index]
    }

    pub fn set_binding(&self, flow_index: usize, binding: FlowBinding) {
        self.bindings.lock()[flow_index] = binding;
    }
}

type CompletionCallback = Arc<dyn Fn(TaskId, Result<(), DflowError>) + Send + Sync>;

/// A task descriptor (spec §3): function pointer, priority, status, target
/// device class, and the handle passed to hooks/submit.
pub struct Task {
    pub handle: Arc<TaskHandle>,
    /// Signed 32-bit priority; higher runs earlier.
    pub priority: i32,
    pub status: TaskStatus,
    pub device_class: DeviceClass,
    pub on_complete: Option<CompletionCallback>,
    /// FIFO tie-break sequence number, assigned at schedule time.
    pub seq: u64,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.handle.id
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.handle.id)
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("device_class", &self.device_class)
            .field("seq", &self.seq)
            .finish()
    }
}
