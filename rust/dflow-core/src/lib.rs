// dflow-core: hierarchical work-stealing CPU scheduler and coherent GPU
// offload engine. See spec sections 4.A-4.K for the per-module contracts;
// each module's doc comment cites the section it implements.

pub mod core_loop;
pub mod datum;
pub mod device;
pub mod engine;
pub mod error;
pub mod function_registry;
pub mod hbbuffer;
pub mod lru;
pub mod mempool;
pub mod offload;
pub mod registry;
pub mod scheduler;
pub mod selector;
pub mod stream;
pub mod task;
pub mod topology;
pub mod worker_queue;

pub use datum::{CoherencyState, CopyIndex, DataCopy, DataTransferStatus, DatumId, DatumMeta};
pub use device::{Device, DeviceTable, PendingEntry, PendingFifo};
pub use engine::{Engine, EngineConfig};
pub use error::{DflowError, DflowResult, ExitCode};
pub use function_registry::{FunctionRegistry, ProcessSymbolResolver, SymbolResolver};
pub use registry::Registry;
pub use scheduler::{ApScheduler, PbqScheduler, Scheduler, SchedulerPolicy};
pub use task::{
    AccessMode, DeviceClass, DeviceIndex, FlowBinding, FlowDecl, Incarnation, SubmitResult, Task,
    TaskFunction, TaskHandle, TaskId, TaskStatus, HOST_DEVICE, RECURSIVE_DEVICE,
};
pub use topology::{Topology, WorkerId};

/// Commonly paired imports for a context-bootstrap collaborator wiring up
/// an `Engine`.
pub mod prelude {
    pub use crate::engine::{Engine, EngineConfig};
    pub use crate::function_registry::{FunctionRegistry, SymbolResolver};
    pub use crate::task::{
        AccessMode, DeviceClass, FlowBinding, FlowDecl, Incarnation, SubmitResult, Task,
        TaskFunction, TaskHandle,
    };
    pub use crate::topology::Topology;
}
