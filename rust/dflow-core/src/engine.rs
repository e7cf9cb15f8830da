//! `Engine`: owns the topology oracle, the scheduler, the device pool, the
//! data-copy registry and the function registry, and runs the worker loop
//! named in spec §2 component K ("select -> run (CPU hook) or enqueue
//! (device hook)"). Nothing here is a process-wide global (DESIGN NOTES
//! §9): `device_load[]`, `executed_tasks` and the device-kernel search path
//! all live as fields on this type.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::thread::JoinHandle;

use crossbeam_utils::Backoff;
use parking_lot::RwLock;

use crate::core_loop::{self, DriveOutcome};
use crate::datum::DatumMeta;
use crate::device::{Device, DeviceTable};
use crate::error::DflowError;
use crate::function_registry::{FunctionRegistry, ProcessSymbolResolver, SymbolResolver};
use crate::mempool::MemoryPool;
use crate::registry::Registry;
use crate::scheduler::{Scheduler, SchedulerPolicy};
use crate::selector;
use crate::task::{
    DeviceClass, FlowBinding, Task, TaskFunction, TaskHandle, TaskId, TaskStatus, HOST_DEVICE,
};
use crate::topology::{Topology, WorkerId};

use dflow_config::{DflowConfig, SchedulerKind};

type CompletionCallback = Arc<dyn Fn(TaskId, Result<(), DflowError>) + Send + Sync>;

/// Per-accelerator sizing, since a library crate has no real device to
/// query free memory from (spec §6 `device_cuda.*` keys assume that query
/// is done by the context-bootstrap collaborator). Each accelerator gets
/// the same `free_mem_bytes` budget.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub config: DflowConfig,
    pub nb_workers: u32,
    /// `Some((domains, workers_per_domain))` for a NUMA grid; `None` for a
    /// flat topology (spec 4.A).
    pub numa_grid: Option<(u32, u32)>,
    pub device_free_mem_bytes: u64,
    pub host_free_mem_bytes: u64,
    pub num_streams_per_device: usize,
    pub stream_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config: DflowConfig::default(),
            nb_workers: num_cpus::get().max(1) as u32,
            numa_grid: None,
            device_free_mem_bytes: 4u64 * 1024 * 1024 * 1024,
            host_free_mem_bytes: 1024 * 1024 * 1024,
            num_streams_per_device: 4,
            stream_capacity: 16,
        }
    }
}

/// Owns every piece of runtime state named across spec §4: topology,
/// scheduler, device table, data-copy registry, function registry, and the
/// monotonic counters the CLI/DSL-compiler collaborator would otherwise
/// read off process-wide globals.
pub struct Engine {
    topology: Topology,
    scheduler: Scheduler,
    devices: RwLock<DeviceTable>,
    registry: Registry,
    functions: RwLock<FunctionRegistry>,
    next_task_id: AtomicU64,
    executed_tasks: AtomicU64,
    shutdown: AtomicBool,
    barrier: Barrier,
    /// `;`-separated device-kernel search path (spec §6 `device_cuda.path`).
    search_path: String,
}

impl Engine {
    /// Builds the topology, devices, scheduler and registries from
    /// `config`. Device 0 (host) and device 1 (recursive, spec 4.J) are
    /// always present; accelerators 2.. come from `device_cuda.enabled`.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let topology = match config.numa_grid {
            Some((domains, per_domain)) => Topology::numa_grid(domains, per_domain),
            None => Topology::flat(config.nb_workers),
        };

        let scheduler = match config.config.scheduler {
            SchedulerKind::Ap => Scheduler::new_ap(&topology),
            SchedulerKind::Pbq => Scheduler::new_pbq(&topology),
        };
        for worker in topology.workers() {
            scheduler.init_worker(worker);
        }

        let devices = build_device_table(&config);
        let search_path = config.config.device_cuda.path.clone();

        Arc::new(Self {
            topology,
            scheduler,
            devices: RwLock::new(devices),
            registry: Registry::new(),
            functions: RwLock::new(FunctionRegistry::new()),
            next_task_id: AtomicU64::new(1),
            executed_tasks: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            barrier: Barrier::new(config.nb_workers.max(1) as usize),
            search_path,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn executed_tasks(&self) -> u64 {
        self.executed_tasks.load(Ordering::Relaxed)
    }

    /// Registers a datum's metadata so tasks can bind it as a flow input
    /// or output (spec 4.F).
    pub fn ensure_datum(&self, id: u64, size_bytes: usize) {
        self.registry.ensure_datum(DatumMeta::new(id, size_bytes));
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Read-only introspection of one device's state, for callers (and
    /// tests) that need to check pool/LRU occupancy without reaching
    /// into the engine's internal lock directly.
    pub fn inspect_device<R>(&self, idx: crate::task::DeviceIndex, f: impl FnOnce(&Device) -> R) -> R {
        f(self.devices.read().get(idx))
    }

    /// Registers a task function under its own name (spec §6: the DSL
    /// compiler's external interface into the registry).
    pub fn register_function(&self, function: Arc<TaskFunction>) {
        self.functions.write().register(function);
    }

    /// Resolves device-kernel symbols for every registered function's
    /// `device_class` incarnation, using the process's own symbol table
    /// (spec §6 "host process's own symbol table" fallback). Pass a fake
    /// [`SymbolResolver`] in tests to avoid depending on real binaries.
    pub fn register_device_symbols(&self, device_class: DeviceClass, capability: Option<u32>) {
        let resolver = ProcessSymbolResolver;
        self.register_device_symbols_with(device_class, capability, &resolver);
    }

    pub fn register_device_symbols_with(
        &self,
        device_class: DeviceClass,
        capability: Option<u32>,
        resolver: &dyn SymbolResolver,
    ) {
        self.functions
            .write()
            .register_device(device_class, &self.search_path, capability, resolver);
    }

    pub fn function_available(&self, function: &str, device_class: DeviceClass) -> bool {
        self.functions.read().is_available(function, device_class)
    }

    /// Submits a task for scheduling on `worker`'s local queue at
    /// `distance_hint` (spec 4.D `schedule(worker, task, distance)`;
    /// top-level producer calls pass `0` for "local"). Wraps the caller's
    /// completion callback so [`Self::executed_tasks`] advances exactly
    /// once per task regardless of whether it ran on the CPU or a device.
    pub fn schedule(
        self: &Arc<Self>,
        worker: WorkerId,
        function: Arc<TaskFunction>,
        bindings: Vec<FlowBinding>,
        priority: i32,
        device_class: DeviceClass,
        pushout: bool,
        distance_hint: u32,
        on_complete: Option<CompletionCallback>,
    ) -> TaskId {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(TaskHandle {
            id,
            function,
            bindings: parking_lot::Mutex::new(bindings),
            pushout,
        });

        let engine = self.clone();
        let wrapped: CompletionCallback = Arc::new(move |tid, result| {
            engine.executed_tasks.fetch_add(1, Ordering::Relaxed);
            if let Some(cb) = &on_complete {
                cb(tid, result);
            }
        });

        let task = Arc::new(Task {
            handle,
            priority,
            status: TaskStatus::Scheduled,
            device_class,
            on_complete: Some(wrapped),
            seq: id,
        });

        self.scheduler.schedule(worker, task, distance_hint);
        id
    }

    /// One worker's tick: select the next task, then run it on the CPU or
    /// hand it to the offload engine (spec §2 component K). Returns
    /// `false` when there was nothing to select, so the worker loop can
    /// back off.
    pub fn worker_tick(&self, worker: WorkerId) -> bool {
        let Some((task, _distance)) = self.scheduler.select(worker) else {
            return false;
        };
        match task.device_class {
            DeviceClass::Cpu => self.run_cpu(task),
            DeviceClass::Recursive | DeviceClass::Cuda => self.offload(worker, task),
        }
        true
    }

    fn run_cpu(&self, task: Arc<Task>) {
        if let Some(inc) = task.handle.function.incarnation_for(DeviceClass::Cpu) {
            if let Some(hook) = &inc.hook {
                hook(&task.handle);
            }
        }
        if let Some(cb) = &task.on_complete {
            cb(task.id(), Ok(()));
        }
    }

    fn offload(&self, worker: WorkerId, task: Arc<Task>) {
        let dev = {
            let devices = self.devices.read();
            selector::select_device(&devices, &self.registry, &task.handle, 1.0)
        };
        let (dev, load_delta) = dev;
        if dev == HOST_DEVICE {
            // No accelerator available or selected: degrade to the CPU
            // incarnation if the function has one (spec 4.J implies the
            // selector only ever returns HOST_DEVICE when every
            // accelerator is disabled or absent).
            return self.run_cpu(task);
        }

        let outcome = {
            let mut devices = self.devices.write();
            core_loop::enter(&mut devices, &self.registry, dev, task, load_delta)
        };

        if let DriveOutcome::Faulted { error, drained } = outcome {
            tracing::error!(device = dev, %error, "device faulted, draining pending tasks to CPU");
            for drained_task in drained {
                self.run_cpu_or_drop(worker, drained_task);
            }
        }
    }

    /// Reroutes a task drained from a poisoned device's pending FIFO back
    /// onto the CPU (spec §7: "pending FIFO is reinjected into the CPU
    /// scheduler"). A task with no CPU incarnation has nowhere left to
    /// run and fails its completion callback instead of looping back into
    /// the now-disabled device.
    fn run_cpu_or_drop(&self, _worker: WorkerId, task: Arc<Task>) {
        if task.handle.function.incarnation_for(DeviceClass::Cpu).is_some() {
            self.run_cpu(task);
        } else if let Some(cb) = &task.on_complete {
            cb(task.id(), Err(DflowError::NotFound {
                function: task.handle.function.name,
                device_class: "cpu",
            }));
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Spawns one OS thread per worker (spec §5: "parallel OS-level
    /// threads"). Each thread waits on the shared `flow_init` barrier
    /// before entering its idle-spin select loop, matching the
    /// publish-then-run-workers sequencing in spec §5/§6. Threads back off
    /// with an exponential spin (never blocking, spec §5 "no cooperative
    /// suspension") when nothing was selected.
    pub fn run_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.topology
            .workers()
            .map(|worker| {
                let engine = self.clone();
                thread::Builder::new()
                    .name(format!("dflow-worker-{worker}"))
                    .spawn(move || {
                        engine.barrier.wait();
                        let backoff = Backoff::new();
                        while !engine.is_shutdown() {
                            if engine.worker_tick(worker) {
                                backoff.reset();
                            } else {
                                backoff.snooze();
                            }
                        }
                    })
                    .expect("failed to spawn dflow worker thread")
            })
            .collect()
    }
}

fn build_device_table(config: &EngineConfig) -> DeviceTable {
    let cuda = &config.config.device_cuda;
    let host_pool = MemoryPool::new(HOST_DEVICE, config.host_free_mem_bytes, 100, None, cuda.memory_block_size);
    let mut devices = vec![
        Device::new(HOST_DEVICE, 1.0, 1.0, host_pool, config.num_streams_per_device, config.stream_capacity),
    ];
    // Device 1 is reserved for recursive tasks (spec 4.J) and never
    // participates in load-balanced selection; it still needs a pool so a
    // recursive task could, in principle, stage data through it.
    let recursive_pool = MemoryPool::new(1, config.host_free_mem_bytes, 100, None, cuda.memory_block_size);
    devices.push(Device::new(1, 1.0, 1.0, recursive_pool, config.num_streams_per_device, config.stream_capacity));

    let requested_blocks = if cuda.memory_number_of_blocks >= 0 {
        Some(cuda.memory_number_of_blocks as u64)
    } else {
        None
    };
    for i in 0..cuda.enabled {
        let index = 2 + i;
        let enabled = cuda.mask & (1u64 << i.min(63)) != 0;
        if !enabled {
            continue;
        }
        let pool = MemoryPool::new(
            index,
            config.device_free_mem_bytes,
            cuda.memory_use,
            requested_blocks,
            cuda.memory_block_size,
        );
        devices.push(Device::new(index, 1.0, 1.0, pool, config.num_streams_per_device, config.stream_capacity));
    }

    DeviceTable::new(devices)
}
