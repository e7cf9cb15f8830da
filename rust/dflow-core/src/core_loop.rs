//! 4.K Core loop: per-device driver election and the single-driver round
//! that ships tasks through stage-in -> execute -> (write-back) ->
//! stage-out -> epilog. `enter` is the offload scheduler's entry point
//! named in spec 4.K; `drive` is the loop a worker runs once it becomes the
//! sole driver for a device.

use std::collections::HashMap;
use std::sync::Arc;

use crate::datum::CopyIndex;
use crate::device::DeviceTable;
use crate::error::DflowError;
use crate::offload;
use crate::registry::Registry;
use crate::task::{DeviceIndex, SubmitResult, Task, TaskFunction, TaskHandle, TaskId};
use crate::stream::Event;

/// Default size of a synthesized write-back batch (`W` in spec 4.K.3).
pub const DEFAULT_WRITEBACK_BATCH: usize = 4;

/// Outcome of a worker's attempt to run a task through a device.
pub enum DriveOutcome {
    /// Another worker is already driving; the task was queued.
    Async,
    /// This worker drove the device until the last accepted task drained.
    Relinquished,
    /// A fatal error poisoned the device; `drained` is its former pending
    /// FIFO, to be rerouted to the CPU scheduler by the caller (spec §7).
    Faulted {
        error: DflowError,
        drained: Vec<Arc<Task>>,
    },
}

/// Entry point for a worker offering `task` to device `dev` (spec 4.K).
/// `load_delta` is whatever the selector added to `device_load[dev]` for
/// this task (spec 4.J); it is reversed exactly once the task completes or
/// the device is poisoned.
pub fn enter(
    devices: &mut DeviceTable,
    registry: &Registry,
    dev: DeviceIndex,
    task: Arc<Task>,
    load_delta: u64,
) -> DriveOutcome {
    if devices.get(dev).join_as_follower() {
        devices.get(dev).pending.push(task, load_delta);
        return DriveOutcome::Async;
    }

    drive(devices, registry, dev, task, load_delta, DEFAULT_WRITEBACK_BATCH)
}

fn writeback_handle(id: TaskId) -> Arc<TaskHandle> {
    Arc::new(TaskHandle {
        id,
        function: Arc::new(TaskFunction {
            name: "__writeback",
            flows: Vec::new(),
            incarnations: Vec::new(),
            key_fn: None,
        }),
        bindings: parking_lot::Mutex::new(Vec::new()),
        pushout: true,
    })
}

/// Runs the device's driver round until the last accepted task drains
/// (spec 4.K items 1-5), starting with `seed` as the first task through the
/// pipeline.
///
/// The stream/registry split forced by Rust's aliasing rules (a stream's
/// `progress` call needs `&mut Stream` while its submit closure would want
/// `&mut DeviceTable`/`&Registry` too) is resolved by doing every
/// registry-mutating decision (`reserve`, `prepare_stage_in`,
/// `prepare_stage_out`) just before handing the task to the stream, and
/// having the submit closures only read a precomputed tick count for that
/// task's id. This keeps the async-completion *signal* inside the stream
/// (as spec 4.H describes) while the actual state transition happens
/// exactly once, at the point the task is accepted into the pipeline.
fn drive(
    devices: &mut DeviceTable,
    registry: &Registry,
    dev: DeviceIndex,
    seed: Arc<Task>,
    seed_load_delta: u64,
    writeback_batch: usize,
) -> DriveOutcome {
    let mut inflight: HashMap<TaskId, Arc<Task>> = HashMap::new();
    let mut load_delta: HashMap<TaskId, u64> = HashMap::new();
    let mut stage_in_ticks: HashMap<TaskId, u32> = HashMap::new();
    let mut stage_out_ticks: HashMap<TaskId, u32> = HashMap::new();
    let mut writeback_batches: HashMap<TaskId, Vec<CopyIndex>> = HashMap::new();
    let mut synthetic_id = TaskId::MAX;

    inflight.insert(seed.id(), seed.clone());
    load_delta.insert(seed.id(), seed_load_delta);
    let mut next_stage_in: Option<Arc<Task>> = Some(seed);

    loop {
        // --- 1. Reserve + stage-in for the task entering this round ---
        let mut stage_in_seed = None;
        if let Some(task) = next_stage_in.take() {
            match offload::reserve(devices, registry, &task.handle, dev) {
                Ok(()) => match offload::prepare_stage_in(devices, registry, &task.handle, dev, task.id()) {
                    Ok(needs_transfer) => {
                        stage_in_ticks.insert(task.id(), if needs_transfer { 1 } else { 0 });
                        stage_in_seed = Some((task.handle.clone(), task.priority));
                    }
                    Err(err) => return fault(devices, dev, err),
                },
                Err(DflowError::Retry(_)) => {
                    let delta = load_delta.remove(&task.id()).unwrap_or(0);
                    devices.get(dev).pending.push(task, delta);
                }
                Err(err) => return fault(devices, dev, err),
            }
        }

        let t0 = {
            let ticks = &stage_in_ticks;
            devices.get_mut(dev).streams[0].progress(
                |h| (SubmitResult::Enqueued, Event::after_ticks(*ticks.get(&h.id).unwrap_or(&0))),
                stage_in_seed,
            )
        };
        if let Some(h) = &t0 {
            offload::complete_stage_in(devices, registry, h, dev);
            stage_in_ticks.remove(&h.id);
        }

        // --- 2. Execute (round-robin stream) ---
        if let Some(h) = &t0 {
            offload::assert_inputs_ready(devices, registry, h, dev);
        }
        let exec_seed = t0
            .as_ref()
            .and_then(|h| inflight.get(&h.id))
            .map(|t| (t.handle.clone(), t.priority, t.device_class));
        let exec_idx = devices.get_mut(dev).next_execute_stream();
        let t1 = devices.get_mut(dev).streams[exec_idx].progress(
            |h| {
                let result = inflight
                    .get(&h.id)
                    .and_then(|t| t.function.incarnation_for(t.device_class))
                    .and_then(|inc| inc.submit.as_ref())
                    .map(|submit| submit(h, dev, exec_idx as u32))
                    .unwrap_or(SubmitResult::Enqueued);
                (result, Event::after_ticks(1))
            },
            exec_seed.map(|(h, p, _)| (h, p)),
        );

        // --- 3. Synthesize a write-back batch if the pipeline is otherwise idle ---
        let mut stage_out_seed = None;
        if let Some(h) = &t1 {
            let needs_pushout = offload::prepare_stage_out(devices, registry, h, dev);
            stage_out_ticks.insert(h.id, if needs_pushout { 1 } else { 0 });
            let priority = inflight.get(&h.id).map(|t| t.priority).unwrap_or(0);
            stage_out_seed = Some((h.clone(), priority));
        } else if t0.is_none() {
            let batch = offload::begin_writeback(devices, dev, writeback_batch);
            if !batch.is_empty() {
                synthetic_id -= 1;
                let handle = writeback_handle(synthetic_id);
                writeback_batches.insert(synthetic_id, batch);
                stage_out_ticks.insert(synthetic_id, 1);
                stage_out_seed = Some((handle, i32::MIN));
            }
        }

        let t2 = {
            let ticks = &stage_out_ticks;
            devices.get_mut(dev).streams[1].progress(
                |h| (SubmitResult::Enqueued, Event::after_ticks(*ticks.get(&h.id).unwrap_or(&0))),
                stage_out_seed,
            )
        };

        // --- 4/5. Completion handling ---
        if let Some(h) = t2 {
            stage_out_ticks.remove(&h.id);
            if let Some(batch) = writeback_batches.remove(&h.id) {
                offload::complete_writeback(devices, registry, dev, &batch);
            } else {
                offload::epilog(devices, registry, &h, dev);
                if let Some(task) = inflight.remove(&h.id) {
                    if let Some(delta) = load_delta.remove(&h.id) {
                        devices.get(dev).sub_load(delta);
                    }
                    if let Some(cb) = &task.on_complete {
                        cb(task.id(), Ok(()));
                    }
                }
                if devices.get(dev).leave() {
                    return DriveOutcome::Relinquished;
                }
                if let Some(entry) = devices.get(dev).pending.pop() {
                    inflight.insert(entry.task.id(), entry.task.clone());
                    load_delta.insert(entry.task.id(), entry.load_delta);
                    next_stage_in = Some(entry.task);
                }
            }
        }

        // A retried reserve or a follower that joined mid-round leaves
        // `pending` non-empty with nothing else in flight to wake it; pick
        // the next arrival up directly rather than waiting for a completion
        // that may never come.
        if next_stage_in.is_none() && t0.is_none() && t1.is_none() {
            if let Some(entry) = devices.get(dev).pending.pop() {
                inflight.insert(entry.task.id(), entry.task.clone());
                load_delta.insert(entry.task.id(), entry.load_delta);
                next_stage_in = Some(entry.task);
            }
        }
    }
}

fn fault(devices: &mut DeviceTable, dev: DeviceIndex, error: DflowError) -> DriveOutcome {
    let drained = devices.get(dev).poison();
    DriveOutcome::Faulted { error, drained }
}
