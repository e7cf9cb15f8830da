//! 4.I Offload state machine: reserve -> stage-in -> execute -> stage-out ->
//! epilog, driven one phase at a time by the core loop (`core_loop.rs`). Each
//! function here implements one phase against the shared device/registry
//! state; none of them block or poll hardware themselves (spec §5: "no
//! cooperative suspension inside the scheduler").

use std::sync::Arc;

use crate::datum::{CoherencyState, CopyIndex, DataTransferStatus, DatumId};
use crate::device::DeviceTable;
use crate::error::{DflowError, DflowResult};
use crate::registry::Registry;
use crate::task::{DeviceIndex, TaskHandle, TaskId};

fn flow_datum(task: &TaskHandle, flow_index: usize) -> Option<DatumId> {
    let binding = task.binding(flow_index);
    binding.data_in.or(binding.data_out)
}

fn task_datums(task: &TaskHandle) -> Vec<DatumId> {
    task.function
        .flows
        .iter()
        .filter(|f| !f.access.is_ctl())
        .filter_map(|f| flow_datum(task, f.index as usize))
        .collect()
}

/// A copy reserved during this call, and whether it was pinned (so a
/// failed reserve can unpin before backing it out).
struct Reserved {
    idx: CopyIndex,
    pinned: bool,
}

fn pin_copy(devices: &mut DeviceTable, dev: DeviceIndex, idx: CopyIndex) {
    let device = devices.get_mut(dev);
    device.free_lru.remove(idx);
    if let Some(copy) = device.copy_mut(idx) {
        copy.readers += 1;
    }
}

fn unpin_copy(devices: &mut DeviceTable, dev: DeviceIndex, idx: CopyIndex) {
    if let Some(copy) = devices.get_mut(dev).copy_mut(idx) {
        copy.readers = copy.readers.saturating_sub(1);
    }
}

/// 4.I.1 Reserve: ensures every non-CTL flow of `task` has a resident copy
/// on `dev`, allocating and evicting as needed, pinning read flows so they
/// survive until stage-out unpins them. On exhaustion, every copy reserved
/// so far this call is unpinned and pushed back onto `free_lru` at its head,
/// and [`DflowError::Retry`] is returned so the caller reschedules the task.
pub fn reserve(
    devices: &mut DeviceTable,
    registry: &Registry,
    task: &TaskHandle,
    dev: DeviceIndex,
) -> DflowResult<()> {
    let protected = task_datums(task);
    let mut reserved_this_call: Vec<Reserved> = Vec::new();

    for flow in &task.function.flows {
        if flow.access.is_ctl() {
            continue;
        }
        let Some(datum) = flow_datum(task, flow.index as usize) else {
            continue;
        };

        if let Some(idx) = registry.get(datum, dev) {
            if flow.access.is_read() {
                pin_copy(devices, dev, idx);
            }
            continue; // already resident: reuse
        }

        let meta = registry.meta(datum).ok_or(DflowError::NotFound {
            function: task.function.name,
            device_class: "cuda",
        })?;
        let version = registry
            .owner_device(datum)
            .and_then(|owner| registry.get(datum, owner).map(|idx| (owner, idx)))
            .and_then(|(owner, idx)| devices.get(owner).copy(idx))
            .map(|c| c.version)
            .unwrap_or(0);

        let idx = loop {
            if let Some(idx) =
                devices
                    .get_mut(dev)
                    .alloc_copy(datum, 1, meta.size_bytes as u64, version)
            {
                break idx;
            }
            if !evict_one(devices, registry, dev, &protected) {
                for r in reserved_this_call.drain(..) {
                    if r.pinned {
                        unpin_copy(devices, dev, r.idx);
                    }
                    devices.get_mut(dev).free_lru.push_front(r.idx);
                }
                tracing::warn!(device = dev, task = task.id, "reserve exhausted, rescheduling");
                return Err(DflowError::Retry(dev));
            }
        };

        registry.attach(datum, dev, idx);
        let pinned = flow.access.is_read();
        if pinned {
            if let Some(copy) = devices.get_mut(dev).copy_mut(idx) {
                copy.readers += 1;
            }
        }
        reserved_this_call.push(Reserved { idx, pinned });
        tracing::trace!(device = dev, datum, idx, "copy reserved");
    }

    Ok(())
}

/// Pops the oldest `free_lru` entry eligible for eviction (not pinned, not
/// one of `protected`'s datums), detaching and freeing it. Entries skipped
/// along the way are requeued in their original order. Returns `false` when
/// no eligible entry exists.
fn evict_one(
    devices: &mut DeviceTable,
    registry: &Registry,
    dev: DeviceIndex,
    protected: &[DatumId],
) -> bool {
    let device = devices.get_mut(dev);
    let mut skipped = Vec::new();
    let mut evicted = false;

    while let Some(idx) = device.free_lru.pop_front() {
        let Some(copy) = device.copy(idx) else { continue };
        if copy.readers != 0 || protected.contains(&copy.datum) {
            skipped.push(idx);
            continue;
        }
        let datum = copy.datum;
        registry.detach(datum, dev);
        device.free_copy(idx);
        tracing::debug!(device = dev, datum, idx, "evicted to satisfy reserve");
        evicted = true;
        break;
    }

    for idx in skipped {
        device.free_lru.push_back(idx);
    }
    evicted
}

/// 4.I.2 Stage-in decision: for each flow, asks the registry whether a
/// transfer is required. Returns `true` if any flow needs a host->device
/// copy (the caller should drive it through stream 0), or a fatal
/// [`DflowError::AntiDependency`] if a write targets a copy still pinned by
/// readers other than this task.
pub fn prepare_stage_in(
    devices: &mut DeviceTable,
    registry: &Registry,
    task: &TaskHandle,
    dev: DeviceIndex,
    task_id: TaskId,
) -> DflowResult<bool> {
    let mut needs_transfer = false;

    for flow in &task.function.flows {
        if flow.access.is_ctl() {
            continue;
        }
        let Some(datum) = flow_datum(task, flow.index as usize) else {
            continue;
        };

        match registry.transfer_ownership_to(devices, datum, dev, flow.access) {
            None => {
                // Destination already holds the required version: no bytes
                // move, but the copy must still read as transferred so
                // execute's readiness check passes.
                if let Some(idx) = registry.get(datum, dev) {
                    if let Some(copy) = devices.get_mut(dev).copy_mut(idx) {
                        if copy.transfer_status != DataTransferStatus::UnderTransfer {
                            copy.transfer_status = DataTransferStatus::CompleteTransfer;
                        }
                    }
                }
            }
            Some(source) => {
                let dest_idx = registry.get(datum, dev).ok_or(DflowError::Retry(dev))?;

                if flow.access.is_write() {
                    // This task's own read-pin (added by `reserve`) doesn't
                    // count as a conflicting reader.
                    let readers = devices
                        .get(dev)
                        .copy(dest_idx)
                        .map(|c| c.readers)
                        .unwrap_or(0);
                    let self_pin = u32::from(flow.access.is_read());
                    if readers > self_pin {
                        return Err(DflowError::AntiDependency { datum, device: dev });
                    }
                }

                let source_version = registry
                    .get(datum, source)
                    .and_then(|idx| devices.get(source).copy(idx))
                    .map(|c| c.version)
                    .unwrap_or(0);

                let dest = devices.get_mut(dev);
                if let Some(copy) = dest.copy_mut(dest_idx) {
                    debug_assert!(
                        copy.pending_completer.is_none()
                            || copy.pending_completer == Some(task_id),
                        "stage-in collision on a copy already pending a different completer \
                         (open question: wait protocol unspecified, source asserts this does \
                         not occur)"
                    );
                    copy.transfer_status = DataTransferStatus::UnderTransfer;
                    copy.pending_completer = Some(task_id);
                    copy.version = source_version;
                }
                needs_transfer = true;
                tracing::trace!(device = dev, datum, from = source, "stage-in transfer queued");
            }
        }
    }

    Ok(needs_transfer)
}

/// Marks every copy this task is the pending completer for as fully
/// transferred, once the stream reports the task's event complete.
pub fn complete_stage_in(devices: &mut DeviceTable, registry: &Registry, task: &TaskHandle, dev: DeviceIndex) {
    for flow in &task.function.flows {
        if flow.access.is_ctl() {
            continue;
        }
        let Some(datum) = flow_datum(task, flow.index as usize) else {
            continue;
        };
        let Some(idx) = registry.get(datum, dev) else {
            continue;
        };
        if let Some(copy) = devices.get_mut(dev).copy_mut(idx) {
            if copy.pending_completer == Some(task.id) {
                copy.transfer_status = DataTransferStatus::CompleteTransfer;
                copy.pending_completer = None;
            }
        }
    }
}

/// Debug-only readiness check invoked immediately before a kernel is
/// submitted (spec 4.I.3: "assert that all inputs have `data_transfer_status
/// == COMPLETE_TRANSFER`").
pub fn assert_inputs_ready(devices: &DeviceTable, registry: &Registry, task: &TaskHandle, dev: DeviceIndex) {
    if !cfg!(debug_assertions) {
        return;
    }
    for flow in &task.function.flows {
        if flow.access.is_ctl() || !flow.access.is_read() {
            continue;
        }
        let Some(datum) = flow_datum(task, flow.index as usize) else {
            continue;
        };
        let Some(idx) = registry.get(datum, dev) else {
            continue;
        };
        let status = devices.get(dev).copy(idx).map(|c| c.transfer_status);
        debug_assert_eq!(
            status,
            Some(DataTransferStatus::CompleteTransfer),
            "execute entered with an incomplete stage-in for datum {datum} on device {dev}"
        );
    }
}

/// 4.I.4 Stage-out / pop: releases read-only pins, and for write flows
/// either hands the copy to `owned_lru` (lazy write-back) or reports that a
/// device->host transfer is needed (eager `pushout`). Returns `true` when
/// the caller must drive a stream-1 transfer before the task can complete.
pub fn prepare_stage_out(
    devices: &mut DeviceTable,
    registry: &Registry,
    task: &TaskHandle,
    dev: DeviceIndex,
) -> bool {
    let mut needs_pushout = false;

    for flow in &task.function.flows {
        if flow.access.is_ctl() {
            continue;
        }
        let Some(datum) = flow_datum(task, flow.index as usize) else {
            continue;
        };
        let Some(idx) = registry.get(datum, dev) else {
            continue;
        };

        let device = devices.get_mut(dev);

        if flow.access.is_read() {
            if let Some(copy) = device.copy_mut(idx) {
                copy.readers = copy.readers.saturating_sub(1);
                if copy.readers == 0 && !flow.access.is_write() {
                    device.free_lru.push_back(idx);
                }
            }
        }

        if flow.access.is_write() {
            if task.pushout {
                needs_pushout = true;
            } else {
                device.owned_lru.push_back(idx);
            }
        }
    }

    needs_pushout
}

/// 4.I.5 Epilog for the eager (`pushout`) path: runs once the device->host
/// transfer for `task`'s write flows has completed. Transitions each write
/// copy OWNED -> SHARED, mirrors its version to the host copy, and frees the
/// device copy back to `free_lru` since the host is now authoritative. The
/// free is gated on the transition actually firing this call, so a second
/// `epilog` call on an already-`Shared` copy is a no-op rather than pushing
/// a duplicate index onto `free_lru` (spec §8 invariant 8: idempotent epilog).
///
/// For the lazy path (`!task.pushout`) this is deliberately a no-op: the
/// copy already sits on `owned_lru` from `prepare_stage_out`, and the
/// OWNED -> SHARED transition happens later, batched, when the core loop's
/// synthesized write-back task drains `owned_lru` (spec 4.K.3) — see
/// [`complete_writeback`]. Running both transitions here would contradict
/// `owned_lru`'s own definition ("ahead of the host's version") for every
/// copy sitting on it (recorded in DESIGN.md as a resolved ambiguity).
pub fn epilog(devices: &mut DeviceTable, registry: &Registry, task: &TaskHandle, dev: DeviceIndex) {
    if !task.pushout {
        return;
    }
    for flow in &task.function.flows {
        if flow.access.is_ctl() || !flow.access.is_write() {
            continue;
        }
        let Some(datum) = flow_datum(task, flow.index as usize) else {
            continue;
        };
        let Some(idx) = registry.get(datum, dev) else {
            continue;
        };
        if sync_write_to_host(devices, registry, datum, dev, idx) {
            devices.get_mut(dev).free_lru.push_back(idx);
        }
    }
}

/// Drains up to `limit` oldest `owned_lru` entries as one batched
/// write-back (spec 4.K.3), pinning each with a reader so it cannot be
/// evicted mid-transfer. Returns the pinned copy indices; the caller drives
/// them through stream 1 and calls [`complete_writeback`] once done.
pub fn begin_writeback(devices: &mut DeviceTable, dev: DeviceIndex, limit: usize) -> Vec<CopyIndex> {
    let device = devices.get_mut(dev);
    let batch = device.owned_lru.drain_oldest(limit);
    for &idx in &batch {
        if let Some(copy) = device.copy_mut(idx) {
            copy.readers += 1;
        }
    }
    batch
}

/// Completes a batched write-back: mirrors each copy's version to the host,
/// transitions OWNED -> SHARED, un-pins the reader added by
/// [`begin_writeback`], and returns the copy to `free_lru`.
pub fn complete_writeback(devices: &mut DeviceTable, registry: &Registry, dev: DeviceIndex, copies: &[CopyIndex]) {
    for &idx in copies {
        let Some(datum) = devices.get(dev).copy(idx).map(|c| c.datum) else {
            continue;
        };
        sync_write_to_host(devices, registry, datum, dev, idx);
        let device = devices.get_mut(dev);
        if let Some(copy) = device.copy_mut(idx) {
            copy.readers = copy.readers.saturating_sub(1);
        }
        device.free_lru.push_back(idx);
    }
}

/// Shared version-mirror/coherency-transition step used by both the eager
/// epilog and the deferred write-back completion (spec §3: "a writer
/// increments [version] exactly once on completion"). Idempotent: a copy
/// already not `Owned` is left untouched (spec §8 invariant 8) and `false`
/// is returned so callers don't repeat a side effect (such as re-queuing
/// the copy onto `free_lru`) that's only valid the call that transitions it.
fn sync_write_to_host(
    devices: &mut DeviceTable,
    registry: &Registry,
    datum: DatumId,
    dev: DeviceIndex,
    idx: CopyIndex,
) -> bool {
    let is_owned = devices
        .get(dev)
        .copy(idx)
        .map(|c| c.coherency == CoherencyState::Owned)
        .unwrap_or(false);
    if !is_owned {
        return false;
    }

    let new_version = devices.get(dev).copy(idx).map(|c| c.version + 1).unwrap_or(1);

    {
        let device = devices.get_mut(dev);
        if let Some(copy) = device.copy_mut(idx) {
            copy.version = new_version;
            copy.coherency = CoherencyState::Shared;
        }
    }

    ensure_host_copy(devices, registry, datum, new_version);
    true
}

/// Ensures a host-side (`device 0`) copy of `datum` exists and carries
/// `version`, allocating one from the host's pool if necessary. The host
/// becomes the datum's owner (spec 4.I.5: "successors see the host copy by
/// default").
fn ensure_host_copy(devices: &mut DeviceTable, registry: &Registry, datum: DatumId, version: u64) {
    use crate::task::HOST_DEVICE;

    if let Some(idx) = registry.get(datum, HOST_DEVICE) {
        let host = devices.get_mut(HOST_DEVICE);
        if let Some(copy) = host.copy_mut(idx) {
            copy.version = version;
            copy.coherency = CoherencyState::Owned;
        }
        registry.mark_owner(datum, HOST_DEVICE);
        return;
    }

    if let Some(meta) = registry.meta(datum) {
        let host = devices.get_mut(HOST_DEVICE);
        if let Some(idx) = host.alloc_copy(datum, 1, meta.size_bytes as u64, version) {
            if let Some(copy) = host.copy_mut(idx) {
                copy.coherency = CoherencyState::Owned;
            }
            registry.attach(datum, HOST_DEVICE, idx);
            registry.mark_owner(datum, HOST_DEVICE);
        }
    }
}

/// A task waiting for driver attention, paired with its scheduling priority
/// (used when it is later fed into a stream's pending FIFO).
pub struct Prioritized {
    pub task: Arc<TaskHandle>,
    pub priority: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::DatumMeta;
    use crate::device::Device;
    use crate::mempool::MemoryPool;
    use crate::task::{AccessMode, DeviceClass, FlowBinding, FlowDecl, Incarnation, TaskFunction};
    use parking_lot::Mutex;

    fn test_device(index: u32, segments: usize) -> Device {
        let pool = MemoryPool::new(index, (segments as u64) * 100, 100, None, 100);
        Device::new(index, 1.0, 1.0, pool, 4, 8)
    }

    /// `DeviceTable` indexes positionally, so a table exercising "device 2"
    /// needs a filler occupying position 1 (the recursive device, unused by
    /// these tests) to keep positions aligned with device indices.
    fn test_table(host_segments: usize, accelerator: Device) -> DeviceTable {
        DeviceTable::new(vec![test_device(0, host_segments), test_device(1, 0), accelerator])
    }

    fn rw_task(id: TaskId, pushout: bool) -> (Arc<TaskHandle>, Registry) {
        let function = Arc::new(TaskFunction {
            name: "axpy",
            flows: vec![FlowDecl {
                index: 0,
                access: AccessMode::ReadWrite,
                name: Some("x"),
            }],
            incarnations: vec![Incarnation {
                device_class: DeviceClass::Cuda,
                dyld_name: None,
                hook: None,
                submit: None,
            }],
            key_fn: None,
        });
        let handle = Arc::new(TaskHandle {
            id,
            function,
            bindings: Mutex::new(vec![FlowBinding {
                data_in: Some(1),
                data_out: Some(1),
            }]),
            pushout,
        });
        let registry = Registry::new();
        registry.ensure_datum(DatumMeta::new(1, 100));
        (handle, registry)
    }

    #[test]
    fn reserve_allocates_a_fresh_copy_and_pins_read_flows() {
        let (task, registry) = rw_task(1, false);
        let mut devices = test_table(2, test_device(2, 2));
        reserve(&mut devices, &registry, &task, 2).unwrap();
        let idx = registry.get(1, 2).unwrap();
        assert_eq!(devices.get(2).copy(idx).unwrap().readers, 1);
    }

    #[test]
    fn reserve_backs_out_on_exhaustion() {
        let (task, registry) = rw_task(1, false);
        // zero-segment pool: alloc can never succeed, eviction can't help either.
        let mut devices = test_table(1, test_device(2, 0));
        let err = reserve(&mut devices, &registry, &task, 2).unwrap_err();
        assert!(matches!(err, DflowError::Retry(2)));
    }

    #[test]
    fn stage_in_requires_transfer_from_host_then_completes() {
        let (task, registry) = rw_task(1, false);
        let mut devices = test_table(2, test_device(2, 2));
        reserve(&mut devices, &registry, &task, 2).unwrap();
        let needs = prepare_stage_in(&mut devices, &registry, &task, 2, 1).unwrap();
        assert!(needs);
        let idx = registry.get(1, 2).unwrap();
        assert_eq!(
            devices.get(2).copy(idx).unwrap().transfer_status,
            DataTransferStatus::UnderTransfer
        );
        complete_stage_in(&mut devices, &registry, &task, 2);
        assert_eq!(
            devices.get(2).copy(idx).unwrap().transfer_status,
            DataTransferStatus::CompleteTransfer
        );
    }

    #[test]
    fn lazy_stage_out_parks_write_copy_on_owned_lru_without_detaching() {
        let (task, registry) = rw_task(1, false);
        let mut devices = test_table(2, test_device(2, 2));
        reserve(&mut devices, &registry, &task, 2).unwrap();
        prepare_stage_in(&mut devices, &registry, &task, 2, 1).unwrap();
        let idx = registry.get(1, 2).unwrap();
        devices.get_mut(2).copy_mut(idx).unwrap().coherency = CoherencyState::Owned;

        let needs_pushout = prepare_stage_out(&mut devices, &registry, &task, 2);
        assert!(!needs_pushout);
        assert!(devices.get(2).owned_lru.contains(idx));
        assert!(registry.get(1, 2).is_some(), "copy stays attached, only queued");
    }

    #[test]
    fn eager_epilog_syncs_host_and_frees_device_copy() {
        let (task, registry) = rw_task(1, true);
        let mut devices = test_table(2, test_device(2, 2));
        reserve(&mut devices, &registry, &task, 2).unwrap();
        prepare_stage_in(&mut devices, &registry, &task, 2, 1).unwrap();
        let idx = registry.get(1, 2).unwrap();
        devices.get_mut(2).copy_mut(idx).unwrap().coherency = CoherencyState::Owned;
        prepare_stage_out(&mut devices, &registry, &task, 2);

        epilog(&mut devices, &registry, &task, 2);

        assert!(devices.get(2).free_lru.contains(idx));
        let host_idx = registry.get(1, 0).unwrap();
        assert_eq!(devices.get(0).copy(host_idx).unwrap().coherency, CoherencyState::Owned);
        assert_eq!(registry.owner_device(1), Some(0));
    }

    #[test]
    fn writeback_batch_syncs_host_then_frees_device_copy() {
        let (task, registry) = rw_task(1, false);
        let mut devices = test_table(2, test_device(2, 2));
        reserve(&mut devices, &registry, &task, 2).unwrap();
        prepare_stage_in(&mut devices, &registry, &task, 2, 1).unwrap();
        let idx = registry.get(1, 2).unwrap();
        devices.get_mut(2).copy_mut(idx).unwrap().coherency = CoherencyState::Owned;
        prepare_stage_out(&mut devices, &registry, &task, 2);

        let batch = begin_writeback(&mut devices, 2, 8);
        assert_eq!(batch, vec![idx]);
        complete_writeback(&mut devices, &registry, 2, &batch);

        assert!(devices.get(2).free_lru.contains(idx));
        assert_eq!(registry.owner_device(1), Some(0));
    }
}
