//! Property-based tests for the eight universally-quantified invariants of
//! spec §8. Properties whose meaning is a structural invariant at a fixed
//! instant (1, 2, 6) are exercised with `proptest` over randomized
//! operation sequences; properties about temporal ordering or idempotence
//! (3, 4, 7, 8) are easier to state as a single representative sequence
//! than to usefully randomize, so they are plain `#[test]`s instead.

mod support;

use std::collections::HashSet;
use std::sync::Arc;

use dflow_core::core_loop::{self, DriveOutcome};
use dflow_core::datum::{CoherencyState, DatumMeta};
use dflow_core::device::DeviceTable;
use dflow_core::offload;
use dflow_core::registry::Registry;
use dflow_core::scheduler::{ApScheduler, SchedulerPolicy};
use dflow_core::task::{
    AccessMode, DeviceClass, FlowDecl, Incarnation, SubmitResult, Task, TaskFunction, TaskHandle,
    TaskStatus, HOST_DEVICE,
};
use dflow_core::topology::Topology;
use proptest::prelude::*;

proptest! {
    /// Invariant 1: for all datums and devices, |copies[d]| <= 1. A
    /// `DeviceIndex -> CopyIndex` `HashMap` entry makes a second copy on the
    /// same device structurally impossible, so this exercises that the
    /// registry never reports the same device twice for one datum.
    #[test]
    fn at_most_one_copy_per_device(datum_count in 1usize..6, device_count in 1u32..4) {
        let registry = Registry::new();
        let mut devices_vec = vec![support::device(0, 32)];
        for d in 1..=device_count {
            devices_vec.push(support::device(d, 32));
        }
        let mut devices = DeviceTable::new(devices_vec);

        for datum in 0..datum_count as u64 {
            registry.ensure_datum(DatumMeta::new(datum, 16));
            for dev in 0..=device_count {
                if let Some(idx) = devices.get_mut(dev).alloc_copy(datum, 1, 16, 0) {
                    registry.attach(datum, dev, idx);
                }
            }
            let holders = registry.devices_holding(datum);
            let mut seen = HashSet::new();
            for h in &holders {
                prop_assert!(seen.insert(*h), "device {} listed twice for datum {}", h, datum);
            }
        }
    }

    /// Invariant 2: at most one OWNED copy exists for a datum at any instant.
    #[test]
    fn at_most_one_owned_copy(writers in proptest::collection::vec(0u32..3, 1..8)) {
        let registry = Registry::new();
        registry.ensure_datum(DatumMeta::new(1, 16));
        let mut devices = DeviceTable::new(vec![
            support::device(0, 8),
            support::device(1, 8),
            support::device(2, 8),
        ]);

        for &dev in &writers {
            if registry.get(1, dev).is_none() {
                if let Some(idx) = devices.get_mut(dev).alloc_copy(1, 1, 16, 0) {
                    registry.attach(1, dev, idx);
                }
            }
            registry.transfer_ownership_to(&mut devices, 1, dev, AccessMode::Write);

            let owned_count = devices
                .iter()
                .filter_map(|d| registry.get(1, d.index).and_then(|idx| d.copy(idx)))
                .filter(|c| c.coherency == CoherencyState::Owned)
                .count();
            prop_assert!(owned_count <= 1, "more than one OWNED copy after writer sequence {:?}", writers);
        }
    }

    /// Invariant 5: `select` on an AP-scheduled domain always returns the
    /// maximum-priority element remaining (ties broken FIFO), or `None`
    /// once empty.
    #[test]
    fn select_returns_priorities_in_priority_then_fifo_order(priorities in proptest::collection::vec(-1000i32..1000, 0..20)) {
        let topo = Topology::flat(1);
        let sched = ApScheduler::new(&topo);
        for (i, &p) in priorities.iter().enumerate() {
            sched.schedule(0, support::task(i as u64, support::rw_function("noop"), p, DeviceClass::Cpu, 1, false), 0);
        }

        let mut expected: Vec<(usize, i32)> = priorities.iter().copied().enumerate().collect();
        expected.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let expected: Vec<i32> = expected.into_iter().map(|(_, p)| p).collect();

        let mut observed = Vec::new();
        while let Some((t, _distance)) = sched.select(0) {
            observed.push(t.priority);
        }
        prop_assert_eq!(observed, expected);
        prop_assert!(sched.select(0).is_none());
    }

    /// Invariant 6: the sum of `device_load[d]` across devices never goes
    /// negative — guaranteed structurally by `Device::sub_load`'s saturating
    /// subtraction, exercised here against randomized add/sub sequences that
    /// may subtract more than was ever added.
    #[test]
    fn device_load_sum_never_negative(ops in proptest::collection::vec((0u32..3, any::<bool>(), 0u64..50), 1..40)) {
        let devices = vec![support::device(0, 8), support::device(1, 8), support::device(2, 8)];
        for (dev, is_add, amount) in ops {
            if is_add {
                devices[dev as usize].add_load(amount);
            } else {
                devices[dev as usize].sub_load(amount);
            }
        }
        let sum: u64 = devices.iter().map(|d| d.current_load()).sum();
        prop_assert!(sum < u64::MAX / 2, "load sum wrapped, implying an underflow occurred");
    }
}

/// Invariant 3: any copy sitting in a LRU has `readers == 0`. Exercised
/// across a full reserve -> stage-in -> stage-out cycle for a read-only
/// task, which is the path that pushes a copy onto `free_lru`.
#[test]
fn copies_in_free_lru_have_no_readers() {
    let registry = Registry::new();
    registry.ensure_datum(DatumMeta::new(1, 16));
    let mut devices = support::table(4, support::device(2, 4));

    let handle = support::handle(1, support::read_only_function("read_x"), 1, false);
    offload::reserve(&mut devices, &registry, &handle, 2).unwrap();
    offload::prepare_stage_in(&mut devices, &registry, &handle, 2, 1).unwrap();
    offload::complete_stage_in(&mut devices, &registry, &handle, 2);
    offload::prepare_stage_out(&mut devices, &registry, &handle, 2);

    let idx = registry.get(1, 2).unwrap();
    assert!(devices.get(2).free_lru.contains(idx));
    assert_eq!(devices.get(2).copy(idx).unwrap().readers, 0);
}

/// Invariant 4: for a task driven through a device, execute completes
/// strictly before the task's completion callback fires. Stage-in-complete
/// happening before execute is enforced by `core_loop::drive`'s own control
/// flow (each phase only advances using the previous phase's output)
/// rather than independently observable from outside the crate.
#[test]
fn execute_completes_before_task_completion_callback() {
    let registry = Registry::new();
    registry.ensure_datum(DatumMeta::new(1, 16));
    let mut devices = support::table(4, support::device(2, 4));

    let events: Arc<parking_lot::Mutex<Vec<&'static str>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let execute_events = events.clone();
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
            submit: Some(Arc::new(move |_h: &TaskHandle, _dev, _stream| {
                execute_events.lock().push("execute");
                SubmitResult::Enqueued
            })),
        }],
        key_fn: None,
    });

    let complete_events = events.clone();
    let task = Arc::new(Task {
        handle: support::handle(1, function, 1, true),
        priority: 0,
        status: TaskStatus::Scheduled,
        device_class: DeviceClass::Cuda,
        on_complete: Some(Arc::new(move |_id, _result| {
            complete_events.lock().push("complete");
        })),
        seq: 1,
    });

    let outcome = core_loop::enter(&mut devices, &registry, 2, task, 0);
    assert!(matches!(outcome, DriveOutcome::Relinquished));
    assert_eq!(*events.lock(), vec!["execute", "complete"]);
}

/// Invariant 7: a datum every access of which is READ keeps its host copy's
/// version and coherence untouched across any number of offloads.
#[test]
fn read_only_datum_leaves_host_copy_unchanged() {
    let registry = Registry::new();
    registry.ensure_datum(DatumMeta::new(1, 16));
    let mut devices = support::table(4, support::device(2, 4));

    let host_idx = devices.get_mut(HOST_DEVICE).alloc_copy(1, 1, 16, 0).unwrap();
    registry.attach(1, HOST_DEVICE, host_idx);
    registry.mark_owner(1, HOST_DEVICE);
    devices.get_mut(HOST_DEVICE).copy_mut(host_idx).unwrap().coherency = CoherencyState::Shared;

    for id in 1..=3u64 {
        let handle = support::handle(id, support::read_only_function("read_x"), 1, false);
        offload::reserve(&mut devices, &registry, &handle, 2).unwrap();
        offload::prepare_stage_in(&mut devices, &registry, &handle, 2, id).unwrap();
        offload::complete_stage_in(&mut devices, &registry, &handle, 2);
        offload::prepare_stage_out(&mut devices, &registry, &handle, 2);
    }

    let host_copy = devices.get(HOST_DEVICE).copy(host_idx).unwrap();
    assert_eq!(host_copy.version, 0);
    assert_eq!(host_copy.coherency, CoherencyState::Shared);
    assert_eq!(registry.owner_device(1), Some(HOST_DEVICE));
}

/// Invariant 8: applying epilog twice to the same completed task is a
/// no-op the second time, since `sync_write_to_host` only acts on a copy
/// whose coherence is still `Owned` — the first call already moved it to
/// `Shared`.
#[test]
fn epilog_is_idempotent() {
    let registry = Registry::new();
    registry.ensure_datum(DatumMeta::new(1, 16));
    let mut devices = support::table(4, support::device(2, 4));

    let handle = support::handle(1, support::rw_function("axpy"), 1, true);
    offload::reserve(&mut devices, &registry, &handle, 2).unwrap();
    offload::prepare_stage_in(&mut devices, &registry, &handle, 2, 1).unwrap();
    let idx = registry.get(1, 2).unwrap();
    devices.get_mut(2).copy_mut(idx).unwrap().coherency = CoherencyState::Owned;
    offload::prepare_stage_out(&mut devices, &registry, &handle, 2);

    offload::epilog(&mut devices, &registry, &handle, 2);
    let host_idx = registry.get(1, HOST_DEVICE).unwrap();
    let after_first = devices.get(HOST_DEVICE).copy(host_idx).unwrap().clone();

    offload::epilog(&mut devices, &registry, &handle, 2);
    let after_second = devices.get(HOST_DEVICE).copy(host_idx).unwrap().clone();

    assert_eq!(after_first.version, after_second.version);
    assert_eq!(after_first.coherency, after_second.coherency);
}
