//! 4.J Device selector: stickiness toward a WRITE output's current owner,
//! else load-balanced assignment weighted by single-precision capability.

use crate::device::DeviceTable;
use crate::registry::Registry;
use crate::task::{DeviceIndex, TaskHandle, HOST_DEVICE, RECURSIVE_DEVICE};

/// Chooses the device to run `task` on for a given `ratio` (relative work
/// amount). Excludes device 0 (CPU) and device 1 (recursive) from the
/// load-balance scan; a WRITE flow whose datum already has a non-CPU,
/// non-recursive owner pins the task there instead (spec 4.J). Returns the
/// chosen device alongside whatever load it added, so the caller can pass
/// the same amount to [`crate::core_loop::enter`] for an exact reversal on
/// completion.
pub fn select_device(
    devices: &DeviceTable,
    registry: &Registry,
    task: &TaskHandle,
    ratio: f64,
) -> (DeviceIndex, u64) {
    if let Some(sticky) = sticky_owner(registry, task) {
        return (sticky, 0);
    }

    let mut best: Option<(DeviceIndex, f64)> = None;
    for device in devices.iter() {
        if device.index == HOST_DEVICE || device.index == RECURSIVE_DEVICE {
            continue;
        }
        if device.is_disabled() {
            continue;
        }
        let score = device.current_load() as f64 + ratio * device.sweight;
        if best.map_or(true, |(_, best_score)| score < best_score) {
            best = Some((device.index, score));
        }
    }

    match best {
        Some((chosen, _)) => {
            let device = devices.get(chosen);
            let delta = (ratio * device.sweight).round().max(0.0) as u64;
            device.add_load(delta);
            (chosen, delta)
        }
        None => (HOST_DEVICE, 0),
    }
}

fn sticky_owner(registry: &Registry, task: &TaskHandle) -> Option<DeviceIndex> {
    for flow in &task.function.flows {
        if !flow.access.is_write() {
            continue;
        }
        let binding = task.binding(flow.index as usize);
        let datum = binding.data_out.or(binding.data_in)?;
        if let Some(owner) = registry.owner_device(datum) {
            if owner != HOST_DEVICE && owner != RECURSIVE_DEVICE {
                return Some(owner);
            }
        }
    }
    None
}
