//! 4.F Data-copy registry: per-datum table of copy locations and coherence
//! bookkeeping. Mutation is serialized per datum (spec 4.F) via a per-entry
//! `Mutex` inside a `DashMap`, the way `knhk-accelerate::memory` shards its
//! allocation table rather than taking one global lock.

use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::datum::{CopyIndex, CoherencyState, DataTransferStatus, DatumId, DatumMeta};
use crate::device::DeviceTable;
use crate::task::{AccessMode, DeviceIndex, HOST_DEVICE};

struct DatumEntry {
    meta: DatumMeta,
    /// At most one copy per device (invariant 1, spec §8).
    copies: HashMap<DeviceIndex, CopyIndex>,
}

impl DatumEntry {
    fn new(meta: DatumMeta) -> Self {
        Self {
            meta,
            copies: HashMap::new(),
        }
    }
}

/// Per-datum table of copies across devices with coherence state (spec
/// §2.F). The table itself only tracks *where* a datum's copies live and
/// who owns it; the copy's own coherence/version fields live on the
/// [`crate::datum::DataCopy`] stored in that device's slab.
#[derive(Default)]
pub struct Registry {
    datums: DashMap<DatumId, Mutex<DatumEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a datum's metadata if not already present. Idempotent.
    pub fn ensure_datum(&self, meta: DatumMeta) {
        self.datums
            .entry(meta.id)
            .or_insert_with(|| Mutex::new(DatumEntry::new(meta)));
    }

    pub fn meta(&self, datum: DatumId) -> Option<DatumMeta> {
        self.datums.get(&datum).map(|e| e.lock().meta.clone())
    }

    pub fn owner_device(&self, datum: DatumId) -> Option<DeviceIndex> {
        self.datums
            .get(&datum)
            .and_then(|e| e.lock().meta.owner_device)
    }

    fn set_owner(&self, datum: DatumId, device: Option<DeviceIndex>) {
        if let Some(entry) = self.datums.get(&datum) {
            entry.lock().meta.owner_device = device;
        }
    }

    /// Marks `device` as the datum's authoritative owner (spec 4.I.5: the
    /// host becomes owner once a write-back completes).
    pub fn mark_owner(&self, datum: DatumId, device: DeviceIndex) {
        self.set_owner(datum, Some(device));
    }

    /// `get(datum, device)`: the associated copy, or `None` (spec 4.F).
    pub fn get(&self, datum: DatumId, device: DeviceIndex) -> Option<CopyIndex> {
        self.datums
            .get(&datum)
            .and_then(|e| e.lock().copies.get(&device).copied())
    }

    /// `attach(datum, copy, device)`: installs the association (spec 4.F).
    pub fn attach(&self, datum: DatumId, device: DeviceIndex, copy: CopyIndex) {
        if let Some(entry) = self.datums.get(&datum) {
            entry.lock().copies.insert(device, copy);
        }
    }

    /// `detach(datum, copy, device)`: clears the association (spec 4.F).
    /// Returns the copy index that was removed, if any.
    pub fn detach(&self, datum: DatumId, device: DeviceIndex) -> Option<CopyIndex> {
        self.datums
            .get(&datum)
            .and_then(|e| e.lock().copies.remove(&device))
    }

    pub fn devices_holding(&self, datum: DatumId) -> Vec<DeviceIndex> {
        self.datums
            .get(&datum)
            .map(|e| e.lock().copies.keys().copied().collect())
            .unwrap_or_default()
    }

    /// `transfer_ownership_to(datum, device_index, access) -> source |
    /// None` (spec 4.F). Atomically decides whether `dest` already holds
    /// the version required by `access` and updates coherence state
    /// in-place on the existing copies; returns `None` ("-1: no transfer
    /// required") or `Some(source_device)` when stage-in must move bytes.
    pub fn transfer_ownership_to(
        &self,
        devices: &mut DeviceTable,
        datum: DatumId,
        dest: DeviceIndex,
        access: AccessMode,
    ) -> Option<DeviceIndex> {
        let entry_ref = self.datums.get(&datum)?;
        let mut entry = entry_ref.lock();

        let source = entry.meta.owner_device.unwrap_or(HOST_DEVICE);
        let source_version = entry
            .copies
            .get(&source)
            .and_then(|&idx| devices.get(source).copy(idx))
            .map(|c| c.version)
            .unwrap_or(0);

        let dest_copy_idx = entry.copies.get(&dest).copied();
        let dest_version = dest_copy_idx
            .and_then(|idx| devices.get(dest).copy(idx))
            .map(|c| c.version);

        let up_to_date = source == dest || dest_version.map_or(false, |v| v >= source_version);

        if !up_to_date {
            return Some(source);
        }

        // Destination already holds the required bytes: no transfer, but
        // coherence state still needs updating for write access (invariant
        // 2: at most one OWNED copy per datum).
        if access.is_write() {
            for (&dev, &idx) in entry.copies.iter() {
                if dev == dest {
                    continue;
                }
                if let Some(copy) = devices.get_mut(dev).copy_mut(idx) {
                    if copy.coherency == CoherencyState::Owned {
                        copy.coherency = CoherencyState::Invalid;
                    }
                }
            }
            if let Some(idx) = dest_copy_idx {
                if let Some(copy) = devices.get_mut(dest).copy_mut(idx) {
                    copy.coherency = CoherencyState::Owned;
                    copy.transfer_status = DataTransferStatus::CompleteTransfer;
                }
            }
            entry.meta.owner_device = Some(dest);
        }

        None
    }
}
