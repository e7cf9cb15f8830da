//! §3 `Device`: memory pool, copy slab, two LRUs, pending FIFO, peer-access
//! mask, driver-election counter, and the selection weights (spec §3, 4.J).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering as AtomicOrdering};

use crossbeam_queue::SegQueue;

use crate::datum::{CopyIndex, DataCopy, DatumId};
use crate::lru::Lru;
use crate::mempool::MemoryPool;
use crate::stream::{Stream, StreamKind};
use crate::task::{DeviceIndex, Task};

/// A task queued on a device's pending FIFO, plus the `device_load[d]`
/// increment the selector made for it (spec 4.J/4.K.5: "decrement device
/// load" on completion) so the eventual driver can reverse it exactly.
pub struct PendingEntry {
    pub task: std::sync::Arc<Task>,
    pub load_delta: u64,
}

/// An offload request waiting for its device to become free (spec 4.K: "the
/// device's shared pending FIFO"). MPSC: any worker pushes, only the driver
/// pops. Carries the full `Task` (not just its handle) so the driver still
/// has the priority and completion callback once it eventually dequeues it.
pub struct PendingFifo {
    queue: SegQueue<PendingEntry>,
}

impl Default for PendingFifo {
    fn default() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }
}

impl PendingFifo {
    pub fn push(&self, task: std::sync::Arc<Task>, load_delta: u64) {
        self.queue.push(PendingEntry { task, load_delta });
    }

    pub fn pop(&self) -> Option<PendingEntry> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// A slab slot: occupied copies are `Some`; free slots chain through
/// `free_slots` rather than leaving tombstones.
pub struct Device {
    pub index: DeviceIndex,
    /// Single-precision throughput weight used by the selector (spec 4.J).
    pub sweight: f64,
    /// `sweight / stod_rate[major - 1]`: derated by host<->device bandwidth.
    pub dweight: f64,
    /// Bitmask of devices this one can DMA to directly (spec §3).
    pub peer_access: u64,
    pub active_workers: AtomicU32,
    /// Additive load accumulator consulted by the selector (spec 4.J, §5).
    pub load: AtomicU64,
    pub disabled: AtomicBool,

    pool: MemoryPool,
    slab: Vec<Option<DataCopy>>,
    free_slots: Vec<CopyIndex>,
    pub free_lru: Lru,
    pub owned_lru: Lru,
    pub pending: PendingFifo,
    pub streams: Vec<Stream>,
    /// Round-robin cursor over the execute streams (spec 4.K.2: `2 +
    /// (counter mod (S-2))`). Touched only by the current driver.
    execute_cursor: usize,
}

impl Device {
    pub fn new(
        index: DeviceIndex,
        sweight: f64,
        dweight: f64,
        pool: MemoryPool,
        num_streams: usize,
        stream_capacity: usize,
    ) -> Self {
        let mut streams = Vec::with_capacity(num_streams.max(3));
        streams.push(Stream::new(StreamKind::StageIn, stream_capacity));
        streams.push(Stream::new(StreamKind::StageOut, stream_capacity));
        for _ in 2..num_streams.max(3) {
            streams.push(Stream::new(StreamKind::Execute, stream_capacity));
        }

        Self {
            index,
            sweight,
            dweight,
            peer_access: 0,
            active_workers: AtomicU32::new(0),
            load: AtomicU64::new(0),
            disabled: AtomicBool::new(false),
            pool,
            slab: Vec::new(),
            free_slots: Vec::new(),
            free_lru: Lru::new(),
            owned_lru: Lru::new(),
            pending: PendingFifo::default(),
            streams,
            execute_cursor: 0,
        }
    }

    /// Picks the next execute stream index in round-robin order over
    /// `streams[2..]` and advances the cursor (spec 4.K.2).
    pub fn next_execute_stream(&mut self) -> usize {
        let execute_slots = self.streams.len() - 2;
        let idx = 2 + (self.execute_cursor % execute_slots.max(1));
        self.execute_cursor = self.execute_cursor.wrapping_add(1);
        idx
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(AtomicOrdering::Acquire)
    }

    pub fn disable(&self) {
        self.disabled.store(true, AtomicOrdering::Release);
    }

    /// Allocates one pool segment and stores a fresh `DataCopy` at a free
    /// slab slot. Returns `None` on pool exhaustion (spec 4.E/4.I.1).
    pub fn alloc_copy(
        &mut self,
        datum: DatumId,
        nb_elts: u64,
        eltsize: u64,
        version: u64,
    ) -> Option<CopyIndex> {
        let ptr = self.pool.alloc(nb_elts, eltsize).ok()?;
        let copy = DataCopy::new(datum, self.index, ptr.0 as u64, version);
        match self.free_slots.pop() {
            Some(idx) => {
                self.slab[idx] = Some(copy);
                Some(idx)
            }
            None => {
                self.slab.push(Some(copy));
                Some(self.slab.len() - 1)
            }
        }
    }

    pub fn copy(&self, idx: CopyIndex) -> Option<&DataCopy> {
        self.slab.get(idx).and_then(|s| s.as_ref())
    }

    pub fn copy_mut(&mut self, idx: CopyIndex) -> Option<&mut DataCopy> {
        self.slab.get_mut(idx).and_then(|s| s.as_mut())
    }

    /// Releases a copy's slab slot and its pool segment (spec 4.I.1 eviction,
    /// 4.I.4 stage-out pop).
    pub fn free_copy(&mut self, idx: CopyIndex) {
        if let Some(slot) = self.slab.get_mut(idx) {
            if let Some(copy) = slot.take() {
                self.pool
                    .free(crate::mempool::DevicePtr(copy.device_ptr as usize));
            }
        }
        self.free_slots.push(idx);
    }

    pub fn free_segment_count(&self) -> usize {
        self.pool.free_segment_count()
    }

    /// Elects this worker as driver if the device is currently idle,
    /// returning `true` on success (spec 4.K, §5: CAS 0 -> 1).
    pub fn try_become_driver(&self) -> bool {
        self.active_workers
            .compare_exchange(0, 1, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }

    /// Non-driver arrival: bumps the counter and reports whether a driver
    /// was already active (spec 4.K: "if the prior value was nonzero").
    pub fn join_as_follower(&self) -> bool {
        self.active_workers.fetch_add(1, AtomicOrdering::AcqRel) != 0
    }

    /// Driver relinquishing: returns `true` if it was the last worker out.
    pub fn leave(&self) -> bool {
        self.active_workers.fetch_sub(1, AtomicOrdering::AcqRel) == 1
    }

    pub fn add_load(&self, delta: u64) {
        self.load.fetch_add(delta, AtomicOrdering::AcqRel);
    }

    pub fn sub_load(&self, delta: u64) {
        self.load.fetch_sub(delta.min(self.load.load(AtomicOrdering::Acquire)), AtomicOrdering::AcqRel);
    }

    pub fn current_load(&self) -> u64 {
        self.load.load(AtomicOrdering::Acquire)
    }

    /// Resets driver bookkeeping and drains the pending FIFO back to a
    /// caller-supplied sink (spec §7: device poisoning on a fatal error).
    pub fn poison(&self) -> Vec<std::sync::Arc<Task>> {
        self.disable();
        self.active_workers.store(0, AtomicOrdering::Release);
        self.load.store(0, AtomicOrdering::Release);
        let mut drained = Vec::new();
        while let Some(entry) = self.pending.pop() {
            drained.push(entry.task);
        }
        drained
    }
}

/// Owns every device in the context, indexed by [`DeviceIndex`]. Device 0 is
/// always the host (spec §3, §6).
pub struct DeviceTable {
    devices: Vec<Device>,
}

impl DeviceTable {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn get(&self, idx: DeviceIndex) -> &Device {
        &self.devices[idx as usize]
    }

    pub fn get_mut(&mut self, idx: DeviceIndex) -> &mut Device {
        &mut self.devices[idx as usize]
    }

    /// Borrows two distinct devices mutably at once (needed to move a copy
    /// from a source device into a destination device's slab).
    pub fn get_pair_mut(&mut self, a: DeviceIndex, b: DeviceIndex) -> (&mut Device, &mut Device) {
        assert_ne!(a, b, "get_pair_mut requires distinct device indices");
        let (a, b) = (a as usize, b as usize);
        if a < b {
            let (left, right) = self.devices.split_at_mut(b);
            (&mut left[a], &mut right[0])
        } else {
            let (left, right) = self.devices.split_at_mut(a);
            (&mut right[0], &mut left[b])
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.iter_mut()
    }
}
