//! 4.E Device memory pool: a contiguous arena carved into `N` fixed-size
//! segments, with a free-list bump/free allocator. Allocation is O(segments)
//! worst case and is only ever called by the worker currently driving the
//! device (spec §5 single-producer discipline).

use crate::error::{DflowError, DflowResult};

/// Opaque device pointer: the segment index inside the pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DevicePtr(pub usize);

pub struct MemoryPool {
    device_index: u32,
    segment_size: u64,
    num_segments: usize,
    free_segments: Vec<usize>,
    in_use: Vec<bool>,
}

impl MemoryPool {
    /// Reserves `min(memory_percentage% of free_mem, requested_blocks *
    /// eltsize)` and partitions it into fixed `segment_size` segments
    /// (spec 4.E / §6 `device_cuda.memory_*` keys).
    pub fn new(
        device_index: u32,
        free_mem_bytes: u64,
        memory_percentage: u8,
        requested_blocks: Option<u64>,
        segment_size: u64,
    ) -> Self {
        let by_percentage = free_mem_bytes.saturating_mul(memory_percentage as u64) / 100;
        let reserved = match requested_blocks {
            Some(blocks) if segment_size > 0 => {
                let by_blocks = blocks.saturating_mul(segment_size);
                by_percentage.min(by_blocks.max(segment_size))
            }
            _ => by_percentage,
        };
        let num_segments = if segment_size == 0 {
            0
        } else {
            (reserved / segment_size) as usize
        };

        tracing::info!(
            device_index,
            num_segments,
            segment_size,
            "memory pool reserved"
        );

        Self {
            device_index,
            segment_size,
            num_segments,
            free_segments: (0..num_segments).rev().collect(),
            in_use: vec![false; num_segments],
        }
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    pub fn free_segment_count(&self) -> usize {
        self.free_segments.len()
    }

    /// Allocates enough segments for `nb_elts * eltsize` bytes and returns a
    /// pointer to the first one. Returns [`DflowError::MemoryExhausted`]
    /// when no single free segment is large enough (the pool never spans
    /// an allocation across multiple segments; callers evict and retry).
    pub fn alloc(&mut self, nb_elts: u64, eltsize: u64) -> DflowResult<DevicePtr> {
        let requested = nb_elts.saturating_mul(eltsize);
        if self.segment_size == 0 || requested > self.segment_size {
            return Err(DflowError::MemoryExhausted(self.device_index));
        }
        match self.free_segments.pop() {
            Some(seg) => {
                self.in_use[seg] = true;
                tracing::trace!(device_index = self.device_index, seg, "segment allocated");
                Ok(DevicePtr(seg))
            }
            None => Err(DflowError::MemoryExhausted(self.device_index)),
        }
    }

    pub fn free(&mut self, ptr: DevicePtr) {
        if let Some(flag) = self.in_use.get_mut(ptr.0) {
            if *flag {
                *flag = false;
                self.free_segments.push(ptr.0);
                tracing::trace!(device_index = self.device_index, seg = ptr.0, "segment freed");
            }
        }
    }
}
