//! 4.H Stream pipeline: a per-device fixed ring of in-flight (event, task)
//! pairs, fed from a priority-sorted pending FIFO. `progress` is the
//! `progress_stream` operation of spec 4.H: a single poll step, never
//! blocking on the event.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::task::{SubmitResult, TaskHandle};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamKind {
    StageIn,
    StageOut,
    Execute,
}

/// A device-side completion signal. Real hardware would poll a driver API;
/// here completion is modeled as a tick countdown so tests can exercise
/// both immediate and pipelined (multi-poll) completion.
#[derive(Debug)]
pub struct Event {
    ticks_remaining: u32,
}

impl Event {
    pub fn immediate() -> Self {
        Self { ticks_remaining: 0 }
    }

    pub fn after_ticks(ticks: u32) -> Self {
        Self {
            ticks_remaining: ticks,
        }
    }

    /// Returns `true` once complete. Never blocks (spec 4.H: "event-complete
    /// checks are the only kernel-level synchronization").
    pub fn poll(&mut self) -> bool {
        if self.ticks_remaining == 0 {
            true
        } else {
            self.ticks_remaining -= 1;
            false
        }
    }
}

struct RingSlot {
    task: Arc<TaskHandle>,
    event: Event,
}

struct PendingItem {
    task: Arc<TaskHandle>,
    priority: i32,
}

pub struct Stream {
    pub kind: StreamKind,
    capacity: usize,
    ring: VecDeque<RingSlot>,
    pending: Vec<PendingItem>,
}

impl Stream {
    pub fn new(kind: StreamKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            ring: VecDeque::with_capacity(capacity),
            pending: Vec::new(),
        }
    }

    fn push_pending(&mut self, task: Arc<TaskHandle>, priority: i32) {
        let pos = self
            .pending
            .binary_search_by(|p| priority.cmp(&p.priority))
            .unwrap_or_else(|e| e);
        self.pending.insert(pos, PendingItem { task, priority });
    }

    fn fill<F>(&mut self, mut submit_fn: F)
    where
        F: FnMut(&TaskHandle) -> (SubmitResult, Event),
    {
        while self.ring.len() < self.capacity && !self.pending.is_empty() {
            let item = self.pending.remove(0);
            match submit_fn(&item.task) {
                (SubmitResult::Enqueued, event) => {
                    self.ring.push_back(RingSlot {
                        task: item.task,
                        event,
                    });
                }
                (SubmitResult::NoRoom, _) => {
                    self.pending.insert(0, item);
                    break;
                }
            }
        }
    }

    /// One step of `progress_stream` (spec 4.H):
    /// 1. optionally enqueue `maybe_task` into the pending FIFO,
    /// 2. fill free ring slots from pending,
    /// 3. poll the oldest in-flight slot; if complete, pop it as output and
    ///    refill once more.
    pub fn progress<F>(
        &mut self,
        submit_fn: F,
        maybe_task: Option<(Arc<TaskHandle>, i32)>,
    ) -> Option<Arc<TaskHandle>>
    where
        F: FnMut(&TaskHandle) -> (SubmitResult, Event),
    {
        if let Some((task, priority)) = maybe_task {
            self.push_pending(task, priority);
        }
        self.fill(submit_fn);

        let completed = matches!(self.ring.front_mut(), Some(slot) if slot.event.poll());
        if completed {
            let slot = self.ring.pop_front().expect("checked Some above");
            Some(slot.task)
        } else {
            None
        }
    }

    pub fn in_flight(&self) -> usize {
        self.ring.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_room(&self) -> bool {
        self.ring.len() < self.capacity
    }
}
