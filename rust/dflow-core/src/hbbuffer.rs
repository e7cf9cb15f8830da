//! 4.B Priority deque (`hbbuffer`): a bounded SPMC buffer of task pointers
//! ordered by priority, with overflow to a parent queue when full.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::task::Task;

/// Receives the suffix of a chain that didn't fit, spec 4.B
/// `push_in_queue_wrapper`. Implemented by the per-NUMA-domain system
/// queue (see `worker_queue.rs`) and, for PBQ, by a neighbor's buffer.
pub trait Overflow: Send + Sync {
    fn push_overflow(&self, tasks: Vec<Arc<Task>>, distance: u32);
}

fn priority_then_fifo(a: &Task, b: &Task) -> Ordering {
    b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))
}

/// Bounded single-producer/multi-consumer priority buffer.
pub struct HbBuffer {
    capacity: usize,
    items: Mutex<Vec<Arc<Task>>>,
    overflow: Option<Arc<dyn Overflow>>,
}

impl HbBuffer {
    pub fn new(capacity: usize, overflow: Option<Arc<dyn Overflow>>) -> Self {
        Self {
            capacity,
            items: Mutex::new(Vec::with_capacity(capacity)),
            overflow,
        }
    }

    /// Inserts a chain sorted by priority (FIFO within equal priority). If
    /// the buffer would exceed capacity, the lowest-priority suffix is
    /// pushed to the overflow target instead.
    pub fn push_all_by_priority(&self, mut chain: Vec<Arc<Task>>, distance: u32) {
        if chain.is_empty() {
            return;
        }
        chain.sort_by(|a, b| priority_then_fifo(a, b));

        let mut guard = self.items.lock();
        guard.extend(chain);
        guard.sort_by(|a, b| priority_then_fifo(a, b));

        if guard.len() > self.capacity {
            let tail = guard.split_off(self.capacity);
            drop(guard);
            if let Some(overflow) = &self.overflow {
                overflow.push_overflow(tail, distance);
            }
            // No overflow target configured (e.g. the system queue itself,
            // which is unbounded): tasks are dropped from `tail` only if
            // this buffer is genuinely the last resort, which callers must
            // avoid by always wiring an overflow for bounded buffers.
        }
    }

    /// Removes and returns the highest-priority item under `cmp`, or
    /// `None` if empty. Never blocks: if the lock is contended it returns
    /// `None` immediately so the caller moves on to the next queue
    /// (spec 4.B: "must not block indefinitely").
    pub fn pop_best<F>(&self, cmp: F) -> Option<Arc<Task>>
    where
        F: Fn(&Task, &Task) -> Ordering,
    {
        let mut guard = self.items.try_lock()?;
        if guard.is_empty() {
            return None;
        }
        let mut best = 0usize;
        for i in 1..guard.len() {
            if cmp(&guard[i], &guard[best]) == Ordering::Less {
                best = i;
            }
        }
        Some(guard.remove(best))
    }

    /// Convenience wrapper using the buffer's native priority/FIFO order.
    pub fn pop_best_default(&self) -> Option<Arc<Task>> {
        self.pop_best(priority_then_fifo)
    }

    /// Removes and returns the first item matching `pred`, if any. Used by
    /// `remove(worker, task)` in the scheduler-policy contract (spec 4.D).
    pub fn remove_by<F: Fn(&Task) -> bool>(&self, pred: F) -> Option<Arc<Task>> {
        let mut guard = self.items.try_lock()?;
        let pos = guard.iter().position(|t| pred(t))?;
        Some(guard.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{DeviceClass, Task, TaskHandle, TaskStatus};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn mk_task(priority: i32, seq: u64, function: Arc<crate::task::TaskFunction>) -> Arc<Task> {
        Arc::new(Task {
            handle: Arc::new(TaskHandle {
                id: seq,
                function,
                bindings: Mutex::new(Vec::new()),
                pushout: false,
            }),
            priority,
            status: TaskStatus::Ready,
            device_class: DeviceClass::Cpu,
            on_complete: None,
            seq,
        })
    }

    fn dummy_function() -> Arc<crate::task::TaskFunction> {
        Arc::new(crate::task::TaskFunction {
            name: "noop",
            flows: Vec::new(),
            incarnations: Vec::new(),
            key_fn: None,
        })
    }

    #[derive(Default)]
    struct CountingOverflow {
        count: AtomicUsize,
    }
    impl Overflow for CountingOverflow {
        fn push_overflow(&self, tasks: Vec<Arc<Task>>, _distance: u32) {
            self.count.fetch_add(tasks.len(), AtomicOrdering::SeqCst);
        }
    }

    #[test]
    fn pop_best_returns_highest_priority() {
        let buf = HbBuffer::new(8, None);
        let f = dummy_function();
        buf.push_all_by_priority(
            vec![mk_task(1, 0, f.clone()), mk_task(7, 1, f.clone()), mk_task(3, 2, f.clone())],
            0,
        );
        let first = buf.pop_best_default().unwrap();
        assert_eq!(first.priority, 7);
        let second = buf.pop_best_default().unwrap();
        assert_eq!(second.priority, 3);
        let third = buf.pop_best_default().unwrap();
        assert_eq!(third.priority, 1);
        assert!(buf.pop_best_default().is_none());
    }

    #[test]
    fn equal_priority_is_fifo() {
        let buf = HbBuffer::new(8, None);
        let f = dummy_function();
        buf.push_all_by_priority(
            vec![mk_task(5, 0, f.clone()), mk_task(5, 1, f.clone())],
            0,
        );
        assert_eq!(buf.pop_best_default().unwrap().handle.id, 0);
        assert_eq!(buf.pop_best_default().unwrap().handle.id, 1);
    }

    #[test]
    fn overflow_on_capacity_exceeded() {
        let overflow = Arc::new(CountingOverflow::default());
        let buf = HbBuffer::new(2, Some(overflow.clone()));
        let f = dummy_function();
        buf.push_all_by_priority(
            vec![mk_task(1, 0, f.clone()), mk_task(2, 1, f.clone()), mk_task(3, 2, f.clone())],
            0,
        );
        assert_eq!(buf.len(), 2);
        assert_eq!(overflow.count.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn empty_pop_never_blocks_and_returns_none() {
        let buf = HbBuffer::new(4, None);
        assert!(buf.pop_best_default().is_none());
    }
}
