//! 4.D Scheduler policies: the `{install, init_worker, schedule, select,
//! remove}` contract shared by AP (absolute priority) and PBQ
//! (priority-biased queues), dispatched through a tagged enum rather than
//! trait objects (DESIGN NOTES §9: "prefer tagged enums with dispatch
//! tables over deep inheritance").

pub mod ap;
pub mod pbq;

use std::sync::Arc;

use crate::task::{Task, TaskId};
use crate::topology::{Topology, WorkerId};

pub use ap::ApScheduler;
pub use pbq::PbqScheduler;

/// Common contract implemented by both policies.
pub trait SchedulerPolicy: Send + Sync {
    fn init_worker(&self, worker: WorkerId);
    fn schedule(&self, worker: WorkerId, task: Arc<Task>, distance: u32);
    /// Returns the selected task plus the probe distance at which it was
    /// found (used to bias subsequent overflow placement).
    fn select(&self, worker: WorkerId) -> Option<(Arc<Task>, u32)>;
    fn remove(&self, worker: WorkerId, task_id: TaskId) -> bool;
}

/// Dispatch-table wrapper selected at context init by the `sched` config
/// key (spec §6).
pub enum Scheduler {
    Ap(ApScheduler),
    Pbq(PbqScheduler),
}

impl Scheduler {
    pub fn new_ap(topo: &Topology) -> Self {
        Scheduler::Ap(ApScheduler::new(topo))
    }

    pub fn new_pbq(topo: &Topology) -> Self {
        Scheduler::Pbq(PbqScheduler::new(topo))
    }
}

impl SchedulerPolicy for Scheduler {
    fn init_worker(&self, worker: WorkerId) {
        match self {
            Scheduler::Ap(s) => s.init_worker(worker),
            Scheduler::Pbq(s) => s.init_worker(worker),
        }
    }

    fn schedule(&self, worker: WorkerId, task: Arc<Task>, distance: u32) {
        match self {
            Scheduler::Ap(s) => s.schedule(worker, task, distance),
            Scheduler::Pbq(s) => s.schedule(worker, task, distance),
        }
    }

    fn select(&self, worker: WorkerId) -> Option<(Arc<Task>, u32)> {
        match self {
            Scheduler::Ap(s) => s.select(worker),
            Scheduler::Pbq(s) => s.select(worker),
        }
    }

    fn remove(&self, worker: WorkerId, task_id: TaskId) -> bool {
        match self {
            Scheduler::Ap(s) => s.remove(worker, task_id),
            Scheduler::Pbq(s) => s.remove(worker, task_id),
        }
    }
}
