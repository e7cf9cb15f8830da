//! PBQ: priority-biased queues. `schedule` inserts into the calling
//! worker's local buffer; `select` probes (i) own local buffer, (ii)
//! neighbor buffers in increasing distance, (iii) the system queue (spec
//! 4.D).

use std::collections::HashMap;
use std::sync::Arc;

use super::SchedulerPolicy;
use crate::task::{Task, TaskId};
use crate::topology::{Topology, WorkerId};
use crate::worker_queue::{build_worker_queues, WorkerQueues};

pub struct PbqScheduler {
    queues: HashMap<WorkerId, WorkerQueues>,
}

impl PbqScheduler {
    pub fn new(topo: &Topology) -> Self {
        Self {
            queues: build_worker_queues(topo),
        }
    }

    fn queues_for(&self, worker: WorkerId) -> &WorkerQueues {
        self.queues
            .get(&worker)
            .expect("select/schedule called for a worker not covered by the topology")
    }
}

impl SchedulerPolicy for PbqScheduler {
    fn init_worker(&self, _worker: WorkerId) {}

    fn schedule(&self, worker: WorkerId, task: Arc<Task>, distance: u32) {
        self.queues_for(worker).local.push_all_by_priority(vec![task], distance);
    }

    fn select(&self, worker: WorkerId) -> Option<(Arc<Task>, u32)> {
        let wq = self.queues_for(worker);

        if let Some(task) = wq.local.pop_best_default() {
            return Some((task, 0));
        }

        for neighbor in &wq.hierarch_queues {
            if let Some(task) = neighbor.buffer.pop_best_default() {
                return Some((task, neighbor.distance.max(1)));
            }
        }

        wq.system.pop().map(|task| (task, u32::MAX))
    }

    fn remove(&self, worker: WorkerId, task_id: TaskId) -> bool {
        self.queues_for(worker)
            .local
            .remove_by(|t| t.id() == task_id)
            .is_some()
    }
}
