//! AP: absolute-priority scheduling. The entire NUMA domain shares one
//! ordered list; `schedule` inserts in priority order, `select` pops the
//! front. Trivially fair on priority, no locality (spec 4.D).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::SchedulerPolicy;
use crate::task::{Task, TaskId};
use crate::topology::{Topology, WorkerId};

fn priority_then_fifo(a: &Task, b: &Task) -> Ordering {
    b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))
}

#[derive(Default)]
struct DomainList {
    items: Mutex<Vec<Arc<Task>>>,
}

impl DomainList {
    fn push(&self, task: Arc<Task>) {
        let mut guard = self.items.lock();
        let pos = guard
            .binary_search_by(|t| priority_then_fifo(t, &task))
            .unwrap_or_else(|e| e);
        guard.insert(pos, task);
    }

    fn pop_front(&self) -> Option<Arc<Task>> {
        let mut guard = self.items.lock();
        if guard.is_empty() {
            None
        } else {
            Some(guard.remove(0))
        }
    }

    fn remove(&self, task_id: TaskId) -> bool {
        let mut guard = self.items.lock();
        if let Some(pos) = guard.iter().position(|t| t.id() == task_id) {
            guard.remove(pos);
            true
        } else {
            false
        }
    }
}

pub struct ApScheduler {
    domain_of: HashMap<WorkerId, u32>,
    domains: HashMap<u32, Arc<DomainList>>,
}

impl ApScheduler {
    pub fn new(topo: &Topology) -> Self {
        let mut domain_of = HashMap::new();
        let mut domains: HashMap<u32, Arc<DomainList>> = HashMap::new();
        for w in topo.workers() {
            let d = topo.domain_of(w);
            domain_of.insert(w, d);
            domains.entry(d).or_insert_with(|| Arc::new(DomainList::default()));
        }
        Self { domain_of, domains }
    }

    fn domain_list(&self, worker: WorkerId) -> &Arc<DomainList> {
        let domain = self.domain_of.get(&worker).copied().unwrap_or(0);
        self.domains
            .get(&domain)
            .expect("worker registered with an unknown domain")
    }
}

impl SchedulerPolicy for ApScheduler {
    fn init_worker(&self, _worker: WorkerId) {}

    fn schedule(&self, worker: WorkerId, task: Arc<Task>, _distance: u32) {
        self.domain_list(worker).push(task);
    }

    fn select(&self, worker: WorkerId) -> Option<(Arc<Task>, u32)> {
        self.domain_list(worker).pop_front().map(|t| (t, 0))
    }

    fn remove(&self, worker: WorkerId, task_id: TaskId) -> bool {
        self.domain_list(worker).remove(task_id)
    }
}
