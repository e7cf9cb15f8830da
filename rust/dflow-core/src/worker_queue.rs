//! 4.C Worker queues: per-worker local `hbbuffer`, the per-NUMA-domain
//! shared system queue, and the distance-ordered neighbor view populated
//! after the `flow_init` barrier (spec §6).

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::hbbuffer::{HbBuffer, Overflow};
use crate::task::Task;
use crate::topology::{Topology, WorkerId};

/// Unbounded MPMC fallback queue shared by every worker in a NUMA domain.
#[derive(Default)]
pub struct SystemQueue {
    queue: SegQueue<Arc<Task>>,
}

impl SystemQueue {
    pub fn push(&self, task: Arc<Task>) {
        self.queue.push(task);
    }

    pub fn pop(&self) -> Option<Arc<Task>> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Overflow for SystemQueue {
    fn push_overflow(&self, tasks: Vec<Arc<Task>>, _distance: u32) {
        for task in tasks {
            self.queue.push(task);
        }
    }
}

/// A neighbor's local buffer, tagged with its distance from `self`.
pub struct NeighborQueue {
    pub worker: WorkerId,
    pub distance: u32,
    pub buffer: Arc<HbBuffer>,
}

/// Everything one worker needs to schedule and select: its own buffer, the
/// ordered view onto every other worker's buffer, and the domain's system
/// queue fallback.
pub struct WorkerQueues {
    pub worker: WorkerId,
    pub local: Arc<HbBuffer>,
    /// Ordered ascending by `distance(self, other)`; ties broken
    /// round-robin starting at `self + 1` (spec 4.C).
    pub hierarch_queues: Vec<NeighborQueue>,
    pub system: Arc<SystemQueue>,
}

/// Default local-buffer capacity: proportional to the worker count within
/// the worker's NUMA domain (spec 4.C: "sized proportionally to the number
/// of workers in its NUMA domain").
pub fn default_capacity(domain_size: usize) -> usize {
    (domain_size * 32).max(64)
}

/// Allocates per-worker local buffers and the per-domain system queues,
/// then (as if after the §5 barrier) populates each worker's hierarchical
/// neighbor view.
pub fn build_worker_queues(topo: &Topology) -> HashMap<WorkerId, WorkerQueues> {
    let mut domain_workers: HashMap<u32, Vec<WorkerId>> = HashMap::new();
    for w in topo.workers() {
        domain_workers.entry(topo.domain_of(w)).or_default().push(w);
    }

    let mut system_queues: HashMap<u32, Arc<SystemQueue>> = HashMap::new();
    for domain in domain_workers.keys() {
        system_queues.insert(*domain, Arc::new(SystemQueue::default()));
    }

    let mut locals: HashMap<WorkerId, Arc<HbBuffer>> = HashMap::new();
    for (domain, workers) in &domain_workers {
        let capacity = default_capacity(workers.len());
        let system = system_queues[domain].clone();
        for &w in workers {
            locals.insert(w, Arc::new(HbBuffer::new(capacity, Some(system.clone()))));
        }
    }

    let nb_workers = topo.nb_workers() as i64;
    let mut out = HashMap::new();
    for (domain, workers) in &domain_workers {
        for &w in workers {
            let mut others: Vec<WorkerId> = topo.workers().filter(|&o| o != w).collect();
            others.sort_by_key(|&o| {
                let d = topo.distance(w, o);
                // Round-robin tie-break starting at self+1.
                let rotated = (o as i64 - (w as i64 + 1)).rem_euclid(nb_workers.max(1));
                (d, rotated)
            });
            let hierarch_queues = others
                .into_iter()
                .map(|o| NeighborQueue {
                    worker: o,
                    distance: topo.distance(w, o),
                    buffer: locals[&o].clone(),
                })
                .collect();

            out.insert(
                w,
                WorkerQueues {
                    worker: w,
                    local: locals[&w].clone(),
                    hierarch_queues,
                    system: system_queues[domain].clone(),
                },
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_queues_are_distance_ordered() {
        let topo = Topology::numa_grid(2, 3);
        let queues = build_worker_queues(&topo);
        let w0 = &queues[&0];
        let distances: Vec<u32> = w0.hierarch_queues.iter().map(|n| n.distance).collect();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted);
        assert_eq!(w0.hierarch_queues.len(), 5); // all other workers
    }

    #[test]
    fn same_domain_workers_share_system_queue() {
        let topo = Topology::numa_grid(2, 2);
        let queues = build_worker_queues(&topo);
        let w0 = &queues[&0];
        let w1 = &queues[&1];
        assert!(Arc::ptr_eq(&w0.system, &w1.system));
        let w2 = &queues[&2];
        assert!(!Arc::ptr_eq(&w0.system, &w2.system));
    }

    #[test]
    fn tie_break_is_round_robin_from_self_plus_one() {
        let topo = Topology::flat(4); // every pair is distance 1, pure tie-break ordering
        let queues = build_worker_queues(&topo);
        let w0 = &queues[&0];
        let order: Vec<WorkerId> = w0.hierarch_queues.iter().map(|n| n.worker).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
