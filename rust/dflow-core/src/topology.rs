//! 4.A Topology oracle: pure, thread-safe-after-init `distance`/`nb_levels`
//! over worker indices, derived from a hardware hierarchy.
//!
//! Real deployments would derive this from `hwloc`; since that is an
//! external collaborator here, [`Topology`] is built from an explicit
//! hierarchy description (NUMA domain -> core groups -> workers) that a
//! context-bootstrap collaborator would otherwise populate from hwloc XML.

use std::collections::HashMap;

pub type WorkerId = u32;

/// One level of the hierarchy, innermost first: e.g. `[core, package, numa]`.
/// Each worker is described by its path down the hierarchy.
#[derive(Clone, Debug)]
pub struct Topology {
    /// For each worker, its ancestor id at each level, innermost first.
    paths: HashMap<WorkerId, Vec<u32>>,
    nb_levels: i32,
}

impl Topology {
    /// Builds a flat topology: every worker distance 1 from every other,
    /// used when no real hierarchy is available (`nb_levels() == -1`).
    pub fn flat(nb_workers: u32) -> Self {
        let mut paths = HashMap::new();
        for w in 0..nb_workers {
            paths.insert(w, Vec::new());
        }
        Self {
            paths,
            nb_levels: -1,
        }
    }

    /// Builds a topology from `(worker_id, path)` pairs. `path[0]` is the
    /// innermost ancestor (e.g. core id), the last element the outermost
    /// (e.g. NUMA domain id). All paths must have equal length.
    pub fn from_paths(entries: impl IntoIterator<Item = (WorkerId, Vec<u32>)>) -> Self {
        let paths: HashMap<WorkerId, Vec<u32>> = entries.into_iter().collect();
        let nb_levels = paths
            .values()
            .next()
            .map(|p| p.len() as i32)
            .unwrap_or(-1);
        Self { paths, nb_levels }
    }

    /// A two-level `nb_domains` x `workers_per_domain` topology: distance 1
    /// within a domain, distance `4 + domain delta` across domains, which
    /// matches the "two workers in separate sockets: distance 4+" example
    /// in spec §4.A.
    pub fn numa_grid(nb_domains: u32, workers_per_domain: u32) -> Self {
        let mut entries = Vec::new();
        for domain in 0..nb_domains {
            for local in 0..workers_per_domain {
                let worker = domain * workers_per_domain + local;
                entries.push((worker, vec![local, domain]));
            }
        }
        Self::from_paths(entries)
    }

    /// Count of hierarchy levels, or -1 when no topology info is available.
    pub fn nb_levels(&self) -> i32 {
        self.nb_levels
    }

    pub fn nb_workers(&self) -> usize {
        self.paths.len()
    }

    /// Distance between two workers: 0 if identical, 1 if they share the
    /// innermost level, and an increasing value per level of divergence
    /// further up the hierarchy. Returns 0 for unknown workers so callers
    /// degrade to "local" rather than panicking.
    pub fn distance(&self, a: WorkerId, b: WorkerId) -> u32 {
        if a == b {
            return 0;
        }
        let (Some(pa), Some(pb)) = (self.paths.get(&a), self.paths.get(&b)) else {
            return 1;
        };
        if pa.is_empty() || pb.is_empty() {
            return 1;
        }
        // Find the first (innermost) level at which the two workers agree;
        // distance grows with how far up the hierarchy we had to climb.
        let mut level = 0usize;
        while level < pa.len() && level < pb.len() {
            if pa[level] == pb[level] {
                return if level == 0 { 1 } else { (level as u32) * 4 };
            }
            level += 1;
        }
        (pa.len().max(pb.len()) as u32) * 4
    }

    pub fn workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.paths.keys().copied()
    }

    /// The NUMA domain (outermost level) a worker belongs to, used by the
    /// worker-queues module to decide who allocates the system queue.
    pub fn domain_of(&self, worker: WorkerId) -> u32 {
        self.paths
            .get(&worker)
            .and_then(|p| p.last())
            .copied()
            .unwrap_or(0)
    }
}
