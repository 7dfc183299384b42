//! Pool of pending work units, indexed for the matcher.
//!
//! Targeted tasks live in per-`(target, type)` buckets; untargeted tasks in
//! per-type priority heaps; parallel tasks in a per-type side table. Within
//! a bucket or heap, ordering is priority descending then enqueue time
//! ascending (oldest first).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::layout::{Rank, ANY_RANK};
use crate::msg::WorkUnit;

/// Heap adapter: higher priority first, then older timestamp first.
#[derive(Debug, Clone, PartialEq)]
struct Prioritized(WorkUnit);

impl Eq for Prioritized {}

impl Ord for Prioritized {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then(other.0.timestamp.cmp(&self.0.timestamp))
            .then(other.0.id.cmp(&self.0.id))
    }
}

impl PartialOrd for Prioritized {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-server pool of pending tasks.
pub struct WorkQueue {
    /// Number of valid work types; types are `0..ntypes`.
    ntypes: i32,

    /// Targeted single-process tasks.
    targeted: HashMap<(Rank, i32), BinaryHeap<Prioritized>>,

    /// Untargeted single-process tasks.
    untargeted: HashMap<i32, BinaryHeap<Prioritized>>,

    /// Parallel tasks (`parallelism > 1`), matched out of band of the
    /// single-process heaps.
    parallel: HashMap<i32, Vec<WorkUnit>>,

    /// Per-type count of stealable tasks (untargeted + parallel).
    stealable_counts: Vec<i64>,

    /// Count of targeted tasks (not stealable, still pending).
    targeted_count: i64,

    /// Next server-local work unit id.
    next_id: u64,

    /// Logical clock stamping enqueue order.
    clock: u64,
}

impl WorkQueue {
    pub fn new(ntypes: i32) -> Self {
        WorkQueue {
            ntypes,
            targeted: HashMap::new(),
            untargeted: HashMap::new(),
            parallel: HashMap::new(),
            stealable_counts: vec![0; ntypes as usize],
            targeted_count: 0,
            next_id: 1,
            clock: 0,
        }
    }

    pub fn ntypes(&self) -> i32 {
        self.ntypes
    }

    /// Next unique work-unit id on this server.
    pub fn unique_wid(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Enqueues a unit, restamping its id and enqueue time for this server
    /// (stolen units arrive with the donor's stamps). Returns the new id.
    pub fn add(&mut self, mut unit: WorkUnit) -> u64 {
        debug_assert!(unit.work_type >= 0 && unit.work_type < self.ntypes);
        unit.id = self.unique_wid();
        self.clock += 1;
        unit.timestamp = self.clock;
        let wid = unit.id;

        if unit.parallelism > 1 {
            self.stealable_counts[unit.work_type as usize] += 1;
            self.parallel.entry(unit.work_type).or_default().push(unit);
        } else if unit.target == ANY_RANK {
            self.stealable_counts[unit.work_type as usize] += 1;
            self.untargeted
                .entry(unit.work_type)
                .or_default()
                .push(Prioritized(unit));
        } else {
            self.targeted_count += 1;
            self.targeted
                .entry((unit.target, unit.work_type))
                .or_default()
                .push(Prioritized(unit));
        }
        wid
    }

    /// Pops the best single-process unit for a rank requesting `work_type`:
    /// targeted to that rank first, then the best untargeted.
    pub fn get(&mut self, target: Rank, work_type: i32) -> Option<WorkUnit> {
        if let Some(heap) = self.targeted.get_mut(&(target, work_type)) {
            if let Some(Prioritized(unit)) = heap.pop() {
                if heap.is_empty() {
                    self.targeted.remove(&(target, work_type));
                }
                self.targeted_count -= 1;
                return Some(unit);
            }
        }
        if let Some(heap) = self.untargeted.get_mut(&work_type) {
            if let Some(Prioritized(unit)) = heap.pop() {
                if heap.is_empty() {
                    self.untargeted.remove(&work_type);
                }
                self.stealable_counts[work_type as usize] -= 1;
                return Some(unit);
            }
        }
        None
    }

    /// Releases the first parallel task whose team the request queue can
    /// currently seat. Highest priority first within a type.
    pub fn pop_parallel(&mut self, can_run: impl Fn(i32, i32) -> bool) -> Option<WorkUnit> {
        for (&work_type, units) in self.parallel.iter_mut() {
            let mut best: Option<usize> = None;
            for (i, u) in units.iter().enumerate() {
                if !can_run(work_type, u.parallelism) {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some(b) => {
                        u.priority > units[b].priority
                            || (u.priority == units[b].priority
                                && u.timestamp < units[b].timestamp)
                    }
                };
                if better {
                    best = Some(i);
                }
            }
            if let Some(i) = best {
                let unit = units.swap_remove(i);
                self.stealable_counts[work_type as usize] -= 1;
                return Some(unit);
            }
        }
        None
    }

    /// Per-type counts of stealable pending work.
    pub fn type_counts(&self) -> Vec<i64> {
        self.stealable_counts.clone()
    }

    /// Total pending units, including targeted ones.
    pub fn total_queued(&self) -> i64 {
        self.stealable_counts.iter().sum::<i64>() + self.targeted_count
    }

    /// Donor side of a steal: removes up to half of the stealable units of
    /// each type, bounded by the cumulative payload byte budget. Targeted
    /// tasks are never stolen, and types where the stealer already holds at
    /// least as much pending work as we do are skipped.
    pub fn steal_units(&mut self, max_memory: i64, stealer_counts: &[i64]) -> Vec<WorkUnit> {
        let mut stolen = Vec::new();
        let mut budget = max_memory;

        for work_type in 0..self.ntypes {
            let count = self.stealable_counts[work_type as usize];
            if count == 0 {
                continue;
            }
            if stealer_counts.get(work_type as usize).copied().unwrap_or(0) >= count {
                continue;
            }
            let mut to_take = count - count / 2; // ceil(count / 2)

            // parallel units first (cheapest to re-queue), then untargeted.
            // The byte budget is a hard cap: a unit that does not fit ends
            // the transfer, even if it would be the only one.
            if let Some(units) = self.parallel.get_mut(&work_type) {
                while to_take > 0 && !units.is_empty() {
                    let bytes = units.last().map(WorkUnit::payload_bytes).unwrap_or(0);
                    if bytes > budget {
                        return stolen;
                    }
                    let unit = units.pop().unwrap();
                    budget -= bytes;
                    to_take -= 1;
                    self.stealable_counts[work_type as usize] -= 1;
                    stolen.push(unit);
                }
            }
            if let Some(heap) = self.untargeted.get_mut(&work_type) {
                while to_take > 0 && !heap.is_empty() {
                    let bytes = heap
                        .peek()
                        .map(|p| p.0.payload_bytes())
                        .unwrap_or(0);
                    if bytes > budget {
                        return stolen;
                    }
                    let Prioritized(unit) = heap.pop().unwrap();
                    budget -= bytes;
                    to_take -= 1;
                    self.stealable_counts[work_type as usize] -= 1;
                    stolen.push(unit);
                }
            }
        }
        stolen
    }
}
