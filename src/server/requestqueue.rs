//! Pool of parked workers waiting for work.
//!
//! A worker whose GET found nothing is parked here until a matching PUT
//! arrives or a steal yields a match. Indexed per type as a FIFO, with a
//! rank side table for fast removal and targeted lookup.

use std::collections::{HashMap, VecDeque};

use crate::layout::Rank;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReqEntry {
    work_type: i32,
    parallelism: i32,
}

/// Per-server pool of parked worker requests.
#[derive(Default)]
pub struct RequestQueue {
    /// Per-type FIFO of parked ranks. May contain stale ranks already
    /// removed through the side table; they are skipped lazily.
    fifos: HashMap<i32, VecDeque<Rank>>,

    /// Rank -> its parked request. The authoritative membership.
    entries: HashMap<Rank, ReqEntry>,
}

impl RequestQueue {
    pub fn new() -> Self {
        RequestQueue::default()
    }

    /// Parks a rank requesting the given type. A rank parks at most once.
    pub fn add(&mut self, rank: Rank, work_type: i32, parallelism: i32) {
        debug_assert!(!self.entries.contains_key(&rank));
        self.entries.insert(
            rank,
            ReqEntry {
                work_type,
                parallelism,
            },
        );
        self.fifos.entry(work_type).or_default().push_back(rank);
    }

    /// Number of parked ranks.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Whether the given rank is parked.
    pub fn contains(&self, rank: Rank) -> bool {
        self.entries.contains_key(&rank)
    }

    /// Number of parked ranks requesting the given type.
    pub fn num_of_type(&self, work_type: i32) -> usize {
        self.entries
            .values()
            .filter(|e| e.work_type == work_type)
            .count()
    }

    /// The distinct types currently requested.
    pub fn types_present(&self) -> Vec<i32> {
        let mut types: Vec<i32> = self.entries.values().map(|e| e.work_type).collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    /// Takes the specific rank if it is parked for the given type.
    pub fn matches_target(&mut self, rank: Rank, work_type: i32) -> bool {
        match self.entries.get(&rank) {
            Some(e) if e.work_type == work_type => {
                self.entries.remove(&rank);
                true
            }
            _ => false,
        }
    }

    /// Takes the longest-parked rank requesting the given type.
    pub fn matches_type(&mut self, work_type: i32) -> Option<Rank> {
        let fifo = self.fifos.get_mut(&work_type)?;
        while let Some(rank) = fifo.pop_front() {
            // skip ranks already taken through the side table
            if let Some(e) = self.entries.get(&rank) {
                if e.work_type == work_type {
                    self.entries.remove(&rank);
                    return Some(rank);
                }
            }
        }
        None
    }

    /// Takes `parallelism` parked ranks of the given type, FIFO order, if
    /// that many are available.
    pub fn parallel_workers(&mut self, work_type: i32, parallelism: i32) -> Option<Vec<Rank>> {
        if (self.num_of_type(work_type) as i32) < parallelism {
            return None;
        }
        let mut team = Vec::with_capacity(parallelism as usize);
        while (team.len() as i32) < parallelism {
            team.push(self.matches_type(work_type)?);
        }
        Some(team)
    }

    /// Snapshot of every parked `(rank, type)` pair, rank-ordered.
    pub fn parked_pairs(&self) -> Vec<(Rank, i32)> {
        let mut pairs: Vec<(Rank, i32)> = self
            .entries
            .iter()
            .map(|(&r, e)| (r, e.work_type))
            .collect();
        pairs.sort_unstable();
        pairs
    }

    /// Removes a parked rank (e.g. it was matched elsewhere or shut down).
    pub fn remove(&mut self, rank: Rank) -> bool {
        self.entries.remove(&rank).is_some()
    }

    /// Drains every parked rank, for shutdown notification.
    pub fn drain(&mut self) -> Vec<Rank> {
        self.fifos.clear();
        let mut ranks: Vec<Rank> = self.entries.drain().map(|(r, _)| r).collect();
        ranks.sort_unstable();
        ranks
    }
}

#[cfg(test)]
mod requestqueue_tests {
    use super::*;

    #[test]
    fn fifo_per_type() {
        let mut rq = RequestQueue::new();
        rq.add(3, 0, 1);
        rq.add(1, 0, 1);
        rq.add(2, 1, 1);
        assert_eq!(rq.size(), 3);
        assert_eq!(rq.matches_type(0), Some(3));
        assert_eq!(rq.matches_type(0), Some(1));
        assert_eq!(rq.matches_type(0), None);
        assert_eq!(rq.matches_type(1), Some(2));
        assert_eq!(rq.size(), 0);
    }

    #[test]
    fn targeted_lookup_removes_from_fifo() {
        let mut rq = RequestQueue::new();
        rq.add(3, 0, 1);
        rq.add(4, 0, 1);
        assert!(rq.matches_target(4, 0));
        assert!(!rq.matches_target(4, 0));
        // rank 4 must not be yielded by the type match anymore
        assert_eq!(rq.matches_type(0), Some(3));
        assert_eq!(rq.matches_type(0), None);
    }

    #[test]
    fn wrong_type_does_not_match_target() {
        let mut rq = RequestQueue::new();
        rq.add(3, 1, 1);
        assert!(!rq.matches_target(3, 0));
        assert!(rq.contains(3));
    }

    #[test]
    fn parallel_team_assembles_when_enough_parked() {
        let mut rq = RequestQueue::new();
        rq.add(0, 2, 1);
        rq.add(1, 2, 1);
        assert_eq!(rq.parallel_workers(2, 4), None);
        rq.add(2, 2, 1);
        rq.add(3, 2, 1);
        let team = rq.parallel_workers(2, 4).unwrap();
        assert_eq!(team, vec![0, 1, 2, 3]);
        assert_eq!(rq.size(), 0);
    }

    #[test]
    fn types_present_deduped() {
        let mut rq = RequestQueue::new();
        rq.add(0, 2, 1);
        rq.add(1, 2, 1);
        rq.add(2, 0, 1);
        assert_eq!(rq.types_present(), vec![0, 2]);
    }

    #[test]
    fn drain_returns_everyone() {
        let mut rq = RequestQueue::new();
        rq.add(5, 0, 1);
        rq.add(2, 1, 1);
        assert_eq!(rq.drain(), vec![2, 5]);
        assert_eq!(rq.size(), 0);
    }
}
