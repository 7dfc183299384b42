//! Fixed cluster layout: which ranks are servers, which are workers, and
//! the home-server routing maps for ranks and datum ids.

use rand::Rng;

use crate::utils::TaskmillError;

/// Rank of a cluster member. Kept as `i32` because targeting fields also
/// carry the `ANY_RANK` / `NULL_RANK` sentinels.
pub type Rank = i32;

/// Target sentinel: any worker may receive the task.
pub const ANY_RANK: Rank = -100;

/// Rank sentinel: no such rank.
pub const NULL_RANK: Rank = -200;

/// Work type sentinel: any type.
pub const ANY_TYPE: i32 = -300;

/// The datum id of nothing.
pub const NULL_ID: i64 = 0;

/// Cluster layout. The last `servers` ranks run the server loop; the first
/// `size - servers` ranks are workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Total number of ranks in the cluster.
    pub size: i32,
    /// Number of server ranks.
    pub servers: i32,
    /// Number of worker ranks.
    pub workers: i32,
    /// My own rank.
    pub rank: Rank,
}

impl Layout {
    pub fn new(size: i32, servers: i32, rank: Rank) -> Result<Self, TaskmillError> {
        if servers < 1 || servers >= size {
            return logged_err!("invalid server count {} of {}", servers, size);
        }
        if rank < 0 || rank >= size {
            return logged_err!("invalid rank {} of {}", rank, size);
        }
        Ok(Layout {
            size,
            servers,
            workers: size - servers,
            rank,
        })
    }

    /// Whether the given rank is a server rank.
    #[inline]
    pub fn is_server(&self, rank: Rank) -> bool {
        rank >= self.workers && rank < self.size
    }

    /// Rank of the master server (the first server rank). The master runs
    /// idle detection and collects failure codes.
    #[inline]
    pub fn master_server(&self) -> Rank {
        self.workers
    }

    /// Home server of the given rank. Servers are their own home.
    #[inline]
    pub fn server_of_rank(&self, rank: Rank) -> Rank {
        if self.is_server(rank) {
            rank
        } else {
            self.workers + (rank % self.servers)
        }
    }

    /// Home server of the given datum id. Negative ids are legal and
    /// distribute across servers identically.
    #[inline]
    pub fn server_of_id(&self, id: i64) -> Rank {
        let s = self.servers as i64;
        self.workers + (((id % s) + s) % s) as i32
    }

    /// Index of this server among servers (0-based). Only meaningful when
    /// called on a server rank.
    #[inline]
    pub fn server_num(&self) -> i32 {
        self.rank - self.workers
    }

    /// Number of workers whose home server is the given server rank.
    pub fn workers_of_server(&self, server: Rank) -> i32 {
        let snum = server - self.workers;
        let base = self.workers / self.servers;
        let extra = self.workers % self.servers;
        base + if snum < extra { 1 } else { 0 }
    }

    /// A uniformly random server rank other than myself (used by the steal
    /// protocol to pick a victim).
    pub fn random_other_server(&self) -> Option<Rank> {
        if self.servers <= 1 {
            return None;
        }
        let mut rng = rand::thread_rng();
        loop {
            let pick = self.workers + rng.gen_range(0..self.servers);
            if pick != self.rank {
                return Some(pick);
            }
        }
    }
}

#[cfg(test)]
mod layout_tests {
    use super::*;

    #[test]
    fn rank_classification() -> Result<(), TaskmillError> {
        let l = Layout::new(10, 3, 0)?;
        assert_eq!(l.workers, 7);
        assert!(!l.is_server(6));
        assert!(l.is_server(7));
        assert!(l.is_server(9));
        assert_eq!(l.master_server(), 7);
        Ok(())
    }

    #[test]
    fn worker_home_servers() -> Result<(), TaskmillError> {
        let l = Layout::new(10, 3, 0)?;
        assert_eq!(l.server_of_rank(0), 7);
        assert_eq!(l.server_of_rank(1), 8);
        assert_eq!(l.server_of_rank(2), 9);
        assert_eq!(l.server_of_rank(3), 7);
        // servers are their own home
        assert_eq!(l.server_of_rank(8), 8);
        Ok(())
    }

    #[test]
    fn id_home_servers() -> Result<(), TaskmillError> {
        let l = Layout::new(10, 3, 0)?;
        assert_eq!(l.server_of_id(0), 7);
        assert_eq!(l.server_of_id(1), 8);
        assert_eq!(l.server_of_id(5), 9);
        // negative ids distribute identically
        assert_eq!(l.server_of_id(-1), 9);
        assert_eq!(l.server_of_id(-3), 7);
        for id in -20i64..20 {
            let s = l.server_of_id(id);
            assert!(l.is_server(s));
        }
        Ok(())
    }

    #[test]
    fn workers_per_server() -> Result<(), TaskmillError> {
        let l = Layout::new(10, 3, 7)?;
        // 7 workers over 3 servers: 3 + 2 + 2
        assert_eq!(l.workers_of_server(7), 3);
        assert_eq!(l.workers_of_server(8), 2);
        assert_eq!(l.workers_of_server(9), 2);
        assert_eq!(
            l.workers_of_server(7) + l.workers_of_server(8) + l.workers_of_server(9),
            l.workers
        );
        Ok(())
    }

    #[test]
    fn invalid_layouts() {
        assert!(Layout::new(4, 0, 0).is_err());
        assert!(Layout::new(4, 4, 0).is_err());
        assert!(Layout::new(4, 1, 4).is_err());
    }

    #[test]
    fn random_server_avoids_self() -> Result<(), TaskmillError> {
        let l = Layout::new(6, 2, 4)?;
        for _ in 0..50 {
            let s = l.random_other_server().unwrap();
            assert_eq!(s, 5);
        }
        let single = Layout::new(6, 1, 5)?;
        assert!(single.random_other_server().is_none());
        Ok(())
    }
}
