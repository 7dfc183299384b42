//! Rank-to-hostname map shared by every rank of the cluster.
//!
//! The transport layer already knows every peer's address, so hostnames are
//! derived from the configured peer address list rather than gathered with a
//! collective. Applications use the map to find co-located ranks and to
//! elect one leader rank per host.

use std::collections::HashMap;

use crate::layout::Rank;
use crate::utils::{env_boolean, TaskmillError};

/// Hostmap operating mode, selected by the `ADLB_HOSTMAP_MODE` environment
/// variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostmapMode {
    /// Full host -> ranks map available.
    #[default]
    Enabled,
    /// Only the lowest rank per host is retained.
    Leaders,
    /// No map is built.
    Disabled,
}

impl HostmapMode {
    /// Reads the mode from the environment. `ADLB_DISABLE_HOSTMAP` wins over
    /// `ADLB_HOSTMAP_MODE`.
    pub fn from_env() -> Result<Self, TaskmillError> {
        if env_boolean("ADLB_DISABLE_HOSTMAP", false) {
            return Ok(HostmapMode::Disabled);
        }
        match std::env::var("ADLB_HOSTMAP_MODE") {
            Err(_) => Ok(HostmapMode::Enabled),
            Ok(s) if s.is_empty() => Ok(HostmapMode::Enabled),
            Ok(s) => match s.as_str() {
                "ENABLED" => Ok(HostmapMode::Enabled),
                "LEADERS" => Ok(HostmapMode::Leaders),
                "DISABLED" => Ok(HostmapMode::Disabled),
                _ => logged_err!("invalid ADLB_HOSTMAP_MODE '{}'", s),
            },
        }
    }
}

/// Hostnames of every rank, plus the optional host -> ranks map.
#[derive(Debug, Clone)]
pub struct Hostnames {
    /// Hostname per rank, indexed by rank.
    names: Vec<String>,

    /// Host -> sorted ranks on that host. Empty when mode is `Disabled`;
    /// holds only the leader rank per host when mode is `Leaders`.
    map: HashMap<String, Vec<Rank>>,

    mode: HostmapMode,
}

impl Hostnames {
    /// Builds the map from the per-rank hostname list.
    pub fn gather(names: Vec<String>, mode: HostmapMode) -> Self {
        if env_boolean("ADLB_DEBUG_RANKS", false) {
            for (rank, name) in names.iter().enumerate() {
                pf_info!("rank: {} nodename: {}", rank, name);
            }
        }

        let mut map: HashMap<String, Vec<Rank>> = HashMap::new();
        if mode != HostmapMode::Disabled {
            for (rank, name) in names.iter().enumerate() {
                map.entry(name.clone()).or_default().push(rank as Rank);
            }
            for ranks in map.values_mut() {
                ranks.sort_unstable();
                if mode == HostmapMode::Leaders {
                    ranks.truncate(1);
                }
            }
        }

        Hostnames { names, map, mode }
    }

    /// Hostname of a given rank.
    pub fn lookup(&self, rank: Rank) -> Option<&str> {
        self.names.get(rank as usize).map(String::as_str)
    }

    /// Ranks running on the given host (leader only in `Leaders` mode).
    pub fn ranks_on(&self, host: &str) -> &[Rank] {
        self.map.get(host).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether this rank is the lowest rank on its host.
    pub fn is_leader(&self, rank: Rank) -> bool {
        match self.lookup(rank) {
            Some(host) => self.ranks_on(host).first() == Some(&rank),
            None => false,
        }
    }

    pub fn mode(&self) -> HostmapMode {
        self.mode
    }
}

#[cfg(test)]
mod hostmap_tests {
    use super::*;

    fn names() -> Vec<String> {
        vec![
            "node0".into(),
            "node0".into(),
            "node1".into(),
            "node1".into(),
            "node1".into(),
        ]
    }

    #[test]
    fn enabled_map() {
        let h = Hostnames::gather(names(), HostmapMode::Enabled);
        assert_eq!(h.lookup(2), Some("node1"));
        assert_eq!(h.ranks_on("node0"), &[0, 1]);
        assert_eq!(h.ranks_on("node1"), &[2, 3, 4]);
        assert!(h.is_leader(0));
        assert!(!h.is_leader(3));
    }

    #[test]
    fn leaders_map() {
        let h = Hostnames::gather(names(), HostmapMode::Leaders);
        assert_eq!(h.ranks_on("node1"), &[2]);
        assert!(h.is_leader(2));
        assert!(!h.is_leader(4));
    }

    #[test]
    fn disabled_map() {
        let h = Hostnames::gather(names(), HostmapMode::Disabled);
        assert!(h.ranks_on("node0").is_empty());
        // names stay addressable even with the map disabled
        assert_eq!(h.lookup(0), Some("node0"));
    }
}
