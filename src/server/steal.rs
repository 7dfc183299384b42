//! Cross-server work redistribution.
//!
//! A server whose workers are starving picks a random peer, acquires it
//! with a Steal-mode sync carrying its own per-type pending counts and a
//! payload byte budget, and receives the transferred units in batches.

use tokio::time::Instant;

use crate::layout::Rank;
use crate::msg::{Msg, SyncMode, Tag, WorkUnit};
use crate::server::{Server, SyncOutcome};
use crate::utils::TaskmillError;

/// Units per transfer batch.
pub const STEAL_BATCH_SIZE: usize = 64;

impl Server {
    /// Initiates a steal from a random peer if one is due. Returns how many
    /// units arrived.
    pub(crate) async fn maybe_steal(&mut self) -> Result<usize, TaskmillError> {
        if self.shutting_down || self.requestqueue.size() == 0 {
            return Ok(0);
        }
        if let Some(last) = self.last_steal {
            let min = tokio::time::Duration::from_millis(self.config.steal_min_interval_ms);
            if last.elapsed() < min {
                return Ok(0);
            }
        }
        let Some(victim) = self.layout.random_other_server() else {
            return Ok(0);
        };
        self.last_steal = Some(Instant::now());
        self.steal_from(victim).await
    }

    /// Runs the stealing half of the protocol against `victim`.
    pub(crate) async fn steal_from(&mut self, victim: Rank) -> Result<usize, TaskmillError> {
        let mode = SyncMode::Steal {
            work_type_counts: self.workqueue.type_counts(),
            max_memory: self.config.steal_max_memory,
        };
        match self.sync_acquire(victim, mode).await? {
            SyncOutcome::Shutdown => return Ok(0),
            SyncOutcome::Accepted => {}
        }

        // the victim sends the transferred units in batches
        let mut got = 0usize;
        loop {
            let (_, msg) = self
                .inbox
                .recv_match(&mut self.hub, |r, m| {
                    r == victim && m.tag() == Tag::StealBatch
                })
                .await?;
            let Msg::StealBatch { units, last } = msg else {
                unreachable!()
            };
            got += units.len();
            for unit in units {
                self.workqueue.add(unit);
            }
            if last {
                break;
            }
        }

        if got > 0 {
            pf_debug!("stole {} units from {}", got, victim);
            // re-run matching for every parked request the new work serves
            self.rematch_parked()?;
        }
        Ok(got)
    }

    /// Donor half: computes the transfer per type, removes the units and
    /// ships them in batches. Runs inside an accepted Steal-mode sync.
    pub(crate) fn handle_steal(
        &mut self,
        stealer: Rank,
        stealer_counts: &[i64],
        max_memory: i64,
    ) -> Result<usize, TaskmillError> {
        let stolen = self.workqueue.steal_units(max_memory, stealer_counts);
        let total = stolen.len();
        pf_debug!("giving {} units to stealer {}", total, stealer);

        let mut batches = stolen.chunks(STEAL_BATCH_SIZE).peekable();
        if batches.peek().is_none() {
            // nothing to give: still terminate the stealer's batch loop
            self.hub.send_msg(
                Msg::StealBatch {
                    units: Vec::new(),
                    last: true,
                },
                stealer,
            )?;
            return Ok(0);
        }
        while let Some(batch) = batches.next() {
            self.hub.send_msg(
                Msg::StealBatch {
                    units: batch.to_vec(),
                    last: batches.peek().is_none(),
                },
                stealer,
            )?;
        }
        Ok(total)
    }
}
