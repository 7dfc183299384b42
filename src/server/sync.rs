//! Deadlock-free server-to-server acquisition handshake.
//!
//! A server must sometimes call into a peer server (notification PUTs,
//! reference STOREs, refcount routing, steals). Two servers calling each
//! other concurrently would deadlock a naive request/serve protocol, so
//! acquisition is arbitrated by rank order: while my own request is
//! outstanding, an interrupting request from a higher-ranked server is
//! accepted and served immediately; one from a lower-ranked server is
//! deferred (or rejected when the defer queue is full) until my own sync
//! completes. In any cycle of mutual requests the highest-ranked server
//! always accepts, so the cycle breaks in bounded rounds.

use std::collections::VecDeque;

use crate::layout::Rank;
use crate::msg::{Msg, SyncMode, Tag};
use crate::server::Server;
use crate::utils::TaskmillError;

/// Capacity of the deferred-request queue before rejecting.
pub const PENDING_SYNC_BUFFER_SIZE: usize = 1024;

/// How an incoming SYNC_REQUEST is treated while my own sync is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingDecision {
    /// Higher-ranked peer: accept and serve now.
    AcceptServe,
    /// Lower-ranked peer, space available: serve after my sync completes.
    Defer,
    /// Lower-ranked peer, defer queue full: reject, peer will retry.
    Reject,
}

/// Rank-order arbitration rule.
pub fn decide_incoming(me: Rank, other: Rank, pending_len: usize) -> IncomingDecision {
    if other > me {
        IncomingDecision::AcceptServe
    } else if pending_len < PENDING_SYNC_BUFFER_SIZE {
        IncomingDecision::Defer
    } else {
        IncomingDecision::Reject
    }
}

/// Result of driving one sync acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The target accepted; the follow-up RPC may be issued.
    Accepted,
    /// A shutdown arrived while syncing.
    Shutdown,
}

/// Per-server sync protocol state.
pub struct SyncState {
    /// Are we currently trying to sync with another server? Nested syncs
    /// are not supported.
    pub in_progress: bool,

    /// Requests from lower-ranked servers parked until we finish.
    pub pending: VecDeque<(Rank, SyncMode)>,
}

impl SyncState {
    pub fn new() -> Self {
        SyncState {
            in_progress: false,
            pending: VecDeque::new(),
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::new()
    }
}

impl Server {
    /// Acquires `target` for one follow-up RPC (or a steal), driving the
    /// handshake until accepted or shut down.
    ///
    /// Three things can happen while our request is outstanding:
    /// 1. the target responds: accept ends the loop, reject backs off and
    ///    resends;
    /// 2. another server interrupts with its own SYNC_REQUEST: served now,
    ///    deferred, or rejected per the rank rule;
    /// 3. a SHUTDOWN_SERVER arrives: the loop ends with a shutdown
    ///    indication.
    pub(crate) async fn sync_acquire(
        &mut self,
        target: Rank,
        mode: SyncMode,
    ) -> Result<SyncOutcome, TaskmillError> {
        debug_assert!(!self.sync.in_progress);
        self.sync.in_progress = true;
        pf_trace!("sync: {} -> {}", self.layout.rank, target);

        self.hub.send_msg(Msg::SyncRequest(mode.clone()), target)?;

        let outcome = loop {
            // (1) response from the target
            if let Some((_, msg)) = self.inbox.probe_take(&mut self.hub, |r, m| {
                r == target && m.tag() == Tag::SyncResponse
            }) {
                let Msg::SyncResponse { accept } = msg else {
                    unreachable!()
                };
                if accept {
                    pf_trace!("sync accepted by {}", target);
                    break SyncOutcome::Accepted;
                }
                // rejected: back off briefly and retry from the top
                pf_debug!("sync rejected by {}, retrying...", target);
                tokio::time::sleep(tokio::time::Duration::from_micros(200)).await;
                self.hub.send_msg(Msg::SyncRequest(mode.clone()), target)?;
                continue;
            }

            // (2) interrupting request from any server
            if let Some((other, msg)) = self
                .inbox
                .probe_take(&mut self.hub, |_, m| m.tag() == Tag::SyncRequest)
            {
                let Msg::SyncRequest(other_mode) = msg else {
                    unreachable!()
                };
                match decide_incoming(self.layout.rank, other, self.sync.pending.len()) {
                    IncomingDecision::AcceptServe => {
                        pf_debug!("sync interrupted by higher-ranked {}", other);
                        self.hub.send_msg(Msg::SyncResponse { accept: true }, other)?;
                        self.serve_accepted_sync(other, other_mode).await?;
                        // if the interrupter was our own target and rejected
                        // us meanwhile, the response sits in the inbox and
                        // the next (1) probe resends
                    }
                    IncomingDecision::Defer => {
                        pf_debug!("deferring sync request from {}", other);
                        self.sync.pending.push_back((other, other_mode));
                    }
                    IncomingDecision::Reject => {
                        pf_debug!("rejecting sync request from {}", other);
                        self.hub
                            .send_msg(Msg::SyncResponse { accept: false }, other)?;
                    }
                }
                continue;
            }

            // (3) shutdown
            if let Some((rank, _)) = self
                .inbox
                .probe_take(&mut self.hub, |_, m| m.tag() == Tag::ShutdownServer)
            {
                pf_debug!("sync cancelled by shutdown from {}", rank);
                self.shutting_down = true;
                break SyncOutcome::Shutdown;
            }

            // nothing relevant buffered: block until any message arrives
            let (rank, msg) = self.hub.recv_msg().await?;
            self.inbox.park(rank, msg);
        };

        self.sync.in_progress = false;
        Ok(outcome)
    }

    /// Serves sync requests deferred during our own acquisitions.
    pub(crate) async fn serve_pending_syncs(&mut self) -> Result<(), TaskmillError> {
        while let Some((peer, mode)) = self.sync.pending.pop_front() {
            self.hub.send_msg(Msg::SyncResponse { accept: true }, peer)?;
            self.serve_accepted_sync(peer, mode).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod sync_tests {
    use super::*;

    #[test]
    fn rank_order_breaks_cycles() {
        // in any pair of mutually syncing servers, exactly one accepts the
        // other immediately
        for (a, b) in [(3, 5), (0, 1), (7, 9)] {
            let a_decides = decide_incoming(a, b, 0);
            let b_decides = decide_incoming(b, a, 0);
            assert_eq!(a_decides, IncomingDecision::AcceptServe);
            assert_eq!(b_decides, IncomingDecision::Defer);
        }
    }

    #[test]
    fn lower_rank_rejected_when_queue_full() {
        assert_eq!(
            decide_incoming(5, 3, PENDING_SYNC_BUFFER_SIZE),
            IncomingDecision::Reject
        );
        assert_eq!(
            decide_incoming(5, 3, PENDING_SYNC_BUFFER_SIZE - 1),
            IncomingDecision::Defer
        );
    }

    #[test]
    fn any_cycle_has_an_accepting_server() {
        // simulate a ring of servers each syncing with the next: the
        // highest-ranked member always accepts its predecessor
        let ring = [4, 7, 2, 9, 5];
        let accepting = ring
            .iter()
            .enumerate()
            .filter(|&(i, &me)| {
                let requester = ring[(i + ring.len() - 1) % ring.len()];
                decide_incoming(me, requester, 0) == IncomingDecision::AcceptServe
            })
            .count();
        assert!(accepting >= 1);
    }
}
