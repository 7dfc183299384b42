//! Notification outputs of data-store operations.
//!
//! Store and refcount operations never talk to the network themselves; they
//! collect everything that must be delivered into a [`NotifSet`], which the
//! server loop then routes: listeners whose home server is this server get
//! a local CONTROL work unit, everything else requires acquiring the remote
//! server through the sync protocol first.

use crate::layout::{Layout, Rank};
use crate::msg::RefCounts;

/// Everything a data operation asks the server to deliver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifSet {
    /// Ranks awaiting closure of the datum.
    pub close_notify: Vec<Rank>,

    /// Ranks awaiting insertion at the touched subscript.
    pub insert_notify: Vec<Rank>,

    /// Datum ids bound by container-reference promises: each must receive a
    /// STORE of the inserted value.
    pub references: Vec<i64>,

    /// Refcount changes to deliver to datum home servers (possibly this
    /// one): referand increments from reference creation and decrements
    /// from datum destruction.
    pub rc_dispatch: Vec<(i64, RefCounts)>,
}

impl NotifSet {
    pub fn new() -> Self {
        NotifSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.close_notify.is_empty()
            && self.insert_notify.is_empty()
            && self.references.is_empty()
            && self.rc_dispatch.is_empty()
    }
}

/// Formats the closure/insertion notification payload: `close <id>` or
/// `close <id> <sub>`.
pub fn close_payload(id: i64, sub: Option<&[u8]>) -> Vec<u8> {
    match sub {
        None => format!("close {}", id).into_bytes(),
        Some(sub) => {
            let mut payload = format!("close {} ", id).into_bytes();
            payload.extend_from_slice(sub);
            payload
        }
    }
}

/// Splits `ranks` into those homed on this server (returned) and the rest
/// (left in place). Local notifications are peeled off first so that
/// cross-server traffic carries only the remainder.
pub fn peel_local(ranks: &mut Vec<Rank>, layout: &Layout) -> Vec<Rank> {
    let me = layout.rank;
    let mut local = Vec::new();
    ranks.retain(|&r| {
        if layout.server_of_rank(r) == me {
            local.push(r);
            false
        } else {
            true
        }
    });
    local
}
