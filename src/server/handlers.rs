//! Tag -> handler dispatch for the server event loop, the PUT/GET matcher
//! paths, and delivery of data-store notifications.

use std::collections::VecDeque;

use crate::codec::DataType;
use crate::data::notify::{close_payload, peel_local, NotifSet};
use crate::layout::{Rank, ANY_RANK, NULL_RANK};
use crate::msg::{
    GetResponse, Msg, PutHdr, RefCounts, Response, Status, StoreHdr, SyncMode, Tag, WorkUnit,
};
use crate::server::{Server, CONTROL_PRIORITY, CONTROL_TYPE};
use crate::utils::TaskmillError;

/// One queued cross-server delivery, performed through the sync protocol
/// once the server is back in its main loop.
#[derive(Debug, Clone)]
pub(crate) enum RemoteOp {
    /// Notification control task for a rank homed on `server`.
    Put { server: Rank, hdr: PutHdr },
    /// Reference write of an inserted value into a datum on `server`.
    Store { server: Rank, hdr: StoreHdr },
    /// Referand refcount routing to a datum on `server`.
    Refcount {
        server: Rank,
        id: i64,
        change: RefCounts,
    },
}

impl Server {
    /// Handles one incoming message. Runs to completion without suspending,
    /// except when accepting a peer server's sync.
    pub(crate) async fn dispatch(&mut self, rank: Rank, msg: Msg) -> Result<(), TaskmillError> {
        pf_trace!("dispatch {:?} <- {}", msg.tag(), rank);
        match msg {
            Msg::Put(hdr) => self.handle_put(rank, hdr)?,
            Msg::Get { work_type } => {
                self.handle_get(rank, work_type, false)?;
                // a miss that parked the worker warrants a steal attempt,
                // rate-limited inside
                if self.requestqueue.contains(rank) {
                    self.maybe_steal().await?;
                }
            }
            Msg::Iget { work_type } => self.handle_get(rank, work_type, true)?,
            Msg::Work { payload } => self.handle_work_payload(rank, payload)?,

            Msg::SyncRequest(mode) => {
                // not inside an acquisition of our own: accept immediately
                self.hub.send_msg(Msg::SyncResponse { accept: true }, rank)?;
                self.serve_accepted_sync(rank, mode).await?;
            }

            Msg::CheckIdle { attempt } => {
                pf_trace!("idle check attempt {} from {}", attempt, rank);
                let idle = self.is_idle() && self.remote_ops.is_empty();
                self.hub
                    .send_msg(Msg::Response(Response::CheckIdle { idle }), rank)?;
            }
            Msg::ShutdownWorker => {
                self.workers_done.insert(rank);
            }
            Msg::ShutdownServer => {
                self.do_shutdown()?;
            }
            Msg::Fail { code } => {
                if self.layout.rank == self.layout.master_server() {
                    pf_error!("rank {} reported failure code {}", rank, code);
                    self.failure_code.get_or_insert(code);
                } else {
                    self.hub
                        .send_msg(Msg::Fail { code }, self.layout.master_server())?;
                }
            }

            // data operations
            other => {
                let resp = self.handle_data_op(rank, other)?;
                self.hub.send_msg(Msg::Response(resp), rank)?;
            }
        }

        // cross-server deliveries generated above happen once per loop turn
        self.flush_remote_ops().await?;
        Ok(())
    }

    // ------------------------- task matching -------------------------- //

    /// PUT: validate, match against parked requests, else queue.
    fn handle_put(&mut self, putter: Rank, hdr: PutHdr) -> Result<(), TaskmillError> {
        if hdr.work_type < 0
            || hdr.work_type >= self.workqueue.ntypes()
            || !(hdr.target == ANY_RANK
                || (hdr.target >= 0 && hdr.target < self.layout.workers))
            || hdr.parallelism < 1
        {
            pf_warn!(
                "invalid put from {}: type {} target {}",
                putter,
                hdr.work_type,
                hdr.target
            );
            self.hub.send_msg(
                Msg::ResponsePut {
                    status: Status::Error,
                    payload_dest: NULL_RANK,
                },
                putter,
            )?;
            return Ok(());
        }

        let unit = WorkUnit {
            id: 0,
            timestamp: 0,
            work_type: hdr.work_type,
            putter: hdr.putter,
            priority: hdr.priority,
            answer: hdr.answer,
            target: hdr.target,
            parallelism: hdr.parallelism,
            payload: hdr.inline.clone().unwrap_or_default(),
            payload_len: hdr.length,
        };

        if hdr.parallelism == 1 && hdr.inline.is_none() {
            // redirect path: an already-parked matching worker receives the
            // payload straight from the putter, bypassing the queue
            let matched = if hdr.target != ANY_RANK {
                self.requestqueue
                    .matches_target(hdr.target, hdr.work_type)
                    .then_some(hdr.target)
            } else {
                self.requestqueue.matches_type(hdr.work_type)
            };
            if let Some(worker) = matched {
                self.hub.send_msg(
                    Msg::ResponsePut {
                        status: Status::Success,
                        payload_dest: worker,
                    },
                    putter,
                )?;
                self.hub.send_msg(
                    Msg::ResponseGet(GetResponse {
                        code: Status::Success,
                        length: hdr.length,
                        answer_rank: hdr.answer,
                        work_type: hdr.work_type,
                        payload_source: hdr.putter,
                        parallelism: 1,
                    }),
                    worker,
                )?;
                return Ok(());
            }
            // miss: have the putter stream the payload to us and finish
            // matching when it arrives
            self.hub.send_msg(
                Msg::ResponsePut {
                    status: Status::Success,
                    payload_dest: self.layout.rank,
                },
                putter,
            )?;
            self.awaiting_payload.insert(putter, unit);
            return Ok(());
        }

        if hdr.parallelism > 1 && hdr.inline.is_none() {
            // parallel payloads are always buffered at the server
            self.hub.send_msg(
                Msg::ResponsePut {
                    status: Status::Success,
                    payload_dest: self.layout.rank,
                },
                putter,
            )?;
            self.awaiting_payload.insert(putter, unit);
            return Ok(());
        }

        // inline payload available: match or enqueue right now
        self.hub.send_msg(
            Msg::ResponsePut {
                status: Status::Success,
                payload_dest: NULL_RANK,
            },
            putter,
        )?;
        self.complete_put_unit(unit)
    }

    /// Matches a unit whose payload is in hand, or enqueues it.
    fn complete_put_unit(&mut self, unit: WorkUnit) -> Result<(), TaskmillError> {
        if unit.parallelism > 1 {
            self.workqueue.add(unit);
            return self.try_release_parallel();
        }

        let matched = if unit.target != ANY_RANK {
            self.requestqueue
                .matches_target(unit.target, unit.work_type)
                .then_some(unit.target)
        } else {
            self.requestqueue.matches_type(unit.work_type)
        };
        match matched {
            Some(worker) => self.deliver_unit_single(worker, &unit),
            None => {
                self.workqueue.add(unit);
                Ok(())
            }
        }
    }

    /// Sends a single-process unit (payload in hand) to a worker.
    fn deliver_unit_single(&mut self, worker: Rank, unit: &WorkUnit) -> Result<(), TaskmillError> {
        self.hub.send_msg(
            Msg::ResponseGet(GetResponse {
                code: Status::Success,
                length: unit.payload_len,
                answer_rank: unit.answer,
                work_type: unit.work_type,
                payload_source: self.layout.rank,
                parallelism: 1,
            }),
            worker,
        )?;
        self.hub.send_msg(
            Msg::Work {
                payload: unit.payload.clone(),
            },
            worker,
        )?;
        Ok(())
    }

    /// Releases every parallel task whose team can now be seated.
    fn try_release_parallel(&mut self) -> Result<(), TaskmillError> {
        loop {
            let rq = &self.requestqueue;
            let Some(unit) = self
                .workqueue
                .pop_parallel(|t, par| rq.num_of_type(t) as i32 >= par)
            else {
                return Ok(());
            };
            let team = self
                .requestqueue
                .parallel_workers(unit.work_type, unit.parallelism)
                .expect("team seated by pop_parallel check");
            pf_debug!(
                "releasing parallel task x{} to {:?}",
                unit.parallelism,
                team
            );
            for &member in &team {
                self.hub.send_msg(
                    Msg::ResponseGet(GetResponse {
                        code: Status::Success,
                        length: unit.payload_len,
                        answer_rank: unit.answer,
                        work_type: unit.work_type,
                        payload_source: self.layout.rank,
                        parallelism: unit.parallelism,
                    }),
                    member,
                )?;
                self.hub.send_msg(
                    Msg::Work {
                        payload: unit.payload.clone(),
                    },
                    member,
                )?;
                self.hub.send_msg(Msg::Workunit { ranks: team.clone() }, member)?;
            }
        }
    }

    /// GET/IGET: pop matching work or park the requester (IGET answers
    /// `Nothing` instead of parking).
    fn handle_get(&mut self, rank: Rank, work_type: i32, iget: bool) -> Result<(), TaskmillError> {
        if work_type < 0 || work_type >= self.workqueue.ntypes() {
            self.hub.send_msg(
                Msg::ResponseGet(GetResponse {
                    code: Status::Error,
                    length: 0,
                    answer_rank: NULL_RANK,
                    work_type,
                    payload_source: NULL_RANK,
                    parallelism: 0,
                }),
                rank,
            )?;
            return Ok(());
        }
        if self.shutting_down {
            return self.send_shutdown_get(rank);
        }

        if let Some(unit) = self.workqueue.get(rank, work_type) {
            return self.deliver_unit_single(rank, &unit);
        }

        if iget {
            self.hub.send_msg(
                Msg::ResponseGet(GetResponse {
                    code: Status::Nothing,
                    length: 0,
                    answer_rank: NULL_RANK,
                    work_type,
                    payload_source: NULL_RANK,
                    parallelism: 0,
                }),
                rank,
            )?;
            return Ok(());
        }

        // park; the response completes on a matching PUT or steal
        self.requestqueue.add(rank, work_type, 1);
        self.try_release_parallel()
    }

    /// A follow-up payload from a putter completes its pending unit.
    fn handle_work_payload(&mut self, putter: Rank, payload: Vec<u8>) -> Result<(), TaskmillError> {
        match self.awaiting_payload.remove(&putter) {
            Some(mut unit) => {
                unit.payload = payload;
                self.complete_put_unit(unit)
            }
            None => {
                pf_warn!("unexpected work payload from {}", putter);
                Ok(())
            }
        }
    }

    /// After a steal delivered new units, retry every parked request.
    pub(crate) fn rematch_parked(&mut self) -> Result<(), TaskmillError> {
        for (rank, work_type) in self.requestqueue.parked_pairs() {
            if let Some(unit) = self.workqueue.get(rank, work_type) {
                self.requestqueue.remove(rank);
                self.deliver_unit_single(rank, &unit)?;
            }
        }
        self.try_release_parallel()
    }

    fn send_shutdown_get(&mut self, rank: Rank) -> Result<(), TaskmillError> {
        self.hub.send_msg(
            Msg::ResponseGet(GetResponse {
                code: Status::Shutdown,
                length: 0,
                answer_rank: NULL_RANK,
                work_type: 0,
                payload_source: NULL_RANK,
                parallelism: 0,
            }),
            rank,
        )
    }

    // ------------------------- data operations ------------------------ //

    /// Executes one data-store RPC and builds its response. Notifications
    /// generated by the operation are routed before returning.
    fn handle_data_op(&mut self, rank: Rank, msg: Msg) -> Result<Response, TaskmillError> {
        let mut notifs = NotifSet::new();
        let mut notif_ctx: Option<(i64, Option<Vec<u8>>, Option<(DataType, Vec<u8>)>)> = None;

        let resp = match msg {
            Msg::Create {
                id,
                dtype,
                type_extra,
                props,
            } => {
                let result = (|| {
                    let id = if id == crate::layout::NULL_ID {
                        self.store.unique()?
                    } else {
                        id
                    };
                    self.store.create(id, dtype, type_extra, props)?;
                    Ok(id)
                })();
                Response::Create(result)
            }
            Msg::Exists { id, sub } => Response::Exists(self.store.exists(id, sub.as_deref())),
            Msg::Store(hdr) => {
                let result = self.store.store(
                    hdr.id,
                    hdr.sub.as_deref(),
                    hdr.dtype,
                    &hdr.bytes,
                    hdr.refcount_decr,
                    &mut notifs,
                );
                if result.is_ok() {
                    let inserted = hdr.sub.is_some().then(|| (hdr.dtype, hdr.bytes.clone()));
                    notif_ctx = Some((hdr.id, hdr.sub.clone(), inserted));
                }
                Response::Store(result)
            }
            Msg::Retrieve(hdr) => {
                let result =
                    self.store
                        .retrieve(hdr.id, hdr.sub.as_deref(), hdr.refcounts, &mut notifs);
                if result.is_ok() {
                    notif_ctx = Some((hdr.id, hdr.sub.clone(), None));
                }
                Response::Retrieve(result)
            }
            Msg::Enumerate(hdr) => {
                let result = self.store.enumerate(
                    hdr.id,
                    hdr.count,
                    hdr.offset,
                    hdr.request_subscripts,
                    hdr.request_members,
                    hdr.decr,
                    &mut notifs,
                );
                if result.is_ok() {
                    notif_ctx = Some((hdr.id, None, None));
                }
                Response::Enumerate(result)
            }
            Msg::Subscribe { id, sub } => {
                Response::Subscribe(self.store.subscribe(id, sub.as_deref(), rank))
            }
            Msg::Permanent { id } => Response::Permanent(self.store.permanent(id)),
            Msg::RefcountIncr { id, change } => {
                let result = self
                    .store
                    .refcount_incr(id, change, RefCounts::NONE, &mut notifs)
                    .map(|_| ());
                if result.is_ok() {
                    notif_ctx = Some((id, None, None));
                }
                Response::RefcountIncr(result)
            }
            Msg::InsertAtomic { id, sub } => {
                Response::InsertAtomic(self.store.insert_atomic(id, &sub))
            }
            Msg::Unique => Response::Unique(self.store.unique()),
            Msg::TypeOf { id } => Response::TypeOf(self.store.typeof_(id)),
            Msg::ContainerTypeOf { id } => {
                Response::ContainerTypeOf(self.store.container_typeof(id))
            }
            Msg::ContainerReference {
                id,
                sub,
                ref_id,
                ref_type,
            } => {
                let result = self.store.container_reference(id, &sub, ref_id, ref_type);
                if let Ok(Some((vtype, bytes))) = &result {
                    // subscript already filled: perform the reference write
                    // now and release the consumed read refcount
                    notifs.references.push(ref_id);
                    let released = self.store.refcount_incr(
                        id,
                        RefCounts { read: -1, write: 0 },
                        RefCounts::NONE,
                        &mut notifs,
                    );
                    if let Err(e) = released {
                        pf_warn!("releasing reference refcount on <{}>: {:?}", id, e);
                    }
                    notif_ctx = Some((id, Some(sub.clone()), Some((*vtype, bytes.clone()))));
                } else if result.is_ok() {
                    notif_ctx = Some((id, Some(sub.clone()), None));
                }
                Response::ContainerReference(result)
            }
            Msg::ContainerSize { id, decr } => {
                let result = self.store.container_size(id, decr, &mut notifs);
                if result.is_ok() {
                    notif_ctx = Some((id, None, None));
                }
                Response::ContainerSize(result)
            }
            Msg::Lock { id } => Response::Lock(self.store.lock(id, rank)),
            Msg::Unlock { id } => Response::Unlock(self.store.unlock(id)),
            other => {
                pf_error!("unexpected message in data dispatch: {:?}", other.tag());
                return logged_err!("unhandled message tag {:?}", other.tag());
            }
        };

        if let Some((id, sub, inserted)) = notif_ctx {
            self.route_notifs(id, sub.as_deref(), notifs, inserted)?;
        } else {
            debug_assert!(notifs.is_empty());
        }
        Ok(resp)
    }

    // ------------------------- notifications -------------------------- //

    /// Routes a notification set: local listeners get a CONTROL work unit
    /// through the normal put path, local reference writes and refcount
    /// changes apply directly (cascading), and everything remote is queued
    /// for sync-protected delivery.
    pub(crate) fn route_notifs(
        &mut self,
        id: i64,
        sub: Option<&[u8]>,
        notifs: NotifSet,
        inserted: Option<(DataType, Vec<u8>)>,
    ) -> Result<(), TaskmillError> {
        // worklist: local reference writes / refcount changes cascade into
        // further notification sets
        let mut work: VecDeque<(i64, Option<Vec<u8>>, NotifSet, Option<(DataType, Vec<u8>)>)> =
            VecDeque::new();
        work.push_back((id, sub.map(<[u8]>::to_vec), notifs, inserted));

        while let Some((id, sub, mut notifs, inserted)) = work.pop_front() {
            // closure notifications: `close <id>`
            let local = peel_local(&mut notifs.close_notify, &self.layout);
            for target in local {
                self.notify_local(target, close_payload(id, None))?;
            }
            for target in notifs.close_notify.drain(..) {
                self.queue_remote_notify(target, close_payload(id, None));
            }

            // insertion notifications: `close <id> <sub>`
            if !notifs.insert_notify.is_empty() {
                let sub = sub.as_deref().expect("insert notify without subscript");
                let mut ranks = notifs.insert_notify;
                let local = peel_local(&mut ranks, &self.layout);
                for target in local {
                    self.notify_local(target, close_payload(id, Some(sub)))?;
                }
                for target in ranks {
                    self.queue_remote_notify(target, close_payload(id, Some(sub)));
                }
            }

            // reference writes of the inserted value
            if !notifs.references.is_empty() {
                let (vtype, bytes) = inserted
                    .clone()
                    .expect("reference write without inserted value");
                for ref_id in notifs.references {
                    let hdr = StoreHdr {
                        id: ref_id,
                        sub: None,
                        dtype: vtype,
                        refcount_decr: RefCounts::WRITE,
                        bytes: bytes.clone(),
                    };
                    let home = self.layout.server_of_id(ref_id);
                    if home == self.layout.rank {
                        let mut sub_notifs = NotifSet::new();
                        match self.store.store(
                            ref_id,
                            None,
                            hdr.dtype,
                            &hdr.bytes,
                            hdr.refcount_decr,
                            &mut sub_notifs,
                        ) {
                            Ok(()) => work.push_back((ref_id, None, sub_notifs, None)),
                            Err(e) => {
                                pf_warn!("reference write to <{}> failed: {:?}", ref_id, e)
                            }
                        }
                    } else {
                        self.remote_ops.push_back(RemoteOp::Store { server: home, hdr });
                    }
                }
            }

            // referand refcount routing
            for (rid, change) in notifs.rc_dispatch {
                let home = self.layout.server_of_id(rid);
                if home == self.layout.rank {
                    let mut sub_notifs = NotifSet::new();
                    match self
                        .store
                        .refcount_incr(rid, change, RefCounts::NONE, &mut sub_notifs)
                    {
                        Ok(_) => work.push_back((rid, None, sub_notifs, None)),
                        Err(e) => pf_warn!("refcount routing to <{}> failed: {:?}", rid, e),
                    }
                } else {
                    self.remote_ops.push_back(RemoteOp::Refcount {
                        server: home,
                        id: rid,
                        change,
                    });
                }
            }
        }
        Ok(())
    }

    /// Enqueues a CONTROL work unit for a locally homed listener through
    /// the normal put-matching path.
    fn notify_local(&mut self, target: Rank, payload: Vec<u8>) -> Result<(), TaskmillError> {
        let unit = WorkUnit {
            id: 0,
            timestamp: 0,
            work_type: CONTROL_TYPE,
            putter: self.layout.rank,
            priority: CONTROL_PRIORITY,
            answer: NULL_RANK,
            target,
            parallelism: 1,
            payload_len: payload.len() as i32,
            payload,
        };
        self.complete_put_unit(unit)
    }

    fn queue_remote_notify(&mut self, target: Rank, payload: Vec<u8>) {
        let server = self.layout.server_of_rank(target);
        let hdr = PutHdr {
            work_type: CONTROL_TYPE,
            priority: CONTROL_PRIORITY,
            putter: self.layout.rank,
            answer: NULL_RANK,
            target,
            length: payload.len() as i32,
            parallelism: 1,
            inline: Some(payload),
        };
        self.remote_ops.push_back(RemoteOp::Put { server, hdr });
    }

    /// Performs queued cross-server deliveries, one sync acquisition each.
    pub(crate) async fn flush_remote_ops(&mut self) -> Result<(), TaskmillError> {
        while let Some(op) = self.remote_ops.pop_front() {
            if self.shutting_down {
                self.remote_ops.clear();
                return Ok(());
            }
            let server = match &op {
                RemoteOp::Put { server, .. }
                | RemoteOp::Store { server, .. }
                | RemoteOp::Refcount { server, .. } => *server,
            };
            match self.sync_acquire(server, SyncMode::Request).await? {
                crate::server::SyncOutcome::Shutdown => {
                    self.remote_ops.clear();
                    return Ok(());
                }
                crate::server::SyncOutcome::Accepted => {}
            }
            match op {
                RemoteOp::Put { hdr, .. } => {
                    self.hub.send_msg(Msg::Put(hdr), server)?;
                    let (_, msg) = self
                        .inbox
                        .recv_match(&mut self.hub, |r, m| {
                            r == server && m.tag() == Tag::ResponsePut
                        })
                        .await?;
                    if let Msg::ResponsePut { status, .. } = msg {
                        if status != Status::Success {
                            pf_warn!("remote notification put rejected: {:?}", status);
                        }
                    }
                }
                RemoteOp::Store { hdr, .. } => {
                    self.hub.send_msg(Msg::Store(hdr), server)?;
                    let (_, msg) = self
                        .inbox
                        .recv_match(&mut self.hub, |r, m| {
                            r == server && m.tag() == Tag::Response
                        })
                        .await?;
                    if let Msg::Response(Response::Store(Err(e))) = msg {
                        pf_warn!("remote reference write failed: {:?}", e);
                    }
                }
                RemoteOp::Refcount { id, change, .. } => {
                    self.hub.send_msg(Msg::RefcountIncr { id, change }, server)?;
                    let (_, msg) = self
                        .inbox
                        .recv_match(&mut self.hub, |r, m| {
                            r == server && m.tag() == Tag::Response
                        })
                        .await?;
                    if let Msg::Response(Response::RefcountIncr(Err(e))) = msg {
                        pf_warn!("remote refcount change on <{}> failed: {:?}", id, e);
                    }
                }
            }
        }
        Ok(())
    }

    // --------------------------- sync serving ------------------------- //

    /// Serves one accepted sync: a Request mode means exactly one follow-up
    /// RPC from the peer (notification traffic); Steal runs the donor half.
    pub(crate) async fn serve_accepted_sync(
        &mut self,
        peer: Rank,
        mode: SyncMode,
    ) -> Result<(), TaskmillError> {
        match mode {
            SyncMode::Request => {
                let (_, msg) = self
                    .inbox
                    .recv_match(&mut self.hub, |r, m| {
                        r == peer
                            && matches!(m.tag(), Tag::Put | Tag::Store | Tag::RefcountIncr)
                    })
                    .await?;
                match msg {
                    Msg::Put(hdr) => self.handle_put(peer, hdr)?,
                    other => {
                        let resp = self.handle_data_op(peer, other)?;
                        self.hub.send_msg(Msg::Response(resp), peer)?;
                    }
                }
                Ok(())
            }
            SyncMode::Steal {
                work_type_counts,
                max_memory,
            } => {
                self.handle_steal(peer, &work_type_counts, max_memory)?;
                Ok(())
            }
        }
    }

    /// Waits for a message matching `pred` while continuing to accept and
    /// serve peer sync requests, so a peer blocked on acquiring us cannot
    /// deadlock the wait. Only usable outside our own sync acquisitions.
    pub(crate) async fn recv_match_serving(
        &mut self,
        pred: impl Fn(Rank, &Msg) -> bool,
    ) -> Result<(Rank, Msg), TaskmillError> {
        debug_assert!(!self.sync.in_progress);
        loop {
            if let Some(pair) = self.inbox.probe_take(&mut self.hub, |r, m| pred(r, m)) {
                return Ok(pair);
            }
            if let Some((peer, msg)) = self
                .inbox
                .probe_take(&mut self.hub, |_, m| m.tag() == Tag::SyncRequest)
            {
                let Msg::SyncRequest(mode) = msg else {
                    unreachable!()
                };
                self.hub.send_msg(Msg::SyncResponse { accept: true }, peer)?;
                self.serve_accepted_sync(peer, mode).await?;
                continue;
            }
            let (rank, msg) = self.hub.recv_msg().await?;
            self.inbox.park(rank, msg);
        }
    }

    // ------------------------- idle detection ------------------------- //

    /// Master-only: when locally idle, poll every other server; if the
    /// whole cluster is idle, broadcast shutdown.
    pub(crate) async fn master_idle_check(&mut self) -> Result<(), TaskmillError> {
        if !self.is_idle() || !self.remote_ops.is_empty() {
            return Ok(());
        }
        self.idle_attempt += 1;
        let attempt = self.idle_attempt;

        let others: Vec<Rank> = (self.layout.workers..self.layout.size)
            .filter(|&s| s != self.layout.rank)
            .collect();
        let mut all_idle = true;
        for &server in &others {
            self.hub.send_msg(Msg::CheckIdle { attempt }, server)?;
            let (_, msg) = self
                .recv_match_serving(|r, m| {
                    r == server
                        && matches!(m, Msg::Response(Response::CheckIdle { .. }))
                })
                .await?;
            if let Msg::Response(Response::CheckIdle { idle }) = msg {
                if !idle {
                    all_idle = false;
                    break;
                }
            }
        }

        if all_idle && self.is_idle() && self.remote_ops.is_empty() {
            pf_info!("cluster idle at attempt {}, shutting down", attempt);
            for &server in &others {
                self.hub.send_msg(Msg::ShutdownServer, server)?;
            }
            self.do_shutdown()?;
        }
        Ok(())
    }

    /// Stops serving: every parked worker's GET completes with Shutdown.
    pub(crate) fn do_shutdown(&mut self) -> Result<(), TaskmillError> {
        self.shutting_down = true;
        for rank in self.requestqueue.drain() {
            self.send_shutdown_get(rank)?;
        }
        Ok(())
    }
}
