//! Worker-side stubs: task submission/retrieval and data operations,
//! each a small RPC conversation with the owning server.

use std::net::SocketAddr;

use crate::codec::value::TypeExtra;
use crate::codec::DataType;
use crate::layout::{Layout, Rank, ANY_RANK, NULL_ID, NULL_RANK};
use crate::msg::{
    CreateProps, DataError, EnumerateHdr, EnumerateResult, Msg, PutHdr, RefCounts, Response,
    RetrieveHdr, RetrieveRc, Status, StoreHdr, Tag, PUT_INLINE_DATA_MAX,
};
use crate::transport::{CommHub, Inbox};
use crate::utils::TaskmillError;

/// Outcome of a data operation: transport errors surface through the outer
/// `Result`, data-layer codes through this inner one.
pub type DataResult<T> = Result<T, DataError>;

/// A received work unit.
#[derive(Debug, Clone, PartialEq)]
pub struct GotWork {
    pub payload: Vec<u8>,
    pub answer: Rank,
    pub work_type: i32,
    /// Full team rank list for parallel tasks.
    pub team: Option<Vec<Rank>>,
}

/// Outcome of a GET/IGET.
#[derive(Debug, Clone, PartialEq)]
pub enum GetOutcome {
    Work(GotWork),
    /// IGET found nothing queued.
    Nothing,
    /// The cluster is shutting down; stop issuing requests.
    Shutdown,
}

/// Worker-side endpoint of the runtime.
pub struct WorkerStub {
    layout: Layout,
    hub: CommHub,
    inbox: Inbox,
    my_server: Rank,
    got_shutdown: bool,
}

impl WorkerStub {
    /// Connects this worker rank into the cluster mesh.
    pub async fn new_and_setup(
        layout: Layout,
        addrs: &[SocketAddr],
    ) -> Result<Self, TaskmillError> {
        if layout.is_server(layout.rank) {
            return logged_err!("rank {} is not a worker rank", layout.rank);
        }
        let mut hub = CommHub::new_and_setup(layout.rank, addrs[layout.rank as usize]).await?;
        hub.wireup(addrs).await?;
        let my_server = layout.server_of_rank(layout.rank);
        Ok(WorkerStub {
            layout,
            hub,
            inbox: Inbox::new(),
            my_server,
            got_shutdown: false,
        })
    }

    pub fn rank(&self) -> Rank {
        self.layout.rank
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Whether a shutdown indication has been received.
    pub fn got_shutdown(&self) -> bool {
        self.got_shutdown
    }

    async fn recv_response(&mut self, server: Rank) -> Result<Response, TaskmillError> {
        let (_, msg) = self
            .inbox
            .recv_match(&mut self.hub, |r, m| {
                r == server && m.tag() == Tag::Response
            })
            .await?;
        match msg {
            Msg::Response(resp) => Ok(resp),
            _ => unreachable!(),
        }
    }

    // --------------------------- task ops ----------------------------- //

    /// Submits a task. Small payloads ride inline; larger ones are
    /// streamed to whichever rank the server names (a matched worker on
    /// the redirect path, or the server itself for queueing).
    pub async fn put(
        &mut self,
        payload: &[u8],
        target: Rank,
        answer: Rank,
        work_type: i32,
        priority: i32,
        parallelism: i32,
    ) -> Result<Status, TaskmillError> {
        let to_server = if target == ANY_RANK {
            self.my_server
        } else {
            self.layout.server_of_rank(target)
        };

        let inline = (payload.len() <= PUT_INLINE_DATA_MAX).then(|| payload.to_vec());
        let has_inline = inline.is_some();
        self.hub.send_msg(
            Msg::Put(PutHdr {
                work_type,
                priority,
                putter: self.layout.rank,
                answer,
                target,
                length: payload.len() as i32,
                parallelism,
                inline,
            }),
            to_server,
        )?;

        let (_, msg) = self
            .inbox
            .recv_match(&mut self.hub, |r, m| {
                r == to_server && m.tag() == Tag::ResponsePut
            })
            .await?;
        let Msg::ResponsePut {
            status,
            payload_dest,
        } = msg
        else {
            unreachable!()
        };
        if status != Status::Success {
            return Ok(status);
        }

        if !has_inline {
            // still need to stream the payload
            if payload_dest == NULL_RANK {
                return logged_err!("put accepted but no payload destination");
            }
            pf_debug!("put payload -> {}", payload_dest);
            self.hub.send_msg(
                Msg::Work {
                    payload: payload.to_vec(),
                },
                payload_dest,
            )?;
        }
        Ok(Status::Success)
    }

    /// Requests one task of the given type, blocking until matched or the
    /// cluster shuts down.
    pub async fn get(&mut self, work_type: i32) -> Result<GetOutcome, TaskmillError> {
        self.hub.send_msg(Msg::Get { work_type }, self.my_server)?;
        self.finish_get().await
    }

    /// Non-blocking variant: `Nothing` when no matching task is queued.
    pub async fn iget(&mut self, work_type: i32) -> Result<GetOutcome, TaskmillError> {
        self.hub.send_msg(Msg::Iget { work_type }, self.my_server)?;
        self.finish_get().await
    }

    async fn finish_get(&mut self) -> Result<GetOutcome, TaskmillError> {
        let my_server = self.my_server;
        let (_, msg) = self
            .inbox
            .recv_match(&mut self.hub, |r, m| {
                r == my_server && m.tag() == Tag::ResponseGet
            })
            .await?;
        let Msg::ResponseGet(g) = msg else {
            unreachable!()
        };
        match g.code {
            Status::Shutdown => {
                pf_debug!("get: shutdown");
                self.got_shutdown = true;
                return Ok(GetOutcome::Shutdown);
            }
            Status::Nothing => return Ok(GetOutcome::Nothing),
            Status::Success => {}
            other => return logged_err!("get failed: {:?}", other),
        }

        // payload arrives from the named source (server or putter)
        pf_debug!("get: payload source: {}", g.payload_source);
        let (_, msg) = self
            .inbox
            .recv_match(&mut self.hub, |r, m| {
                r == g.payload_source && m.tag() == Tag::Work
            })
            .await?;
        let Msg::Work { payload } = msg else {
            unreachable!()
        };
        debug_assert_eq!(payload.len() as i32, g.length);

        // parallel tasks are followed by the team rank list
        let team = if g.parallelism > 1 {
            let (_, msg) = self
                .inbox
                .recv_match(&mut self.hub, |r, m| {
                    r == my_server && m.tag() == Tag::Workunit
                })
                .await?;
            let Msg::Workunit { ranks } = msg else {
                unreachable!()
            };
            Some(ranks)
        } else {
            None
        };

        Ok(GetOutcome::Work(GotWork {
            payload,
            answer: g.answer_rank,
            work_type: g.work_type,
            team,
        }))
    }

    // --------------------------- data ops ----------------------------- //

    /// Creates a datum. A null `id_hint` lets the home server allocate one
    /// from its sequence.
    pub async fn create(
        &mut self,
        id_hint: i64,
        dtype: DataType,
        type_extra: TypeExtra,
        props: CreateProps,
    ) -> Result<DataResult<i64>, TaskmillError> {
        let server = if id_hint == NULL_ID {
            self.my_server
        } else {
            self.layout.server_of_id(id_hint)
        };
        self.hub.send_msg(
            Msg::Create {
                id: id_hint,
                dtype,
                type_extra,
                props,
            },
            server,
        )?;
        match self.recv_response(server).await? {
            Response::Create(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    pub async fn exists(
        &mut self,
        id: i64,
        sub: Option<&[u8]>,
    ) -> Result<DataResult<bool>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(
            Msg::Exists {
                id,
                sub: sub.map(<[u8]>::to_vec),
            },
            server,
        )?;
        match self.recv_response(server).await? {
            Response::Exists(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    pub async fn store(
        &mut self,
        id: i64,
        sub: Option<&[u8]>,
        dtype: DataType,
        bytes: Vec<u8>,
        refcount_decr: RefCounts,
    ) -> Result<DataResult<()>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(
            Msg::Store(StoreHdr {
                id,
                sub: sub.map(<[u8]>::to_vec),
                dtype,
                refcount_decr,
                bytes,
            }),
            server,
        )?;
        match self.recv_response(server).await? {
            Response::Store(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    pub async fn retrieve(
        &mut self,
        id: i64,
        sub: Option<&[u8]>,
        refcounts: RetrieveRc,
    ) -> Result<DataResult<(DataType, Vec<u8>)>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(
            Msg::Retrieve(RetrieveHdr {
                id,
                refcounts,
                sub: sub.map(<[u8]>::to_vec),
            }),
            server,
        )?;
        match self.recv_response(server).await? {
            Response::Retrieve(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    pub async fn enumerate(
        &mut self,
        id: i64,
        count: i64,
        offset: i64,
        request_subscripts: bool,
        request_members: bool,
        decr: RefCounts,
    ) -> Result<DataResult<EnumerateResult>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(
            Msg::Enumerate(EnumerateHdr {
                id,
                request_subscripts,
                request_members,
                count,
                offset,
                decr,
            }),
            server,
        )?;
        match self.recv_response(server).await? {
            Response::Enumerate(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    /// Subscribes to datum closure (no subscript) or subscript insertion.
    /// `Ok(false)` means there is nothing to wait for.
    pub async fn subscribe(
        &mut self,
        id: i64,
        sub: Option<&[u8]>,
    ) -> Result<DataResult<bool>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(
            Msg::Subscribe {
                id,
                sub: sub.map(<[u8]>::to_vec),
            },
            server,
        )?;
        match self.recv_response(server).await? {
            Response::Subscribe(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    pub async fn refcount_incr(
        &mut self,
        id: i64,
        change: RefCounts,
    ) -> Result<DataResult<()>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(Msg::RefcountIncr { id, change }, server)?;
        match self.recv_response(server).await? {
            Response::RefcountIncr(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    /// Reserves `container[sub]`; returns `(created, value_present)`.
    pub async fn insert_atomic(
        &mut self,
        id: i64,
        sub: &[u8],
    ) -> Result<DataResult<(bool, bool)>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(
            Msg::InsertAtomic {
                id,
                sub: sub.to_vec(),
            },
            server,
        )?;
        match self.recv_response(server).await? {
            Response::InsertAtomic(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    /// Asks my home server for a fresh datum id.
    pub async fn unique(&mut self) -> Result<DataResult<i64>, TaskmillError> {
        self.hub.send_msg(Msg::Unique, self.my_server)?;
        match self.recv_response(self.my_server).await? {
            Response::Unique(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    pub async fn typeof_(&mut self, id: i64) -> Result<DataResult<DataType>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(Msg::TypeOf { id }, server)?;
        match self.recv_response(server).await? {
            Response::TypeOf(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    pub async fn container_typeof(
        &mut self,
        id: i64,
    ) -> Result<DataResult<(DataType, DataType)>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(Msg::ContainerTypeOf { id }, server)?;
        match self.recv_response(server).await? {
            Response::ContainerTypeOf(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    /// Binds a promise to write `container[sub]` into `ref_id` once filled.
    pub async fn container_reference(
        &mut self,
        id: i64,
        sub: &[u8],
        ref_id: i64,
        ref_type: DataType,
    ) -> Result<DataResult<Option<(DataType, Vec<u8>)>>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(
            Msg::ContainerReference {
                id,
                sub: sub.to_vec(),
                ref_id,
                ref_type,
            },
            server,
        )?;
        match self.recv_response(server).await? {
            Response::ContainerReference(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    pub async fn container_size(
        &mut self,
        id: i64,
        decr: RefCounts,
    ) -> Result<DataResult<i64>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(Msg::ContainerSize { id, decr }, server)?;
        match self.recv_response(server).await? {
            Response::ContainerSize(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    pub async fn permanent(&mut self, id: i64) -> Result<DataResult<()>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(Msg::Permanent { id }, server)?;
        match self.recv_response(server).await? {
            Response::Permanent(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    /// Advisory lock attempt; reports whether acquired.
    pub async fn lock(&mut self, id: i64) -> Result<DataResult<bool>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(Msg::Lock { id }, server)?;
        match self.recv_response(server).await? {
            Response::Lock(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    pub async fn unlock(&mut self, id: i64) -> Result<DataResult<()>, TaskmillError> {
        let server = self.layout.server_of_id(id);
        self.hub.send_msg(Msg::Unlock { id }, server)?;
        match self.recv_response(server).await? {
            Response::Unlock(r) => Ok(r),
            other => logged_err!("mismatched response {:?}", other),
        }
    }

    // ---------------------------- control ----------------------------- //

    /// Broadcasts a non-recoverable failure; the master server turns it
    /// into the cluster exit code at finalize.
    pub fn fail(&mut self, code: i32) -> Result<(), TaskmillError> {
        self.hub
            .send_msg(Msg::Fail { code }, self.layout.master_server())
    }

    /// Announces that this worker will issue no further task requests.
    pub fn finalize(&mut self) -> Result<(), TaskmillError> {
        self.hub.send_msg(Msg::ShutdownWorker, self.my_server)
    }
}
