//! Wire messaging conventions: tags, message bodies, status codes.
//!
//! Every message carries exactly one tag's body. RPCs incoming to a server
//! are answered with one of the outgoing response tags; the `Work` tag
//! carries opaque task payloads between arbitrary rank pairs (server to
//! worker, or worker to worker on the redirect path).

use serde::{Deserialize, Serialize};

use crate::codec::value::TypeExtra;
use crate::codec::DataType;
use crate::layout::Rank;

/// Payloads at or below this size ride inline in the PUT header; larger
/// ones are delivered in a follow-up `Work` message.
pub const PUT_INLINE_DATA_MAX: usize = 1024;

/// Common status codes crossing the wire. `Error` is the only truly fatal
/// condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    /// Rejected: e.g., out of memory, or double-assignment.
    Rejected,
    /// Normal shutdown.
    Shutdown,
    /// No error but nothing happened.
    Nothing,
    /// Caller should retry.
    Retry,
    /// Finished; don't call again.
    Done,
    Error,
}

/// Error kinds of the data layer, sent back to callers inside responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataError {
    Oom,
    /// Attempt to declare the same id twice.
    DoubleDeclare,
    /// Attempt to set the same datum or subscript twice.
    DoubleWrite,
    /// Attempt to read an unset value.
    Unset,
    NotFound,
    SubscriptNotFound,
    /// Parse error in number scanning (struct field subscripts).
    NumberFormat,
    Invalid,
    /// Attempt to read/write the null id.
    Null,
    /// Attempt to operate on the wrong data type.
    Type,
    /// A refcount would fall below zero.
    RefcountNegative,
    /// Exceeded an implementation limit (e.g. id space exhausted).
    Limit,
    BufferTooSmall,
    Done,
    Unknown,
}

/// Message tags. Grouped into tags incoming to servers, tags outgoing from
/// servers, and tags that may travel between any pair of ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    // task operations incoming to server
    Put,
    Get,
    Iget,

    // data operations incoming to server
    Create,
    Exists,
    Store,
    Retrieve,
    Enumerate,
    Subscribe,
    Permanent,
    RefcountIncr,
    InsertAtomic,
    Unique,
    TypeOf,
    ContainerTypeOf,
    ContainerReference,
    ContainerSize,
    Lock,
    Unlock,

    // server-to-server and control
    SyncRequest,
    StealBatch,
    CheckIdle,
    ShutdownWorker,
    ShutdownServer,

    // outgoing from server
    Response,
    ResponsePut,
    ResponseGet,
    SyncResponse,
    Workunit,
    Fail,

    // payload channel between any two ranks
    Work,
}

/// PUT request header. When the payload fits the inline threshold it rides
/// along; otherwise the putter follows up with a `Work` message to whichever
/// rank the `ResponsePut` names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutHdr {
    pub work_type: i32,
    pub priority: i32,
    pub putter: Rank,
    pub answer: Rank,
    pub target: Rank,
    pub length: i32,
    pub parallelism: i32,
    pub inline: Option<Vec<u8>>,
}

/// GET/IGET response header. `payload_source` names the rank that will send
/// the `Work` payload (the server itself, or the putter on a redirect).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    pub code: Status,
    pub length: i32,
    pub answer_rank: Rank,
    pub work_type: i32,
    pub payload_source: Rank,
    pub parallelism: i32,
}

/// Refcount pair used in store/retrieve/refcount messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RefCounts {
    pub read: i32,
    pub write: i32,
}

impl RefCounts {
    pub const NONE: RefCounts = RefCounts { read: 0, write: 0 };
    pub const READ: RefCounts = RefCounts { read: 1, write: 0 };
    pub const WRITE: RefCounts = RefCounts { read: 0, write: 1 };

    pub fn is_none(&self) -> bool {
        self.read == 0 && self.write == 0
    }

    pub fn negate(&self) -> RefCounts {
        RefCounts {
            read: -self.read,
            write: -self.write,
        }
    }
}

/// Refcount plan applied by a retrieve: decrement self, increment referands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetrieveRc {
    pub decr_self: RefCounts,
    pub incr_referand: RefCounts,
}

/// Datum creation properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProps {
    pub read_refcount: i32,
    pub write_refcount: i32,
    pub permanent: bool,
    /// Opaque debug tag.
    pub symbol: u32,
}

impl Default for CreateProps {
    fn default() -> Self {
        CreateProps {
            read_refcount: 1,
            write_refcount: 1,
            permanent: false,
            symbol: 0,
        }
    }
}

/// Store request header: id, optional subscript, value type and bytes, and
/// the refcount decrement applied atomically with the write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHdr {
    pub id: i64,
    pub sub: Option<Vec<u8>>,
    pub dtype: DataType,
    pub refcount_decr: RefCounts,
    pub bytes: Vec<u8>,
}

/// Retrieve request header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveHdr {
    pub id: i64,
    pub refcounts: RetrieveRc,
    pub sub: Option<Vec<u8>>,
}

/// Enumerate request: a contiguous slice of a container or multiset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumerateHdr {
    pub id: i64,
    pub request_subscripts: bool,
    pub request_members: bool,
    /// Maximum number of elements; -1 for unlimited.
    pub count: i64,
    pub offset: i64,
    pub decr: RefCounts,
}

/// Enumerate response body: packed `varint len, bytes` per included part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumerateResult {
    pub records: i64,
    pub key_type: DataType,
    pub val_type: DataType,
    pub data: Vec<u8>,
}

/// Mode of a server-to-server sync acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Acquire the peer to issue one follow-up RPC (notification traffic).
    Request,
    /// Acquire the peer to steal work from it.
    Steal {
        /// The stealer's pending-work count per work type.
        work_type_counts: Vec<i64>,
        /// Cumulative payload byte budget for the transfer.
        max_memory: i64,
    },
}

/// A task descriptor plus its opaque payload. Payloads of queued tasks that
/// exceeded the inline threshold are buffered here too once they arrive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Unique id wrt the server currently holding this unit.
    pub id: u64,
    /// Logical enqueue time on that server; oldest-first tie-break key.
    pub timestamp: u64,
    pub work_type: i32,
    pub putter: Rank,
    pub priority: i32,
    pub answer: Rank,
    pub target: Rank,
    pub parallelism: i32,
    /// Payload, or empty when the payload is still in flight from the
    /// putter (`payload_len` stays authoritative).
    pub payload: Vec<u8>,
    pub payload_len: i32,
}

impl WorkUnit {
    /// Approximate bytes this unit contributes to a steal memory budget.
    pub fn payload_bytes(&self) -> i64 {
        self.payload_len as i64
    }
}

/// Response bodies riding under the generic `Response` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Create(Result<i64, DataError>),
    Exists(Result<bool, DataError>),
    Store(Result<(), DataError>),
    Retrieve(Result<(DataType, Vec<u8>), DataError>),
    Enumerate(Result<EnumerateResult, DataError>),
    Subscribe(Result<bool, DataError>),
    Permanent(Result<(), DataError>),
    RefcountIncr(Result<(), DataError>),
    InsertAtomic(Result<(bool, bool), DataError>),
    Unique(Result<i64, DataError>),
    TypeOf(Result<DataType, DataError>),
    ContainerTypeOf(Result<(DataType, DataType), DataError>),
    /// Immediate value when the subscript was already filled, else None.
    ContainerReference(Result<Option<(DataType, Vec<u8>)>, DataError>),
    ContainerSize(Result<i64, DataError>),
    Lock(Result<bool, DataError>),
    Unlock(Result<(), DataError>),
    CheckIdle { idle: bool },
}

/// The one message type crossing the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Msg {
    // task operations
    Put(PutHdr),
    Get { work_type: i32 },
    Iget { work_type: i32 },

    // data operations
    Create {
        id: i64,
        dtype: DataType,
        type_extra: TypeExtra,
        props: CreateProps,
    },
    Exists {
        id: i64,
        sub: Option<Vec<u8>>,
    },
    Store(StoreHdr),
    Retrieve(RetrieveHdr),
    Enumerate(EnumerateHdr),
    Subscribe {
        id: i64,
        sub: Option<Vec<u8>>,
    },
    Permanent {
        id: i64,
    },
    RefcountIncr {
        id: i64,
        change: RefCounts,
    },
    InsertAtomic {
        id: i64,
        sub: Vec<u8>,
    },
    Unique,
    TypeOf {
        id: i64,
    },
    ContainerTypeOf {
        id: i64,
    },
    ContainerReference {
        id: i64,
        sub: Vec<u8>,
        ref_id: i64,
        ref_type: DataType,
    },
    ContainerSize {
        id: i64,
        decr: RefCounts,
    },
    Lock {
        id: i64,
    },
    Unlock {
        id: i64,
    },

    // server-to-server and control
    SyncRequest(SyncMode),
    StealBatch {
        units: Vec<WorkUnit>,
        last: bool,
    },
    CheckIdle {
        attempt: i64,
    },
    ShutdownWorker,
    ShutdownServer,

    // outgoing from server
    Response(Response),
    ResponsePut {
        status: Status,
        /// Where the putter must stream the payload: a worker rank on the
        /// redirect path, the server itself for buffered queueing, or
        /// `NULL_RANK` when the inline payload was consumed.
        payload_dest: Rank,
    },
    ResponseGet(GetResponse),
    SyncResponse {
        accept: bool,
    },
    Workunit {
        ranks: Vec<Rank>,
    },
    Fail {
        code: i32,
    },

    // payload channel
    Work {
        payload: Vec<u8>,
    },
}

impl Msg {
    /// The tag of this message.
    pub fn tag(&self) -> Tag {
        match self {
            Msg::Put(_) => Tag::Put,
            Msg::Get { .. } => Tag::Get,
            Msg::Iget { .. } => Tag::Iget,
            Msg::Create { .. } => Tag::Create,
            Msg::Exists { .. } => Tag::Exists,
            Msg::Store(_) => Tag::Store,
            Msg::Retrieve(_) => Tag::Retrieve,
            Msg::Enumerate(_) => Tag::Enumerate,
            Msg::Subscribe { .. } => Tag::Subscribe,
            Msg::Permanent { .. } => Tag::Permanent,
            Msg::RefcountIncr { .. } => Tag::RefcountIncr,
            Msg::InsertAtomic { .. } => Tag::InsertAtomic,
            Msg::Unique => Tag::Unique,
            Msg::TypeOf { .. } => Tag::TypeOf,
            Msg::ContainerTypeOf { .. } => Tag::ContainerTypeOf,
            Msg::ContainerReference { .. } => Tag::ContainerReference,
            Msg::ContainerSize { .. } => Tag::ContainerSize,
            Msg::Lock { .. } => Tag::Lock,
            Msg::Unlock { .. } => Tag::Unlock,
            Msg::SyncRequest(_) => Tag::SyncRequest,
            Msg::StealBatch { .. } => Tag::StealBatch,
            Msg::CheckIdle { .. } => Tag::CheckIdle,
            Msg::ShutdownWorker => Tag::ShutdownWorker,
            Msg::ShutdownServer => Tag::ShutdownServer,
            Msg::Response(_) => Tag::Response,
            Msg::ResponsePut { .. } => Tag::ResponsePut,
            Msg::ResponseGet(_) => Tag::ResponseGet,
            Msg::SyncResponse { .. } => Tag::SyncResponse,
            Msg::Workunit { .. } => Tag::Workunit,
            Msg::Fail { .. } => Tag::Fail,
            Msg::Work { .. } => Tag::Work,
        }
    }
}

#[cfg(test)]
mod msg_tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let msgs = vec![
            Msg::Put(PutHdr {
                work_type: 1,
                priority: 0,
                putter: 3,
                answer: -1,
                target: crate::layout::ANY_RANK,
                length: 5,
                parallelism: 1,
                inline: Some(b"hello".to_vec()),
            }),
            Msg::Retrieve(RetrieveHdr {
                id: 101,
                refcounts: RetrieveRc::default(),
                sub: Some(b"k1".to_vec()),
            }),
            Msg::SyncRequest(SyncMode::Steal {
                work_type_counts: vec![0, 4, 2],
                max_memory: 1 << 20,
            }),
            Msg::Response(Response::Retrieve(Err(DataError::NotFound))),
        ];
        for msg in msgs {
            let bytes = rmp_serde::encode::to_vec(&msg).unwrap();
            let back: Msg = rmp_serde::decode::from_slice(&bytes).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn tags_partition() {
        assert_eq!(Msg::Unique.tag(), Tag::Unique);
        assert_eq!(Msg::ShutdownServer.tag(), Tag::ShutdownServer);
        assert_eq!(
            Msg::Work { payload: vec![] }.tag(),
            Tag::Work
        );
    }
}
