//! Fingerprint index over checkpointed results.
//!
//! Entries live in permanent BLOB->BLOB containers sharded across servers
//! at negative datum ids (which `data_unique` never allocates), keyed by
//! the raw key bytes. An entry value is either the checkpointed bytes
//! themselves or a pointer into the log file, distinguished by a trailing
//! flag byte.

use async_trait::async_trait;

use crate::codec::value::TypeExtra;
use crate::codec::DataType;
use crate::data::{DataStore, NotifSet};
use crate::msg::{CreateProps, DataError, RefCounts, RetrieveRc};
use crate::utils::TaskmillError;
use crate::worker::{DataResult, WorkerStub};

/// One checkpoint index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEntry {
    /// The value bytes themselves.
    Inline(Vec<u8>),
    /// Location of the value in a checkpoint file; `file == None` means
    /// the file currently being written.
    InFile {
        file: Option<String>,
        val_offset: u64,
        val_len: u32,
    },
}

impl IndexEntry {
    /// Serialized form stored in the index container: payload plus a
    /// trailing in-file flag byte.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            IndexEntry::Inline(data) => {
                let mut out = data.clone();
                out.push(0);
                out
            }
            IndexEntry::InFile {
                file,
                val_offset,
                val_len,
            } => {
                let name = file.as_deref().unwrap_or("");
                let mut out = Vec::with_capacity(8 + name.len() + 8 + 4 + 1);
                out.extend_from_slice(&(name.len() as u64).to_le_bytes());
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(&val_offset.to_le_bytes());
                out.extend_from_slice(&val_len.to_le_bytes());
                out.push(1);
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<IndexEntry, DataError> {
        let (&flag, payload) = bytes.split_last().ok_or(DataError::Invalid)?;
        if flag == 0 {
            return Ok(IndexEntry::Inline(payload.to_vec()));
        }
        if payload.len() < 8 {
            return Err(DataError::Invalid);
        }
        let name_len = u64::from_le_bytes(payload[0..8].try_into().unwrap()) as usize;
        let rest = &payload[8..];
        if rest.len() != name_len + 12 {
            return Err(DataError::Invalid);
        }
        let file = if name_len == 0 {
            None
        } else {
            Some(
                String::from_utf8(rest[..name_len].to_vec())
                    .map_err(|_| DataError::Invalid)?,
            )
        };
        let val_offset = u64::from_le_bytes(rest[name_len..name_len + 8].try_into().unwrap());
        let val_len = u32::from_le_bytes(rest[name_len + 8..].try_into().unwrap());
        Ok(IndexEntry::InFile {
            file,
            val_offset,
            val_len,
        })
    }
}

/// Container id hosting the index shard of the given server. Negative ids
/// in `[-servers, -1]` route to the right server under the home-server map.
pub fn server_container_id(servers: i32, server_num: i32) -> i64 {
    debug_assert!(server_num >= 0 && server_num < servers);
    -(servers as i64) + server_num as i64
}

/// Index container id responsible for a key.
pub fn id_for_key(key: &[u8], servers: i32) -> i64 {
    let hash = crc32fast::hash(key);
    -((hash % servers as u32) as i64) - 1
}

/// Creates this server's index shard container. Called on each server
/// before any checkpoint traffic.
pub fn init_server_index(
    store: &mut DataStore,
    servers: i32,
    server_num: i32,
) -> Result<(), DataError> {
    let id = server_container_id(servers, server_num);
    store.create(
        id,
        DataType::Container,
        TypeExtra::Container {
            key_type: DataType::Blob,
            val_type: DataType::Blob,
        },
        CreateProps {
            read_refcount: 1,
            write_refcount: 1,
            permanent: true,
            symbol: 0,
        },
    )
}

/// The two data-plane calls the checkpoint layer needs, satisfied by the
/// worker RPC stub or by a server's own store.
#[async_trait]
pub trait IndexData {
    async fn index_store(
        &mut self,
        id: i64,
        key: &[u8],
        bytes: Vec<u8>,
    ) -> Result<DataResult<()>, TaskmillError>;

    async fn index_retrieve(
        &mut self,
        id: i64,
        key: &[u8],
    ) -> Result<DataResult<Vec<u8>>, TaskmillError>;
}

#[async_trait]
impl IndexData for WorkerStub {
    async fn index_store(
        &mut self,
        id: i64,
        key: &[u8],
        bytes: Vec<u8>,
    ) -> Result<DataResult<()>, TaskmillError> {
        let blob = crate::codec::Value::Blob(bytes).pack();
        self.store(id, Some(key), DataType::Blob, blob, RefCounts::NONE)
            .await
    }

    async fn index_retrieve(
        &mut self,
        id: i64,
        key: &[u8],
    ) -> Result<DataResult<Vec<u8>>, TaskmillError> {
        let got = self.retrieve(id, Some(key), RetrieveRc::default()).await?;
        Ok(got.map(|(_, bytes)| bytes))
    }
}

#[async_trait]
impl IndexData for DataStore {
    async fn index_store(
        &mut self,
        id: i64,
        key: &[u8],
        bytes: Vec<u8>,
    ) -> Result<DataResult<()>, TaskmillError> {
        let mut notifs = NotifSet::new();
        let blob = crate::codec::Value::Blob(bytes).pack();
        Ok(self.store(
            id,
            Some(key),
            DataType::Blob,
            &blob,
            RefCounts::NONE,
            &mut notifs,
        ))
    }

    async fn index_retrieve(
        &mut self,
        id: i64,
        key: &[u8],
    ) -> Result<DataResult<Vec<u8>>, TaskmillError> {
        let mut notifs = NotifSet::new();
        Ok(self
            .retrieve(id, Some(key), RetrieveRc::default(), &mut notifs)
            .map(|(_, bytes)| bytes))
    }
}

#[cfg(test)]
mod index_tests {
    use super::*;

    #[test]
    fn entry_codec_roundtrip() {
        for entry in [
            IndexEntry::Inline(b"small value".to_vec()),
            IndexEntry::Inline(vec![]),
            IndexEntry::InFile {
                file: None,
                val_offset: 123456,
                val_len: 789,
            },
            IndexEntry::InFile {
                file: Some("/tmp/xpt.log".into()),
                val_offset: u64::MAX / 2,
                val_len: u32::MAX,
            },
        ] {
            let bytes = entry.encode();
            assert_eq!(IndexEntry::decode(&bytes).unwrap(), entry);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(IndexEntry::decode(&[]).is_err());
        assert!(IndexEntry::decode(&[1]).is_err());
        assert!(IndexEntry::decode(&[9, 9, 1]).is_err());
    }

    #[test]
    fn key_sharding_in_range() {
        for servers in [1i32, 3, 8] {
            for key in [&b"alpha"[..], b"beta", b"", b"\x00\xff"] {
                let id = id_for_key(key, servers);
                assert!((-(servers as i64)..0).contains(&id));
            }
        }
    }

    #[test]
    fn container_ids_cover_all_servers() {
        let servers = 4;
        let ids: Vec<i64> = (0..servers)
            .map(|s| server_container_id(servers, s))
            .collect();
        assert_eq!(ids, vec![-4, -3, -2, -1]);
    }

    #[tokio::test]
    async fn local_index_store_retrieve() {
        let mut store = DataStore::new(2, 0);
        init_server_index(&mut store, 2, 0).unwrap();
        let id = server_container_id(2, 0);

        let entry = IndexEntry::Inline(b"result".to_vec());
        store
            .index_store(id, b"fingerprint", entry.encode())
            .await
            .unwrap()
            .unwrap();
        let raw = store
            .index_retrieve(id, b"fingerprint")
            .await
            .unwrap()
            .unwrap();
        // stored as a packed blob: unwrap the value layer
        let unpacked = crate::codec::Value::unpack(DataType::Blob, &raw).unwrap();
        let crate::codec::Value::Blob(bytes) = unpacked else {
            panic!("not a blob")
        };
        assert_eq!(IndexEntry::decode(&bytes).unwrap(), entry);

        // duplicate insert is a double write, reported not fatal
        let again = store
            .index_store(id, b"fingerprint", entry.encode())
            .await
            .unwrap();
        assert_eq!(again, Err(DataError::DoubleWrite));
    }
}
