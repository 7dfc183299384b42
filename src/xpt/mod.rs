//! Checkpointing: the rank-striped log file plus the fingerprint index.
//!
//! A rank writes `(key, value)` checkpoint records; small values are
//! indexed inline, large ones are persisted and indexed by file location.
//! Reloading a file from a previous run replays every rank's records into
//! the index, skipping (and counting) corrupt records.

pub mod file;
pub mod index;

pub use file::{XptReader, XptRecord, XptWriter, XPT_BLOCK_SIZE, XPT_MAX};
pub use index::{IndexData, IndexEntry};

use tokio::time::{Duration, Instant};

use crate::msg::DataError;
use crate::utils::TaskmillError;

/// When buffered checkpoint records are forced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Only on close and when the index demands it.
    NoFlush,
    /// At most every interval.
    Periodic(Duration),
    /// After every persisted record.
    Always,
}

/// Per-write persistence request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persist {
    /// Index-only write (unless the value is too big to inline).
    NoPersist,
    /// Write to the log.
    Persist,
    /// Write to the log and flush regardless of policy.
    PersistFlush,
}

/// Per-rank statistics from a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RankStats {
    pub rank: u32,
    pub valid: u64,
    pub invalid: u64,
}

/// Checkpoint state of one rank.
pub struct Checkpoint {
    writer: XptWriter,
    policy: FlushPolicy,
    /// Values longer than this are indexed by file location.
    max_index_val: usize,
    servers: i32,
    last_flush: Instant,
}

impl Checkpoint {
    /// Opens the shared checkpoint file for this rank. Server ranks must
    /// have created their index shards (`index::init_server_index`) first.
    pub fn init(
        filename: &str,
        rank: u32,
        ranks: u32,
        servers: i32,
        block_size: u32,
        policy: FlushPolicy,
        max_index_val: usize,
    ) -> Result<Self, TaskmillError> {
        let writer = XptWriter::open(filename, rank, ranks, block_size)?;
        Ok(Checkpoint {
            writer,
            policy,
            max_index_val,
            servers,
            last_flush: Instant::now(),
        })
    }

    fn flush_due(&self) -> bool {
        match self.policy {
            FlushPolicy::NoFlush => false,
            FlushPolicy::Always => true,
            FlushPolicy::Periodic(interval) => self.last_flush.elapsed() >= interval,
        }
    }

    fn flush(&mut self) -> Result<(), TaskmillError> {
        self.writer.flush()?;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Writes one checkpoint entry. With `index_add`, the entry becomes
    /// visible through `lookup`; an in-file entry is flushed before the
    /// index commit so no reader can see a dangling offset.
    pub async fn write<D: IndexData>(
        &mut self,
        key: &[u8],
        val: &[u8],
        persist: Persist,
        index_add: bool,
        data: &mut D,
    ) -> Result<(), TaskmillError> {
        if val.len() as i64 > XPT_MAX {
            return logged_err!("checkpoint value too long: {}", val.len());
        }

        let in_file = index_add && val.len() > self.max_index_val;
        let do_persist = persist != Persist::NoPersist || in_file;

        let mut entry = (index_add && !in_file).then(|| IndexEntry::Inline(val.to_vec()));

        if do_persist {
            let val_offset = self.writer.write(key, val)?;
            if persist == Persist::PersistFlush || in_file || self.flush_due() {
                self.flush()?;
            }
            if in_file {
                entry = Some(IndexEntry::InFile {
                    file: None,
                    val_offset,
                    val_len: val.len() as u32,
                });
            }
        }

        if let Some(entry) = entry {
            let id = index::id_for_key(key, self.servers);
            match data.index_store(id, key, entry.encode()).await? {
                Ok(()) => {}
                // the same function may legitimately be recomputed
                Err(DataError::DoubleWrite) => {
                    pf_debug!("checkpoint key already indexed");
                }
                Err(e) => return logged_err!("error storing checkpoint entry: {:?}", e),
            }
        }
        Ok(())
    }

    /// Looks a key up in the index, reading the value back from the log
    /// when it was indexed by location.
    pub async fn lookup<D: IndexData>(
        &mut self,
        key: &[u8],
        data: &mut D,
    ) -> Result<Option<Vec<u8>>, TaskmillError> {
        let id = index::id_for_key(key, self.servers);
        let raw = match data.index_retrieve(id, key).await? {
            Ok(bytes) => bytes,
            Err(DataError::NotFound) | Err(DataError::SubscriptNotFound) => return Ok(None),
            Err(e) => return logged_err!("error looking up checkpoint: {:?}", e),
        };
        match IndexEntry::decode(&raw) {
            Ok(IndexEntry::Inline(bytes)) => Ok(Some(bytes)),
            Ok(IndexEntry::InFile {
                file: None,
                val_offset,
                val_len,
            }) => Ok(Some(self.writer.read_val(val_offset, val_len as usize)?)),
            Ok(IndexEntry::InFile {
                file: Some(file),
                val_offset,
                val_len,
            }) => {
                let mut reader = XptReader::open(&file)?;
                Ok(Some(reader.read_val(val_offset, val_len as usize)?))
            }
            Err(e) => logged_err!("corrupt checkpoint index entry: {:?}", e),
        }
    }

    /// Ends this rank's checkpoint stream.
    pub fn close(self) -> Result<(), TaskmillError> {
        self.writer.close()
    }
}

/// Replays every rank's records of a previous run's file into the index.
/// Corrupt records are counted per rank and skipped; values larger than
/// `max_index_val` are indexed by their location in `filename`.
pub async fn reload<D: IndexData>(
    filename: &str,
    servers: i32,
    max_index_val: usize,
    data: &mut D,
) -> Result<Vec<RankStats>, TaskmillError> {
    let mut reader = XptReader::open(filename)?;
    let ranks = reader.ranks();
    let mut stats = Vec::with_capacity(ranks as usize);

    for rank in 0..ranks {
        let mut rs = RankStats {
            rank,
            ..Default::default()
        };
        if reader.select_rank(rank)? {
            loop {
                match reader.read_record()? {
                    XptRecord::Done => break,
                    XptRecord::Invalid => rs.invalid += 1,
                    XptRecord::Record {
                        key,
                        val,
                        val_offset,
                    } => {
                        rs.valid += 1;
                        let entry = if val.len() > max_index_val {
                            IndexEntry::InFile {
                                file: Some(filename.to_string()),
                                val_offset,
                                val_len: val.len() as u32,
                            }
                        } else {
                            IndexEntry::Inline(val)
                        };
                        let id = index::id_for_key(&key, servers);
                        match data.index_store(id, &key, entry.encode()).await? {
                            Ok(()) | Err(DataError::DoubleWrite) => {}
                            Err(e) => {
                                pf_warn!("error replaying checkpoint entry: {:?}", e);
                            }
                        }
                    }
                }
            }
        } else {
            pf_debug!("no checkpoint entries for rank {}", rank);
        }
        stats.push(rs);
    }
    Ok(stats)
}
