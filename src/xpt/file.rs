//! Rank-striped append-only checkpoint file with CRC-protected records.
//!
//! All ranks share one sparse file. Block `b` belongs to rank `b mod N`;
//! rank `r` writes only blocks `r, r+N, r+2N, ...`. Every used block opens
//! with the magic byte; a zero first byte marks an unused block. Block 0
//! additionally carries the file header. Records are
//! `sync_marker, crc32, varint rec_len, varint key_len, key, value` with
//! the CRC covering everything after itself; records may span blocks, and
//! block magic bytes are not counted in record offsets. A zero-length
//! record marks the end of a rank's records.
//!
//! All fixed-width integers in the file are big-endian; the CRC input is
//! treated as a raw byte sequence.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::codec::vint;
use crate::utils::TaskmillError;

/// Magic byte at the start of every used block.
pub const XPT_MAGIC: u8 = 0x42;

/// Sync marker preceding every record.
pub const XPT_SYNC_MARKER: u32 = 0x5F1C_0B73;

/// Default block size: 4 MiB.
pub const XPT_BLOCK_SIZE: u32 = 4 * 1024 * 1024;

/// Write buffer size.
pub const XPT_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum length of a checkpoint record body.
pub const XPT_MAX: i64 = 20 * 1024 * 1024 - 1;

/// File header length: u32 block_size + u32 ranks.
const XPT_HEADER_BYTES: u32 = 8;

/// Bytes of an end-of-rank marker record: sync marker, CRC, varint 0.
const EOF_REC_BYTES: u32 = 4 + 4 + 1;

/// Buffered writer half, owned by one rank.
pub struct XptWriter {
    file: File,
    rank: u32,
    ranks: u32,
    block_size: u32,
    buffer: Vec<u8>,
    /// Block currently being written and the flushed position within it.
    curr_block: u32,
    curr_block_pos: u32,
}

impl XptWriter {
    /// Opens (creating if needed) the shared file and seats this rank at
    /// its first owned block. Rank 0 writes the file header.
    pub fn open(
        path: impl AsRef<Path>,
        rank: u32,
        ranks: u32,
        block_size: u32,
    ) -> Result<Self, TaskmillError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        let mut state = XptWriter {
            file,
            rank,
            ranks,
            block_size,
            buffer: Vec::with_capacity(XPT_BUFFER_SIZE),
            curr_block: rank,
            curr_block_pos: 0,
        };
        if rank == 0 {
            // header describes the file structure for any reader
            let mut hdr = [0u8; 8];
            hdr[0..4].copy_from_slice(&block_size.to_be_bytes());
            hdr[4..8].copy_from_slice(&ranks.to_be_bytes());
            state.bufwrite(&hdr)?;
            state.flush()?;
        }
        Ok(state)
    }

    /// Logical `(block, pos)` of the next byte to be buffered, accounting
    /// for buffered data and the magic byte of any block it would open.
    fn logical_pos(&self) -> (u32, u32) {
        let total = self.curr_block_pos as u64 + self.buffer.len() as u64;
        let crossed = (total / self.block_size as u64) as u32;
        let pos = (total % self.block_size as u64) as u32;
        (self.curr_block + crossed * self.ranks, pos)
    }

    /// Logical file offset of the next data byte. When the position sits
    /// exactly at a block boundary the data byte lands after that block's
    /// magic byte.
    fn logical_offset(&self) -> u64 {
        let (block, pos) = self.logical_pos();
        let pos = if pos == 0 { 1 } else { pos };
        block as u64 * self.block_size as u64 + pos as u64
    }

    /// Appends raw bytes, injecting the magic byte at every block start,
    /// including when buffered writes straddle a boundary.
    fn bufwrite(&mut self, mut data: &[u8]) -> Result<(), TaskmillError> {
        while !data.is_empty() {
            let (_, in_block) = self.logical_pos();
            if in_block == 0 {
                self.buffer.push(XPT_MAGIC);
                if self.buffer.len() >= XPT_BUFFER_SIZE {
                    self.flush_buffers()?;
                }
                continue;
            }
            let to_boundary = (self.block_size - in_block) as usize;
            let to_buffer = XPT_BUFFER_SIZE - self.buffer.len();
            let n = data.len().min(to_boundary).min(to_buffer);
            self.buffer.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.buffer.len() >= XPT_BUFFER_SIZE {
                self.flush_buffers()?;
            }
        }
        Ok(())
    }

    fn bufwrite_uint32(&mut self, val: u32) -> Result<(), TaskmillError> {
        self.bufwrite(&val.to_be_bytes())
    }

    /// Writes the buffer out block by block, striding to this rank's next
    /// block at each boundary.
    fn flush_buffers(&mut self) -> Result<(), TaskmillError> {
        let mut pos = 0usize;
        while pos < self.buffer.len() {
            let block_left = (self.block_size - self.curr_block_pos) as usize;
            let n = block_left.min(self.buffer.len() - pos);
            let off = self.curr_block as u64 * self.block_size as u64
                + self.curr_block_pos as u64;
            self.file.write_all_at(&self.buffer[pos..pos + n], off)?;
            pos += n;
            if n == block_left {
                self.curr_block += self.ranks;
                self.curr_block_pos = 0;
            } else {
                self.curr_block_pos += n as u32;
            }
        }
        self.buffer.clear();
        Ok(())
    }

    /// Flushes buffered records and forces them to disk.
    pub fn flush(&mut self) -> Result<(), TaskmillError> {
        self.flush_buffers()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Appends one record; returns the file offset of the value bytes (for
    /// in-file index entries).
    pub fn write(&mut self, key: &[u8], val: &[u8]) -> Result<u64, TaskmillError> {
        let mut key_len_enc = [0u8; vint::VINT_MAX_BYTES];
        let key_len_encb = vint::encode_into(key.len() as i64, &mut key_len_enc);

        let rec_len = key_len_encb as i64 + key.len() as i64 + val.len() as i64;
        let mut rec_len_enc = [0u8; vint::VINT_MAX_BYTES];
        let rec_len_encb = vint::encode_into(rec_len, &mut rec_len_enc);

        let mut crc = crc32fast::Hasher::new();
        crc.update(&rec_len_enc[..rec_len_encb]);
        crc.update(&key_len_enc[..key_len_encb]);
        crc.update(key);
        crc.update(val);
        let crc = crc.finalize();

        pf_trace!(
            "xpt write: key {} bytes, val {} bytes, block {}",
            key.len(),
            val.len(),
            self.curr_block
        );

        self.bufwrite_uint32(XPT_SYNC_MARKER)?;
        self.bufwrite_uint32(crc)?;
        self.bufwrite(&rec_len_enc[..rec_len_encb])?;
        self.bufwrite(&key_len_enc[..key_len_encb])?;
        self.bufwrite(key)?;
        let val_offset = self.logical_offset();
        self.bufwrite(val)?;
        Ok(val_offset)
    }

    /// Writes the zero-length end-of-rank record.
    fn write_eof_record(&mut self) -> Result<(), TaskmillError> {
        let mut rec_len_enc = [0u8; vint::VINT_MAX_BYTES];
        let rec_len_encb = vint::encode_into(0, &mut rec_len_enc);
        let mut crc = crc32fast::Hasher::new();
        crc.update(&rec_len_enc[..rec_len_encb]);
        self.bufwrite_uint32(XPT_SYNC_MARKER)?;
        self.bufwrite_uint32(crc.finalize())?;
        self.bufwrite(&rec_len_enc[..rec_len_encb])?;
        Ok(())
    }

    /// Marks the end of this rank's records and flushes. The marker is
    /// written only when the current block is started and has room for it;
    /// a reader treats a missing marker like end-of-file.
    pub fn close(mut self) -> Result<(), TaskmillError> {
        let (_, pos) = self.logical_pos();
        if pos > 0 && self.block_size - pos >= EOF_REC_BYTES {
            self.write_eof_record()?;
        }
        self.flush()?;
        Ok(())
    }

    /// Reads value bytes back from the file being written, following the
    /// block stride. Only flushed offsets may be read; the enclosing
    /// record's CRC is not re-verified here.
    pub fn read_val(&self, val_offset: u64, val_len: usize) -> Result<Vec<u8>, TaskmillError> {
        let mut block = (val_offset / self.block_size as u64) as u32;
        let mut bpos = (val_offset % self.block_size as u64) as u32;
        let mut out = vec![0u8; val_len];
        let mut done = 0usize;
        while done < val_len {
            if bpos == 0 {
                // skip the block's magic byte
                bpos = 1;
            }
            let block_left = (self.block_size - bpos) as usize;
            let n = block_left.min(val_len - done);
            let off = block as u64 * self.block_size as u64 + bpos as u64;
            self.file.read_exact_at(&mut out[done..done + n], off)?;
            done += n;
            if n == block_left {
                block += self.ranks;
                bpos = 0;
            } else {
                bpos += n as u32;
            }
        }
        Ok(out)
    }
}

/// One record-read outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum XptRecord {
    /// A valid record, with the file offset of its value bytes.
    Record {
        key: Vec<u8>,
        val: Vec<u8>,
        val_offset: u64,
    },
    /// A corrupt record was detected and skipped; reading resynchronized
    /// at the next sync marker.
    Invalid,
    /// End of this rank's records (end marker, zero block, or EOF).
    Done,
}

/// Reader over a checkpoint file, scanning one rank's stripe at a time.
pub struct XptReader {
    file: File,
    block_size: u32,
    ranks: u32,
    curr_rank: u32,
    curr_block: u32,
    curr_block_pos: u32,
}

/// Internal read status distinguishing clean stripe ends from I/O trouble.
enum BlkStatus {
    Ok,
    Done,
}

impl XptReader {
    /// Opens a checkpoint file for reading, verifying magic and header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TaskmillError> {
        let file = File::open(path.as_ref())?;

        let mut byte = [0u8; 1];
        file.read_exact_at(&mut byte, 0)?;
        if byte[0] != XPT_MAGIC {
            return logged_err!(
                "invalid magic number {:#04x} at start of checkpoint file",
                byte[0]
            );
        }
        let mut hdr = [0u8; 8];
        file.read_exact_at(&mut hdr, 1)?;
        let block_size = u32::from_be_bytes(hdr[0..4].try_into().unwrap());
        let ranks = u32::from_be_bytes(hdr[4..8].try_into().unwrap());
        if block_size == 0 || ranks == 0 {
            return logged_err!(
                "corrupt checkpoint header: block_size {} ranks {}",
                block_size,
                ranks
            );
        }

        pf_debug!(
            "opened checkpoint file: block size {} ranks {}",
            block_size,
            ranks
        );
        Ok(XptReader {
            file,
            block_size,
            ranks,
            curr_rank: 0,
            curr_block: 0,
            curr_block_pos: 1 + XPT_HEADER_BYTES,
        })
    }

    pub fn ranks(&self) -> u32 {
        self.ranks
    }

    /// Seats the reader at the first block of the given rank. Returns
    /// false when that rank wrote no records.
    pub fn select_rank(&mut self, rank: u32) -> Result<bool, TaskmillError> {
        if rank >= self.ranks {
            return logged_err!("invalid rank {} of {}", rank, self.ranks);
        }
        self.curr_rank = rank;
        match self.block_move(rank)? {
            BlkStatus::Done => Ok(false),
            BlkStatus::Ok => Ok(true),
        }
    }

    /// Moves to the start of the given block, checking its magic byte.
    fn block_move(&mut self, block: u32) -> Result<BlkStatus, TaskmillError> {
        self.curr_block = block;
        self.curr_block_pos = 0;

        let off = block as u64 * self.block_size as u64;
        let mut byte = [0u8; 1];
        match self.file.read_exact_at(&mut byte, off) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(BlkStatus::Done);
            }
            Err(e) => return Err(e.into()),
        }
        self.curr_block_pos = 1;
        if byte[0] == 0 {
            // a hole: past this rank's last written block
            return Ok(BlkStatus::Done);
        }
        if byte[0] != XPT_MAGIC {
            return logged_err!(
                "invalid magic number {:#04x} at start of block {}",
                byte[0],
                block
            );
        }
        if block == 0 {
            // move past the file header
            self.curr_block_pos += XPT_HEADER_BYTES;
        }
        Ok(BlkStatus::Ok)
    }

    fn block_advance(&mut self) -> Result<BlkStatus, TaskmillError> {
        self.block_move(self.curr_block + self.ranks)
    }

    /// Current position as a file offset.
    fn offset(&self) -> u64 {
        self.curr_block as u64 * self.block_size as u64 + self.curr_block_pos as u64
    }

    /// Advances a `(block, pos)` pair by `add` stream bytes, skipping block
    /// magic bytes at boundaries.
    fn pos_add(&self, mut block: u32, mut pos: u32, mut add: u64) -> (u32, u32) {
        while add > 0 {
            let block_left = (self.block_size - pos) as u64;
            if add < block_left {
                pos += add as u32;
                break;
            }
            add -= block_left;
            block += self.ranks;
            pos = 1; // past the next block's magic byte
        }
        (block, pos)
    }

    /// Reads stream bytes that may span non-contiguous blocks.
    fn blkread(&mut self, buf: &mut [u8]) -> Result<BlkStatus, TaskmillError> {
        let mut done = 0usize;
        while done < buf.len() {
            if self.curr_block_pos >= self.block_size {
                match self.block_advance()? {
                    BlkStatus::Done => return Ok(BlkStatus::Done),
                    BlkStatus::Ok => {}
                }
            }
            let block_left = (self.block_size - self.curr_block_pos) as usize;
            let n = block_left.min(buf.len() - done);
            match self.file.read_exact_at(&mut buf[done..done + n], self.offset()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(BlkStatus::Done);
                }
                Err(e) => return Err(e.into()),
            }
            self.curr_block_pos += n as u32;
            done += n;
        }
        Ok(BlkStatus::Ok)
    }

    fn blkgetc(&mut self) -> Result<Option<u8>, TaskmillError> {
        let mut byte = [0u8; 1];
        match self.blkread(&mut byte)? {
            BlkStatus::Done => Ok(None),
            BlkStatus::Ok => Ok(Some(byte[0])),
        }
    }

    fn blkread_uint32(&mut self) -> Result<Option<u32>, TaskmillError> {
        let mut buf = [0u8; 4];
        match self.blkread(&mut buf)? {
            BlkStatus::Done => Ok(None),
            BlkStatus::Ok => Ok(Some(u32::from_be_bytes(buf))),
        }
    }

    /// Decodes a varint byte by byte. `Ok(None)` means clean EOF;
    /// `Err` with the decoded-so-far flag distinguishes malformed input.
    fn blkread_vint(&mut self) -> Result<Option<Result<i64, ()>>, TaskmillError> {
        let mut dec = vint::Decoder::new();
        loop {
            let Some(b) = self.blkgetc()? else {
                return Ok(None);
            };
            match dec.feed(b) {
                None => return Ok(Some(Err(()))), // malformed
                Some(Some(v)) => return Ok(Some(Ok(v))),
                Some(None) => continue,
            }
        }
    }

    /// Normalizes the position onto a readable byte, advancing past block
    /// boundaries. Returns the normalized `(block, pos)`.
    fn norm_pos(&mut self) -> Result<Option<(u32, u32)>, TaskmillError> {
        if self.curr_block_pos >= self.block_size {
            match self.block_advance()? {
                BlkStatus::Done => return Ok(None),
                BlkStatus::Ok => {}
            }
        }
        Ok(Some((self.curr_block, self.curr_block_pos)))
    }

    /// Scans forward from one byte past the failed record's sync marker
    /// until the marker reappears (big-endian byte-shifted window), leaving
    /// the position at the found marker so the next read parses it as a
    /// record start. Errors here are swallowed; the next read reports them.
    fn resync(&mut self, resync_block: u32, resync_pos: u32) {
        pf_debug!("attempting to resync checkpoint read");
        self.curr_block = resync_block;
        self.curr_block_pos = resync_pos;

        // positions of the last four bytes read: window start candidates
        let mut starts: std::collections::VecDeque<(u32, u32)> =
            std::collections::VecDeque::with_capacity(4);
        let mut window: u32 = 0;
        let mut have = 0usize;
        loop {
            let byte_pos = match self.norm_pos() {
                Ok(Some(p)) => p,
                _ => return,
            };
            let b = match self.blkgetc() {
                Ok(Some(b)) => b,
                _ => return,
            };
            starts.push_back(byte_pos);
            if starts.len() > 4 {
                starts.pop_front();
            }
            window = (window << 8) | b as u32;
            have += 1;
            if have >= 4 && window == XPT_SYNC_MARKER {
                let (block, pos) = starts.front().copied().unwrap();
                self.curr_block = block;
                self.curr_block_pos = pos;
                return;
            }
        }
    }

    /// Reads value bytes at a known offset (from an in-file index entry),
    /// following the block stride of the file.
    pub fn read_val(&mut self, val_offset: u64, val_len: usize) -> Result<Vec<u8>, TaskmillError> {
        self.curr_block = (val_offset / self.block_size as u64) as u32;
        self.curr_block_pos = (val_offset % self.block_size as u64) as u32;
        let mut out = vec![0u8; val_len];
        match self.blkread(&mut out)? {
            BlkStatus::Done => logged_err!(
                "checkpoint value at offset {} is past end of file",
                val_offset
            ),
            BlkStatus::Ok => Ok(out),
        }
    }

    /// Reads the next record of the selected rank.
    pub fn read_record(&mut self) -> Result<XptRecord, TaskmillError> {
        // one byte past the sync marker position, for resync
        let (resync_block, resync_pos) =
            self.pos_add(self.curr_block, self.curr_block_pos, 1);
        let rec_offset = self.offset();

        let Some(sync) = self.blkread_uint32()? else {
            return Ok(XptRecord::Done);
        };
        if sync != XPT_SYNC_MARKER {
            // can't do much if the sync marker is bad; proceed anyway
            pf_debug!(
                "sync marker {:#010x} at offset {} does not match, proceeding",
                sync,
                rec_offset
            );
        }

        let Some(crc) = self.blkread_uint32()? else {
            return Ok(XptRecord::Done);
        };

        let rec_len = match self.blkread_vint()? {
            None => return Ok(XptRecord::Done),
            Some(Err(())) => {
                pf_warn!("could not decode record length at offset {}", rec_offset);
                self.resync(resync_block, resync_pos);
                return Ok(XptRecord::Invalid);
            }
            Some(Ok(v)) => v,
        };

        if !(0..=XPT_MAX).contains(&rec_len) {
            pf_warn!("out of range record length: {}", rec_len);
            self.resync(resync_block, resync_pos);
            return Ok(XptRecord::Invalid);
        }

        let mut rec_len_enc = [0u8; vint::VINT_MAX_BYTES];
        let rec_len_encb = vint::encode_into(rec_len, &mut rec_len_enc);

        if rec_len == 0 {
            // end-of-rank marker, if its CRC holds up
            let mut check = crc32fast::Hasher::new();
            check.update(&rec_len_enc[..rec_len_encb]);
            if check.finalize() != crc {
                pf_warn!("CRC check failed for end marker at offset {}", rec_offset);
                self.resync(resync_block, resync_pos);
                return Ok(XptRecord::Invalid);
            }
            return Ok(XptRecord::Done);
        }

        let (body_block, body_pos) = (self.curr_block, self.curr_block_pos);
        let mut body = vec![0u8; rec_len as usize];
        match self.blkread(&mut body)? {
            BlkStatus::Done => return Ok(XptRecord::Done),
            BlkStatus::Ok => {}
        }

        let mut check = crc32fast::Hasher::new();
        check.update(&rec_len_enc[..rec_len_encb]);
        check.update(&body);
        let check = check.finalize();
        if check != crc {
            pf_warn!(
                "CRC check failed for record at offset {}: computed {:#010x} expected {:#010x}",
                rec_offset,
                check,
                crc
            );
            self.resync(resync_block, resync_pos);
            return Ok(XptRecord::Invalid);
        }

        // CRC passed: split body into key and value
        let Some((key_len, key_len_encb)) = vint::decode(&body) else {
            pf_warn!("error decoding key length at offset {}", rec_offset);
            self.resync(resync_block, resync_pos);
            return Ok(XptRecord::Invalid);
        };
        if key_len < 0 || key_len > rec_len - key_len_encb as i64 {
            pf_warn!("key length {} too long for record {}", key_len, rec_len);
            self.resync(resync_block, resync_pos);
            return Ok(XptRecord::Invalid);
        }

        let key_rel = key_len_encb;
        let val_rel = key_rel + key_len as usize;
        let (vo_block, vo_pos) = self.pos_add(body_block, body_pos, val_rel as u64);
        let val_offset = vo_block as u64 * self.block_size as u64 + vo_pos as u64;

        Ok(XptRecord::Record {
            key: body[key_rel..val_rel].to_vec(),
            val: body[val_rel..].to_vec(),
            val_offset,
        })
    }
}

#[cfg(test)]
mod xpt_file_tests {
    use super::*;

    fn tmp_path(name: &str) -> String {
        format!("/tmp/test-xpt-{}-{}.log", name, std::process::id())
    }

    fn write_records(
        path: &str,
        rank: u32,
        ranks: u32,
        block_size: u32,
        n: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut writer = XptWriter::open(path, rank, ranks, block_size).unwrap();
        let mut pairs = Vec::new();
        for i in 0..n {
            let key = format!("key-{}", i).into_bytes();
            let val = format!("value-{}-{}", i, "x".repeat(i % 40)).into_bytes();
            writer.write(&key, &val).unwrap();
            pairs.push((key, val));
        }
        writer.close().unwrap();
        pairs
    }

    #[test]
    fn log_roundtrip_same_rank() {
        let path = tmp_path("roundtrip");
        let _ = std::fs::remove_file(&path);
        let pairs = write_records(&path, 0, 1, 1 << 16, 100);

        let mut reader = XptReader::open(&path).unwrap();
        assert!(reader.select_rank(0).unwrap());
        for (key, val) in &pairs {
            match reader.read_record().unwrap() {
                XptRecord::Record { key: k, val: v, .. } => {
                    assert_eq!(&k, key);
                    assert_eq!(&v, val);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(reader.read_record().unwrap(), XptRecord::Done);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn header_describes_file() {
        let path = tmp_path("header");
        let _ = std::fs::remove_file(&path);
        write_records(&path, 0, 4, 1 << 16, 1);
        let reader = XptReader::open(&path).unwrap();
        assert_eq!(reader.ranks(), 4);
        assert_eq!(reader.block_size, 1 << 16);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn rank_stripe_isolation() {
        // writes by rank r touch only blocks congruent to r mod N
        let path = tmp_path("stripes");
        let _ = std::fs::remove_file(&path);
        let bs: u32 = 1 << 12;
        let ranks = 3u32;
        // each rank writes enough to fill several blocks
        let mut all = Vec::new();
        for rank in 0..ranks {
            let mut writer = XptWriter::open(&path, rank, ranks, bs).unwrap();
            let mut pairs = Vec::new();
            for i in 0..40 {
                let key = format!("r{}k{}", rank, i).into_bytes();
                let val = vec![rank as u8; 300 + i];
                writer.write(&key, &val).unwrap();
                pairs.push((key, val));
            }
            writer.close().unwrap();
            all.push(pairs);
        }

        // each rank's records read back intact from its own stripe
        let mut reader = XptReader::open(&path).unwrap();
        for rank in 0..ranks {
            assert!(reader.select_rank(rank).unwrap());
            for (key, val) in &all[rank as usize] {
                match reader.read_record().unwrap() {
                    XptRecord::Record { key: k, val: v, .. } => {
                        assert_eq!(&k, key);
                        assert_eq!(&v, val);
                    }
                    other => panic!("rank {}: unexpected {:?}", rank, other),
                }
            }
            assert_eq!(reader.read_record().unwrap(), XptRecord::Done);
        }

        // block ownership: every used block's first byte is the magic, and
        // unowned gaps of rank 1's stripe hold other ranks' blocks only
        let data = std::fs::read(&path).unwrap();
        let nblocks = data.len().div_ceil(bs as usize);
        for b in 0..nblocks {
            let first = data[b * bs as usize];
            assert!(
                first == XPT_MAGIC || first == 0,
                "block {} starts with {:#04x}",
                b,
                first
            );
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn records_span_blocks() {
        let path = tmp_path("spanning");
        let _ = std::fs::remove_file(&path);
        let bs: u32 = 4096;
        let mut writer = XptWriter::open(&path, 0, 2, bs).unwrap();
        // values larger than a block force records across boundaries
        let big1 = vec![0xAAu8; 3 * bs as usize / 2];
        let big2 = vec![0x55u8; 2 * bs as usize];
        writer.write(b"big1", &big1).unwrap();
        writer.write(b"big2", &big2).unwrap();
        writer.close().unwrap();

        let mut reader = XptReader::open(&path).unwrap();
        assert!(reader.select_rank(0).unwrap());
        match reader.read_record().unwrap() {
            XptRecord::Record { key, val, .. } => {
                assert_eq!(key, b"big1");
                assert_eq!(val, big1);
            }
            other => panic!("unexpected {:?}", other),
        }
        match reader.read_record().unwrap() {
            XptRecord::Record { key, val, .. } => {
                assert_eq!(key, b"big2");
                assert_eq!(val, big2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(reader.read_record().unwrap(), XptRecord::Done);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn corrupt_record_resyncs_to_next() {
        // mutating bytes inside one record reports it INVALID and the
        // following records are still read
        let path = tmp_path("corrupt");
        let _ = std::fs::remove_file(&path);
        let pairs = write_records(&path, 0, 1, 1 << 16, 1000);

        // find the 500th record's value and flip bytes inside it
        let mut reader = XptReader::open(&path).unwrap();
        assert!(reader.select_rank(0).unwrap());
        let mut val_off = 0u64;
        for i in 0..500 {
            match reader.read_record().unwrap() {
                XptRecord::Record { val_offset, .. } => {
                    if i == 499 {
                        val_off = val_offset;
                    }
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        drop(reader);

        let mut data = std::fs::read(&path).unwrap();
        for i in 0..4 {
            data[val_off as usize + i] ^= 0xFF;
        }
        std::fs::write(&path, &data).unwrap();

        let mut reader = XptReader::open(&path).unwrap();
        assert!(reader.select_rank(0).unwrap());
        let (mut valid, mut invalid) = (0u64, 0u64);
        let mut survivors = Vec::new();
        loop {
            match reader.read_record().unwrap() {
                XptRecord::Record { key, val, .. } => {
                    valid += 1;
                    survivors.push((key, val));
                }
                XptRecord::Invalid => invalid += 1,
                XptRecord::Done => break,
            }
        }
        assert_eq!(valid, 999);
        assert_eq!(invalid, 1);
        // all surviving records parse back to their original values
        let expected: Vec<_> = pairs
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 499)
            .map(|(_, p)| p.clone())
            .collect();
        assert_eq!(survivors, expected);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn corrupt_length_field_resyncs() {
        let path = tmp_path("badlen");
        let _ = std::fs::remove_file(&path);
        write_records(&path, 0, 1, 1 << 16, 3);

        // record layout begins right after header: overwrite the second
        // record's length varint with garbage keeping its sync marker
        let mut reader = XptReader::open(&path).unwrap();
        reader.select_rank(0).unwrap();
        let first_end = match reader.read_record().unwrap() {
            XptRecord::Record { .. } => reader.offset(),
            other => panic!("unexpected {:?}", other),
        };
        drop(reader);

        let mut data = std::fs::read(&path).unwrap();
        // sync(4) + crc(4) then the rec_len varint of record 2
        data[first_end as usize + 8] = 0xFF;
        data[first_end as usize + 9] = 0xFF;
        std::fs::write(&path, &data).unwrap();

        let mut reader = XptReader::open(&path).unwrap();
        reader.select_rank(0).unwrap();
        let mut kinds = Vec::new();
        loop {
            match reader.read_record().unwrap() {
                XptRecord::Record { .. } => kinds.push("ok"),
                XptRecord::Invalid => kinds.push("bad"),
                XptRecord::Done => break,
            }
        }
        assert_eq!(kinds, vec!["ok", "bad", "ok"]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn read_val_follows_stride() {
        let path = tmp_path("readval");
        let _ = std::fs::remove_file(&path);
        let bs: u32 = 4096;
        let mut writer = XptWriter::open(&path, 0, 2, bs).unwrap();
        let val = (0u32..2500).flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>();
        let off = writer.write(b"key", &val).unwrap();
        writer.flush().unwrap();
        // value spans into the next owned block; read_val must skip the
        // interposed magic byte
        let back = writer.read_val(off, val.len()).unwrap();
        assert_eq!(back, val);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_end_marker_reads_as_done() {
        // a writer that never closed (no end marker): reading stops at the
        // zero bytes of the unwritten region just like a clean close
        let path = tmp_path("noeof");
        let _ = std::fs::remove_file(&path);
        let mut writer = XptWriter::open(&path, 0, 1, 1 << 16).unwrap();
        writer.write(b"k", b"v").unwrap();
        writer.flush().unwrap();
        drop(writer); // no close(): no end marker

        // extend the file so the reader sees zeroed space, not EOF
        let data = std::fs::read(&path).unwrap();
        let mut padded = data.clone();
        padded.resize((1 << 16) as usize, 0);
        std::fs::write(&path, &padded).unwrap();

        let mut reader = XptReader::open(&path).unwrap();
        reader.select_rank(0).unwrap();
        assert!(matches!(
            reader.read_record().unwrap(),
            XptRecord::Record { .. }
        ));
        // next "record" starts in zeroed space: sync marker mismatch, zero
        // CRC, zero length... which checks out as Done or Invalid, never a
        // phantom record
        let next = reader.read_record().unwrap();
        assert!(
            next == XptRecord::Done || next == XptRecord::Invalid,
            "got {:?}",
            next
        );
        std::fs::remove_file(&path).unwrap();
    }
}
