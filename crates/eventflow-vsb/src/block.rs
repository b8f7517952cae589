//! A single VSB block: create, open, append, read, archive, delete.
//!
//! One writer, many readers. Appends go through an async writer lock; the
//! published tail (`last_offset`, `write_pos`, per-offset positions) lives
//! behind a short synchronous mutex. Readers snapshot the tail and then
//! read from their own file handle, so they never contend with the writer
//! beyond that snapshot.
//!
//! Deletion unlinks the file while `Arc<Block>` handles keep it readable;
//! the last handle dropping releases the inode.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use eventflow_core::{BlockId, Entry};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{FlushPolicy, VsbConfig};
use crate::error::{Result, VsbError};
use crate::format::{
    self, Footer, FrameCheck, Header, FOOTER_SIZE, HEADER_SIZE, INDEX_ENTRY_SIZE,
};

/// Lifecycle state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Accepting appends; no footer on disk.
    Working,
    /// Sealed read-only; index and footer present.
    Archived,
    /// Unlinked; all operations fail.
    Deleted,
}

/// Point-in-time description of a block, as reported in heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStat {
    pub id: BlockId,
    pub capacity: u64,
    pub size: u64,
    pub first_offset: u64,
    /// -1 when the block is empty.
    pub last_offset: i64,
    pub first_timestamp_ns: u64,
    pub last_timestamp_ns: u64,
    pub archived: bool,
}

#[derive(Debug)]
struct Tail {
    state: BlockState,
    /// -1 when empty; offsets are dense so `positions[i]` is offset `i`.
    last_offset: i64,
    /// File position where the next frame goes; also the current data size.
    write_pos: u64,
    positions: Vec<u64>,
    first_timestamp_ns: u64,
    last_timestamp_ns: u64,
}

#[derive(Debug)]
pub struct Block {
    path: PathBuf,
    header: Header,
    flush: FlushPolicy,
    writer: tokio::sync::Mutex<File>,
    tail: Mutex<Tail>,
    archived_tx: Option<mpsc::Sender<BlockId>>,
}

impl Block {
    /// Create a new empty block file. Fails if the file already exists.
    pub async fn create(
        path: impl AsRef<Path>,
        id: BlockId,
        capacity: u64,
        config: &VsbConfig,
        archived_tx: Option<mpsc::Sender<BlockId>>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let header = Header {
            version: format::FORMAT_VERSION,
            flags: 0,
            block_id: id,
            capacity,
            created_ns: now_ns(),
        };
        let mut file = OpenOptions::new()
            .write(true)
            .read(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(&format::encode_header(&header)).await?;
        file.sync_all().await?;
        debug!(block_id = %id, path = %path.display(), capacity, "block created");
        Ok(Self {
            path,
            header,
            flush: config.flush,
            writer: tokio::sync::Mutex::new(file),
            tail: Mutex::new(Tail {
                state: BlockState::Working,
                last_offset: -1,
                write_pos: HEADER_SIZE,
                positions: Vec::new(),
                first_timestamp_ns: 0,
                last_timestamp_ns: 0,
            }),
            archived_tx,
        })
    }

    /// Open an existing block file and recover its tail state.
    ///
    /// For a working block this scans forward from the header to the last
    /// intact frame; a torn tail (short frame or CRC mismatch) is truncated
    /// away and logged at `warn`. For an archived block the footer and index
    /// are loaded instead of scanning.
    pub async fn open(
        path: impl AsRef<Path>,
        config: &VsbConfig,
        archived_tx: Option<mpsc::Sender<BlockId>>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path).await?;

        let mut header_buf = vec![0u8; HEADER_SIZE as usize];
        let n = read_up_to(&mut file, &mut header_buf).await?;
        let header = format::decode_header(&header_buf[..n])?;

        let file_len = file.metadata().await?.len();

        // Archived blocks carry a footer at the very end.
        if let Some(footer) = read_footer(&mut file, file_len).await? {
            let tail = load_archived(&mut file, file_len, &footer).await?;
            debug!(
                block_id = %header.block_id,
                entries = footer.count,
                "archived block opened"
            );
            return Ok(Self {
                path,
                header,
                flush: config.flush,
                writer: tokio::sync::Mutex::new(file),
                tail: Mutex::new(tail),
                archived_tx,
            });
        }

        let tail = scan_working(&mut file, file_len, header.block_id).await?;
        Ok(Self {
            path,
            header,
            flush: config.flush,
            writer: tokio::sync::Mutex::new(file),
            tail: Mutex::new(tail),
            archived_tx,
        })
    }

    pub fn id(&self) -> BlockId {
        self.header.block_id
    }

    pub fn capacity(&self) -> u64 {
        self.header.capacity
    }

    pub fn state(&self) -> BlockState {
        self.tail.lock().unwrap().state
    }

    /// Last assigned offset, or -1 for an empty block.
    pub fn last_offset(&self) -> i64 {
        self.tail.lock().unwrap().last_offset
    }

    pub fn stat(&self) -> BlockStat {
        let tail = self.tail.lock().unwrap();
        BlockStat {
            id: self.header.block_id,
            capacity: self.header.capacity,
            size: tail.write_pos,
            first_offset: 0,
            last_offset: tail.last_offset,
            first_timestamp_ns: tail.first_timestamp_ns,
            last_timestamp_ns: tail.last_timestamp_ns,
            archived: tail.state == BlockState::Archived,
        }
    }

    /// Append a single record. Durable on return under `EveryAppend`; under
    /// the default `EveryBatch` policy use [`append_batch`](Self::append_batch)
    /// or follow with [`flush`](Self::flush).
    pub async fn append(&self, payload: &[u8], timestamp_ns: u64) -> Result<u64> {
        let offsets = self
            .append_batch(std::iter::once((payload, timestamp_ns)))
            .await?;
        Ok(offsets[0])
    }

    /// Append a batch of records, fsyncing once at the batch boundary.
    /// Returns the assigned offsets, dense and in order.
    pub async fn append_batch<'a>(
        &self,
        records: impl IntoIterator<Item = (&'a [u8], u64)>,
    ) -> Result<Vec<u64>> {
        let mut file = self.writer.lock().await;

        // Snapshot the tail; the writer lock makes us the only appender.
        let (state, mut next_offset, mut pos) = {
            let tail = self.tail.lock().unwrap();
            (tail.state, (tail.last_offset + 1) as u64, tail.write_pos)
        };
        match state {
            BlockState::Working => {}
            BlockState::Archived => return Err(VsbError::Full),
            BlockState::Deleted => return Err(VsbError::Deleted),
        }

        let mut buf = BytesMut::new();
        let mut offsets = Vec::new();
        let mut new_positions = Vec::new();
        let mut first_ts = None;
        let mut last_ts = 0;
        for (payload, ts) in records {
            let frame = format::encode_frame(next_offset, ts, payload);
            if pos + buf.len() as u64 + frame.len() as u64 > self.header.capacity {
                return Err(VsbError::Full);
            }
            new_positions.push(pos + buf.len() as u64);
            buf.extend_from_slice(&frame);
            offsets.push(next_offset);
            first_ts.get_or_insert(ts);
            last_ts = ts;
            next_offset += 1;
        }
        if offsets.is_empty() {
            return Ok(offsets);
        }

        file.seek(SeekFrom::Start(pos)).await?;
        match self.flush {
            FlushPolicy::EveryAppend => {
                // One sync per frame; the batch still lands in order.
                for i in 0..new_positions.len() {
                    let start = (new_positions[i] - pos) as usize;
                    let end = new_positions
                        .get(i + 1)
                        .map(|&n| (n - pos) as usize)
                        .unwrap_or(buf.len());
                    file.write_all(&buf[start..end]).await?;
                    file.sync_data().await?;
                }
            }
            FlushPolicy::EveryBatch => {
                file.write_all(&buf).await?;
                file.sync_data().await?;
            }
            FlushPolicy::Never => {
                file.write_all(&buf).await?;
            }
        }
        pos += buf.len() as u64;

        // Publish the new tail.
        {
            let mut tail = self.tail.lock().unwrap();
            if tail.last_offset < 0 {
                tail.first_timestamp_ns = first_ts.unwrap_or(0);
            }
            tail.last_offset = *offsets.last().unwrap() as i64;
            tail.write_pos = pos;
            tail.positions.extend_from_slice(&new_positions);
            tail.last_timestamp_ns = last_ts;
        }
        Ok(offsets)
    }

    /// Fsync the block file.
    pub async fn flush(&self) -> Result<()> {
        let file = self.writer.lock().await;
        file.sync_data().await?;
        Ok(())
    }

    /// Read entries starting at `offset`, stopping once the accumulated
    /// payload bytes would exceed `max_bytes` (the first entry is always
    /// returned) or the block end is reached. Reading exactly one past the
    /// last offset yields an empty vec.
    pub async fn read(&self, offset: u64, max_bytes: u64) -> Result<Vec<Entry>> {
        let (state, last_offset, start_pos, end_pos) = {
            let tail = self.tail.lock().unwrap();
            let start = tail.positions.get(offset as usize).copied();
            (tail.state, tail.last_offset, start, tail.write_pos)
        };
        if state == BlockState::Deleted {
            return Err(VsbError::Deleted);
        }
        if offset as i64 > last_offset + 1 {
            return Err(VsbError::OffsetOutOfRange {
                offset,
                last: last_offset,
            });
        }
        if offset as i64 == last_offset + 1 {
            return Ok(Vec::new());
        }
        let start_pos = start_pos.ok_or(VsbError::Corrupt(format!(
            "no file position for offset {offset}"
        )))?;

        // Read on a private handle; the writer never rewrites [start, end).
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start_pos)).await?;

        let mut entries = Vec::new();
        let mut buf = BytesMut::new();
        let mut remaining = end_pos - start_pos;
        let mut consumed = 0u64;
        let mut total = 0u64;
        let mut expected = offset;
        while (expected as i64) <= last_offset {
            // Top up the buffer until it holds the next frame.
            let frame = loop {
                match format::decode_frame(&buf[consumed as usize..]) {
                    FrameCheck::Complete {
                        offset: o,
                        timestamp_ns,
                        payload,
                        len,
                    } => break Some((o, timestamp_ns, payload, len)),
                    FrameCheck::Torn if remaining > 0 => {
                        let chunk = remaining.min(64 * 1024) as usize;
                        let mut tmp = vec![0u8; chunk];
                        let n = file.read(&mut tmp).await?;
                        if n == 0 {
                            break None;
                        }
                        buf.extend_from_slice(&tmp[..n]);
                        remaining -= n as u64;
                    }
                    FrameCheck::Torn => break None,
                }
            };
            let Some((o, timestamp_ns, payload, len)) = frame else {
                // The tail snapshot said this range holds intact frames.
                return Err(VsbError::Corrupt(format!(
                    "frame for offset {expected} unreadable"
                )));
            };
            if o != expected {
                return Err(VsbError::Corrupt(format!(
                    "offset mismatch: frame says {o}, expected {expected}"
                )));
            }
            if !entries.is_empty() && total + payload.len() as u64 > max_bytes {
                break;
            }
            total += payload.len() as u64;
            consumed += len;
            entries.push(Entry::new(o, timestamp_ns, payload));
            if total >= max_bytes {
                break;
            }
            expected += 1;
        }
        Ok(entries)
    }

    /// Seal the block: write the index and footer, flip to `Archived`, and
    /// notify the archived listener. Calling it again is a no-op and leaves
    /// the file byte-identical.
    pub async fn archive(&self) -> Result<()> {
        let mut file = self.writer.lock().await;
        let (state, write_pos, positions) = {
            let tail = self.tail.lock().unwrap();
            match tail.state {
                BlockState::Working => {}
                BlockState::Archived => return Ok(()),
                BlockState::Deleted => return Err(VsbError::Deleted),
            }
            let positions: Vec<(u64, u64)> = tail
                .positions
                .iter()
                .enumerate()
                .map(|(i, &p)| (i as u64, p))
                .collect();
            (tail.state, tail.write_pos, positions)
        };
        debug_assert_eq!(state, BlockState::Working);

        let footer = Footer {
            count: positions.len() as u64,
            index_start: write_pos,
        };
        file.seek(SeekFrom::Start(write_pos)).await?;
        file.write_all(&format::encode_index(&positions)).await?;
        file.write_all(&format::encode_footer(&footer)).await?;
        file.sync_all().await?;

        {
            let mut tail = self.tail.lock().unwrap();
            tail.state = BlockState::Archived;
        }
        debug!(block_id = %self.header.block_id, entries = footer.count, "block archived");
        if let Some(tx) = &self.archived_tx {
            if tx.send(self.header.block_id).await.is_err() {
                warn!(block_id = %self.header.block_id, "archived listener queue closed");
            }
        }
        Ok(())
    }

    /// Unlink the block file. In-flight reads on existing handles finish
    /// normally; new operations fail. Idempotent.
    pub async fn delete(&self) -> Result<()> {
        {
            let mut tail = self.tail.lock().unwrap();
            if tail.state == BlockState::Deleted {
                return Ok(());
            }
            tail.state = BlockState::Deleted;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

async fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        let r = file.read(&mut buf[n..]).await?;
        if r == 0 {
            break;
        }
        n += r;
    }
    Ok(n)
}

async fn read_footer(file: &mut File, file_len: u64) -> Result<Option<Footer>> {
    if file_len < HEADER_SIZE + FOOTER_SIZE {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(file_len - FOOTER_SIZE)).await?;
    let mut buf = vec![0u8; FOOTER_SIZE as usize];
    file.read_exact(&mut buf).await?;
    Ok(format::decode_footer(&buf))
}

async fn load_archived(file: &mut File, file_len: u64, footer: &Footer) -> Result<Tail> {
    let index_len = footer.count * INDEX_ENTRY_SIZE;
    if footer.index_start < HEADER_SIZE
        || footer.index_start + index_len + FOOTER_SIZE != file_len
    {
        return Err(VsbError::Corrupt(format!(
            "footer positions inconsistent: index_start={} count={} len={}",
            footer.index_start, footer.count, file_len
        )));
    }
    file.seek(SeekFrom::Start(footer.index_start)).await?;
    let mut buf = vec![0u8; index_len as usize];
    file.read_exact(&mut buf).await?;
    let index = format::decode_index(&buf, footer.count)?;

    let mut positions = Vec::with_capacity(index.len());
    for (i, &(offset, pos)) in index.iter().enumerate() {
        if offset != i as u64 {
            return Err(VsbError::Corrupt(format!(
                "index offset {offset} at slot {i} is not dense"
            )));
        }
        positions.push(pos);
    }

    // First and last timestamps come from the frames themselves.
    let (mut first_ts, mut last_ts) = (0, 0);
    if let (Some(&first), Some(&last)) = (positions.first(), positions.last()) {
        first_ts = read_frame_timestamp(file, first, footer.index_start).await?;
        last_ts = read_frame_timestamp(file, last, footer.index_start).await?;
    }

    Ok(Tail {
        state: BlockState::Archived,
        last_offset: footer.count as i64 - 1,
        write_pos: footer.index_start,
        positions,
        first_timestamp_ns: first_ts,
        last_timestamp_ns: last_ts,
    })
}

async fn read_frame_timestamp(file: &mut File, pos: u64, limit: u64) -> Result<u64> {
    file.seek(SeekFrom::Start(pos)).await?;
    let span = (limit - pos).min(64 * 1024) as usize;
    let mut buf = vec![0u8; span];
    let n = read_up_to(file, &mut buf).await?;
    match format::decode_frame(&buf[..n]) {
        FrameCheck::Complete { timestamp_ns, .. } => Ok(timestamp_ns),
        FrameCheck::Torn => Err(VsbError::Corrupt(format!(
            "archived frame at {pos} unreadable"
        ))),
    }
}

async fn scan_working(file: &mut File, file_len: u64, id: BlockId) -> Result<Tail> {
    let mut positions = Vec::new();
    let mut pos = HEADER_SIZE;
    let mut first_ts = 0;
    let mut last_ts = 0;
    let mut expected = 0u64;

    file.seek(SeekFrom::Start(pos)).await?;
    let mut buf = BytesMut::new();
    let mut eof = false;
    loop {
        let frame = loop {
            match format::decode_frame(&buf[..]) {
                FrameCheck::Complete {
                    offset,
                    timestamp_ns,
                    payload: _,
                    len,
                } => break Some((offset, timestamp_ns, len)),
                FrameCheck::Torn if !eof => {
                    let mut tmp = vec![0u8; 64 * 1024];
                    let n = file.read(&mut tmp).await?;
                    if n == 0 {
                        eof = true;
                    } else {
                        buf.extend_from_slice(&tmp[..n]);
                    }
                }
                FrameCheck::Torn => break None,
            }
        };
        match frame {
            Some((offset, timestamp_ns, len)) if offset == expected => {
                if expected == 0 {
                    first_ts = timestamp_ns;
                }
                last_ts = timestamp_ns;
                positions.push(pos);
                pos += len;
                let _ = buf.split_to(len as usize);
                expected += 1;
            }
            // A dense-offset violation is treated like a torn frame: the
            // scan stops at the last good position.
            _ => break,
        }
    }

    if pos < file_len {
        warn!(
            block_id = %id,
            safe_pos = pos,
            file_len,
            dropped = file_len - pos,
            "torn tail frame detected, truncating"
        );
        file.set_len(pos).await?;
        file.sync_all().await?;
    }

    Ok(Tail {
        state: BlockState::Working,
        last_offset: expected as i64 - 1,
        write_pos: pos,
        positions,
        first_timestamp_ns: first_ts,
        last_timestamp_ns: last_ts,
    })
}
