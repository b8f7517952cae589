//! WAL record framing and replay.
//!
//! Record layout, little-endian:
//!
//! ```text
//! ┌───────────┬──────────┬─────────┬───────────┬─────┬───────┐
//! │ Body Size │ CRC32    │ Op      │ Key Size  │ Key │ Value │
//! │ (4 bytes) │(4 bytes) │(1 byte) │ (4 bytes) │     │       │
//! └───────────┴──────────┴─────────┴───────────┴─────┴───────┘
//! ```
//!
//! The body size covers everything after the CRC; the CRC covers the body.
//! Replay stops and truncates at the first record that is short or fails
//! its CRC — a torn tail from a crash is expected, not an error.
//!
//! A snapshot is the same format: a compacted WAL holding one `Put` per
//! live key, written to a temp file and renamed into place.

use std::collections::BTreeMap;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogOp {
    Put = 1,
    Delete = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub op: LogOp,
    pub key: String,
    pub value: Bytes,
}

impl WalRecord {
    pub fn put(key: impl Into<String>, value: Bytes) -> Self {
        Self {
            op: LogOp::Put,
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op: LogOp::Delete,
            key: key.into(),
            value: Bytes::new(),
        }
    }
}

pub fn encode_record(rec: &WalRecord) -> Bytes {
    let body_len = 1 + 4 + rec.key.len() + rec.value.len();
    let mut body = BytesMut::with_capacity(body_len);
    body.put_u8(rec.op as u8);
    body.put_u32_le(rec.key.len() as u32);
    body.put_slice(rec.key.as_bytes());
    body.put_slice(&rec.value);

    let mut buf = BytesMut::with_capacity(8 + body_len);
    buf.put_u32_le(body_len as u32);
    buf.put_u32_le(crc32fast::hash(&body));
    buf.put_slice(&body);
    buf.freeze()
}

/// Decode one record from the front of `buf`. `None` means the record is
/// torn (short, bad CRC, or malformed) and replay must stop here.
pub fn decode_record(buf: &[u8]) -> Option<(WalRecord, usize)> {
    if buf.len() < 8 {
        return None;
    }
    let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let stored_crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if body_len < 5 || buf.len() < 8 + body_len {
        return None;
    }
    let body = &buf[8..8 + body_len];
    if crc32fast::hash(body) != stored_crc {
        return None;
    }
    let mut cursor = body;
    let op = match cursor.get_u8() {
        1 => LogOp::Put,
        2 => LogOp::Delete,
        _ => return None,
    };
    let key_len = cursor.get_u32_le() as usize;
    if cursor.remaining() < key_len {
        return None;
    }
    let key = match std::str::from_utf8(&cursor[..key_len]) {
        Ok(s) => s.to_string(),
        Err(_) => return None,
    };
    cursor.advance(key_len);
    let value = Bytes::copy_from_slice(cursor);
    Some((WalRecord { op, key, value }, 8 + body_len))
}

/// An open, append-only WAL file.
pub struct Wal {
    file: File,
    size: u64,
}

impl Wal {
    /// Open (creating if absent) and replay the WAL at `path`, applying
    /// records into `state`. A torn tail is truncated away with a warning.
    pub async fn open(path: impl AsRef<Path>, state: &mut BTreeMap<String, Bytes>) -> Result<Wal> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .await?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw).await?;

        let mut pos = 0usize;
        while let Some((rec, len)) = decode_record(&raw[pos..]) {
            apply(state, &rec);
            pos += len;
        }
        if pos < raw.len() {
            warn!(
                path = %path.display(),
                valid = pos,
                dropped = raw.len() - pos,
                "torn record in wal, truncating"
            );
            file.set_len(pos as u64).await?;
            file.sync_all().await?;
        }
        // Leave the cursor at the end for appends.
        use tokio::io::AsyncSeekExt;
        file.seek(std::io::SeekFrom::Start(pos as u64)).await?;

        Ok(Wal {
            file,
            size: pos as u64,
        })
    }

    /// Append records without syncing.
    pub async fn append(&mut self, records: &[WalRecord]) -> Result<()> {
        let mut buf = BytesMut::new();
        for rec in records {
            buf.extend_from_slice(&encode_record(rec));
        }
        self.file.write_all(&buf).await?;
        self.size += buf.len() as u64;
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<()> {
        self.file.sync_data().await?;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Write `state` as a compacted WAL to `snap_path` (via a temp file +
/// rename) and reset the live WAL file at `wal_path` to empty. Returns the
/// fresh `Wal`.
pub async fn rotate(
    snap_path: impl AsRef<Path>,
    wal_path: impl AsRef<Path>,
    state: &BTreeMap<String, Bytes>,
) -> Result<Wal> {
    let snap_path = snap_path.as_ref();
    let tmp = snap_path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).await?;
        let mut buf = BytesMut::new();
        for (key, value) in state {
            buf.extend_from_slice(&encode_record(&WalRecord::put(key.clone(), value.clone())));
        }
        file.write_all(&buf).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp, snap_path).await?;

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .read(true)
        .open(wal_path.as_ref())
        .await?;
    file.sync_all().await?;
    Ok(Wal { file, size: 0 })
}

/// Load a snapshot file into `state`. Missing file is an empty snapshot.
pub async fn load_snapshot(
    path: impl AsRef<Path>,
    state: &mut BTreeMap<String, Bytes>,
) -> Result<()> {
    let raw = match tokio::fs::read(path.as_ref()).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut pos = 0usize;
    while let Some((rec, len)) = decode_record(&raw[pos..]) {
        apply(state, &rec);
        pos += len;
    }
    if pos < raw.len() {
        // The snapshot was written atomically, so a torn record points at
        // real corruption rather than a crash window.
        warn!(
            path = %path.as_ref().display(),
            valid = pos,
            "snapshot has trailing garbage, ignoring remainder"
        );
    }
    Ok(())
}

fn apply(state: &mut BTreeMap<String, Bytes>, rec: &WalRecord) {
    match rec.op {
        LogOp::Put => {
            state.insert(rec.key.clone(), rec.value.clone());
        }
        LogOp::Delete => {
            state.remove(&rec.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_roundtrip() {
        let rec = WalRecord::put("raft/1/hs", Bytes::from(vec![1, 2, 3]));
        let wire = encode_record(&rec);
        let (back, len) = decode_record(&wire).unwrap();
        assert_eq!(back, rec);
        assert_eq!(len, wire.len());
    }

    #[test]
    fn test_delete_record_roundtrip() {
        let rec = WalRecord::delete("block/9/read");
        let (back, _) = decode_record(&encode_record(&rec)).unwrap();
        assert_eq!(back.op, LogOp::Delete);
        assert_eq!(back.key, "block/9/read");
        assert!(back.value.is_empty());
    }

    #[test]
    fn test_torn_prefixes_rejected() {
        let wire = encode_record(&WalRecord::put("k", Bytes::from("value")));
        for cut in 0..wire.len() {
            assert!(decode_record(&wire[..cut]).is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn test_crc_flip_rejected() {
        let mut wire = encode_record(&WalRecord::put("k", Bytes::from("value"))).to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0x40;
        assert!(decode_record(&wire).is_none());
    }

    #[tokio::test]
    async fn test_wal_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        {
            let mut state = BTreeMap::new();
            let mut wal = Wal::open(&path, &mut state).await.unwrap();
            wal.append(&[
                WalRecord::put("a", Bytes::from("1")),
                WalRecord::put("b", Bytes::from("2")),
                WalRecord::put("a", Bytes::from("3")),
                WalRecord::delete("b"),
            ])
            .await
            .unwrap();
            wal.sync().await.unwrap();
        }

        let mut state = BTreeMap::new();
        let wal = Wal::open(&path, &mut state).await.unwrap();
        assert_eq!(state.get("a"), Some(&Bytes::from("3")));
        assert_eq!(state.get("b"), None);
        assert!(wal.size() > 0);
    }

    #[tokio::test]
    async fn test_wal_truncates_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        {
            let mut state = BTreeMap::new();
            let mut wal = Wal::open(&path, &mut state).await.unwrap();
            wal.append(&[
                WalRecord::put("keep-1", Bytes::from("x")),
                WalRecord::put("keep-2", Bytes::from("y")),
            ])
            .await
            .unwrap();
            wal.sync().await.unwrap();
        }

        // Simulate a crash mid-append: half a record at the tail.
        let partial = encode_record(&WalRecord::put("torn", Bytes::from("zzzz")));
        let mut raw = std::fs::read(&path).unwrap();
        let intact_len = raw.len();
        raw.extend_from_slice(&partial[..partial.len() / 2]);
        std::fs::write(&path, &raw).unwrap();

        let mut state = BTreeMap::new();
        let mut wal = Wal::open(&path, &mut state).await.unwrap();
        assert_eq!(state.len(), 2);
        assert!(state.contains_key("keep-1"));
        assert!(state.contains_key("keep-2"));
        assert_eq!(wal.size(), intact_len as u64);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact_len as u64);

        // Appends continue at the truncation point without key loss.
        wal.append(&[WalRecord::put("after", Bytes::from("ok"))])
            .await
            .unwrap();
        wal.sync().await.unwrap();

        let mut state = BTreeMap::new();
        Wal::open(&path, &mut state).await.unwrap();
        assert_eq!(state.len(), 3);
        assert!(state.contains_key("after"));
    }

    #[tokio::test]
    async fn test_rotate_and_load_snapshot() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("wal");
        let snap_path = dir.path().join("snap");

        let mut state = BTreeMap::new();
        let mut wal = Wal::open(&wal_path, &mut state).await.unwrap();
        for i in 0..10 {
            let rec = WalRecord::put(format!("key-{i}"), Bytes::from(format!("v{i}")));
            apply(&mut state, &rec);
            wal.append(&[rec]).await.unwrap();
        }
        wal.sync().await.unwrap();

        let wal = rotate(&snap_path, &wal_path, &state).await.unwrap();
        assert_eq!(wal.size(), 0);
        assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), 0);

        let mut loaded = BTreeMap::new();
        load_snapshot(&snap_path, &mut loaded).await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_load_missing_snapshot_is_empty() {
        let dir = tempdir().unwrap();
        let mut state = BTreeMap::new();
        load_snapshot(dir.path().join("snap"), &mut state)
            .await
            .unwrap();
        assert!(state.is_empty());
    }
}
