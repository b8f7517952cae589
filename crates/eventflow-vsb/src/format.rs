//! Bit-level codecs for the VSB file format.
//!
//! Everything here is pure byte manipulation; file I/O lives in
//! [`block`](crate::block). All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use eventflow_core::BlockId;

use crate::error::{Result, VsbError};

/// Magic bytes at offset 0: `"VSB0"`.
pub const HEADER_MAGIC: [u8; 4] = *b"VSB0";

/// Magic bytes closing the footer of an archived block: `"VSBT"`.
pub const TRAILER_MAGIC: [u8; 4] = *b"VSBT";

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

/// Fixed header size; the entries region starts here.
pub const HEADER_SIZE: u64 = 4096;

/// Footer size: count (8) + index start (8) + trailer magic (4).
pub const FOOTER_SIZE: u64 = 20;

/// One index entry: offset (8) + file position (8).
pub const INDEX_ENTRY_SIZE: u64 = 16;

/// Frame bytes covered by the length prefix: offset (8) + timestamp (8) +
/// payload length (4), before the payload itself.
pub const FRAME_META_SIZE: u64 = 20;

/// On-disk bytes a frame adds beyond its payload: length prefix (4) +
/// covered metadata + CRC (4).
pub const FRAME_OVERHEAD: u64 = 4 + FRAME_META_SIZE + 4;

/// Decoded 4 KiB header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub flags: u16,
    pub block_id: BlockId,
    pub capacity: u64,
    pub created_ns: u64,
}

pub fn encode_header(h: &Header) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE as usize);
    buf.put_slice(&HEADER_MAGIC);
    buf.put_u16_le(h.version);
    buf.put_u16_le(h.flags);
    buf.put_u64_le(h.block_id.as_u64());
    buf.put_u64_le(h.capacity);
    buf.put_u64_le(h.created_ns);
    buf.resize(HEADER_SIZE as usize, 0);
    buf.freeze()
}

pub fn decode_header(mut buf: &[u8]) -> Result<Header> {
    if buf.len() < HEADER_SIZE as usize {
        return Err(VsbError::CorruptHeader(format!(
            "header too short: {} bytes",
            buf.len()
        )));
    }
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != HEADER_MAGIC {
        return Err(VsbError::CorruptHeader(format!("bad magic {:02X?}", magic)));
    }
    let version = buf.get_u16_le();
    if version != FORMAT_VERSION {
        return Err(VsbError::CorruptHeader(format!(
            "unsupported version {}",
            version
        )));
    }
    let flags = buf.get_u16_le();
    let block_id = BlockId::from_u64(buf.get_u64_le());
    let capacity = buf.get_u64_le();
    let created_ns = buf.get_u64_le();
    Ok(Header {
        version,
        flags,
        block_id,
        capacity,
        created_ns,
    })
}

/// Result of decoding one frame from a byte window.
#[derive(Debug)]
pub enum FrameCheck {
    /// A complete, CRC-valid frame. `len` is the total on-disk size.
    Complete {
        offset: u64,
        timestamp_ns: u64,
        payload: Bytes,
        len: u64,
    },
    /// Short read, impossible length, or CRC mismatch. During recovery a
    /// torn frame and everything after it are treated as absent.
    Torn,
}

pub fn encode_frame(offset: u64, timestamp_ns: u64, payload: &[u8]) -> Bytes {
    let len = FRAME_META_SIZE as u32 + payload.len() as u32;
    let mut buf = BytesMut::with_capacity(4 + len as usize + 4);
    buf.put_u32_le(len);
    buf.put_u64_le(offset);
    buf.put_u64_le(timestamp_ns);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf.freeze()
}

pub fn decode_frame(buf: &[u8]) -> FrameCheck {
    if buf.len() < 4 {
        return FrameCheck::Torn;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64;
    if len < FRAME_META_SIZE {
        return FrameCheck::Torn;
    }
    let total = 4 + len + 4;
    if (buf.len() as u64) < total {
        return FrameCheck::Torn;
    }
    let body = &buf[..(4 + len) as usize];
    let stored_crc = {
        let at = (4 + len) as usize;
        u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    };
    if crc32fast::hash(body) != stored_crc {
        return FrameCheck::Torn;
    }
    let mut cursor = &body[4..];
    let offset = cursor.get_u64_le();
    let timestamp_ns = cursor.get_u64_le();
    let payload_len = cursor.get_u32_le() as u64;
    if payload_len != len - FRAME_META_SIZE {
        return FrameCheck::Torn;
    }
    FrameCheck::Complete {
        offset,
        timestamp_ns,
        payload: Bytes::copy_from_slice(cursor),
        len: total,
    }
}

/// Decoded footer of an archived block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Number of entries, equal to last offset + 1.
    pub count: u64,
    /// File position where the index begins.
    pub index_start: u64,
}

pub fn encode_footer(f: &Footer) -> Bytes {
    let mut buf = BytesMut::with_capacity(FOOTER_SIZE as usize);
    buf.put_u64_le(f.count);
    buf.put_u64_le(f.index_start);
    buf.put_slice(&TRAILER_MAGIC);
    buf.freeze()
}

/// Decode the trailing [`FOOTER_SIZE`] bytes of a file. Returns `None` when
/// the trailer magic is absent, i.e. the block is still `Working`.
pub fn decode_footer(buf: &[u8]) -> Option<Footer> {
    if buf.len() != FOOTER_SIZE as usize || buf[16..20] != TRAILER_MAGIC {
        return None;
    }
    let mut cursor = buf;
    let count = cursor.get_u64_le();
    let index_start = cursor.get_u64_le();
    Some(Footer { count, index_start })
}

pub fn encode_index(positions: &[(u64, u64)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(positions.len() * INDEX_ENTRY_SIZE as usize);
    for &(offset, pos) in positions {
        buf.put_u64_le(offset);
        buf.put_u64_le(pos);
    }
    buf.freeze()
}

pub fn decode_index(mut buf: &[u8], count: u64) -> Result<Vec<(u64, u64)>> {
    if buf.len() as u64 != count * INDEX_ENTRY_SIZE {
        return Err(VsbError::Corrupt(format!(
            "index size {} does not match count {}",
            buf.len(),
            count
        )));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset = buf.get_u64_le();
        let pos = buf.get_u64_le();
        out.push((offset, pos));
    }
    Ok(out)
}
