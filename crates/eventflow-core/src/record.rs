//! Record types.
//!
//! An [`AppendRecord`] is what a producer hands to the store: an optional
//! record key, a timestamp, and opaque value bytes. It travels through Raft
//! as the proposal payload and is re-encoded verbatim into the block file,
//! so the wire encoding here must stay stable.
//!
//! An [`Entry`] is what a read returns: the record's dense offset within the
//! block plus the raw payload bytes as they were appended. The block engine
//! never interprets payload bytes; decoding back to an `AppendRecord` is the
//! caller's business.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A record as submitted for append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRecord {
    /// Optional key; producers use it for partitioning and as an
    /// idempotency handle on retry.
    pub key: Option<Bytes>,

    /// Event time in nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,

    /// Opaque value bytes.
    pub value: Bytes,
}

impl AppendRecord {
    pub fn new(key: Option<Bytes>, timestamp_ns: u64, value: Bytes) -> Self {
        Self {
            key,
            timestamp_ns,
            value,
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        8 + 4 + self.key.as_ref().map(|k| k.len()).unwrap_or(0) + 4 + self.value.len()
    }

    /// Encode into the stable wire form:
    /// `timestamp(8) | key_len(4) | key | value_len(4) | value`,
    /// little-endian. A key length of zero means "no key".
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u64_le(self.timestamp_ns);
        match &self.key {
            Some(k) => {
                buf.put_u32_le(k.len() as u32);
                buf.put_slice(k);
            }
            None => buf.put_u32_le(0),
        }
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(&self.value);
        buf.freeze()
    }

    /// Decode from the wire form produced by [`encode`](Self::encode).
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < 8 + 4 {
            return Err(Error::InvalidRequest("record too short".into()));
        }
        let timestamp_ns = buf.get_u64_le();
        let key_len = buf.get_u32_le() as usize;
        if buf.remaining() < key_len + 4 {
            return Err(Error::InvalidRequest("record key truncated".into()));
        }
        let key = if key_len > 0 {
            Some(buf.copy_to_bytes(key_len))
        } else {
            None
        };
        let value_len = buf.get_u32_le() as usize;
        if buf.remaining() != value_len {
            return Err(Error::InvalidRequest("record value truncated".into()));
        }
        let value = buf.copy_to_bytes(value_len);
        Ok(Self {
            key,
            timestamp_ns,
            value,
        })
    }
}

/// A record as stored in a block, addressed by its offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Dense offset within the block, starting at 0.
    pub offset: u64,

    /// Append time in nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,

    /// Payload bytes exactly as appended.
    pub payload: Bytes,
}

impl Entry {
    pub fn new(offset: u64, timestamp_ns: u64, payload: Bytes) -> Self {
        Self {
            offset,
            timestamp_ns,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_with_key() {
        let rec = AppendRecord::new(
            Some(Bytes::from("order-42")),
            1_700_000_000_000_000_000,
            Bytes::from(r#"{"state":"paid"}"#),
        );
        let wire = rec.encode();
        assert_eq!(wire.len(), rec.encoded_len());
        let back = AppendRecord::decode(wire).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_roundtrip_without_key() {
        let rec = AppendRecord::new(None, 7, Bytes::from("v"));
        let back = AppendRecord::decode(rec.encode()).unwrap();
        assert_eq!(back, rec);
        assert!(back.key.is_none());
    }

    #[test]
    fn test_empty_value() {
        let rec = AppendRecord::new(Some(Bytes::from("k")), 0, Bytes::new());
        let back = AppendRecord::decode(rec.encode()).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_decode_too_short() {
        let err = AppendRecord::decode(Bytes::from_static(&[0u8; 4])).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_decode_truncated_value() {
        let rec = AppendRecord::new(None, 1, Bytes::from("hello"));
        let wire = rec.encode();
        let cut = wire.slice(..wire.len() - 2);
        let err = AppendRecord::decode(cut).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_decode_trailing_garbage_rejected() {
        let rec = AppendRecord::new(None, 1, Bytes::from("x"));
        let mut wire = BytesMut::from(&rec.encode()[..]);
        wire.put_u8(0xFF);
        let err = AppendRecord::decode(wire.freeze()).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_entry_fields() {
        let e = Entry::new(3, 99, Bytes::from("payload"));
        assert_eq!(e.offset, 3);
        assert_eq!(e.timestamp_ns, 99);
        assert_eq!(e.payload, Bytes::from("payload"));
    }
}
