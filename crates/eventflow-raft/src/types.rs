//! Raft wire and storage types.
//!
//! Node IDs are block IDs: each replica of a segment participates in the
//! group under its own block's 64-bit ID. Messages are hand-encoded,
//! little-endian, behind the transport's 4-byte length prefix; byte strings
//! carry their own 4-byte length.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RaftError, Result};

/// Persistent per-group state that must be durable before any message that
/// reflects it leaves the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardState {
    pub term: u64,
    /// Node voted for in `term`; 0 for none.
    pub vote: u64,
    pub commit: u64,
}

/// Group membership.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfState {
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
}

impl ConfState {
    pub fn contains(&self, id: u64) -> bool {
        self.voters.contains(&id) || self.learners.contains(&id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    Normal = 0,
    ConfChange = 1,
    /// Empty entry a fresh leader appends to commit prior-term entries.
    Noop = 2,
}

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub kind: EntryKind,
    pub payload: Bytes,
}

/// Single-step membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfChange {
    pub kind: ConfChangeKind,
    pub node: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfChangeKind {
    /// New node joins with no vote; it catches up first.
    AddLearner = 0,
    /// Promote a caught-up learner (or add directly) to voter.
    AddVoter = 1,
    RemoveNode = 2,
}

/// Reference-style snapshot: the follower fetches the block's bytes over
/// the bulk transport instead of copying them through the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub last_index: u64,
    pub last_term: u64,
    /// Last block offset covered by `last_index`; -1 for an empty block.
    pub block_offset: i64,
    /// CRC32 of the block file prefix the snapshot refers to.
    pub block_crc: u32,
    pub conf: ConfState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    PreVote { last_index: u64, last_term: u64 },
    PreVoteResp { granted: bool },
    Vote { last_index: u64, last_term: u64 },
    VoteResp { granted: bool },
    AppendEntries {
        prev_index: u64,
        prev_term: u64,
        commit: u64,
        entries: Vec<LogEntry>,
    },
    AppendResp { success: bool, match_index: u64 },
    Heartbeat { commit: u64 },
    HeartbeatResp { match_index: u64 },
    InstallSnapshot { meta: SnapshotMeta },
    SnapshotResp { success: bool, last_index: u64 },
}

/// A routed Raft message. `to`/`from` are block IDs; the transport maps
/// `to` to an endpoint through the engine's peer table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: u64,
    pub to: u64,
    pub term: u64,
    pub kind: MessageKind,
}

const K_PRE_VOTE: u8 = 1;
const K_PRE_VOTE_RESP: u8 = 2;
const K_VOTE: u8 = 3;
const K_VOTE_RESP: u8 = 4;
const K_APPEND: u8 = 5;
const K_APPEND_RESP: u8 = 6;
const K_HEARTBEAT: u8 = 7;
const K_HEARTBEAT_RESP: u8 = 8;
const K_SNAPSHOT: u8 = 9;
const K_SNAPSHOT_RESP: u8 = 10;

pub fn encode_entry(buf: &mut BytesMut, e: &LogEntry) {
    buf.put_u64_le(e.term);
    buf.put_u64_le(e.index);
    buf.put_u8(e.kind as u8);
    buf.put_u32_le(e.payload.len() as u32);
    buf.put_slice(&e.payload);
}

pub fn decode_entry(buf: &mut Bytes) -> Result<LogEntry> {
    if buf.remaining() < 8 + 8 + 1 + 4 {
        return Err(RaftError::Codec("entry header short".into()));
    }
    let term = buf.get_u64_le();
    let index = buf.get_u64_le();
    let kind = match buf.get_u8() {
        0 => EntryKind::Normal,
        1 => EntryKind::ConfChange,
        2 => EntryKind::Noop,
        k => return Err(RaftError::Codec(format!("bad entry kind {k}"))),
    };
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(RaftError::Codec("entry payload short".into()));
    }
    let payload = buf.copy_to_bytes(len);
    Ok(LogEntry {
        term,
        index,
        kind,
        payload,
    })
}

/// Storage form of a [`LogEntry`] (the index is in the key).
pub fn encode_entry_value(e: &LogEntry) -> Bytes {
    let mut buf = BytesMut::with_capacity(17 + e.payload.len());
    encode_entry(&mut buf, e);
    buf.freeze()
}

pub fn decode_entry_value(raw: Bytes) -> Result<LogEntry> {
    let mut buf = raw;
    let e = decode_entry(&mut buf)?;
    if buf.has_remaining() {
        return Err(RaftError::Codec("entry trailing bytes".into()));
    }
    Ok(e)
}

impl ConfChange {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(self.kind as u8);
        buf.put_u64_le(self.node);
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> Result<Self> {
        if raw.remaining() != 9 {
            return Err(RaftError::Codec("bad conf change size".into()));
        }
        let kind = match raw.get_u8() {
            0 => ConfChangeKind::AddLearner,
            1 => ConfChangeKind::AddVoter,
            2 => ConfChangeKind::RemoveNode,
            k => return Err(RaftError::Codec(format!("bad conf change kind {k}"))),
        };
        Ok(Self {
            kind,
            node: raw.get_u64_le(),
        })
    }
}

fn encode_conf_state(buf: &mut BytesMut, cs: &ConfState) {
    buf.put_u32_le(cs.voters.len() as u32);
    for v in &cs.voters {
        buf.put_u64_le(*v);
    }
    buf.put_u32_le(cs.learners.len() as u32);
    for l in &cs.learners {
        buf.put_u64_le(*l);
    }
}

fn decode_conf_state(buf: &mut Bytes) -> Result<ConfState> {
    let mut read_list = |buf: &mut Bytes| -> Result<Vec<u64>> {
        if buf.remaining() < 4 {
            return Err(RaftError::Codec("conf state short".into()));
        }
        let n = buf.get_u32_le() as usize;
        if buf.remaining() < n * 8 {
            return Err(RaftError::Codec("conf state short".into()));
        }
        Ok((0..n).map(|_| buf.get_u64_le()).collect())
    };
    Ok(ConfState {
        voters: read_list(buf)?,
        learners: read_list(buf)?,
    })
}

impl HardState {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.vote);
        buf.put_u64_le(self.commit);
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> Result<Self> {
        if raw.remaining() != 24 {
            return Err(RaftError::Codec("bad hard state size".into()));
        }
        Ok(Self {
            term: raw.get_u64_le(),
            vote: raw.get_u64_le(),
            commit: raw.get_u64_le(),
        })
    }
}

impl ConfState {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        encode_conf_state(&mut buf, self);
        buf.freeze()
    }

    pub fn decode(raw: Bytes) -> Result<Self> {
        let mut buf = raw;
        let cs = decode_conf_state(&mut buf)?;
        if buf.has_remaining() {
            return Err(RaftError::Codec("conf state trailing bytes".into()));
        }
        Ok(cs)
    }
}

impl SnapshotMeta {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.last_index);
        buf.put_u64_le(self.last_term);
        buf.put_i64_le(self.block_offset);
        buf.put_u32_le(self.block_crc);
        encode_conf_state(&mut buf, &self.conf);
        buf.freeze()
    }

    pub fn decode(raw: Bytes) -> Result<Self> {
        let mut buf = raw;
        if buf.remaining() < 28 {
            return Err(RaftError::Codec("snapshot meta short".into()));
        }
        let last_index = buf.get_u64_le();
        let last_term = buf.get_u64_le();
        let block_offset = buf.get_i64_le();
        let block_crc = buf.get_u32_le();
        let conf = decode_conf_state(&mut buf)?;
        if buf.has_remaining() {
            return Err(RaftError::Codec("snapshot meta trailing bytes".into()));
        }
        Ok(Self {
            last_index,
            last_term,
            block_offset,
            block_crc,
            conf,
        })
    }
}

impl Message {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.from);
        buf.put_u64_le(self.to);
        buf.put_u64_le(self.term);
        match &self.kind {
            MessageKind::PreVote {
                last_index,
                last_term,
            } => {
                buf.put_u8(K_PRE_VOTE);
                buf.put_u64_le(*last_index);
                buf.put_u64_le(*last_term);
            }
            MessageKind::PreVoteResp { granted } => {
                buf.put_u8(K_PRE_VOTE_RESP);
                buf.put_u8(*granted as u8);
            }
            MessageKind::Vote {
                last_index,
                last_term,
            } => {
                buf.put_u8(K_VOTE);
                buf.put_u64_le(*last_index);
                buf.put_u64_le(*last_term);
            }
            MessageKind::VoteResp { granted } => {
                buf.put_u8(K_VOTE_RESP);
                buf.put_u8(*granted as u8);
            }
            MessageKind::AppendEntries {
                prev_index,
                prev_term,
                commit,
                entries,
            } => {
                buf.put_u8(K_APPEND);
                buf.put_u64_le(*prev_index);
                buf.put_u64_le(*prev_term);
                buf.put_u64_le(*commit);
                buf.put_u32_le(entries.len() as u32);
                for e in entries {
                    encode_entry(&mut buf, e);
                }
            }
            MessageKind::AppendResp {
                success,
                match_index,
            } => {
                buf.put_u8(K_APPEND_RESP);
                buf.put_u8(*success as u8);
                buf.put_u64_le(*match_index);
            }
            MessageKind::Heartbeat { commit } => {
                buf.put_u8(K_HEARTBEAT);
                buf.put_u64_le(*commit);
            }
            MessageKind::HeartbeatResp { match_index } => {
                buf.put_u8(K_HEARTBEAT_RESP);
                buf.put_u64_le(*match_index);
            }
            MessageKind::InstallSnapshot { meta } => {
                buf.put_u8(K_SNAPSHOT);
                let enc = meta.encode();
                buf.put_u32_le(enc.len() as u32);
                buf.put_slice(&enc);
            }
            MessageKind::SnapshotResp {
                success,
                last_index,
            } => {
                buf.put_u8(K_SNAPSHOT_RESP);
                buf.put_u8(*success as u8);
                buf.put_u64_le(*last_index);
            }
        }
        buf.freeze()
    }

    pub fn decode(raw: Bytes) -> Result<Self> {
        let mut buf = raw;
        if buf.remaining() < 25 {
            return Err(RaftError::Codec("message header short".into()));
        }
        let from = buf.get_u64_le();
        let to = buf.get_u64_le();
        let term = buf.get_u64_le();
        let tag = buf.get_u8();
        let need = |buf: &Bytes, n: usize| -> Result<()> {
            if buf.remaining() < n {
                Err(RaftError::Codec(format!("message body short for tag {tag}")))
            } else {
                Ok(())
            }
        };
        let kind = match tag {
            K_PRE_VOTE => {
                need(&buf, 16)?;
                MessageKind::PreVote {
                    last_index: buf.get_u64_le(),
                    last_term: buf.get_u64_le(),
                }
            }
            K_PRE_VOTE_RESP => {
                need(&buf, 1)?;
                MessageKind::PreVoteResp {
                    granted: buf.get_u8() != 0,
                }
            }
            K_VOTE => {
                need(&buf, 16)?;
                MessageKind::Vote {
                    last_index: buf.get_u64_le(),
                    last_term: buf.get_u64_le(),
                }
            }
            K_VOTE_RESP => {
                need(&buf, 1)?;
                MessageKind::VoteResp {
                    granted: buf.get_u8() != 0,
                }
            }
            K_APPEND => {
                need(&buf, 28)?;
                let prev_index = buf.get_u64_le();
                let prev_term = buf.get_u64_le();
                let commit = buf.get_u64_le();
                let n = buf.get_u32_le() as usize;
                let mut entries = Vec::with_capacity(n.min(4096));
                for _ in 0..n {
                    entries.push(decode_entry(&mut buf)?);
                }
                MessageKind::AppendEntries {
                    prev_index,
                    prev_term,
                    commit,
                    entries,
                }
            }
            K_APPEND_RESP => {
                need(&buf, 9)?;
                MessageKind::AppendResp {
                    success: buf.get_u8() != 0,
                    match_index: buf.get_u64_le(),
                }
            }
            K_HEARTBEAT => {
                need(&buf, 8)?;
                MessageKind::Heartbeat {
                    commit: buf.get_u64_le(),
                }
            }
            K_HEARTBEAT_RESP => {
                need(&buf, 8)?;
                MessageKind::HeartbeatResp {
                    match_index: buf.get_u64_le(),
                }
            }
            K_SNAPSHOT => {
                need(&buf, 4)?;
                let len = buf.get_u32_le() as usize;
                need(&buf, len)?;
                let meta = SnapshotMeta::decode(buf.copy_to_bytes(len))?;
                MessageKind::InstallSnapshot { meta }
            }
            K_SNAPSHOT_RESP => {
                need(&buf, 9)?;
                MessageKind::SnapshotResp {
                    success: buf.get_u8() != 0,
                    last_index: buf.get_u64_le(),
                }
            }
            t => return Err(RaftError::Codec(format!("unknown message tag {t}"))),
        };
        Ok(Self {
            from,
            to,
            term,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let wire = msg.encode();
        let back = Message::decode(wire).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_message_roundtrips() {
        roundtrip(Message {
            from: 1,
            to: 2,
            term: 3,
            kind: MessageKind::PreVote {
                last_index: 10,
                last_term: 2,
            },
        });
        roundtrip(Message {
            from: 2,
            to: 1,
            term: 3,
            kind: MessageKind::PreVoteResp { granted: true },
        });
        roundtrip(Message {
            from: 1,
            to: 2,
            term: 4,
            kind: MessageKind::Vote {
                last_index: 10,
                last_term: 2,
            },
        });
        roundtrip(Message {
            from: 2,
            to: 1,
            term: 4,
            kind: MessageKind::VoteResp { granted: false },
        });
        roundtrip(Message {
            from: 1,
            to: 3,
            term: 4,
            kind: MessageKind::Heartbeat { commit: 42 },
        });
        roundtrip(Message {
            from: 3,
            to: 1,
            term: 4,
            kind: MessageKind::HeartbeatResp { match_index: 40 },
        });
        roundtrip(Message {
            from: 1,
            to: 3,
            term: 4,
            kind: MessageKind::AppendResp {
                success: true,
                match_index: 17,
            },
        });
        roundtrip(Message {
            from: 1,
            to: 3,
            term: 9,
            kind: MessageKind::SnapshotResp {
                success: false,
                last_index: 0,
            },
        });
    }

    #[test]
    fn test_append_entries_roundtrip() {
        let entries = vec![
            LogEntry {
                term: 4,
                index: 11,
                kind: EntryKind::Normal,
                payload: Bytes::from("first"),
            },
            LogEntry {
                term: 4,
                index: 12,
                kind: EntryKind::ConfChange,
                payload: ConfChange {
                    kind: ConfChangeKind::AddLearner,
                    node: 77,
                }
                .encode(),
            },
            LogEntry {
                term: 4,
                index: 13,
                kind: EntryKind::Normal,
                payload: Bytes::new(),
            },
        ];
        roundtrip(Message {
            from: 1,
            to: 2,
            term: 4,
            kind: MessageKind::AppendEntries {
                prev_index: 10,
                prev_term: 3,
                commit: 9,
                entries,
            },
        });
    }

    #[test]
    fn test_install_snapshot_roundtrip() {
        roundtrip(Message {
            from: 1,
            to: 2,
            term: 7,
            kind: MessageKind::InstallSnapshot {
                meta: SnapshotMeta {
                    last_index: 100,
                    last_term: 6,
                    block_offset: 99,
                    block_crc: 0xDEAD_BEEF,
                    conf: ConfState {
                        voters: vec![1, 2, 3],
                        learners: vec![4],
                    },
                },
            },
        });
    }

    #[test]
    fn test_hard_state_roundtrip() {
        let hs = HardState {
            term: 5,
            vote: 2,
            commit: 42,
        };
        assert_eq!(HardState::decode(hs.encode()).unwrap(), hs);
    }

    #[test]
    fn test_conf_state_roundtrip() {
        let cs = ConfState {
            voters: vec![10, 20, 30],
            learners: vec![40],
        };
        assert_eq!(ConfState::decode(cs.encode()).unwrap(), cs);
        assert!(cs.contains(20));
        assert!(cs.contains(40));
        assert!(!cs.contains(50));
    }

    #[test]
    fn test_conf_change_roundtrip() {
        for kind in [
            ConfChangeKind::AddLearner,
            ConfChangeKind::AddVoter,
            ConfChangeKind::RemoveNode,
        ] {
            let cc = ConfChange { kind, node: 9 };
            assert_eq!(ConfChange::decode(cc.encode()).unwrap(), cc);
        }
    }

    #[test]
    fn test_entry_value_roundtrip() {
        let e = LogEntry {
            term: 1,
            index: 2,
            kind: EntryKind::Normal,
            payload: Bytes::from("payload"),
        };
        assert_eq!(decode_entry_value(encode_entry_value(&e)).unwrap(), e);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Message::decode(Bytes::from_static(b"short")).is_err());
        let mut wire = Message {
            from: 1,
            to: 2,
            term: 3,
            kind: MessageKind::Heartbeat { commit: 1 },
        }
        .encode()
        .to_vec();
        wire[24] = 0xEE; // unknown tag
        assert!(Message::decode(Bytes::from(wire)).is_err());
    }
}
