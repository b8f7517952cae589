//! Cluster-wide 64-bit identifiers.
//!
//! Every durable object in EventFlow (blocks, segments, volumes, servers,
//! eventlogs) is named by a 64-bit ID allocated by a snowflake-style
//! generator:
//!
//! ```text
//! | 41 bits ms since epoch | 5 bits service kind | 10 bits instance | 8 bits sequence |
//! ```
//!
//! IDs are monotonic within one instance and unique cluster-wide as long as
//! instance numbers are distinct. The generator is a process global with an
//! explicit [`init`]/[`destroy`] lifecycle; allocating before `init` is a
//! [`Fatal`](crate::Error::Fatal) error, never a silent zero.

use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Custom epoch for the timestamp field: 2022-01-01T00:00:00Z.
const EPOCH_MS: u64 = 1_640_995_200_000;

const KIND_BITS: u32 = 5;
const INSTANCE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 8;

const INSTANCE_SHIFT: u32 = SEQUENCE_BITS;
const KIND_SHIFT: u32 = SEQUENCE_BITS + INSTANCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + INSTANCE_BITS + KIND_BITS;

const MAX_INSTANCE: u16 = (1 << INSTANCE_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

/// Which service allocated an ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceKind {
    Controller = 0x01,
    Store = 0x02,
    Trigger = 0x03,
    Gateway = 0x04,
    /// Reserved for debug mode and tests.
    Test = 0x1F,
}

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const NONE: $name = $name(0);

            pub const fn from_u64(v: u64) -> Self {
                $name(v)
            }

            pub const fn as_u64(self) -> u64 {
                self.0
            }

            pub const fn is_none(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:016X}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                $name(v)
            }
        }
    };
}

define_id!(
    /// Identifier of a single on-disk block (one replica of a segment).
    BlockId
);
define_id!(
    /// Identifier of a segment; doubles as the Raft group ID of its replicas.
    SegmentId
);
define_id!(
    /// Identifier of a server's storage volume.
    VolumeId
);
define_id!(
    /// Identifier assigned to a segment server by the controller.
    ServerId
);
define_id!(
    /// Identifier of an eventlog (ordered list of segments).
    EventlogId
);

struct Generator {
    kind: ServiceKind,
    instance: u16,
    last_ms: u64,
    sequence: u16,
}

impl Generator {
    fn next(&mut self) -> u64 {
        let mut now = now_ms();
        if now < self.last_ms {
            // Clock went backwards; hold the line at the last timestamp so
            // IDs stay monotonic.
            now = self.last_ms;
        }
        if now == self.last_ms {
            if self.sequence == MAX_SEQUENCE {
                // Sequence exhausted within this millisecond.
                while now <= self.last_ms {
                    now = now_ms();
                }
                self.last_ms = now;
                self.sequence = 0;
            } else {
                self.sequence += 1;
            }
        } else {
            self.last_ms = now;
            self.sequence = 0;
        }
        compose(now, self.kind, self.instance, self.sequence)
    }
}

fn compose(now_ms: u64, kind: ServiceKind, instance: u16, sequence: u16) -> u64 {
    let ts = now_ms.saturating_sub(EPOCH_MS);
    (ts << TIMESTAMP_SHIFT)
        | ((kind as u64) << KIND_SHIFT)
        | ((instance as u64 & MAX_INSTANCE as u64) << INSTANCE_SHIFT)
        | (sequence as u64 & MAX_SEQUENCE as u64)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

static GENERATOR: Mutex<Option<Generator>> = Mutex::new(None);

/// Initialize the process-wide ID generator. Idempotent for identical
/// arguments; re-initializing with a different identity is an error.
pub fn init(kind: ServiceKind, instance: u16) -> Result<()> {
    if instance > MAX_INSTANCE {
        return Err(Error::InvalidRequest(format!(
            "instance {} exceeds {} bits",
            instance, INSTANCE_BITS
        )));
    }
    let mut guard = GENERATOR.lock().unwrap();
    if let Some(g) = guard.as_ref() {
        if g.kind == kind && g.instance == instance {
            return Ok(());
        }
        return Err(Error::Fatal(
            "id generator already initialized with a different identity".into(),
        ));
    }
    *guard = Some(Generator {
        kind,
        instance,
        last_ms: 0,
        sequence: 0,
    });
    Ok(())
}

/// Tear down the process-wide generator. Safe to call when not initialized.
pub fn destroy() {
    *GENERATOR.lock().unwrap() = None;
}

/// Allocate the next ID. Fails `Fatal` if [`init`] has not been called.
pub fn next_id() -> Result<u64> {
    let mut guard = GENERATOR.lock().unwrap();
    match guard.as_mut() {
        Some(g) => Ok(g.next()),
        None => Err(Error::Fatal("id generator used before init".into())),
    }
}

/// Allocate an ID for debug mode without touching the process global.
///
/// Debug-mode servers skip controller registration and therefore never learn
/// a real instance number; the `Test` kind keeps such IDs out of the
/// production namespace.
pub fn new_test_id() -> u64 {
    compose(now_ms(), ServiceKind::Test, 0, 0)
}
