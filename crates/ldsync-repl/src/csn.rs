//! Change Sequence Numbers and the per-replica CSN generator.
//!
//! A CSN stamps every replicated change. CSNs are totally ordered by
//! timestamp, then server id, then sequence number, so two changes made in the
//! same millisecond on different replicas still have a strict order.

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ReplError;

/// Identifier of one replica (directory server) within the topology.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(u32);

impl ServerId {
    /// Creates a new ServerId from a raw value.
    pub fn new(id: u32) -> Self {
        ServerId(id)
    }

    /// Returns the raw value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Length of the binary key encoding of a CSN.
pub const CSN_KEY_LEN: usize = 14;

/// A Change Sequence Number.
///
/// Field order matters: the derived `Ord` compares timestamp, then server id,
/// then sequence number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Csn {
    timestamp_ms: i64,
    server_id: ServerId,
    seqnum: u16,
}

impl Csn {
    /// Creates a CSN from its parts.
    pub fn new(timestamp_ms: i64, server_id: ServerId, seqnum: u16) -> Self {
        Self {
            timestamp_ms,
            server_id,
            seqnum,
        }
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Server that generated this CSN.
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Sequence number within the millisecond.
    pub fn seqnum(&self) -> u16 {
        self.seqnum
    }

    /// Returns true if `self` is strictly newer than `other`.
    pub fn newer_than(&self, other: &Csn) -> bool {
        self > other
    }

    /// Big-endian key encoding whose byte order equals CSN order.
    pub fn to_key_bytes(&self) -> [u8; CSN_KEY_LEN] {
        let mut out = [0u8; CSN_KEY_LEN];
        let ts = (self.timestamp_ms as u64) ^ (1u64 << 63);
        out[..8].copy_from_slice(&ts.to_be_bytes());
        out[8..12].copy_from_slice(&self.server_id.0.to_be_bytes());
        out[12..].copy_from_slice(&self.seqnum.to_be_bytes());
        out
    }

    /// Decodes a key produced by [`Csn::to_key_bytes`].
    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self, ReplError> {
        if bytes.len() != CSN_KEY_LEN {
            return Err(ReplError::protocol(format!(
                "CSN key must be {} bytes, got {}",
                CSN_KEY_LEN,
                bytes.len()
            )));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[..8]);
        let mut sid = [0u8; 4];
        sid.copy_from_slice(&bytes[8..12]);
        let mut seq = [0u8; 2];
        seq.copy_from_slice(&bytes[12..]);
        Ok(Self {
            timestamp_ms: (u64::from_be_bytes(ts) ^ (1u64 << 63)) as i64,
            server_id: ServerId(u32::from_be_bytes(sid)),
            seqnum: u16::from_be_bytes(seq),
        })
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:08x}{:04x}",
            self.timestamp_ms as u64, self.server_id.0, self.seqnum
        )
    }
}

impl FromStr for Csn {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 28 || !s.is_ascii() {
            return Err(ReplError::protocol(format!("invalid CSN string: {s:?}")));
        }
        let bad = |_| ReplError::protocol(format!("invalid CSN string: {s:?}"));
        let ts = u64::from_str_radix(&s[..16], 16).map_err(bad)?;
        let sid = u32::from_str_radix(&s[16..24], 16).map_err(bad)?;
        let seq = u16::from_str_radix(&s[24..], 16).map_err(bad)?;
        Ok(Csn::new(ts as i64, ServerId(sid), seq))
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug)]
struct GeneratorState {
    last_ts: i64,
    seqnum: u16,
}

/// Monotonic CSN generator for one replica.
///
/// Constructed once by its Domain and owned by it; never shared between
/// server ids.
#[derive(Debug)]
pub struct CsnGenerator {
    server_id: ServerId,
    state: Mutex<GeneratorState>,
}

impl CsnGenerator {
    /// Creates a generator that has not produced any CSN yet.
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            state: Mutex::new(GeneratorState {
                last_ts: i64::MIN,
                seqnum: 0,
            }),
        }
    }

    /// Creates a generator that will only produce CSNs newer than `last`.
    pub fn resume_after(server_id: ServerId, last: Option<Csn>) -> Self {
        let gen = Self::new(server_id);
        if let Some(csn) = last {
            gen.adjust(&csn);
        }
        gen
    }

    /// Server id stamped into every CSN.
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Returns a fresh CSN using the wall clock.
    pub fn new_csn(&self) -> Csn {
        self.new_csn_at(wall_clock_ms())
    }

    /// Returns a fresh CSN as if the wall clock read `now_ms`.
    ///
    /// If the clock did not advance (or went backwards) the previous
    /// timestamp is reused with the next sequence number.
    pub fn new_csn_at(&self, now_ms: i64) -> Csn {
        let mut state = self.state.lock();
        if now_ms > state.last_ts {
            state.last_ts = now_ms;
            state.seqnum = 0;
        } else if state.seqnum == u16::MAX {
            state.last_ts += 1;
            state.seqnum = 0;
        } else {
            state.seqnum += 1;
        }
        Csn::new(state.last_ts, self.server_id, state.seqnum)
    }

    /// Makes sure every CSN generated from now on is newer than `seen`.
    ///
    /// A lower server id would lose the tie at `seen`'s timestamp, so the
    /// next CSN is pushed into the following millisecond.
    pub fn adjust(&self, seen: &Csn) {
        let mut state = self.state.lock();
        if seen.timestamp_ms >= state.last_ts {
            state.last_ts = seen.timestamp_ms;
            state.seqnum = u16::MAX;
        }
    }
}
