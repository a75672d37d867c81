//! Session liveness tracking.
//!
//! Both ends of a session tick a [`HeartbeatMonitor`] once per heartbeat
//! interval. A tick with no inbound traffic since the previous tick counts as
//! a missed heartbeat; `max_missed` consecutive misses declare the session
//! dead. A tick with no outbound traffic means a `Heartbeat` must be sent.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const STATE_ACTIVE: u8 = 0;
const STATE_WARNING: u8 = 1;
const STATE_DEAD: u8 = 2;

/// Liveness of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatState {
    /// Traffic seen during the last interval.
    Active,
    /// At least one interval without traffic.
    Warning,
    /// `max_missed` intervals without traffic.
    Dead,
}

impl From<u8> for HeartbeatState {
    fn from(raw: u8) -> Self {
        match raw {
            STATE_WARNING => HeartbeatState::Warning,
            STATE_DEAD => HeartbeatState::Dead,
            _ => HeartbeatState::Active,
        }
    }
}

impl From<HeartbeatState> for u8 {
    fn from(state: HeartbeatState) -> Self {
        match state {
            HeartbeatState::Active => STATE_ACTIVE,
            HeartbeatState::Warning => STATE_WARNING,
            HeartbeatState::Dead => STATE_DEAD,
        }
    }
}

/// Heartbeat timing of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between ticks.
    pub interval: Duration,
    /// Missed intervals before the session is dead.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_missed: 3,
        }
    }
}

impl HeartbeatConfig {
    /// Silence after which the session is declared dead.
    pub fn timeout(&self) -> Duration {
        self.interval * self.max_missed
    }
}

/// Heartbeat counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatStats {
    /// Current state.
    pub state: u8,
    /// Consecutive missed intervals.
    pub missed_count: u32,
    /// Heartbeats sent.
    pub total_sent: u64,
    /// Messages received (of any kind).
    pub total_received: u64,
    /// Intervals that passed without inbound traffic.
    pub total_missed: u64,
}

/// Liveness tracker of one session.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: AtomicU8,
    missed_count: AtomicU32,
    inbound_seen: AtomicBool,
    outbound_seen: AtomicBool,
    total_sent: AtomicU64,
    total_received: AtomicU64,
    total_missed: AtomicU64,
}

impl HeartbeatMonitor {
    /// Creates a monitor in `Active` state.
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(STATE_ACTIVE),
            missed_count: AtomicU32::new(0),
            inbound_seen: AtomicBool::new(false),
            outbound_seen: AtomicBool::new(false),
            total_sent: AtomicU64::new(0),
            total_received: AtomicU64::new(0),
            total_missed: AtomicU64::new(0),
        }
    }

    /// Timing of this monitor.
    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> HeartbeatState {
        HeartbeatState::from(self.state.load(Ordering::SeqCst))
    }

    /// Records inbound traffic; any message proves liveness.
    pub fn record_received(&self) {
        self.total_received.fetch_add(1, Ordering::Relaxed);
        self.inbound_seen.store(true, Ordering::SeqCst);
    }

    /// Records outbound traffic.
    pub fn record_sent(&self) {
        self.outbound_seen.store(true, Ordering::SeqCst);
    }

    /// Records that a heartbeat was sent.
    pub fn record_heartbeat_sent(&self) {
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        self.record_sent();
    }

    /// Closes one interval and returns the resulting state.
    pub fn tick(&self) -> HeartbeatState {
        if self.inbound_seen.swap(false, Ordering::SeqCst) {
            self.missed_count.store(0, Ordering::SeqCst);
            self.state.store(STATE_ACTIVE, Ordering::SeqCst);
            return HeartbeatState::Active;
        }
        self.total_missed.fetch_add(1, Ordering::Relaxed);
        let missed = self.missed_count.fetch_add(1, Ordering::SeqCst) + 1;
        let state = if missed >= self.config.max_missed {
            HeartbeatState::Dead
        } else {
            HeartbeatState::Warning
        };
        self.state.store(state.into(), Ordering::SeqCst);
        state
    }

    /// True when nothing was sent during the interval just closed.
    ///
    /// Resets the outbound flag.
    pub fn heartbeat_due(&self) -> bool {
        !self.outbound_seen.swap(false, Ordering::SeqCst)
    }

    /// True unless the session is dead.
    pub fn is_alive(&self) -> bool {
        self.state() != HeartbeatState::Dead
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            state: self.state.load(Ordering::SeqCst),
            missed_count: self.missed_count.load(Ordering::SeqCst),
            total_sent: self.total_sent.load(Ordering::Relaxed),
            total_received: self.total_received.load(Ordering::Relaxed),
            total_missed: self.total_missed.load(Ordering::Relaxed),
        }
    }
}
