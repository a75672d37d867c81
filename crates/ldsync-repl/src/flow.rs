//! Credit-based flow control of update streams.
//!
//! Each side announces a window in its handshake. The sender holds one
//! credit per update it may still send; the receiver returns credits with
//! `WindowAck` once it has processed half a window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{ReplError, Result};

/// Default window (updates in flight per direction).
pub const DEFAULT_WINDOW: u32 = 100;

/// Sending half: suspends once the peer's window is exhausted.
#[derive(Debug, Clone)]
pub struct SendWindow {
    credits: Arc<Semaphore>,
    window: u32,
    sent: Arc<AtomicU64>,
}

impl SendWindow {
    /// Creates a window of `window` credits.
    pub fn new(window: u32) -> Self {
        Self {
            credits: Arc::new(Semaphore::new(window as usize)),
            window,
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Window announced by the peer.
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Credits currently available.
    pub fn available(&self) -> usize {
        self.credits.available_permits()
    }

    /// Updates sent through this window.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Takes one credit, waiting for a `WindowAck` if none is left.
    pub async fn acquire(&self) -> Result<()> {
        let permit = self
            .credits
            .acquire()
            .await
            .map_err(|_| ReplError::Shutdown)?;
        permit.forget();
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns `credits` received in a `WindowAck`.
    ///
    /// Credits beyond the window are ignored.
    pub fn credit(&self, credits: u32) {
        let room = (self.window as usize).saturating_sub(self.credits.available_permits());
        let add = (credits as usize).min(room);
        if add > 0 {
            self.credits.add_permits(add);
        }
    }

    /// Wakes waiting senders with an error.
    pub fn close(&self) {
        self.credits.close();
    }
}

/// Receiving half: counts processed updates and decides when to ack.
#[derive(Debug)]
pub struct RecvWindow {
    window: u32,
    unacked: u32,
    received: u64,
}

impl RecvWindow {
    /// Creates the receiving half of a `window`-sized stream.
    pub fn new(window: u32) -> Self {
        Self {
            window,
            unacked: 0,
            received: 0,
        }
    }

    /// Updates received.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Processed updates not acknowledged yet.
    pub fn unacked(&self) -> u32 {
        self.unacked
    }

    /// Records one processed update; returns credits to ack when half the window is used.
    pub fn record(&mut self) -> Option<u32> {
        self.received += 1;
        self.unacked += 1;
        if self.unacked >= (self.window / 2).max(1) {
            self.flush()
        } else {
            None
        }
    }

    /// Takes every unacknowledged credit (idle flush, heartbeat tick).
    pub fn flush(&mut self) -> Option<u32> {
        if self.unacked == 0 {
            return None;
        }
        Some(std::mem::take(&mut self.unacked))
    }
}
