//! Liveness probing
//!
//! While the connection is ready, a `ping` is sent every interval. A probe
//! that fails or does not answer within the heartbeat timeout counts as a
//! miss; any answered probe resets the count. Reaching the miss threshold
//! forces the connection into recovery.
//!
//! The same ticker sweeps the correlation table for expired deadlines, so
//! entries whose waiter has gone away still resolve `Timeout`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{ConnectionInner, ConnectionState};
use crate::types::METHOD_PING;

/// Consecutive-miss counter.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    misses: AtomicU32,
    threshold: u32,
}

impl HeartbeatMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            misses: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    pub fn record_success(&self) {
        self.misses.store(0, Ordering::SeqCst);
    }

    /// Count a miss. Returns `true` when the threshold is reached, in which
    /// case the counter starts over.
    pub fn record_miss(&self) -> bool {
        let misses = self.misses.fetch_add(1, Ordering::SeqCst) + 1;
        if misses >= self.threshold {
            self.misses.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn misses(&self) -> u32 {
        self.misses.load(Ordering::SeqCst)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

/// Start the heartbeat task for a connection. It stops when `cancel` fires
/// or the connection is dropped.
pub(super) fn spawn(
    inner: &Arc<ConnectionInner>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let weak: Weak<ConnectionInner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let Some(inner) = weak.upgrade() else { return };

            let expired = inner.sweep_expired(Instant::now());
            if expired > 0 {
                tracing::debug!(expired, "swept expired requests");
            }

            if inner.state() != ConnectionState::Ready {
                continue;
            }

            match inner.request_direct(METHOD_PING, serde_json::json!({}), timeout).await {
                Ok(_) => inner.heartbeat.record_success(),
                Err(e) => {
                    let misses = inner.heartbeat.misses() + 1;
                    if inner.heartbeat.record_miss() {
                        tracing::warn!(
                            threshold = inner.heartbeat.threshold(),
                            "heartbeat threshold reached, recovering connection"
                        );
                        let _ = inner.trigger_reconnect("heartbeat missed");
                    } else {
                        tracing::warn!(misses, "heartbeat missed: {}", e);
                    }
                }
            }
        }
    });
}
