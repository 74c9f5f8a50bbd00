//! Atomic dispatch counters.
//!
//! All atomics use `Relaxed` ordering. They are monotonic display counters
//! with no synchronization requirements.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Default)]
struct StatsInner {
    requests: AtomicU64,
    replies: AtomicU64,
    timeouts: AtomicU64,
    send_failures: AtomicU64,
    connection_closed: AtomicU64,
}

/// Thread-safe dispatch statistics. Cheap to clone (Arc).
#[derive(Clone, Default)]
pub struct DispatchStats {
    inner: Arc<StatsInner>,
}

/// Point-in-time copy of the counters, serializable to JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub replies: u64,
    pub timeouts: u64,
    pub send_failures: u64,
    pub connection_closed: u64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_requests(&self) {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_replies(&self) {
        self.inner.replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeouts(&self) {
        self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_send_failures(&self, n: u64) {
        self.inner.send_failures.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_connection_closed(&self) {
        self.inner.connection_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.inner.requests.load(Ordering::Relaxed),
            replies: self.inner.replies.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
            send_failures: self.inner.send_failures.load(Ordering::Relaxed),
            connection_closed: self.inner.connection_closed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DispatchStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.snapshot(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let stats = DispatchStats::new();
        let other = stats.clone();
        stats.inc_requests();
        other.inc_requests();
        other.add_send_failures(3);
        stats.inc_timeouts();

        let snap = stats.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.send_failures, 3);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.replies, 0);

        let json = serde_json::to_value(snap).unwrap();
        assert_eq!(json["requests"], 2);
        assert_eq!(json["connection_closed"], 0);
    }
}
