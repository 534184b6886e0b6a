//! Per-listener connection statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::relay::RelayResult;

/// Forward statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    /// Total connection count
    pub connection_count: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Total bytes sent (local -> tunnel)
    pub bytes_sent: u64,
    /// Total bytes received (tunnel -> local)
    pub bytes_received: u64,
}

/// Atomic counters updated from connection tasks
#[derive(Debug, Default)]
pub struct StatsCounter {
    connection_count: AtomicU64,
    active_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StatsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_opened(&self) {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        // fetch_update never fails with a closure that always returns Some
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Record a finished relay where `a` is the local side
    pub(crate) fn record(&self, result: &RelayResult) {
        self.bytes_sent.fetch_add(result.a_to_b, Ordering::Relaxed);
        self.bytes_received.fetch_add(result.b_to_a, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayEnd;

    #[test]
    fn test_counters() {
        let stats = StatsCounter::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.record(&RelayResult {
            a_to_b: 10,
            b_to_a: 20,
            end: RelayEnd::Eof,
            error: None,
        });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connection_count, 2);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.bytes_sent, 10);
        assert_eq!(snapshot.bytes_received, 20);
    }

    #[test]
    fn test_active_never_underflows() {
        let stats = StatsCounter::new();
        stats.connection_closed();
        assert_eq!(stats.snapshot().active_connections, 0);
    }
}
