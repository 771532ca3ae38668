//! Receive/send counters shared between the worker loop and its outputs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

const NO_LATENCY: u64 = u64::MAX;

/// Point-in-time copy of [`WorkerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub sent: u64,
    /// Publish-to-receive latency of the most recent stamped message
    pub last_latency: Option<Duration>,
}

/// Lock-free worker counters
#[derive(Debug)]
pub struct WorkerStats {
    received: AtomicU64,
    sent: AtomicU64,
    last_latency_ms: AtomicU64,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(NO_LATENCY),
        }
    }
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a received event and, when it carries an origin time, its latency.
    ///
    /// An origin in the future (clock skew between hosts) counts as zero latency.
    pub fn record_received(&self, origin: Option<SystemTime>) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if let Some(origin) = origin {
            let elapsed = SystemTime::now()
                .duration_since(origin)
                .unwrap_or(Duration::ZERO);
            let millis = u64::try_from(elapsed.as_millis()).unwrap_or(NO_LATENCY - 1);
            self.last_latency_ms
                .store(millis.min(NO_LATENCY - 1), Ordering::Relaxed);
        }
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let latency = self.last_latency_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            last_latency: (latency != NO_LATENCY).then(|| Duration::from_millis(latency)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unstamped_events_only_count() {
        let stats = WorkerStats::new();
        stats.record_received(None);
        stats.record_received(None);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.last_latency, None);
    }

    #[test]
    fn test_latency_from_origin() {
        let stats = WorkerStats::new();
        stats.record_received(Some(SystemTime::now() - Duration::from_millis(250)));
        let latency = stats.snapshot().last_latency.unwrap_or_default();
        assert!(latency >= Duration::from_millis(250));
        assert!(latency < Duration::from_secs(5));
    }

    #[test]
    fn test_future_origin_is_zero_latency() {
        let stats = WorkerStats::new();
        stats.record_received(Some(SystemTime::now() + Duration::from_secs(60)));
        assert_eq!(stats.snapshot().last_latency, Some(Duration::ZERO));
    }

    #[test]
    fn test_sent_counter() {
        let stats = WorkerStats::new();
        stats.record_sent();
        assert_eq!(stats.snapshot().sent, 1);
    }
}
