//! Statistics tracking for the resolver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters updated by the resolver as requests progress.
#[derive(Default)]
pub struct ResolverStats {
    requests: AtomicU64,
    replies: AtomicU64,
    timeouts: AtomicU64,
    retransmits: AtomicU64,
    malformed: AtomicU64,
    spoofed: AtomicU64,
    cancelled: AtomicU64,
    send_errors: AtomicU64,
    /// Cumulative reply latency in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl ResolverStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reply(&self, elapsed: Duration) {
        self.replies.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_spoofed(&self) {
        self.spoofed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let replies = self.replies.load(Ordering::Relaxed);
        let total_us = self.total_response_time_us.load(Ordering::Relaxed);

        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            replies,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            spoofed: self.spoofed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            avg_response_ms: average_ms(total_us, replies),
        }
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let replies = self.replies.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        StatsSnapshot {
            requests: self.requests.swap(0, Ordering::Relaxed),
            replies,
            timeouts: self.timeouts.swap(0, Ordering::Relaxed),
            retransmits: self.retransmits.swap(0, Ordering::Relaxed),
            malformed: self.malformed.swap(0, Ordering::Relaxed),
            spoofed: self.spoofed.swap(0, Ordering::Relaxed),
            cancelled: self.cancelled.swap(0, Ordering::Relaxed),
            send_errors: self.send_errors.swap(0, Ordering::Relaxed),
            avg_response_ms: average_ms(total_us, replies),
        }
    }
}

fn average_ms(total_us: u64, count: u64) -> f64 {
    if count > 0 {
        (total_us as f64 / count as f64) / 1000.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub replies: u64,
    pub timeouts: u64,
    pub retransmits: u64,
    pub malformed: u64,
    pub spoofed: u64,
    pub cancelled: u64,
    pub send_errors: u64,
    pub avg_response_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_averages_reply_latency() {
        let stats = ResolverStats::new();
        stats.record_request();
        stats.record_request();
        stats.record_reply(Duration::from_millis(2));
        stats.record_reply(Duration::from_millis(4));
        stats.record_timeout();

        let snapshot = stats.snapshot();

        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.replies, 2);
        assert_eq!(snapshot.timeouts, 1);
        assert!((snapshot.avg_response_ms - 3.0).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_counters() {
        let stats = ResolverStats::new();
        stats.record_spoofed();
        stats.record_cancelled();

        let first = stats.snapshot_and_reset();
        let second = stats.snapshot();

        assert_eq!(first.spoofed, 1);
        assert_eq!(first.cancelled, 1);
        assert_eq!(second.spoofed, 0);
        assert_eq!(second.avg_response_ms, 0.0);
    }
}
