//! Observability and Metrics
//!
//! Per-connection counters for frame traffic, retries, rejected frames and
//! reconnects. Each `Connection` owns one `Metrics`; there is no global
//! instance.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for one connection
#[derive(Debug)]
pub struct Metrics {
    /// Frames written to the socket
    pub frames_sent: AtomicU64,
    /// Frames read from the socket
    pub frames_received: AtomicU64,
    /// Total bytes written
    pub bytes_sent: AtomicU64,
    /// Total bytes read
    pub bytes_received: AtomicU64,
    /// Writes that failed and were retried
    pub send_retries: AtomicU64,
    /// Frames given up on after exhausting retries
    pub send_failures: AtomicU64,
    /// Binary frames rejected by the authentication check
    pub auth_failures: AtomicU64,
    /// Binary frames that did not decode into a node
    pub decode_failures: AtomicU64,
    /// Successful socket (re)connects
    pub connects: AtomicU64,
    /// Unexpected closes observed by the reader
    pub connectivity_failures: AtomicU64,
    /// Keepalive probes written
    pub keepalives_sent: AtomicU64,
    /// Keepalive timestamps received from the server
    pub keepalives_received: AtomicU64,
    /// Responses handed to a pending caller
    pub responses_delivered: AtomicU64,
    /// Responses for abandoned tags
    pub responses_dropped: AtomicU64,
    /// Unsolicited events dispatched
    pub push_events: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            send_retries: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            connectivity_failures: AtomicU64::new(0),
            keepalives_sent: AtomicU64::new(0),
            keepalives_received: AtomicU64::new(0),
            responses_delivered: AtomicU64::new(0),
            responses_dropped: AtomicU64::new(0),
            push_events: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a frame written to the socket
    pub fn frame_sent(&self, byte_count: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    /// Record a frame read from the socket
    pub fn frame_received(&self, byte_count: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn send_retry(&self) {
        self.send_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connectivity_failure(&self) {
        self.connectivity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn keepalive_sent(&self) {
        self.keepalives_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn keepalive_received(&self) {
        self.keepalives_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_delivered(&self) {
        self.responses_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_dropped(&self) {
        self.responses_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_event(&self) {
        self.push_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_retries: self.send_retries.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            connectivity_failures: self.connectivity_failures.load(Ordering::Relaxed),
            keepalives_sent: self.keepalives_sent.load(Ordering::Relaxed),
            keepalives_received: self.keepalives_received.load(Ordering::Relaxed),
            responses_delivered: self.responses_delivered.load(Ordering::Relaxed),
            responses_dropped: self.responses_dropped.load(Ordering::Relaxed),
            push_events: self.push_events.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            send_retries = snapshot.send_retries,
            send_failures = snapshot.send_failures,
            auth_failures = snapshot.auth_failures,
            decode_failures = snapshot.decode_failures,
            connects = snapshot.connects,
            connectivity_failures = snapshot.connectivity_failures,
            keepalives_sent = snapshot.keepalives_sent,
            keepalives_received = snapshot.keepalives_received,
            responses_delivered = snapshot.responses_delivered,
            responses_dropped = snapshot.responses_dropped,
            push_events = snapshot.push_events,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_retries: u64,
    pub send_failures: u64,
    pub auth_failures: u64,
    pub decode_failures: u64,
    pub connects: u64,
    pub connectivity_failures: u64,
    pub keepalives_sent: u64,
    pub keepalives_received: u64,
    pub responses_delivered: u64,
    pub responses_dropped: u64,
    pub push_events: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.frame_sent(10);
        metrics.frame_sent(5);
        metrics.auth_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.bytes_sent, 15);
        assert_eq!(snapshot.auth_failures, 1);
        assert_eq!(snapshot.frames_received, 0);
    }
}
