//! Connection metrics
//!
//! Atomic counters owned by one connection and shared with its driver task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Counters of one connection
#[derive(Debug)]
pub struct ConnectionMetrics {
    /// Transports opened
    pub connections_total: AtomicU64,
    /// Transports currently open
    pub connections_active: AtomicU64,
    pub auth_total: AtomicU64,
    pub auth_success: AtomicU64,
    pub auth_failed: AtomicU64,
    /// Text frames sent, keepalives excluded
    pub messages_sent: AtomicU64,
    /// Frames received
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Commands sent through `jdev/sys/enc` or `jdev/sys/fenc`
    pub commands_encrypted: AtomicU64,
    pub keepalives_sent: AtomicU64,
    /// Decoded event records
    pub events_received: AtomicU64,
    /// Socket and keepalive timeouts
    pub timeouts: AtomicU64,
    /// Frames the codec rejected
    pub protocol_errors: AtomicU64,
    /// Requests rejected because the connection went down
    pub requests_rejected: AtomicU64,
    start_time: Instant,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            auth_total: AtomicU64::new(0),
            auth_success: AtomicU64::new(0),
            auth_failed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            commands_encrypted: AtomicU64::new(0),
            keepalives_sent: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // saturating: a close may be reported for a transport that never counted as open
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn auth_attempt(&self) {
        self.auth_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_success(&self) {
        self.auth_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failed(&self) {
        self.auth_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn command_encrypted(&self) {
        self.commands_encrypted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn keepalive_sent(&self) {
        self.keepalives_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_received(&self, count: u64) {
        self.events_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_rejected(&self, count: u64) {
        self.requests_rejected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            auth_total: self.auth_total.load(Ordering::Relaxed),
            auth_success: self.auth_success.load(Ordering::Relaxed),
            auth_failed: self.auth_failed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            commands_encrypted: self.commands_encrypted.load(Ordering::Relaxed),
            keepalives_sent: self.keepalives_sent.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            auth_total = snapshot.auth_total,
            auth_success = snapshot.auth_success,
            auth_failed = snapshot.auth_failed,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            commands_encrypted = snapshot.commands_encrypted,
            keepalives_sent = snapshot.keepalives_sent,
            events_received = snapshot.events_received,
            timeouts = snapshot.timeouts,
            protocol_errors = snapshot.protocol_errors,
            requests_rejected = snapshot.requests_rejected,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub auth_total: u64,
    pub auth_success: u64,
    pub auth_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub commands_encrypted: u64,
    pub keepalives_sent: u64,
    pub events_received: u64,
    pub timeouts: u64,
    pub protocol_errors: u64,
    pub requests_rejected: u64,
    pub uptime_seconds: u64,
}

/// Logs how long an operation took when dropped
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}
