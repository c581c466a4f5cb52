//! # Throughput Estimation
//!
//! Adaptive socket timeouts derived from measured transfer speed.
//!
//! Every completed transfer that carried a payload of at least
//! [`constants::MIN_SAMPLE_BYTES`] is recorded as a [`ThroughputSample`]. Once
//! [`constants::MIN_SAMPLES`] samples exist, the timeout for an expected payload is
//! scaled from the average speed, with a safety factor that grows with how much
//! larger the payload is than the average sample.
//!
//! ## Factor Tiers
//! | `bytes / avg_size` | factor |
//! |--------------------|--------|
//! | < 10               | 2.5    |
//! | < 100              | 3      |
//! | < 200              | 3.5    |
//! | < 1000             | 4      |
//! | < 2000             | 4.5    |
//! | < 3000             | 5      |
//! | < 4000             | 5.5    |
//! | otherwise          | 6      |
//!
//! ## Cache Policy
//! Capacity is [`constants::CACHE_CAPACITY`]; when full, the sample with the fewest
//! bytes is dropped so the cache keeps large, representative transfers. A transfer
//! that outlived its timeout quarters every cached speed before being recorded.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Timing constants of the estimator.
pub mod constants {
    use std::time::Duration;

    /// Timeout used until enough samples exist
    pub const OPEN_CONNECTION_TIMEOUT: Duration = Duration::from_millis(15_000);

    /// Lower bound for every armed timeout, equal to the keepalive timeout
    pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_millis(4_000);

    /// Maximum number of cached samples
    pub const CACHE_CAPACITY: usize = 20;

    /// Samples below this size say nothing about throughput
    pub const MIN_SAMPLE_BYTES: u64 = 20;

    /// Samples needed before timeouts are computed
    pub const MIN_SAMPLES: usize = 5;

    /// Applied to all cached speeds after a transfer exceeded its timeout
    pub const SLOWDOWN_FACTOR: f64 = 0.25;

    /// Multiplier for long timeout mode while the cache is still warming up
    pub const LONG_MODE_MULTIPLIER: f64 = 3.0;
}

/// One measured transfer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    pub bytes: u64,
    pub bytes_per_ms: f64,
}

/// Estimated progress of an announced payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataProgress {
    pub total: u64,
    pub downloaded: u64,
    pub pending: u64,
    pub percent: f64,
    /// The total comes from an estimated header
    pub estimated: bool,
}

#[derive(Debug, Clone, Copy)]
struct Transfer {
    bytes: u64,
    estimated: bool,
    started: Instant,
}

/// Safety factor for a payload `ratio` times larger than the average sample
pub fn timeout_factor(ratio: f64) -> f64 {
    if ratio < 10.0 {
        2.5
    } else if ratio < 100.0 {
        3.0
    } else if ratio < 200.0 {
        3.5
    } else if ratio < 1000.0 {
        4.0
    } else if ratio < 2000.0 {
        4.5
    } else if ratio < 3000.0 {
        5.0
    } else if ratio < 4000.0 {
        5.5
    } else {
        6.0
    }
}

/// Rolling throughput cache and the timeout of the transfer currently awaited.
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    samples: Vec<ThroughputSample>,
    avg_speed: f64,
    avg_size: f64,
    long_timeout_mode: bool,
    open_timeout: Duration,
    min_timeout: Duration,
    current_timeout: Duration,
    transfer: Option<Transfer>,
}

impl Default for ThroughputEstimator {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ThroughputEstimator {
    /// Create an estimator; `long_timeout_mode` is used by download connections
    pub fn new(long_timeout_mode: bool) -> Self {
        Self::with_timeouts(
            long_timeout_mode,
            constants::OPEN_CONNECTION_TIMEOUT,
            constants::DEFAULT_SOCKET_TIMEOUT,
        )
    }

    /// Create an estimator with custom warm-up timeout and timeout floor
    pub fn with_timeouts(
        long_timeout_mode: bool,
        open_timeout: Duration,
        min_timeout: Duration,
    ) -> Self {
        Self {
            samples: Vec::with_capacity(constants::CACHE_CAPACITY + 1),
            avg_speed: 0.0,
            avg_size: 0.0,
            long_timeout_mode,
            open_timeout,
            min_timeout,
            current_timeout: open_timeout,
            transfer: None,
        }
    }

    pub fn samples(&self) -> &[ThroughputSample] {
        &self.samples
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Average speed in bytes per millisecond (rounded up)
    pub fn average_speed(&self) -> f64 {
        self.avg_speed
    }

    /// Average sample size in bytes (rounded up)
    pub fn average_size(&self) -> f64 {
        self.avg_size
    }

    /// Timeout computed for the last started transfer, before the floor is applied
    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    /// Timeout for a payload of `bytes`; `0` means the size is unknown
    pub fn timeout_for_size(&self, bytes: u64) -> Duration {
        let ms = self.timeout_ms(bytes, false);
        if ms.is_finite() && ms >= 0.0 {
            Duration::from_millis(ms as u64)
        } else {
            self.open_timeout
        }
    }

    fn timeout_ms(&self, bytes: u64, long_mode: bool) -> f64 {
        let open_ms = self.open_timeout.as_millis() as f64;

        if self.samples.len() < constants::MIN_SAMPLES && !long_mode {
            if self.long_timeout_mode {
                let long = self.timeout_ms(bytes, true);
                if long.is_finite() {
                    return long.max(open_ms) * constants::LONG_MODE_MULTIPLIER;
                }
            }
            return open_ms;
        }

        if self.avg_speed <= 0.0 {
            return f64::NAN;
        }

        let bytes = bytes as f64;
        if bytes == 0.0 {
            (self.avg_size / self.avg_speed * 2.0).ceil()
        } else if self.avg_size > bytes {
            (bytes / self.avg_speed * 2.0).ceil()
        } else {
            let factor = timeout_factor(bytes / self.avg_size);
            (bytes / self.avg_speed * factor).ceil()
        }
    }

    /// Start waiting for a transfer and return the timeout to arm.
    ///
    /// `bytes` is the announced payload size, `0` when a command was just sent.
    pub fn start(&mut self, bytes: u64, estimated: bool, now: Instant) -> Duration {
        self.transfer = Some(Transfer {
            bytes,
            estimated,
            started: now,
        });
        self.current_timeout = self.timeout_for_size(bytes);
        self.current_timeout.max(self.min_timeout)
    }

    /// The awaited transfer arrived; record its throughput.
    pub fn complete(&mut self, now: Instant) {
        let Some(transfer) = self.transfer.take() else {
            return;
        };
        if transfer.bytes == 0 {
            return;
        }

        let elapsed = now.saturating_duration_since(transfer.started);
        let elapsed_ms = elapsed.as_millis();
        if elapsed_ms == 0 {
            return;
        }

        let bytes_per_ms = (transfer.bytes as f64 / elapsed_ms as f64).round();
        if self.current_timeout < elapsed {
            self.slow_down();
        }
        self.add_sample(transfer.bytes, bytes_per_ms);
    }

    /// Forget the awaited transfer without measuring it
    pub fn cancel(&mut self) {
        self.transfer = None;
    }

    /// True while a payload of known size is awaited
    pub fn expects_payload(&self) -> bool {
        self.transfer.map(|t| t.bytes > 0).unwrap_or(false)
    }

    /// Record a sample, evicting the smallest one when the cache is full
    pub fn add_sample(&mut self, bytes: u64, bytes_per_ms: f64) {
        if bytes < constants::MIN_SAMPLE_BYTES {
            return;
        }

        self.samples.push(ThroughputSample {
            bytes,
            bytes_per_ms,
        });

        if self.samples.len() > constants::CACHE_CAPACITY {
            if let Some(smallest) = self
                .samples
                .iter()
                .enumerate()
                .min_by_key(|(_, sample)| sample.bytes)
                .map(|(idx, _)| idx)
            {
                self.samples.remove(smallest);
            }
        }

        self.recompute_averages();
    }

    /// Quarter every cached speed
    pub fn slow_down(&mut self) {
        for sample in &mut self.samples {
            sample.bytes_per_ms *= constants::SLOWDOWN_FACTOR;
        }
        self.recompute_averages();
    }

    fn recompute_averages(&mut self) {
        if self.samples.is_empty() {
            self.avg_speed = 0.0;
            self.avg_size = 0.0;
            return;
        }
        let count = self.samples.len() as f64;
        let speed: f64 = self.samples.iter().map(|s| s.bytes_per_ms).sum();
        let size: f64 = self.samples.iter().map(|s| s.bytes as f64).sum();
        self.avg_speed = (speed / count).ceil();
        self.avg_size = (size / count).ceil();
    }

    /// Estimated progress of the awaited payload
    pub fn progress(&self, now: Instant) -> Option<DataProgress> {
        let transfer = self.transfer.filter(|t| t.bytes > 0)?;
        let timeout_ms = self.current_timeout.as_millis().max(1) as f64;
        let bytes_per_ms = transfer.bytes as f64 / timeout_ms;
        let elapsed_ms = now.saturating_duration_since(transfer.started).as_millis() as f64;

        let total = transfer.bytes;
        let downloaded = ((bytes_per_ms * elapsed_ms) as u64).min(total);
        let percent = (downloaded as f64 / total as f64 * 1000.0).round() / 10.0;

        Some(DataProgress {
            total,
            downloaded,
            pending: total - downloaded,
            percent,
            estimated: transfer.estimated,
        })
    }
}
