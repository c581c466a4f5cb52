//! # Utility Modules
//!
//! ## Components
//! - **Throughput**: adaptive socket timeouts from measured transfer speed
//! - **Time**: conversions from the Miniserver epoch (2009-01-01)
//! - **Metrics**: per-connection atomic counters
//! - **Logging**: `tracing-subscriber` setup from [`LoggingConfig`](crate::config::LoggingConfig)

pub mod logging;
pub mod metrics;
pub mod throughput;
pub mod time;

pub use metrics::{ConnectionMetrics, MetricsSnapshot};
pub use throughput::ThroughputEstimator;
