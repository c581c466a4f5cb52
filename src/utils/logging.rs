//! Subscriber setup for binaries and tests.
//!
//! The library only emits `tracing` events; nothing is installed unless
//! [`init_logging`] is called.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a subscriber
/// is already installed or the log file cannot be opened.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()));

    let writer = match (config.log_to_file, config.log_file_path.as_deref()) {
        (true, Some(path)) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ProtocolError::ConfigError(format!("Cannot open log file {path}: {e}"))
                })?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ProtocolError::ConfigError(format!("Logging already initialized: {e}")))?;
    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}
