//! Logging infrastructure for the memgate request core.
//!
//! This crate provides structured JSON logging for production and a
//! pretty format for development, plus the standard event names used
//! across the server.
//!
//! # Usage
//!
//! ```ignore
//! use memgate_telemetry::{TelemetryConfig, init_logging};
//!
//! let config = TelemetryConfig::new().with_log_level("debug");
//! init_logging(&config)?;
//! ```

pub mod config;
pub mod logging;

pub use config::{LogFormat, TelemetryConfig};
pub use logging::{events, init_logging};

use thiserror::Error;

/// Telemetry errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize logging.
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
}
