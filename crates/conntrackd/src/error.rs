//! Error types for the NAT connection tracker.
//!
//! All errors implement `std::error::Error` via `thiserror`. Only
//! construction can fail; the steady-state operations (lookup, clear,
//! stats) are infallible and represent misses as absent values.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Errors that can occur while building or driving the tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Invalid constructor arguments.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Netlink socket operation failed (open, bind, send, receive).
    #[error("netlink error: {0}")]
    Netlink(String),

    /// The synchronous conntrack table dump failed during construction.
    #[error("initial conntrack dump failed for {family}: {reason}")]
    InitialDump { family: &'static str, reason: String },

    /// Construction did not complete within the initialization timeout.
    #[error("could not initialize conntrack after {0:?}")]
    InitTimeout(Duration),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
