//! Tracker configuration.
//!
//! All knobs are surfaced at construction time; there is no environment or
//! CLI layer in this crate. Process-wide configuration loading belongs to
//! the embedding daemon.

use crate::error::{Result, TrackerError};
use std::path::PathBuf;

/// Construction-time configuration for [`NatConntracker`].
///
/// [`NatConntracker`]: crate::tracker::NatConntracker
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Root of the proc filesystem, used to resolve the global network
    /// namespace (`<proc_root>/1/ns/net`).
    pub proc_root: PathBuf,

    /// Capacity of the short-lived buffer holding translations for
    /// recently destroyed flows. Must be greater than zero.
    pub delete_buffer_size: usize,

    /// Hard capacity of the translation index. Registrations beyond this
    /// are rejected, not evicted.
    pub max_state_size: usize,
}

impl TrackerConfig {
    pub fn new(proc_root: impl Into<PathBuf>, delete_buffer_size: usize, max_state_size: usize) -> Self {
        TrackerConfig {
            proc_root: proc_root.into(),
            delete_buffer_size,
            max_state_size,
        }
    }

    /// Validate the configuration, rejecting values the tracker cannot
    /// operate with.
    pub fn validate(&self) -> Result<()> {
        if self.delete_buffer_size == 0 {
            return Err(TrackerError::InvalidConfig(
                "short term buffer size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            proc_root: PathBuf::from("/proc"),
            delete_buffer_size: 10_000,
            max_state_size: 65_000,
        }
    }
}
