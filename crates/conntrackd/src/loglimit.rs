//! Rate limiter for repeated warning logs.

use std::time::{Duration, Instant};

/// Decides whether a repeated warning should be emitted.
///
/// The first `burst` occurrences always log; after that, one log per
/// `interval`. The caller owns the actual log statement so the message can
/// carry call-site context.
#[derive(Debug)]
pub struct LogLimit {
    burst: u64,
    interval: Duration,
    hits: u64,
    last_logged: Option<Instant>,
}

impl LogLimit {
    pub fn new(burst: u64, interval: Duration) -> Self {
        LogLimit {
            burst,
            interval,
            hits: 0,
            last_logged: None,
        }
    }

    /// Record an occurrence and report whether it should be logged.
    pub fn should_log(&mut self) -> bool {
        self.hits += 1;
        if self.hits <= self.burst {
            self.last_logged = Some(Instant::now());
            return true;
        }

        let now = Instant::now();
        match self.last_logged {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_logged = Some(now);
                true
            }
        }
    }

    /// Total occurrences recorded, logged or not.
    pub fn hits(&self) -> u64 {
        self.hits
    }
}
