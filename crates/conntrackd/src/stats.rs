//! Atomic tracker statistics.
//!
//! The counters are written from the event callback threads and the lookup
//! path, and sampled by `stats()` without taking the engine lock. Relaxed
//! ordering is sufficient: the values are monotone counters and the
//! snapshot only needs to be approximately consistent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Monotone counters for the tracker hot paths.
#[derive(Debug, Default)]
pub struct TrackerStats {
    gets: AtomicU64,
    gets_nanos: AtomicU64,
    registers: AtomicU64,
    registers_nanos: AtomicU64,
    unregisters: AtomicU64,
    unregisters_nanos: AtomicU64,
    expires: AtomicU64,
    dropped_registers: AtomicU64,
    dropped_unregisters: AtomicU64,
}

impl TrackerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_get(&self, elapsed: Duration) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.gets_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_register(&self, elapsed: Duration) {
        self.registers.fetch_add(1, Ordering::Relaxed);
        self.registers_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_unregister(&self, elapsed: Duration) {
        self.unregisters.fetch_add(1, Ordering::Relaxed);
        self.unregisters_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_expired(&self, count: u64) {
        self.expires.fetch_add(count, Ordering::Relaxed);
    }

    /// A registration rejected because the translation index is full.
    pub fn record_dropped_register(&self) {
        self.dropped_registers.fetch_add(1, Ordering::Relaxed);
    }

    /// A retained translation displaced because the short-lived buffer was
    /// full when a newly destroyed flow arrived.
    pub fn record_dropped_unregister(&self) {
        self.dropped_unregisters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn expires_total(&self) -> u64 {
        self.expires.load(Ordering::Relaxed)
    }

    pub fn dropped_registers_total(&self) -> u64 {
        self.dropped_registers.load(Ordering::Relaxed)
    }

    pub fn dropped_unregisters_total(&self) -> u64 {
        self.dropped_unregisters.load(Ordering::Relaxed)
    }

    /// Render the counters into the public stats map. Size gauges are
    /// supplied by the caller, which reads them under the engine lock.
    pub fn snapshot(&self, state_size: usize, short_lived_size: usize) -> HashMap<String, i64> {
        let mut m = HashMap::new();
        m.insert("state_size".to_string(), state_size as i64);
        m.insert(
            "short_term_buffer_size".to_string(),
            short_lived_size as i64,
        );
        m.insert("expires_total".to_string(), self.expires_total() as i64);

        let gets = self.gets.load(Ordering::Relaxed);
        if gets != 0 {
            m.insert("gets_total".to_string(), gets as i64);
            m.insert(
                "nanoseconds_per_get".to_string(),
                (self.gets_nanos.load(Ordering::Relaxed) / gets) as i64,
            );
        }

        let registers = self.registers.load(Ordering::Relaxed);
        if registers != 0 {
            m.insert("registers_total".to_string(), registers as i64);
            m.insert(
                "nanoseconds_per_register".to_string(),
                (self.registers_nanos.load(Ordering::Relaxed) / registers) as i64,
            );
        }

        let unregisters = self.unregisters.load(Ordering::Relaxed);
        if unregisters != 0 {
            m.insert("unregisters_total".to_string(), unregisters as i64);
            m.insert(
                "nanoseconds_per_unregister".to_string(),
                (self.unregisters_nanos.load(Ordering::Relaxed) / unregisters) as i64,
            );
        }

        let dropped_registers = self.dropped_registers_total();
        if dropped_registers != 0 {
            m.insert(
                "dropped_registers_total".to_string(),
                dropped_registers as i64,
            );
        }

        let dropped_unregisters = self.dropped_unregisters_total();
        if dropped_unregisters != 0 {
            m.insert(
                "dropped_unregisters_total".to_string(),
                dropped_unregisters as i64,
            );
        }

        m
    }
}
