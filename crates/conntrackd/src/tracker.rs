//! Tracker engine.
//!
//! Owns the translation index, the short-lived buffer, and the kernel
//! subscriptions, and answers synchronous translation lookups. Two
//! dispatch worker threads drive the subscriptions (the transport can only
//! deliver one callback kind per handle, so create/update and destroy run
//! on independent handles); a third worker compacts the index on a ticker.
//! A single mutex serializes access to both stores; the statistics block is
//! atomic and sampled without it.

use crate::config::TrackerConfig;
use crate::decode;
use crate::error::{Result, TrackerError};
use crate::generation::{nth_generation, unix_now_nanos, COMPACT_INTERVAL, EXPIRY_GENERATIONS};
use crate::loglimit::LogLimit;
use crate::state::{ShortLivedBuffer, TranslationIndex};
use crate::stats::TrackerStats;
use crate::transport::{ConntrackTransport, EventKind, Family, FlowEntry};
use conntrack_types::{Address, ConnKey, Translation, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Hard bound on construction: handle opening, both table dumps, and worker
/// startup must all complete within this window.
pub const INITIALIZATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Read cadence of the kernel subscriptions. Short enough that dispatch
/// threads notice shutdown promptly.
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);

const EXCEEDED_SIZE_LOG_BURST: u64 = 10;
const EXCEEDED_SIZE_LOG_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// A user-space mirror of the kernel's NAT conntrack state.
///
/// All operations are safe to call from any thread. A miss is an absent
/// value, never an error.
pub trait Conntracker: Send + Sync {
    /// Resolve the pre-NAT endpoint of a connection into its reply-tuple
    /// translation.
    fn translation_for_conn(
        &self,
        ip: Address,
        port: u16,
        transport: Transport,
    ) -> Option<Translation>;

    /// Release translations retained for recently destroyed flows.
    fn clear_short_lived(&self);

    /// Snapshot of the tracker counters and store sizes.
    fn stats(&self) -> HashMap<String, i64>;

    /// Stop the workers and release the kernel handles. Idempotent.
    fn close(&self);
}

struct TrackerState {
    index: TranslationIndex,
    short_lived: ShortLivedBuffer,
}

struct Inner {
    state: Mutex<TrackerState>,
    stats: TrackerStats,
    exceeded_size_limit: Mutex<LogLimit>,
    max_state_size: usize,
}

impl Inner {
    /// Create/update path: admit a NAT entry into the translation index.
    fn register(&self, entry: &FlowEntry) {
        if !decode::is_nat(entry) {
            return;
        }
        let Some(key) = decode::format_key(entry) else {
            return;
        };
        let now = unix_now_nanos();
        let Some(indexed) = decode::format_translation(entry, nth_generation(now, EXPIRY_GENERATIONS))
        else {
            return;
        };

        let start = Instant::now();
        let mut state = self.state.lock().unwrap();
        if !state.index.insert(key, indexed) {
            drop(state);
            self.stats.record_dropped_register();
            self.warn_exceeded_size();
            return;
        }
        // The flow came back to life; whatever the short-lived buffer still
        // holds for this key is stale now.
        state.short_lived.remove(&key);
        drop(state);

        self.stats.record_register(start.elapsed());
    }

    /// Destroy path: move the translation into the short-lived buffer so
    /// late lookups still resolve.
    fn unregister(&self, entry: &FlowEntry) {
        if !decode::is_nat(entry) {
            return;
        }
        let Some(key) = decode::format_key(entry) else {
            return;
        };

        let start = Instant::now();
        let mut state = self.state.lock().unwrap();
        let mut evicted = false;
        if let Some(removed) = state.index.remove(&key) {
            evicted = state.short_lived.insert(key, removed.translation);
        }
        drop(state);

        if evicted {
            self.stats.record_dropped_unregister();
            warn!("exceeded maximum tracked short lived connections, dropping oldest");
        }
        self.stats.record_unregister(start.elapsed());
    }

    /// Seed the index from a table dump, through the same bounded insert as
    /// live registrations.
    fn seed(&self, entries: &[FlowEntry], now_nanos: u64) -> usize {
        let gen = nth_generation(now_nanos, EXPIRY_GENERATIONS);
        let mut seeded = 0;

        let mut state = self.state.lock().unwrap();
        for entry in entries {
            if !decode::is_nat(entry) {
                continue;
            }
            let Some(key) = decode::format_key(entry) else {
                continue;
            };
            let Some(indexed) = decode::format_translation(entry, gen) else {
                continue;
            };
            if state.index.insert(key, indexed) {
                seeded += 1;
            } else {
                self.stats.record_dropped_register();
            }
        }

        seeded
    }

    fn compact(&self) {
        let now = unix_now_nanos();
        let mut state = self.state.lock().unwrap();
        let expired = state.index.compact(now);
        let remaining = state.index.len();
        drop(state);

        self.stats.record_expired(expired);
        if expired > 0 {
            debug!(expired, remaining, "compacted translation index");
        }
    }

    fn warn_exceeded_size(&self) {
        if self.exceeded_size_limit.lock().unwrap().should_log() {
            warn!(
                max_state_size = self.max_state_size,
                "exceeded maximum conntrack state size, rejecting new entries \
                 (will log first ten times, and then once every 10 minutes)"
            );
        }
    }
}

/// The production tracker. See [`Conntracker`] for the public surface.
pub struct NatConntracker {
    inner: Arc<Inner>,
    shutdown: Arc<AtomicBool>,
    compact_tx: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl NatConntracker {
    /// Build a tracker against the kernel's conntrack table.
    ///
    /// Construction runs on a dedicated worker so an unresponsive transport
    /// cannot hang the caller; if it has not completed within
    /// [`INITIALIZATION_TIMEOUT`] the call fails and any handles the worker
    /// acquired are released as it unwinds.
    #[cfg(target_os = "linux")]
    pub fn new(config: TrackerConfig) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("conntrack-init".to_string())
            .spawn(move || {
                let _ = tx.send(Self::init(config));
            })
            .map_err(TrackerError::Io)?;

        match rx.recv_timeout(INITIALIZATION_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(TrackerError::InitTimeout(INITIALIZATION_TIMEOUT)),
        }
    }

    #[cfg(target_os = "linux")]
    fn init(config: TrackerConfig) -> Result<Self> {
        use crate::netlink::{ConntrackSocket, NetnsHandle, GROUPS_CREATE_UPDATE, GROUPS_DESTROY};

        let netns = NetnsHandle::global(&config.proc_root);
        let events = ConntrackSocket::open(GROUPS_CREATE_UPDATE, netns.as_ref(), READ_TIMEOUT)?;
        let destroys = ConntrackSocket::open(GROUPS_DESTROY, netns.as_ref(), READ_TIMEOUT)?;
        drop(netns);

        Self::with_transports(config, Box::new(events), Box::new(destroys))
    }

    /// Build a tracker over explicit transports. The first carries
    /// create/update events and serves the seeding dumps; the second
    /// carries destroy events.
    pub fn with_transports(
        config: TrackerConfig,
        mut events: Box<dyn ConntrackTransport>,
        destroys: Box<dyn ConntrackTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(Inner {
            state: Mutex::new(TrackerState {
                index: TranslationIndex::new(config.max_state_size),
                short_lived: ShortLivedBuffer::new(config.delete_buffer_size),
            }),
            stats: TrackerStats::new(),
            exceeded_size_limit: Mutex::new(LogLimit::new(
                EXCEEDED_SIZE_LOG_BURST,
                EXCEEDED_SIZE_LOG_INTERVAL,
            )),
            max_state_size: config.max_state_size,
        });

        let now = unix_now_nanos();

        let v4 = events.dump(Family::V4).map_err(|e| TrackerError::InitialDump {
            family: Family::V4.name(),
            reason: e.to_string(),
        })?;
        let seeded = inner.seed(&v4, now);
        debug!(entries = v4.len(), seeded, "seeded IPv4 conntrack state");

        // IPv4 coverage is still useful on its own.
        match events.dump(Family::V6) {
            Ok(v6) => {
                let seeded = inner.seed(&v6, now);
                debug!(entries = v6.len(), seeded, "seeded IPv6 conntrack state");
            }
            Err(e) => {
                error!(error = %e, "failed to dump IPv6 conntrack table, continuing with IPv4 only");
            }
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (compact_tx, compact_rx) = mpsc::channel();

        let workers = vec![
            spawn_dispatch("conntrack-events", events, Arc::clone(&inner), Arc::clone(&shutdown))?,
            spawn_dispatch("conntrack-destroys", destroys, Arc::clone(&inner), Arc::clone(&shutdown))?,
            spawn_compactor(compact_rx, Arc::clone(&inner))?,
        ];

        info!(
            max_state_size = config.max_state_size,
            delete_buffer_size = config.delete_buffer_size,
            "conntrack tracker initialized"
        );

        Ok(NatConntracker {
            inner,
            shutdown,
            compact_tx: Mutex::new(Some(compact_tx)),
            workers: Mutex::new(workers),
        })
    }
}

impl Conntracker for NatConntracker {
    fn translation_for_conn(
        &self,
        ip: Address,
        port: u16,
        transport: Transport,
    ) -> Option<Translation> {
        let start = Instant::now();
        let key = ConnKey::new(ip, port, transport);
        let now = unix_now_nanos();

        let mut state = self.inner.state.lock().unwrap();
        // An index hit refreshes the entry's generation; the short-lived
        // fallback is a plain read.
        let result = state
            .index
            .lookup(&key, now)
            .or_else(|| state.short_lived.lookup(&key));
        drop(state);

        self.inner.stats.record_get(start.elapsed());
        result
    }

    fn clear_short_lived(&self) {
        self.inner.state.lock().unwrap().short_lived.clear();
    }

    fn stats(&self) -> HashMap<String, i64> {
        // Sizes need the lock, briefly; the counters are atomic.
        let (state_size, short_lived_size) = {
            let state = self.inner.state.lock().unwrap();
            (state.index.len(), state.short_lived.len())
        };
        self.inner.stats.snapshot(state_size, short_lived_size)
    }

    fn close(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping the sender ends the compaction ticker; the dispatch
        // threads observe the flag within one read timeout.
        self.compact_tx.lock().unwrap().take();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }

        info!("conntrack tracker closed");
    }
}

impl Drop for NatConntracker {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_dispatch(
    name: &'static str,
    mut transport: Box<dyn ConntrackTransport>,
    inner: Arc<Inner>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match transport.next_events() {
                    Ok(events) => {
                        for event in events {
                            match event.kind {
                                EventKind::New | EventKind::Update => inner.register(&event.entry),
                                EventKind::Destroy => inner.unregister(&event.entry),
                            }
                        }
                    }
                    Err(e) => {
                        warn!(worker = name, error = %e, "conntrack event read failed");
                        thread::sleep(READ_TIMEOUT);
                    }
                }
            }
            transport.close();
        })
        .map_err(TrackerError::Io)
}

fn spawn_compactor(ticker: Receiver<()>, inner: Arc<Inner>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("conntrack-compact".to_string())
        .spawn(move || loop {
            match ticker.recv_timeout(COMPACT_INTERVAL) {
                Err(RecvTimeoutError::Timeout) => inner.compact(),
                // Sender dropped: the tracker is closing.
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .map_err(TrackerError::Io)
}
