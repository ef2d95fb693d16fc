//! User-space NAT connection tracker.
//!
//! Mirrors the kernel's conntrack table so an external observer holding a
//! raw socket 4-tuple can resolve the pre-NAT endpoint of a connection
//! into its post-NAT (reply-tuple) endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  events   ┌───────────────┐  lookups  ┌──────────┐
//! │ Linux kernel │──────────▶│  conntrackd   │◀──────────│  tracer  │
//! │  (ctnetlink) │  dumps    │               │           │          │
//! └──────────────┘           │ translation   │           └──────────┘
//!                            │ index +       │
//!                            │ short-lived   │
//!                            │ buffer        │
//!                            └───────────────┘
//! ```
//!
//! Two kernel subscriptions feed the engine (create/update and destroy;
//! one callback kind per handle), a ticker drives periodic compaction of
//! the index, and lookups are answered under a single engine lock with
//! bounded hold times. The event stream is lossy by design; the tracker
//! resynchronizes from later events instead of retrying.
//!
//! # Modules
//!
//! - [`config`]: construction-time configuration
//! - [`decode`]: conntrack entry → NAT key/translation projection
//! - [`error`]: error types
//! - [`generation`]: coarse time buckets driving the expiry policy
//! - [`state`]: the translation index and short-lived buffer
//! - [`stats`]: atomic counters
//! - [`tracker`]: the engine and its public [`Conntracker`] trait
//! - [`transport`]: the kernel transport seam and channel-fed test transport
//! - `netlink` (Linux): the production ctnetlink transport

pub mod config;
pub mod decode;
pub mod error;
pub mod generation;
pub mod loglimit;
#[cfg(target_os = "linux")]
pub mod netlink;
pub mod state;
pub mod stats;
pub mod tracker;
pub mod transport;

pub use config::TrackerConfig;
pub use error::{Result, TrackerError};
pub use tracker::{Conntracker, NatConntracker, INITIALIZATION_TIMEOUT, READ_TIMEOUT};
pub use transport::{
    ChannelTransport, ChannelTransportHandle, ConntrackEvent, ConntrackTransport, EventKind,
    Family, FlowEntry, FlowTuple, ProtoTuple,
};
