//! Kernel conntrack transport seam.
//!
//! The tracker engine is written against [`ConntrackTransport`], which
//! delivers a dump snapshot plus a stream of typed events. The production
//! implementation is the ctnetlink socket in [`crate::netlink`]; tests and
//! non-Linux development use [`ChannelTransport`], which is fed through an
//! in-process channel.

use crate::error::Result;
use conntrack_types::Address;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

/// Address family of a conntrack table dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const fn name(&self) -> &'static str {
        match self {
            Family::V4 => "IPv4",
            Family::V6 => "IPv6",
        }
    }
}

/// L4 sub-tuple of a conntrack tuple. Any field may be absent on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtoTuple {
    pub number: Option<u8>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

/// One side of a conntrack entry (origin or reply view of the flow).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowTuple {
    pub src: Option<Address>,
    pub dst: Option<Address>,
    pub proto: ProtoTuple,
}

/// A conntrack entry as delivered by the kernel: the pre-NAT origin tuple
/// and the post-NAT reply tuple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowEntry {
    pub origin: Option<FlowTuple>,
    pub reply: Option<FlowTuple>,
}

/// The event kinds a subscription can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A new flow entered the conntrack table (includes expected flows).
    New,
    /// An existing flow was updated.
    Update,
    /// The flow was removed from the conntrack table.
    Destroy,
}

/// One conntrack event from a kernel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConntrackEvent {
    pub kind: EventKind,
    pub entry: FlowEntry,
}

/// A source of conntrack state: a synchronous table dump plus an event
/// stream read on a short cadence.
///
/// The event stream is inherently lossy; the kernel drops events under
/// load and the tracker resynchronizes via later events rather than
/// retrying. `next_events` must return within roughly the configured read
/// timeout even when no events are pending, so the dispatch thread driving
/// it stays responsive to shutdown.
pub trait ConntrackTransport: Send {
    /// Synchronously dump the conntrack table for one address family.
    fn dump(&mut self, family: Family) -> Result<Vec<FlowEntry>>;

    /// Return the events received since the last call, or an empty batch
    /// after the read timeout elapses.
    fn next_events(&mut self) -> Result<Vec<ConntrackEvent>>;

    /// Release the underlying resources. Further calls may fail.
    fn close(&mut self);
}

/// Handle for feeding a [`ChannelTransport`] from a test or simulation.
#[derive(Clone)]
pub struct ChannelTransportHandle {
    tx: Sender<ConntrackEvent>,
}

impl ChannelTransportHandle {
    /// Enqueue an event for delivery on the next `next_events` call.
    /// Returns false once the transport side has been closed.
    pub fn send(&self, event: ConntrackEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// In-process transport fed over an mpsc channel.
///
/// The dump snapshot is fixed at construction; events arrive through the
/// paired [`ChannelTransportHandle`]. `next_events` blocks for at most the
/// read timeout, mirroring the cadence of the netlink socket.
pub struct ChannelTransport {
    dump_v4: Vec<FlowEntry>,
    dump_v6: Vec<FlowEntry>,
    rx: Option<Receiver<ConntrackEvent>>,
    read_timeout: Duration,
}

impl ChannelTransport {
    pub fn new(read_timeout: Duration) -> (Self, ChannelTransportHandle) {
        let (tx, rx) = mpsc::channel();
        (
            ChannelTransport {
                dump_v4: Vec::new(),
                dump_v6: Vec::new(),
                rx: Some(rx),
                read_timeout,
            },
            ChannelTransportHandle { tx },
        )
    }

    /// Set the snapshot returned by the IPv4 dump.
    pub fn with_dump_v4(mut self, entries: Vec<FlowEntry>) -> Self {
        self.dump_v4 = entries;
        self
    }

    /// Set the snapshot returned by the IPv6 dump.
    pub fn with_dump_v6(mut self, entries: Vec<FlowEntry>) -> Self {
        self.dump_v6 = entries;
        self
    }
}

impl ConntrackTransport for ChannelTransport {
    fn dump(&mut self, family: Family) -> Result<Vec<FlowEntry>> {
        Ok(match family {
            Family::V4 => self.dump_v4.clone(),
            Family::V6 => self.dump_v6.clone(),
        })
    }

    fn next_events(&mut self) -> Result<Vec<ConntrackEvent>> {
        let Some(rx) = self.rx.as_ref() else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        match rx.recv_timeout(self.read_timeout) {
            Ok(event) => {
                events.push(event);
                // Drain whatever else is already queued.
                while let Ok(event) = rx.try_recv() {
                    events.push(event);
                }
            }
            Err(_) => {}
        }
        Ok(events)
    }

    fn close(&mut self) {
        self.rx = None;
    }
}
