//! Linux ctnetlink transport.
//!
//! Talks NETLINK_NETFILTER directly: a synchronous conntrack table dump for
//! seeding, and multicast-group subscriptions for the live event stream.
//! The socket is non-blocking; reads poll on a short cadence so the
//! dispatch thread driving [`next_events`] stays responsive to shutdown.
//!
//! [`next_events`]: crate::transport::ConntrackTransport::next_events

use crate::error::{Result, TrackerError};
use crate::transport::{ConntrackEvent, ConntrackTransport, EventKind, Family, FlowEntry, FlowTuple};
use conntrack_types::Address;
use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::socket::{bind, recv, send, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType};
use nix::sys::stat::Mode;
use nix::unistd;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How long the seeding dump may take before construction fails. The init
/// worker is abandoned on the outer timeout; this inner deadline stops its
/// read loop from leaking.
const DUMP_TIMEOUT: Duration = Duration::from_secs(5);

/// nfnetlink subsystem and message types (linux/netfilter/nfnetlink.h,
/// nfnetlink_conntrack.h).
const NFNL_SUBSYS_CTNETLINK: u16 = 1;
const IPCTNL_MSG_CT_NEW: u16 = 0;
const IPCTNL_MSG_CT_GET: u16 = 1;
const IPCTNL_MSG_CT_DELETE: u16 = 2;
const NFNETLINK_V0: u8 = 0;

/// Netlink control message types and flags (linux/netlink.h).
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_DUMP: u16 = 0x300;
const NLM_F_EXCL: u16 = 0x200;
const NLM_F_CREATE: u16 = 0x400;
const NLMSG_HDRLEN: usize = 16;

/// Conntrack attribute types (nested TLVs).
const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TUPLE_REPLY: u16 = 2;
const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;
const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_IP_V6_SRC: u16 = 3;
const CTA_IP_V6_DST: u16 = 4;
const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;
const NLA_TYPE_MASK: u16 = 0x3fff;

/// Multicast group bits (NFNLGRP_CONNTRACK_*, bit = 1 << (group - 1)).
const GRP_CONNTRACK_NEW: u32 = 1 << 0;
const GRP_CONNTRACK_UPDATE: u32 = 1 << 1;
const GRP_CONNTRACK_DESTROY: u32 = 1 << 2;
const GRP_CONNTRACK_EXP_NEW: u32 = 1 << 3;

/// Subscription mask for the create/update handle. Expectation-subsystem
/// messages arrive on the EXP_NEW group but carry a different attribute
/// layout; the parser skips them by subsystem id.
pub const GROUPS_CREATE_UPDATE: u32 = GRP_CONNTRACK_NEW | GRP_CONNTRACK_UPDATE | GRP_CONNTRACK_EXP_NEW;

/// Subscription mask for the destroy handle.
pub const GROUPS_DESTROY: u32 = GRP_CONNTRACK_DESTROY;

/// An open handle on a network namespace, released on drop.
#[derive(Debug)]
pub struct NetnsHandle(RawFd);

impl NetnsHandle {
    /// Resolve the global (pid 1) network namespace under `proc_root`.
    ///
    /// Returns `None` when the namespace file cannot be opened; the caller
    /// then creates sockets in the current namespace.
    pub fn global(proc_root: &Path) -> Option<Self> {
        let path = proc_root.join("1/ns/net");
        match fcntl::open(&path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()) {
            Ok(fd) => Some(NetnsHandle(fd)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not open global network namespace, using current");
                None
            }
        }
    }

    pub fn fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for NetnsHandle {
    fn drop(&mut self) {
        let _ = unistd::close(self.0);
    }
}

/// Run `f` with the calling thread switched into `netns`, restoring the
/// original namespace afterwards. Must only be called from a thread that
/// owns no other namespace-sensitive state; the tracker calls it from its
/// dedicated init worker.
fn with_netns<T>(netns: RawFd, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let original = fcntl::open("/proc/self/ns/net", OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| TrackerError::Netlink(format!("failed to open current netns: {e}")))?;

    if let Err(e) = setns(netns, CloneFlags::CLONE_NEWNET) {
        let _ = unistd::close(original);
        return Err(TrackerError::Netlink(format!("failed to enter netns: {e}")));
    }

    let result = f();

    let restored = setns(original, CloneFlags::CLONE_NEWNET);
    let _ = unistd::close(original);
    match restored {
        Ok(()) => result,
        // The thread is stranded in the wrong namespace; nothing created
        // afterwards can be trusted.
        Err(e) => Err(TrackerError::Netlink(format!("failed to restore netns: {e}"))),
    }
}

/// A NETLINK_NETFILTER socket subscribed to a set of conntrack groups.
#[derive(Debug)]
pub struct ConntrackSocket {
    fd: Option<RawFd>,
    buffer: Vec<u8>,
    read_timeout: Duration,
    seq: u32,
}

impl ConntrackSocket {
    /// Open a socket subscribed to `groups`, optionally inside another
    /// network namespace.
    pub fn open(groups: u32, netns: Option<&NetnsHandle>, read_timeout: Duration) -> Result<Self> {
        let fd = match netns {
            Some(ns) => {
                let ns_fd = ns.fd();
                with_netns(ns_fd, || create_socket(groups))?
            }
            None => create_socket(groups)?,
        };

        fcntl::fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(|e| {
            let _ = unistd::close(fd);
            TrackerError::Netlink(format!("failed to set non-blocking: {e}"))
        })?;

        debug!(groups = %format_args!("{groups:#x}"), "conntrack socket open");

        Ok(ConntrackSocket {
            fd: Some(fd),
            buffer: vec![0u8; 64 * 1024],
            read_timeout,
            seq: 0,
        })
    }
}

fn create_socket(groups: u32) -> Result<RawFd> {
    let fd = socket(
        AddressFamily::Netlink,
        SockType::Raw,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::NetlinkNetFilter,
    )
    .map_err(|e| TrackerError::Netlink(format!("failed to create netfilter socket: {e}")))?;

    if let Err(e) = bind(fd, &NetlinkAddr::new(0, groups)) {
        let _ = unistd::close(fd);
        return Err(TrackerError::Netlink(format!("failed to bind netfilter socket: {e}")));
    }

    Ok(fd)
}

impl ConntrackTransport for ConntrackSocket {
    fn dump(&mut self, family: Family) -> Result<Vec<FlowEntry>> {
        let fd = self
            .fd
            .ok_or_else(|| TrackerError::Netlink("socket closed".to_string()))?;

        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let request = build_dump_request(family, seq);
        send(fd, &request, MsgFlags::empty())
            .map_err(|e| TrackerError::Netlink(format!("failed to send dump request: {e}")))?;

        let deadline = Instant::now() + DUMP_TIMEOUT;
        let mut entries = Vec::new();

        loop {
            match recv(fd, &mut self.buffer, MsgFlags::empty()) {
                Ok(0) => return Err(TrackerError::Netlink("socket closed during dump".to_string())),
                Ok(len) => {
                    for msg in split_messages(&self.buffer[..len]) {
                        // Subscription traffic interleaves with the dump;
                        // only our sequence belongs to it. Events arriving
                        // before callbacks are registered are dropped, which
                        // the lossy stream already tolerates.
                        if msg.seq != seq {
                            continue;
                        }
                        match msg.msg_type {
                            NLMSG_DONE => return Ok(entries),
                            NLMSG_ERROR => {
                                let errno = parse_nlmsg_error(msg.payload);
                                if errno != 0 {
                                    return Err(TrackerError::Netlink(format!(
                                        "dump rejected by kernel: errno {errno}"
                                    )));
                                }
                            }
                            t if t >> 8 == NFNL_SUBSYS_CTNETLINK => {
                                if let Some(entry) = parse_flow_entry(msg.payload) {
                                    entries.push(entry);
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Err(Errno::EAGAIN) => {
                    if Instant::now() >= deadline {
                        return Err(TrackerError::Netlink(format!(
                            "dump did not complete within {DUMP_TIMEOUT:?}"
                        )));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(Errno::EINTR) => {}
                Err(e) => {
                    return Err(TrackerError::Netlink(format!("dump receive failed: {e}")));
                }
            }
        }
    }

    fn next_events(&mut self) -> Result<Vec<ConntrackEvent>> {
        let Some(fd) = self.fd else {
            return Ok(Vec::new());
        };

        match recv(fd, &mut self.buffer, MsgFlags::empty()) {
            Ok(len) if len > 0 => {
                let mut events = Vec::new();
                for msg in split_messages(&self.buffer[..len]) {
                    let Some(kind) = event_kind(msg.msg_type, msg.flags) else {
                        continue;
                    };
                    match parse_flow_entry(msg.payload) {
                        Some(entry) => events.push(ConntrackEvent { kind, entry }),
                        None => trace!("dropping unparsable conntrack event"),
                    }
                }
                Ok(events)
            }
            Ok(_) => Ok(Vec::new()),
            Err(Errno::EAGAIN) => {
                // Nothing pending; wait out the read timeout here so the
                // dispatch loop polls at a bounded cadence.
                thread::sleep(self.read_timeout);
                Ok(Vec::new())
            }
            Err(Errno::EINTR) => Ok(Vec::new()),
            Err(Errno::ENOBUFS) => {
                // The kernel dropped events because we read too slowly. The
                // index resynchronizes from later create/update events.
                warn!("conntrack event socket overflowed, events lost");
                Ok(Vec::new())
            }
            Err(e) => Err(TrackerError::Netlink(format!("event receive failed: {e}"))),
        }
    }

    fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            let _ = unistd::close(fd);
        }
    }
}

impl Drop for ConntrackSocket {
    fn drop(&mut self) {
        ConntrackTransport::close(self);
    }
}

/// nlmsghdr + nfgenmsg for a table dump of one family.
fn build_dump_request(family: Family, seq: u32) -> [u8; NLMSG_HDRLEN + 4] {
    let msg_type = (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_GET;
    let flags = NLM_F_REQUEST | NLM_F_DUMP;
    let af = match family {
        Family::V4 => libc::AF_INET as u8,
        Family::V6 => libc::AF_INET6 as u8,
    };

    let mut buf = [0u8; NLMSG_HDRLEN + 4];
    buf[0..4].copy_from_slice(&((NLMSG_HDRLEN + 4) as u32).to_ne_bytes());
    buf[4..6].copy_from_slice(&msg_type.to_ne_bytes());
    buf[6..8].copy_from_slice(&flags.to_ne_bytes());
    buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    // pid 0: kernel assigns. nfgenmsg: family, version, res_id (big endian).
    buf[16] = af;
    buf[17] = NFNETLINK_V0;
    buf
}

/// Classify a message into an event kind. Returns `None` for messages that
/// are not conntrack-subsystem flow events (control messages, expectation
/// subsystem).
fn event_kind(msg_type: u16, flags: u16) -> Option<EventKind> {
    if msg_type >> 8 != NFNL_SUBSYS_CTNETLINK {
        return None;
    }
    match msg_type & 0xff {
        IPCTNL_MSG_CT_DELETE => Some(EventKind::Destroy),
        IPCTNL_MSG_CT_NEW if flags & (NLM_F_CREATE | NLM_F_EXCL) != 0 => Some(EventKind::New),
        IPCTNL_MSG_CT_NEW => Some(EventKind::Update),
        _ => None,
    }
}

struct RawMessage<'a> {
    msg_type: u16,
    flags: u16,
    seq: u32,
    payload: &'a [u8],
}

/// Walk the netlink messages in one datagram. Truncated or malformed
/// headers end the walk; remaining bytes are dropped.
fn split_messages(data: &[u8]) -> Vec<RawMessage<'_>> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= data.len() {
        let chunk = &data[offset..];
        let len = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
        if len < NLMSG_HDRLEN || len > chunk.len() {
            break;
        }
        messages.push(RawMessage {
            msg_type: u16::from_ne_bytes([chunk[4], chunk[5]]),
            flags: u16::from_ne_bytes([chunk[6], chunk[7]]),
            seq: u32::from_ne_bytes([chunk[8], chunk[9], chunk[10], chunk[11]]),
            payload: &chunk[NLMSG_HDRLEN..len],
        });
        // Messages are 4-byte aligned within the datagram.
        offset += (len + 3) & !3;
    }

    messages
}

fn parse_nlmsg_error(payload: &[u8]) -> i32 {
    if payload.len() < 4 {
        return 0;
    }
    -i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]])
}

/// Iterator over netlink attributes (TLVs) in a buffer.
struct NlaIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for NlaIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 4 {
            return None;
        }
        let len = u16::from_ne_bytes([self.data[0], self.data[1]]) as usize;
        let nla_type = u16::from_ne_bytes([self.data[2], self.data[3]]);
        if len < 4 || len > self.data.len() {
            return None;
        }
        let payload = &self.data[4..len];
        let aligned = (len + 3) & !3;
        self.data = if aligned >= self.data.len() {
            &[]
        } else {
            &self.data[aligned..]
        };
        Some((nla_type & NLA_TYPE_MASK, payload))
    }
}

fn attrs(data: &[u8]) -> NlaIter<'_> {
    NlaIter { data }
}

/// Parse a conntrack message payload (nfgenmsg + attributes) into a flow
/// entry. Attributes beyond the origin/reply tuples are ignored.
fn parse_flow_entry(payload: &[u8]) -> Option<FlowEntry> {
    // Skip the 4-byte nfgenmsg.
    let body = payload.get(4..)?;

    let mut entry = FlowEntry::default();
    for (nla_type, tuple_data) in attrs(body) {
        match nla_type {
            CTA_TUPLE_ORIG => entry.origin = Some(parse_tuple(tuple_data)),
            CTA_TUPLE_REPLY => entry.reply = Some(parse_tuple(tuple_data)),
            _ => {}
        }
    }

    if entry.origin.is_none() && entry.reply.is_none() {
        return None;
    }
    Some(entry)
}

fn parse_tuple(data: &[u8]) -> FlowTuple {
    let mut tuple = FlowTuple::default();

    for (nla_type, payload) in attrs(data) {
        match nla_type {
            CTA_TUPLE_IP => {
                for (ip_type, addr) in attrs(payload) {
                    match ip_type {
                        CTA_IP_V4_SRC => tuple.src = parse_v4(addr),
                        CTA_IP_V4_DST => tuple.dst = parse_v4(addr),
                        CTA_IP_V6_SRC => tuple.src = parse_v6(addr),
                        CTA_IP_V6_DST => tuple.dst = parse_v6(addr),
                        _ => {}
                    }
                }
            }
            CTA_TUPLE_PROTO => {
                for (proto_type, value) in attrs(payload) {
                    match proto_type {
                        CTA_PROTO_NUM if !value.is_empty() => {
                            tuple.proto.number = Some(value[0]);
                        }
                        CTA_PROTO_SRC_PORT => tuple.proto.src_port = parse_be16(value),
                        CTA_PROTO_DST_PORT => tuple.proto.dst_port = parse_be16(value),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    tuple
}

fn parse_v4(data: &[u8]) -> Option<Address> {
    let octets: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(Address::from(Ipv4Addr::from(octets)))
}

fn parse_v6(data: &[u8]) -> Option<Address> {
    let octets: [u8; 16] = data.get(..16)?.try_into().ok()?;
    Some(Address::from(Ipv6Addr::from(octets)))
}

fn parse_be16(data: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = data.get(..2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}
