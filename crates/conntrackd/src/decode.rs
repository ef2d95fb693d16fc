//! Conntrack entry decoder.
//!
//! Classifies entries as NAT and projects them into the index key/value
//! pair. Entries with missing fields or an untracked L4 protocol are
//! silently dropped; the event stream is lossy by design and a malformed
//! entry is not an error.

use crate::state::IndexEntry;
use crate::transport::{FlowEntry, FlowTuple};
use conntrack_types::{ConnKey, Translation, Transport};

/// Returns true iff the entry represents a NAT'd flow: the reply tuple is
/// not the byte-reversed mirror of the origin tuple. Entries with any
/// required field absent are not NAT.
pub fn is_nat(entry: &FlowEntry) -> bool {
    let (Some(origin), Some(reply)) = (&entry.origin, &entry.reply) else {
        return false;
    };
    let (Some(origin_src), Some(origin_dst)) = (origin.src, origin.dst) else {
        return false;
    };
    let (Some(reply_src), Some(reply_dst)) = (reply.src, reply.dst) else {
        return false;
    };
    let (Some(origin_src_port), Some(origin_dst_port)) =
        (origin.proto.src_port, origin.proto.dst_port)
    else {
        return false;
    };
    let (Some(reply_src_port), Some(reply_dst_port)) = (reply.proto.src_port, reply.proto.dst_port)
    else {
        return false;
    };

    origin_src != reply_dst
        || origin_dst != reply_src
        || origin_src_port != reply_dst_port
        || origin_dst_port != reply_src_port
}

/// Project the entry's origin tuple into the index key.
///
/// Returns `None` when the source endpoint is absent or the L4 protocol is
/// not TCP or UDP.
pub fn format_key(entry: &FlowEntry) -> Option<ConnKey> {
    let origin = entry.origin.as_ref()?;
    let ip = origin.src?;
    let port = origin.proto.src_port?;
    let transport = Transport::from_l4_proto(origin.proto.number?)?;
    Some(ConnKey::new(ip, port, transport))
}

/// Project the entry's reply tuple into an index entry stamped with the
/// given expiry generation.
pub fn format_translation(entry: &FlowEntry, exp_generation: u8) -> Option<IndexEntry> {
    let reply: &FlowTuple = entry.reply.as_ref()?;
    Some(IndexEntry {
        translation: Translation {
            repl_src_ip: reply.src?,
            repl_dst_ip: reply.dst?,
            repl_src_port: reply.proto.src_port?,
            repl_dst_port: reply.proto.dst_port?,
        },
        exp_generation,
    })
}
