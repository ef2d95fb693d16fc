//! Flow identification and NAT translation types.

use crate::{Address, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The L4 transports tracked by the conntrack mirror.
///
/// Flows on any other protocol are dropped at the decode boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    /// Map an L4 protocol number to a tracked transport.
    ///
    /// Returns `None` for anything other than TCP (6) and UDP (17).
    pub const fn from_l4_proto(proto: u8) -> Option<Self> {
        match proto {
            6 => Some(Transport::Tcp),
            17 => Some(Transport::Udp),
            _ => None,
        }
    }

    /// The IANA protocol number.
    pub const fn l4_proto(&self) -> u8 {
        match self {
            Transport::Tcp => 6,
            Transport::Udp => 17,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Transport {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" | "TCP" => Ok(Transport::Tcp),
            "udp" | "UDP" => Ok(Transport::Udp),
            other => Err(ParseError::InvalidTransport(other.to_string())),
        }
    }
}

/// The pre-NAT origin endpoint of one side of a flow.
///
/// Two distinct flows sharing the same origin 3-tuple cannot both be
/// tracked; the later registration overwrites the earlier, matching the
/// kernel's own uniqueness on the origin tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnKey {
    pub ip: Address,
    pub port: u16,
    pub transport: Transport,
}

impl ConnKey {
    pub const fn new(ip: Address, port: u16, transport: Transport) -> Self {
        ConnKey {
            ip,
            port,
            transport,
        }
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.transport)
    }
}

/// The reply-tuple view of a flow: the endpoints the peer believes it is
/// talking to after NAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub repl_src_ip: Address,
    pub repl_dst_ip: Address,
    pub repl_src_port: u16,
    pub repl_dst_port: u16,
}

impl fmt::Display for Translation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.repl_src_ip, self.repl_src_port, self.repl_dst_ip, self.repl_dst_port
        )
    }
}
