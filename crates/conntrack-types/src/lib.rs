//! Shared connection-tracking primitives.
//!
//! This crate provides the types exchanged between the NAT connection
//! tracker and its consumers:
//!
//! - [`Address`]: a 16-byte canonical IP address container
//! - [`Transport`]: the tracked L4 transports (TCP, UDP)
//! - [`ConnKey`]: the pre-NAT origin endpoint of a flow
//! - [`Translation`]: the reply-tuple (post-NAT) view of a flow

mod addr;
mod flow;

pub use addr::Address;
pub use flow::{ConnKey, Translation, Transport};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid transport protocol: {0}")]
    InvalidTransport(String),
}
