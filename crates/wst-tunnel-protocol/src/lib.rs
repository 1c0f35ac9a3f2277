#![forbid(unsafe_code)]

//! Message model for the packet tunnel channel.
//!
//! The channel is a single duplex message stream (typically a WebSocket). Two message kinds flow
//! over it:
//!
//! - exactly one *control* message, sent first by the remote side, carrying the network
//!   configuration as JSON text:
//!
//!   ```text
//!   {"ipv4": {"address": "10.0.0.5", "gateway": "10.0.0.1", "prefix_length": 24},
//!    "ipv6": {"address": "fd00::5", "gateway": "fd00::1", "prefix_length": 64}}
//!   ```
//!
//! - any number of *data* messages, each a raw IPv4 or IPv6 packet with no link-layer header.
//!   The version nibble of the first byte selects the network protocol.

use core::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// Largest control payload accepted by [`decode_netconf`].
pub const MAX_CONTROL_PAYLOAD: usize = 4 * 1024;

/// Per-family address configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConf {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub prefix_length: u8,
}

/// Network configuration delivered as the first channel message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConf {
    #[serde(default)]
    pub ipv4: IpConf,
    #[serde(default)]
    pub ipv6: IpConf,
}

impl NetConf {
    pub fn ipv4_address(&self) -> Result<Ipv4Addr, Error> {
        parse_addr("ipv4.address", &self.ipv4.address)
    }

    /// IPv4 next hop, if one was configured.
    pub fn ipv4_gateway(&self) -> Result<Option<Ipv4Addr>, Error> {
        if self.ipv4.gateway.trim().is_empty() {
            return Ok(None);
        }
        parse_addr("ipv4.gateway", &self.ipv4.gateway).map(Some)
    }

    pub fn ipv4_prefix_length(&self) -> Result<u8, Error> {
        check_prefix("ipv4.prefix_length", self.ipv4.prefix_length, 32)
    }

    /// IPv6 local address, if one was configured.
    pub fn ipv6_address(&self) -> Result<Option<Ipv6Addr>, Error> {
        if self.ipv6.address.trim().is_empty() {
            return Ok(None);
        }
        parse_addr("ipv6.address", &self.ipv6.address).map(Some)
    }
}

fn parse_addr<A: core::str::FromStr>(field: &'static str, raw: &str) -> Result<A, Error> {
    raw.trim().parse().map_err(|_| Error::InvalidAddress {
        field,
        value: raw.to_string(),
    })
}

fn check_prefix(field: &'static str, prefix: u8, max: u8) -> Result<u8, Error> {
    if prefix > max {
        return Err(Error::InvalidPrefixLength { field, prefix, max });
    }
    Ok(prefix)
}

/// A single message received from (or sent to) the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Structured text payload (network configuration).
    Control(String),
    /// Raw IP packet.
    Data(Vec<u8>),
}

impl ChannelMessage {
    pub fn is_control(&self) -> bool {
        matches!(self, ChannelMessage::Control(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4 = 4,
    V6 = 6,
}

/// Classify a raw packet by the version nibble of its first byte.
///
/// Returns `None` for empty frames and unrecognised versions; callers drop those silently.
pub fn probe_ip_version(frame: &[u8]) -> Option<IpVersion> {
    match frame.first()? >> 4 {
        4 => Some(IpVersion::V4),
        6 => Some(IpVersion::V6),
        _ => None,
    }
}

pub fn decode_netconf(text: &str) -> Result<NetConf, Error> {
    if text.len() > MAX_CONTROL_PAYLOAD {
        return Err(Error::ControlTooLarge {
            len: text.len(),
            max: MAX_CONTROL_PAYLOAD,
        });
    }
    let conf: NetConf =
        serde_json::from_str(text).map_err(|err| Error::InvalidJson(err.to_string()))?;
    // Every address field must parse before the configuration is accepted.
    conf.ipv4_address()?;
    conf.ipv4_gateway()?;
    conf.ipv4_prefix_length()?;
    conf.ipv6_address()?;
    Ok(conf)
}

pub fn encode_netconf(conf: &NetConf) -> String {
    // Serialising plain strings and integers cannot fail.
    serde_json::to_string(conf).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    ControlTooLarge {
        len: usize,
        max: usize,
    },
    InvalidJson(String),
    InvalidAddress {
        field: &'static str,
        value: String,
    },
    InvalidPrefixLength {
        field: &'static str,
        prefix: u8,
        max: u8,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ControlTooLarge { len, max } => {
                write!(f, "control payload too large: {len} > {max}")
            }
            Error::InvalidJson(err) => write!(f, "cannot decode network configuration: {err}"),
            Error::InvalidAddress { field, value } => {
                write!(f, "invalid address in {field}: {value:?}")
            }
            Error::InvalidPrefixLength { field, prefix, max } => {
                write!(f, "invalid {field}: {prefix} > {max}")
            }
        }
    }
}

impl std::error::Error for Error {}
