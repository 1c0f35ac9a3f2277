//! Remote address resolution for socket operations.
//!
//! Only literal addresses are accepted; there is no name service behind the tunnel. The family of
//! the literal must match the socket's network protocol.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::engine::NetworkProtocol;
use crate::error::{BridgeError, Result};

/// Resolve `host:port` (IPv6 hosts in brackets) for a socket of the given family.
///
/// An empty host resolves to the unspecified address of that family.
pub fn resolve(network: NetworkProtocol, input: &str) -> Result<SocketAddr> {
    let fail = |reason| BridgeError::AddressResolution {
        input: input.to_string(),
        reason,
    };

    let (host, port) = split_host_port(input).ok_or_else(|| fail("missing port"))?;
    let port: u16 = port.parse().map_err(|_| fail("invalid port"))?;

    let ip = if host.is_empty() {
        match network {
            NetworkProtocol::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            NetworkProtocol::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    } else {
        host.parse::<IpAddr>().map_err(|_| fail("invalid host"))?
    };

    let ip = match (network, ip) {
        (NetworkProtocol::Ipv4, IpAddr::V6(v6)) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .ok_or_else(|| fail("no suitable address"))?,
        (NetworkProtocol::Ipv6, IpAddr::V4(_)) => return Err(fail("no suitable address")),
        (_, ip) => ip,
    };

    Ok(SocketAddr::new(ip, port))
}

fn split_host_port(input: &str) -> Option<(&str, &str)> {
    if let Some(rest) = input.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port = rest.strip_prefix(':')?;
        return Some((host, port));
    }
    let (host, port) = input.rsplit_once(':')?;
    if host.contains(':') {
        // Unbracketed IPv6 literal.
        return None;
    }
    Some((host, port))
}
