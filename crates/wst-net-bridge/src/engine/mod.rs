//! Contract between the bridge and the user-space network stack.
//!
//! The bridge never implements protocol state machines itself. Everything below the socket layer
//! (addressing, checksums, routing, retransmission) lives behind [`StackEngine`]. The engine in
//! turn talks to the outside world through a [`LinkEndpoint`] (the virtual NIC) and hands received
//! packets back to the stack through the [`NetworkDispatcher`] it attaches to that link.
//!
//! Endpoint I/O is strictly non-blocking: operations that cannot complete return
//! [`EngineError::WouldBlock`] (or [`EngineError::ConnectStarted`]) and the engine later signals
//! readiness through the endpoint's [`WaiterQueue`].

use core::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

use crate::waiter::WaiterQueue;

mod smol;

pub use smol::{SmolFactory, SmolStack};

pub type NicId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
}

impl NetworkProtocol {
    /// Parse the caller-facing family name (`ip4` / `ip6`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ip4" => Some(Self::Ipv4),
            "ip6" => Some(Self::Ipv6),
            _ => None,
        }
    }

    /// Numeric family code used by the shared-memory caller surface (0 = ip4, 1 = ip6).
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Ipv4),
            1 => Some(Self::Ipv6),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ipv4 => "ip4",
            Self::Ipv6 => "ip6",
        }
    }

    pub fn matches(self, addr: IpAddr) -> bool {
        matches!(
            (self, addr),
            (Self::Ipv4, IpAddr::V4(_)) | (Self::Ipv6, IpAddr::V6(_))
        )
    }
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl TransportProtocol {
    /// Parse the caller-facing transport name (`tcp` / `udp` / `icmp`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            "icmp" => Some(Self::Icmp),
            _ => None,
        }
    }

    /// Numeric transport code used by the shared-memory caller surface (0 = tcp, 1 = udp).
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Tcp),
            1 => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }

    /// Connection-oriented byte stream (as opposed to message-oriented datagrams).
    pub fn is_stream(self) -> bool {
        matches!(self, Self::Tcp)
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Network address qualified by the NIC it is reachable through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullAddress {
    pub nic: NicId,
    pub addr: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    pub address: IpAddr,
    pub prefix_length: u8,
}

impl Subnet {
    /// `0.0.0.0/0`.
    pub const IPV4_ANY: Subnet = Subnet {
        address: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        prefix_length: 0,
    };

    pub fn is_default(&self) -> bool {
        self.prefix_length == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: Subnet,
    /// Next hop. `None` means the destination is on-link.
    pub gateway: Option<IpAddr>,
    pub nic: NicId,
}

/// Protocols the engine must support; fixed when the stack is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackOptions {
    pub network_protocols: Vec<NetworkProtocol>,
    pub transport_protocols: Vec<TransportProtocol>,
}

impl StackOptions {
    pub fn supports(&self, network: NetworkProtocol, transport: TransportProtocol) -> bool {
        self.network_protocols.contains(&network) && self.transport_protocols.contains(&transport)
    }
}

/// Six-byte link-layer address. The tunnel carries bare IP packets, so only
/// [`LinkAddress::PLACEHOLDER`] is ever used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkAddress(pub [u8; 6]);

impl LinkAddress {
    pub const PLACEHOLDER: LinkAddress = LinkAddress([0; 6]);
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LinkCapabilities: u32 {
        const RX_CHECKSUM_OFFLOAD = 1 << 0;
        const TX_CHECKSUM_OFFLOAD = 1 << 1;
        const LOOPBACK = 1 << 2;
    }
}

/// Outbound packet as assembled by the stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketBuffer {
    pub network_header: Vec<u8>,
    pub transport_header: Vec<u8>,
    pub data: Vec<u8>,
}

impl PacketBuffer {
    pub fn len(&self) -> usize {
        self.network_header.len() + self.transport_header.len() + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenate headers and payload into one contiguous frame.
    pub fn into_frame(self) -> Vec<u8> {
        let mut frame = self.network_header;
        frame.reserve(self.transport_header.len() + self.data.len());
        frame.extend_from_slice(&self.transport_header);
        frame.extend_from_slice(&self.data);
        frame
    }
}

/// One unit of data returned by [`Endpoint::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunk {
    pub data: Vec<u8>,
    /// Sender address; only populated for datagram endpoints.
    pub remote: Option<FullAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("operation would block")]
    WouldBlock,
    #[error("connection attempt started")]
    ConnectStarted,
    #[error("endpoint is closed for receive")]
    ClosedForReceive,
    #[error("endpoint is closed for send")]
    ClosedForSend,
    #[error("connection was refused")]
    ConnectionRefused,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection timed out")]
    TimedOut,
    #[error("endpoint not connected")]
    NotConnected,
    #[error("endpoint is already connected")]
    AlreadyConnected,
    #[error("endpoint is in invalid state")]
    InvalidEndpointState,
    #[error("destination address is required")]
    DestinationRequired,
    #[error("bad address")]
    BadAddress,
    #[error("no route to host")]
    NoRoute,
    #[error("message too long")]
    MessageTooLong,
    #[error("unknown protocol")]
    UnknownProtocol,
    #[error("duplicate nic id {0}")]
    DuplicateNic(NicId),
    #[error("unknown nic id {0}")]
    UnknownNic(NicId),
    #[error("link endpoint already has a dispatcher attached")]
    AlreadyAttached,
    #[error("link is closed")]
    LinkClosed,
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// The peer (or local side) will never accept or produce more data on this endpoint.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, EngineError::ClosedForReceive | EngineError::ClosedForSend)
    }
}

/// Entry point for packets received by a link.
pub trait NetworkDispatcher: Send + Sync {
    fn deliver_network_packet(
        &self,
        remote: LinkAddress,
        local: LinkAddress,
        protocol: NetworkProtocol,
        packet: Vec<u8>,
    );
}

/// Link-layer contract the stack drives to put packets on the wire.
pub trait LinkEndpoint: Send + Sync {
    fn mtu(&self) -> u32;

    fn capabilities(&self) -> LinkCapabilities;

    fn max_header_length(&self) -> u16;

    fn link_address(&self) -> LinkAddress;

    /// Attach the stack's dispatcher. A link accepts exactly one dispatcher.
    fn attach(&self, dispatcher: Arc<dyn NetworkDispatcher>) -> Result<(), EngineError>;

    fn is_attached(&self) -> bool;

    fn write_packet(&self, protocol: NetworkProtocol, packet: PacketBuffer)
        -> Result<(), EngineError>;

    fn write_packets(
        &self,
        protocol: NetworkProtocol,
        packets: Vec<PacketBuffer>,
    ) -> Result<usize, EngineError>;

    fn write_raw_packet(&self, frame: Vec<u8>) -> Result<(), EngineError>;
}

/// A transport endpoint owned by exactly one socket.
pub trait Endpoint: Send + Sync {
    /// Start connecting. Returns [`EngineError::ConnectStarted`] when completion is signalled
    /// later through `EventMask::OUT`.
    fn connect(&self, addr: FullAddress) -> Result<(), EngineError>;

    /// Non-blocking write; `to` overrides the connected peer for datagram endpoints.
    fn write(&self, payload: &[u8], to: Option<FullAddress>) -> Result<usize, EngineError>;

    /// Non-blocking read of one chunk (stream) or one datagram.
    fn read(&self) -> Result<ReadChunk, EngineError>;

    /// Take and clear the pending asynchronous error, if any. A closed endpoint always reports one.
    fn take_error(&self) -> Option<EngineError>;

    fn close(&self);
}

pub trait StackEngine: Send + Sync {
    fn create_nic(&self, id: NicId, link: Arc<dyn LinkEndpoint>) -> Result<(), EngineError>;

    fn add_address(
        &self,
        nic: NicId,
        protocol: NetworkProtocol,
        address: IpAddr,
        prefix_length: u8,
    ) -> Result<(), EngineError>;

    /// Replace the routing table.
    fn set_route_table(&self, routes: Vec<Route>) -> Result<(), EngineError>;

    fn new_endpoint(
        &self,
        transport: TransportProtocol,
        network: NetworkProtocol,
        waiters: Arc<WaiterQueue>,
    ) -> Result<Box<dyn Endpoint>, EngineError>;
}

/// Builds a [`StackEngine`] with the requested protocols registered.
pub trait EngineFactory: Send + Sync {
    fn new_stack(&self, options: StackOptions) -> Result<Arc<dyn StackEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn(StackOptions) -> Result<Arc<dyn StackEngine>, EngineError> + Send + Sync,
{
    fn new_stack(&self, options: StackOptions) -> Result<Arc<dyn StackEngine>, EngineError> {
        self(options)
    }
}
