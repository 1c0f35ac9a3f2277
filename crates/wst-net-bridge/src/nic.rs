use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use wst_tunnel_protocol::{probe_ip_version, IpVersion};

use crate::engine::{
    EngineError, LinkAddress, LinkCapabilities, LinkEndpoint, NetworkDispatcher, NetworkProtocol,
    PacketBuffer,
};

pub const DEFAULT_MTU: u32 = 1500;

/// Outbound half of the external channel: accepts whole frames, one message each.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), EngineError>;
}

impl FrameSink for mpsc::UnboundedSender<Vec<u8>> {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), EngineError> {
        self.send(frame).map_err(|_| EngineError::LinkClosed)
    }
}

/// What [`VirtualNic::deliver`] did with an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ipv4,
    Ipv6,
    DroppedEmpty,
    DroppedUnknownVersion(u8),
    DroppedDetached,
}

impl Disposition {
    pub fn is_dispatched(self) -> bool {
        matches!(self, Disposition::Ipv4 | Disposition::Ipv6)
    }
}

/// Link endpoint backed by the external channel.
///
/// Transmit forwards each assembled packet as a single outbound message with no buffering; the
/// channel's own flow control is the only backpressure. Receive routes frames by IP version to
/// the attached dispatcher.
pub struct VirtualNic {
    sink: Arc<dyn FrameSink>,
    dispatcher: OnceLock<Arc<dyn NetworkDispatcher>>,
    mtu: u32,
}

impl VirtualNic {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self::with_mtu(sink, DEFAULT_MTU)
    }

    pub fn with_mtu(sink: Arc<dyn FrameSink>, mtu: u32) -> Self {
        Self {
            sink,
            dispatcher: OnceLock::new(),
            mtu,
        }
    }

    /// Hand an inbound frame to the stack.
    pub fn deliver(&self, frame: Vec<u8>) -> Disposition {
        let protocol = match probe_ip_version(&frame) {
            Some(IpVersion::V4) => NetworkProtocol::Ipv4,
            Some(IpVersion::V6) => NetworkProtocol::Ipv6,
            None => {
                let disposition = match frame.first() {
                    None => Disposition::DroppedEmpty,
                    Some(&b) => Disposition::DroppedUnknownVersion(b >> 4),
                };
                tracing::debug!(?disposition, len = frame.len(), "dropping inbound frame");
                return disposition;
            }
        };

        let Some(dispatcher) = self.dispatcher.get() else {
            tracing::debug!(len = frame.len(), "dropping inbound frame: nic not attached");
            return Disposition::DroppedDetached;
        };

        dispatcher.deliver_network_packet(
            LinkAddress::PLACEHOLDER,
            LinkAddress::PLACEHOLDER,
            protocol,
            frame,
        );
        match protocol {
            NetworkProtocol::Ipv4 => Disposition::Ipv4,
            NetworkProtocol::Ipv6 => Disposition::Ipv6,
        }
    }
}

impl LinkEndpoint for VirtualNic {
    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn capabilities(&self) -> LinkCapabilities {
        LinkCapabilities::empty()
    }

    fn max_header_length(&self) -> u16 {
        0
    }

    fn link_address(&self) -> LinkAddress {
        LinkAddress::PLACEHOLDER
    }

    fn attach(&self, dispatcher: Arc<dyn NetworkDispatcher>) -> Result<(), EngineError> {
        self.dispatcher
            .set(dispatcher)
            .map_err(|_| EngineError::AlreadyAttached)
    }

    fn is_attached(&self) -> bool {
        self.dispatcher.get().is_some()
    }

    fn write_packet(
        &self,
        _protocol: NetworkProtocol,
        packet: PacketBuffer,
    ) -> Result<(), EngineError> {
        self.sink.send_frame(packet.into_frame())
    }

    fn write_packets(
        &self,
        _protocol: NetworkProtocol,
        _packets: Vec<PacketBuffer>,
    ) -> Result<usize, EngineError> {
        unimplemented!("write_packets is not supported by the virtual nic")
    }

    fn write_raw_packet(&self, _frame: Vec<u8>) -> Result<(), EngineError> {
        unimplemented!("write_raw_packet is not supported by the virtual nic")
    }
}
