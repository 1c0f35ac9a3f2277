use std::net::IpAddr;

use wst_tunnel_protocol::NetConf;

use crate::context::NetContext;
use crate::engine::{NetworkProtocol, Route, StackOptions, Subnet, TransportProtocol};
use crate::error::{BridgeError, Result};
use crate::NIC_ID;

impl NetContext {
    /// Build the engine from the first configuration message and open the readiness gate.
    ///
    /// Registers every supported protocol, attaches the NIC, assigns the IPv4 address and
    /// installs a single default IPv4 route. No IPv6 address is assigned, so IPv6 sockets can be
    /// created but have no source address to send from.
    pub(crate) fn bootstrap(&self, conf: NetConf) -> Result<()> {
        tracing::info!(
            address = %conf.ipv4.address,
            gateway = %conf.ipv4.gateway,
            prefix_length = conf.ipv4.prefix_length,
            "IPv4 configuration"
        );
        tracing::info!(
            address = %conf.ipv6.address,
            gateway = %conf.ipv6.gateway,
            prefix_length = conf.ipv6.prefix_length,
            "IPv6 configuration"
        );

        let invalid = |err: wst_tunnel_protocol::Error| BridgeError::ProtocolViolation(err.to_string());
        let address = conf.ipv4_address().map_err(invalid)?;
        let prefix_length = conf.ipv4_prefix_length().map_err(invalid)?;
        let gateway = conf.ipv4_gateway().map_err(invalid)?;

        let stack = self.factory.new_stack(StackOptions {
            network_protocols: vec![NetworkProtocol::Ipv4, NetworkProtocol::Ipv6],
            transport_protocols: vec![
                TransportProtocol::Tcp,
                TransportProtocol::Udp,
                TransportProtocol::Icmp,
            ],
        })?;
        stack.create_nic(NIC_ID, self.nic.clone())?;
        stack.add_address(
            NIC_ID,
            NetworkProtocol::Ipv4,
            IpAddr::V4(address),
            prefix_length,
        )?;
        stack.set_route_table(vec![Route {
            destination: Subnet::IPV4_ANY,
            gateway: gateway.map(IpAddr::V4),
            nic: NIC_ID,
        }])?;

        if matches!(conf.ipv6_address(), Ok(Some(_))) {
            tracing::debug!("IPv6 address configured but not assigned; IPv6 egress is unverified");
        }

        if self.stack.set(stack).is_err() {
            return Err(BridgeError::ProtocolViolation(
                "network stack already built".to_string(),
            ));
        }
        let _ = self.netconf.set(conf);
        self.open_gate();
        tracing::info!("network stack ready");
        Ok(())
    }
}
