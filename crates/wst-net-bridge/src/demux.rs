//! Classification of inbound channel messages.

use std::sync::atomic::Ordering;

use wst_tunnel_protocol::{decode_netconf, ChannelMessage};

use crate::context::NetContext;
use crate::engine::LinkEndpoint;
use crate::error::{BridgeError, Result};
use crate::nic::Disposition;

/// What the demultiplexer did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Configured,
    Frame(Disposition),
}

impl NetContext {
    /// Feed one message received from the channel.
    ///
    /// The first message must be the configuration; it is applied exactly once. Packets are only
    /// accepted once the stack is ready.
    ///
    /// A configuration that fails to decode, or whose stack cannot be built before the NIC is
    /// attached, may be retried. A failure after the NIC has been attached is final: the gate
    /// never opens and socket operations keep waiting.
    pub fn handle_message(&self, message: ChannelMessage) -> Result<Inbound> {
        match message {
            ChannelMessage::Control(text) => self.handle_control(&text),
            ChannelMessage::Data(frame) => self.handle_frame(frame),
        }
    }

    fn handle_control(&self, text: &str) -> Result<Inbound> {
        let twice =
            || BridgeError::ProtocolViolation("got network configuration twice".to_string());

        if self.configured.load(Ordering::Acquire) {
            return Err(twice());
        }
        let conf = decode_netconf(text)
            .map_err(|err| BridgeError::ProtocolViolation(err.to_string()))?;
        if self.configured.swap(true, Ordering::AcqRel) {
            return Err(twice());
        }

        if let Err(err) = self.bootstrap(conf) {
            if !self.nic.is_attached() {
                self.configured.store(false, Ordering::Release);
            }
            return Err(err);
        }
        Ok(Inbound::Configured)
    }

    fn handle_frame(&self, frame: Vec<u8>) -> Result<Inbound> {
        if !self.is_ready() {
            return Err(BridgeError::ProtocolViolation(
                "got packet before network configuration".to_string(),
            ));
        }
        Ok(Inbound::Frame(self.nic.deliver(frame)))
    }
}
