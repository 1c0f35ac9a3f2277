use thiserror::Error;

use crate::engine::EngineError;
use crate::registry::SocketId;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failures surfaced by bridge operations.
///
/// `WouldBlock` from the engine never appears here: the event bridge absorbs it by waiting for
/// readiness and retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Bad control/data ordering on the channel, or a repeated configuration.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("cannot resolve address {input:?}: {reason}")]
    AddressResolution { input: String, reason: &'static str },

    #[error("invalid socket id {0}")]
    UnknownSocket(SocketId),

    #[error("unsupported protocol: network {network:?}, transport {transport:?}")]
    UnsupportedProtocol { network: String, transport: String },

    #[error(transparent)]
    StackEngine(#[from] EngineError),
}
