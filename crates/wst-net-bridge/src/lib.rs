//! Socket API over a user-space TCP/IP stack whose only link is a message tunnel.
//!
//! A [`NetContext`] owns one virtual NIC. Raw IP packets arrive as binary channel messages and are
//! fed in through [`NetContext::handle_message`]; packets the stack emits leave through the
//! [`FrameSink`] given at construction. The first text message carries the network configuration.
//! Until it has been applied, every socket operation waits.
//!
//! Callers drive sockets either directly through the `async` methods on [`NetContext`] or through
//! [`SocketApi`], which runs each call as its own task and resolves to a [`Rejection`] on failure.
#![forbid(unsafe_code)]

mod addr;
mod bootstrap;
mod context;
mod demux;
pub mod engine;
mod error;
mod gateway;
pub mod iovec;
mod nic;
mod registry;
mod socket;
pub mod waiter;

pub use addr::resolve;
pub use context::NetContext;
pub use demux::Inbound;
pub use engine::{NicId, SmolFactory, SmolStack};
pub use error::{BridgeError, Result};
pub use gateway::{spawn_op, Pending, RecvResult, Rejection, SocketApi};
pub use nic::{Disposition, FrameSink, VirtualNic, DEFAULT_MTU};
pub use registry::{SocketId, SocketRegistry};
pub use socket::{Received, Socket};

pub use wst_tunnel_protocol::{ChannelMessage, NetConf};

/// The single NIC every bridge stack is built with.
pub const NIC_ID: NicId = 1;
