//! Asynchronous operation surface exposed to the embedding caller.
//!
//! Each call starts a task on the runtime and returns a [`Pending`] handle immediately. The handle
//! resolves with the operation's value, or with a [`Rejection`] when the operation fails or
//! panics. A panic inside one operation never takes down the caller or the other operations.

use core::fmt;
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::task::{JoinError, JoinHandle};

use crate::context::NetContext;
use crate::engine::{NetworkProtocol, TransportProtocol};
use crate::error::BridgeError;
use crate::registry::SocketId;

/// Failure delivered to the caller in place of an operation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub message: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error in protocol library: {}", self.message)
    }
}

impl std::error::Error for Rejection {}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

fn join_failure(err: JoinError) -> String {
    if err.is_panic() {
        panic_message(err.into_panic())
    } else {
        "operation was cancelled".to_string()
    }
}

/// Handle to an in-flight operation.
#[must_use = "operations report their result through the returned handle"]
pub struct Pending<T> {
    op: &'static str,
    handle: JoinHandle<Result<T, BridgeError>>,
}

impl<T> Pending<T> {
    /// Abandon the operation; its task is cancelled at the next suspension point.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, Rejection>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let op = self.op;
        let joined = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(joined) => joined,
            Poll::Pending => return Poll::Pending,
        };
        let message = match joined {
            Ok(Ok(value)) => return Poll::Ready(Ok(value)),
            Ok(Err(err)) => err.to_string(),
            Err(err) => join_failure(err),
        };
        tracing::warn!(op, error = %message, "operation failed");
        Poll::Ready(Err(Rejection { message }))
    }
}

/// Run `fut` as an independent task.
///
/// Must be called from within a tokio runtime.
pub fn spawn_op<T, F>(op: &'static str, fut: F) -> Pending<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T, BridgeError>> + Send + 'static,
{
    Pending {
        op,
        handle: tokio::spawn(fut),
    }
}

/// Result of [`SocketApi::recv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvResult {
    pub len: usize,
    pub remote: Option<SocketAddr>,
    pub buffers: Vec<Vec<u8>>,
}

/// Cloneable handle through which callers drive sockets.
#[derive(Clone)]
pub struct SocketApi {
    ctx: Arc<NetContext>,
}

impl SocketApi {
    pub fn new(ctx: Arc<NetContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<NetContext> {
        &self.ctx
    }

    /// Create a socket by numeric protocol codes (0 = ip4/1 = ip6, 0 = tcp/1 = udp).
    pub fn socket(&self, network: u32, transport: u32) -> Pending<SocketId> {
        let ctx = self.ctx.clone();
        spawn_op("socket", async move {
            let unsupported = || BridgeError::UnsupportedProtocol {
                network: network.to_string(),
                transport: transport.to_string(),
            };
            let net = NetworkProtocol::from_code(network).ok_or_else(unsupported)?;
            let trans = TransportProtocol::from_code(transport).ok_or_else(unsupported)?;
            ctx.create_socket(net, trans).await
        })
    }

    /// Create a socket by protocol name (`ip4`/`ip6`, `tcp`/`udp`/`icmp`).
    pub fn socket_named(&self, network: &str, transport: &str) -> Pending<SocketId> {
        let ctx = self.ctx.clone();
        let (network, transport) = (network.to_string(), transport.to_string());
        spawn_op("socket", async move {
            ctx.create_socket_named(&network, &transport).await
        })
    }

    pub fn connect(&self, id: SocketId, remote: String) -> Pending<()> {
        let ctx = self.ctx.clone();
        spawn_op("connect", async move { ctx.connect(id, &remote).await })
    }

    pub fn close(&self, id: SocketId) -> Pending<()> {
        let ctx = self.ctx.clone();
        spawn_op("close", async move { ctx.close(id).await })
    }

    pub fn send(
        &self,
        id: SocketId,
        segments: Vec<Vec<u8>>,
        remote: Option<String>,
    ) -> Pending<usize> {
        let ctx = self.ctx.clone();
        spawn_op("send", async move {
            ctx.send(id, &segments, remote.as_deref()).await
        })
    }

    pub fn recv(&self, id: SocketId, buffers: Vec<Vec<u8>>) -> Pending<RecvResult> {
        let ctx = self.ctx.clone();
        spawn_op("recv", async move {
            let received = ctx.receive(id, buffers).await?;
            Ok(RecvResult {
                len: received.len,
                remote: received.remote,
                buffers: received.buffers,
            })
        })
    }
}
