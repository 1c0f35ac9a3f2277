use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};

use tokio::sync::watch;
use wst_tunnel_protocol::NetConf;

use crate::engine::{EngineError, EngineFactory, NetworkProtocol, StackEngine, TransportProtocol};
use crate::error::{BridgeError, Result};
use crate::iovec;
use crate::nic::{FrameSink, VirtualNic};
use crate::registry::{SocketId, SocketRegistry};
use crate::socket::{Received, Socket};
use crate::waiter::WaiterQueue;

/// Everything one bridge instance needs: the NIC bound to its channel, the engine built at
/// bootstrap, the socket registry and the readiness gate.
///
/// Independent contexts share nothing, so several stacks can coexist in one process.
pub struct NetContext {
    pub(crate) nic: Arc<VirtualNic>,
    pub(crate) factory: Box<dyn EngineFactory>,
    pub(crate) stack: OnceLock<Arc<dyn StackEngine>>,
    pub(crate) netconf: OnceLock<NetConf>,
    pub(crate) configured: AtomicBool,
    ready: watch::Sender<bool>,
    registry: SocketRegistry,
}

impl NetContext {
    pub fn new(sink: Arc<dyn FrameSink>, factory: impl EngineFactory + 'static) -> Arc<Self> {
        Arc::new(Self {
            nic: Arc::new(VirtualNic::new(sink)),
            factory: Box::new(factory),
            stack: OnceLock::new(),
            netconf: OnceLock::new(),
            configured: AtomicBool::new(false),
            ready: watch::Sender::new(false),
            registry: SocketRegistry::new(),
        })
    }

    pub fn nic(&self) -> &Arc<VirtualNic> {
        &self.nic
    }

    pub fn registry(&self) -> &SocketRegistry {
        &self.registry
    }

    /// The configuration in effect, once applied.
    pub fn netconf(&self) -> Option<&NetConf> {
        self.netconf.get()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub(crate) fn open_gate(&self) {
        self.ready.send_replace(true);
    }

    /// Suspend until bootstrap has completed. Returns immediately afterwards.
    pub async fn await_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    fn engine(&self) -> Result<&Arc<dyn StackEngine>> {
        self.stack.get().ok_or_else(|| {
            BridgeError::ProtocolViolation("network stack is not configured".to_string())
        })
    }

    pub async fn create_socket(
        &self,
        network: NetworkProtocol,
        transport: TransportProtocol,
    ) -> Result<SocketId> {
        self.await_ready().await;
        let engine = self.engine()?;

        let waiters = Arc::new(WaiterQueue::new());
        let endpoint = engine
            .new_endpoint(transport, network, waiters.clone())
            .map_err(|err| match err {
                EngineError::UnknownProtocol => BridgeError::UnsupportedProtocol {
                    network: network.to_string(),
                    transport: transport.to_string(),
                },
                other => other.into(),
            })?;

        let id = self.registry.next_id();
        self.registry.insert(Arc::new(Socket::new(
            id, endpoint, waiters, network, transport,
        )));
        tracing::debug!(%id, %network, %transport, "socket created");
        Ok(id)
    }

    /// Like [`NetContext::create_socket`], taking caller-facing protocol names.
    pub async fn create_socket_named(&self, network: &str, transport: &str) -> Result<SocketId> {
        let unsupported = || BridgeError::UnsupportedProtocol {
            network: network.to_string(),
            transport: transport.to_string(),
        };
        let net = NetworkProtocol::from_name(network).ok_or_else(unsupported)?;
        let trans = TransportProtocol::from_name(transport).ok_or_else(unsupported)?;
        self.create_socket(net, trans).await
    }

    pub async fn socket(&self, id: SocketId) -> Result<Arc<Socket>> {
        self.await_ready().await;
        self.registry.get(id)
    }

    pub async fn connect(&self, id: SocketId, remote: &str) -> Result<()> {
        let socket = self.socket(id).await?;
        socket.connect(remote).await
    }

    /// Remove the socket and release its endpoint. The id stays unresolvable forever.
    pub async fn close(&self, id: SocketId) -> Result<()> {
        self.await_ready().await;
        let socket = self.registry.remove(id)?;
        socket.close();
        tracing::debug!(%id, "socket closed");
        Ok(())
    }

    pub async fn send(
        &self,
        id: SocketId,
        segments: &[Vec<u8>],
        remote: Option<&str>,
    ) -> Result<usize> {
        let socket = self.socket(id).await?;
        let payload = iovec::gather(segments);
        let to = remote.map(|remote| socket.resolve(remote)).transpose()?;
        socket.send(&payload, to).await
    }

    pub async fn receive(&self, id: SocketId, buffers: Vec<Vec<u8>>) -> Result<Received> {
        let socket = self.socket(id).await?;
        socket.receive(buffers).await
    }
}
