//! Per-socket state and the blocking-style I/O built on engine readiness.
//!
//! Every operation follows the same shape: register interest with the endpoint's waiter queue,
//! attempt the non-blocking engine call, and on `WouldBlock` park until the queue is notified,
//! then retry. The wait entry is a scoped guard, so it is deregistered on every exit path.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::addr;
use crate::engine::{Endpoint, EngineError, FullAddress, NetworkProtocol, TransportProtocol};
use crate::error::Result;
use crate::iovec;
use crate::registry::SocketId;
use crate::waiter::{EventMask, WaiterQueue};
use crate::NIC_ID;

/// Outcome of a receive: caller buffers come back filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub len: usize,
    /// Datagram source. `None` for stream sockets and for end-of-stream.
    pub remote: Option<SocketAddr>,
    pub buffers: Vec<Vec<u8>>,
}

pub struct Socket {
    id: SocketId,
    endpoint: Box<dyn Endpoint>,
    waiters: Arc<WaiterQueue>,
    network: NetworkProtocol,
    transport: TransportProtocol,
    // Received but not yet delivered stream bytes.
    recv_buf: Mutex<Vec<u8>>,
    connecting: Mutex<()>,
}

impl Socket {
    pub fn new(
        id: SocketId,
        endpoint: Box<dyn Endpoint>,
        waiters: Arc<WaiterQueue>,
        network: NetworkProtocol,
        transport: TransportProtocol,
    ) -> Self {
        Self {
            id,
            endpoint,
            waiters,
            network,
            transport,
            recv_buf: Mutex::new(Vec::new()),
            connecting: Mutex::new(()),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn network(&self) -> NetworkProtocol {
        self.network
    }

    pub fn transport(&self) -> TransportProtocol {
        self.transport
    }

    pub fn waiters(&self) -> &Arc<WaiterQueue> {
        &self.waiters
    }

    /// Resolve a remote `host:port` string for this socket's family.
    pub fn resolve(&self, remote: &str) -> Result<FullAddress> {
        let addr = addr::resolve(self.network, remote)?;
        Ok(FullAddress {
            nic: NIC_ID,
            addr: addr.ip(),
            port: addr.port(),
        })
    }

    pub async fn connect(&self, remote: &str) -> Result<()> {
        let addr = self.resolve(remote)?;

        // Concurrent connects would share one completion signal; run them one at a time.
        let _connecting = self.connecting.lock().await;

        let entry = self.waiters.register(EventMask::writable());
        let res = match self.endpoint.connect(addr) {
            Err(EngineError::ConnectStarted) => {
                entry.notified().await;
                self.endpoint.take_error().map_or(Ok(()), Err)
            }
            other => other,
        };
        drop(entry);

        res.map_err(Into::into)
    }

    /// Write `payload`, waiting for buffer space as needed.
    ///
    /// Returns 0 without error once the stream can no longer carry data.
    pub async fn send(&self, payload: &[u8], to: Option<FullAddress>) -> Result<usize> {
        let entry = self.waiters.register(EventMask::writable());
        loop {
            match self.endpoint.write(payload, to) {
                Ok(n) => return Ok(n),
                Err(EngineError::WouldBlock) => entry.notified().await,
                Err(err) if err.is_end_of_stream() => return Ok(0),
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub async fn receive(&self, buffers: Vec<Vec<u8>>) -> Result<Received> {
        if self.transport.is_stream() {
            self.receive_stream(buffers).await
        } else {
            self.receive_datagram(buffers).await
        }
    }

    // Non-greedy: a single successful engine read ends the call even if it underfills the
    // buffers. Only `WouldBlock` causes another attempt.
    async fn receive_stream(&self, mut buffers: Vec<Vec<u8>>) -> Result<Received> {
        let target = iovec::total_len(&buffers);
        let entry = self.waiters.register(EventMask::readable());

        let mut pending = self.recv_buf.lock().await;
        while pending.len() < target {
            match self.endpoint.read() {
                Ok(chunk) => {
                    pending.extend_from_slice(&chunk.data);
                    break;
                }
                Err(EngineError::WouldBlock) => entry.notified().await,
                Err(err) if err.is_end_of_stream() => break,
                Err(err) => return Err(err.into()),
            }
        }

        let len = iovec::scatter(&mut buffers, &pending);
        pending.drain(..len);
        Ok(Received {
            len,
            remote: None,
            buffers,
        })
    }

    async fn receive_datagram(&self, mut buffers: Vec<Vec<u8>>) -> Result<Received> {
        let entry = self.waiters.register(EventMask::readable());
        loop {
            match self.endpoint.read() {
                Ok(chunk) => {
                    let len = iovec::scatter(&mut buffers, &chunk.data);
                    let remote = chunk
                        .remote
                        .map(|from| SocketAddr::new(from.addr, from.port));
                    return Ok(Received {
                        len,
                        remote,
                        buffers,
                    });
                }
                Err(EngineError::WouldBlock) => entry.notified().await,
                Err(err) if err.is_end_of_stream() => {
                    return Ok(Received {
                        len: 0,
                        remote: None,
                        buffers,
                    })
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Number of stream bytes received but not yet delivered.
    pub async fn buffered(&self) -> usize {
        self.recv_buf.lock().await.len()
    }

    /// Release the engine endpoint.
    pub fn close(&self) {
        self.endpoint.close();
    }
}
