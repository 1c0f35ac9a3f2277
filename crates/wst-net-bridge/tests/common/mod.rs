#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use wst_net_bridge::engine::{
    Endpoint, EngineError, FullAddress, LinkAddress, LinkEndpoint, NetworkDispatcher,
    NetworkProtocol, NicId, ReadChunk, Route, StackEngine, StackOptions, TransportProtocol,
};
use wst_net_bridge::waiter::{EventMask, WaiterQueue};
use wst_net_bridge::NetContext;

pub const NETCONF: &str = r#"{
    "ipv4": {"address": "10.0.0.5", "gateway": "10.0.0.1", "prefix_length": 24},
    "ipv6": {"address": "fd00::5", "gateway": "fd00::1", "prefix_length": 64}
}"#;

/// Behaviour of one scripted endpoint. Empty queues mean "would block" for reads and "accept
/// everything" for writes.
#[derive(Default)]
pub struct Script {
    pub connect: Option<EngineError>,
    pub pending_error: Option<EngineError>,
    pub reads: VecDeque<Result<ReadChunk, EngineError>>,
    pub writes: VecDeque<Result<usize, EngineError>>,
    pub written: Vec<(Vec<u8>, Option<FullAddress>)>,
    pub connected_to: Vec<FullAddress>,
    pub read_calls: usize,
    pub panic_on_read: bool,
    pub closed: bool,
}

#[derive(Clone)]
pub struct MockSocket {
    pub transport: TransportProtocol,
    pub network: NetworkProtocol,
    pub script: Arc<Mutex<Script>>,
    pub waiters: Arc<WaiterQueue>,
}

impl MockSocket {
    pub fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Queue a stream chunk and signal readability.
    pub fn push_read(&self, data: &[u8]) {
        self.script().reads.push_back(Ok(ReadChunk {
            data: data.to_vec(),
            remote: None,
        }));
        self.waiters.notify(EventMask::IN);
    }

    pub fn push_datagram(&self, data: &[u8], from: &str) {
        let from: std::net::SocketAddr = from.parse().unwrap();
        self.script().reads.push_back(Ok(ReadChunk {
            data: data.to_vec(),
            remote: Some(FullAddress {
                nic: 1,
                addr: from.ip(),
                port: from.port(),
            }),
        }));
        self.waiters.notify(EventMask::IN);
    }
}

struct MockEndpoint {
    socket: MockSocket,
}

impl Endpoint for MockEndpoint {
    fn connect(&self, addr: FullAddress) -> Result<(), EngineError> {
        let mut script = self.socket.script();
        script.connected_to.push(addr);
        match script.connect.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn write(&self, payload: &[u8], to: Option<FullAddress>) -> Result<usize, EngineError> {
        let mut script = self.socket.script();
        match script.writes.pop_front() {
            Some(Ok(n)) => {
                script.written.push((payload[..n].to_vec(), to));
                Ok(n)
            }
            Some(Err(err)) => Err(err),
            None => {
                script.written.push((payload.to_vec(), to));
                Ok(payload.len())
            }
        }
    }

    fn read(&self) -> Result<ReadChunk, EngineError> {
        let mut script = self.socket.script();
        script.read_calls += 1;
        if script.panic_on_read {
            drop(script);
            panic!("scripted read failure");
        }
        script
            .reads
            .pop_front()
            .unwrap_or(Err(EngineError::WouldBlock))
    }

    fn take_error(&self) -> Option<EngineError> {
        self.socket.script().pending_error.take()
    }

    fn close(&self) {
        self.socket.script().closed = true;
        self.socket.waiters.notify(EventMask::all());
    }
}

#[derive(Default)]
pub struct Recorder {
    pub packets: Mutex<Vec<(NetworkProtocol, Vec<u8>)>>,
}

impl NetworkDispatcher for Recorder {
    fn deliver_network_packet(
        &self,
        _remote: LinkAddress,
        _local: LinkAddress,
        protocol: NetworkProtocol,
        packet: Vec<u8>,
    ) {
        self.packets.lock().unwrap().push((protocol, packet));
    }
}

/// Engine that records configuration calls and hands out scripted endpoints.
#[derive(Default)]
pub struct MockEngine {
    pub options: Mutex<Option<StackOptions>>,
    pub nics: Mutex<Vec<NicId>>,
    pub addresses: Mutex<Vec<(NicId, NetworkProtocol, IpAddr, u8)>>,
    pub routes: Mutex<Vec<Route>>,
    pub sockets: Mutex<Vec<MockSocket>>,
    pub dispatched: Arc<Recorder>,
    pub refuse_udp: bool,
}

impl MockEngine {
    pub fn socket(&self, index: usize) -> MockSocket {
        self.sockets.lock().unwrap()[index].clone()
    }

    pub fn dispatched(&self) -> Vec<(NetworkProtocol, Vec<u8>)> {
        self.dispatched.packets.lock().unwrap().clone()
    }
}

impl StackEngine for MockEngine {
    fn create_nic(&self, id: NicId, link: Arc<dyn LinkEndpoint>) -> Result<(), EngineError> {
        link.attach(self.dispatched.clone())?;
        self.nics.lock().unwrap().push(id);
        Ok(())
    }

    fn add_address(
        &self,
        nic: NicId,
        protocol: NetworkProtocol,
        address: IpAddr,
        prefix_length: u8,
    ) -> Result<(), EngineError> {
        self.addresses
            .lock()
            .unwrap()
            .push((nic, protocol, address, prefix_length));
        Ok(())
    }

    fn set_route_table(&self, routes: Vec<Route>) -> Result<(), EngineError> {
        *self.routes.lock().unwrap() = routes;
        Ok(())
    }

    fn new_endpoint(
        &self,
        transport: TransportProtocol,
        network: NetworkProtocol,
        waiters: Arc<WaiterQueue>,
    ) -> Result<Box<dyn Endpoint>, EngineError> {
        if self.refuse_udp && transport == TransportProtocol::Udp {
            return Err(EngineError::UnknownProtocol);
        }
        let socket = MockSocket {
            transport,
            network,
            script: Arc::new(Mutex::new(Script::default())),
            waiters,
        };
        self.sockets.lock().unwrap().push(socket.clone());
        Ok(Box::new(MockEndpoint { socket }))
    }
}

pub struct Harness {
    pub ctx: Arc<NetContext>,
    pub engine: Arc<MockEngine>,
    pub outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn harness_with(engine: MockEngine) -> Harness {
    let engine = Arc::new(engine);
    let (tx, outbound) = mpsc::unbounded_channel();
    let factory_engine = engine.clone();
    let ctx = NetContext::new(
        Arc::new(tx),
        move |options: StackOptions| -> Result<Arc<dyn StackEngine>, EngineError> {
            *factory_engine.options.lock().unwrap() = Some(options);
            Ok(factory_engine.clone())
        },
    );
    Harness {
        ctx,
        engine,
        outbound,
    }
}

pub fn harness() -> Harness {
    harness_with(MockEngine::default())
}

/// A harness whose configuration has already been applied.
pub fn ready_harness() -> Harness {
    let h = harness();
    h.ctx
        .handle_message(wst_net_bridge::ChannelMessage::Control(NETCONF.to_string()))
        .expect("configuration applies");
    h
}
