//! [`StackEngine`] backed by smoltcp.
//!
//! One [`Interface`] with an IP-medium device sits on top of the attached [`LinkEndpoint`].
//! Inbound packets are queued on the device and processed immediately; a background task drives
//! retransmission and other timers. After every poll, each endpoint's readiness is published to
//! its [`WaiterQueue`].

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasher;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime};

use smoltcp::iface::{Config, Interface, PollResult, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::{icmp, tcp, udp};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint};
use wst_tunnel_protocol::{probe_ip_version, IpVersion};

use super::{
    Endpoint, EngineError, EngineFactory, FullAddress, LinkAddress, LinkEndpoint,
    NetworkDispatcher, NetworkProtocol, NicId, PacketBuffer, ReadChunk, Route, StackEngine,
    StackOptions, TransportProtocol,
};
use crate::waiter::{EventMask, WaiterQueue};

const TCP_BUFFER_SIZE: usize = 64 * 1024;
const DATAGRAM_BUFFER_SIZE: usize = 64 * 1024;
const DATAGRAM_SLOTS: usize = 32;
const EPHEMERAL_PORT_START: u16 = 49152;
const CONNECT_TIMEOUT: smoltcp::time::Duration = smoltcp::time::Duration::from_secs(60);
const MAX_TIMER_DELAY: Duration = Duration::from_millis(100);
const MAX_POLL_ROUNDS: usize = 8;
const IPV6_HEADER_LEN: usize = 40;

/// Builds a [`SmolStack`] per configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmolFactory;

impl EngineFactory for SmolFactory {
    fn new_stack(&self, options: StackOptions) -> Result<Arc<dyn StackEngine>, EngineError> {
        Ok(SmolStack::new(options))
    }
}

pub struct SmolStack {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    options: StackOptions,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct EndpointState {
    waiters: Arc<WaiterQueue>,
    transport: TransportProtocol,
    connect_started: Option<smoltcp::time::Instant>,
    established: bool,
    error: Option<EngineError>,
    default_remote: Option<IpEndpoint>,
}

struct Inner {
    iface: Option<Interface>,
    nic: Option<NicId>,
    device: TunnelDevice,
    sockets: SocketSet<'static>,
    endpoints: HashMap<SocketHandle, EndpointState>,
    // Closed TCP sockets still finishing their shutdown handshake.
    closing: Vec<SocketHandle>,
    next_port: u16,
    epoch: tokio::time::Instant,
}

fn take_port(next: &mut u16) -> u16 {
    let port = *next;
    *next = if port == u16::MAX {
        EPHEMERAL_PORT_START
    } else {
        port + 1
    };
    port
}

fn is_synchronized(state: tcp::State) -> bool {
    !matches!(
        state,
        tcp::State::Closed | tcp::State::Listen | tcp::State::SynSent | tcp::State::SynReceived
    )
}

fn to_std_duration(d: smoltcp::time::Duration) -> Duration {
    Duration::from_micros(d.total_micros())
}

impl Inner {
    fn now(&self) -> smoltcp::time::Instant {
        smoltcp::time::Instant::from_micros(self.epoch.elapsed().as_micros() as i64)
    }

    fn poll(&mut self) {
        let now = self.now();
        let Some(iface) = self.iface.as_mut() else {
            return;
        };

        let mut budget = MAX_POLL_ROUNDS + self.device.rx.len();
        while budget > 0 {
            budget -= 1;
            let res = iface.poll(now, &mut self.device, &mut self.sockets);
            if res == PollResult::None && self.device.rx.is_empty() {
                break;
            }
        }

        self.reap();
        self.publish_readiness(now);
    }

    fn poll_delay(&mut self) -> Option<Duration> {
        let now = self.now();
        let iface = self.iface.as_mut()?;
        iface.poll_delay(now, &self.sockets).map(to_std_duration)
    }

    fn reap(&mut self) {
        let sockets = &mut self.sockets;
        self.closing.retain(|&handle| {
            let state = sockets.get::<tcp::Socket>(handle).state();
            if matches!(state, tcp::State::Closed | tcp::State::TimeWait) {
                sockets.remove(handle);
                false
            } else {
                true
            }
        });
    }

    fn publish_readiness(&mut self, now: smoltcp::time::Instant) {
        for (&handle, state) in self.endpoints.iter_mut() {
            let mut events = EventMask::empty();
            match state.transport {
                TransportProtocol::Tcp => {
                    let socket = self.sockets.get::<tcp::Socket>(handle);
                    if is_synchronized(socket.state()) {
                        state.established = true;
                    }
                    if socket.can_recv() || (state.established && !socket.may_recv()) {
                        events |= EventMask::IN;
                    }
                    if socket.can_send() {
                        events |= EventMask::OUT;
                    }
                    // A connection attempt that ends in Closed is reported exactly once.
                    if socket.state() == tcp::State::Closed {
                        if let Some(started) = state.connect_started.take() {
                            if !state.established {
                                state.error = Some(if now - started >= CONNECT_TIMEOUT {
                                    EngineError::TimedOut
                                } else {
                                    EngineError::ConnectionRefused
                                });
                                events |= EventMask::ERR;
                            }
                            events |= EventMask::IN | EventMask::OUT | EventMask::HUP;
                        }
                    }
                }
                TransportProtocol::Udp => {
                    let socket = self.sockets.get::<udp::Socket>(handle);
                    if socket.can_recv() {
                        events |= EventMask::IN;
                    }
                    if socket.can_send() {
                        events |= EventMask::OUT;
                    }
                }
                TransportProtocol::Icmp => {
                    let socket = self.sockets.get::<icmp::Socket>(handle);
                    if socket.can_recv() {
                        events |= EventMask::IN;
                    }
                    if socket.can_send() {
                        events |= EventMask::OUT;
                    }
                }
            }
            if !events.is_empty() {
                state.waiters.notify(events);
            }
        }
    }
}

/// IP-medium device over the attached link.
struct TunnelDevice {
    rx: VecDeque<Vec<u8>>,
    link: Option<Arc<dyn LinkEndpoint>>,
    mtu: usize,
}

struct TunnelRxToken {
    frame: Vec<u8>,
}

struct TunnelTxToken<'a> {
    link: Option<&'a Arc<dyn LinkEndpoint>>,
}

impl Device for TunnelDevice {
    type RxToken<'a>
        = TunnelRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = TunnelTxToken<'a>
    where
        Self: 'a;

    fn receive(
        &mut self,
        _timestamp: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((
            TunnelRxToken { frame },
            TunnelTxToken {
                link: self.link.as_ref(),
            },
        ))
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(TunnelTxToken {
            link: self.link.as_ref(),
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

impl RxToken for TunnelRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.frame)
    }
}

impl TxToken for TunnelTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0; len];
        let result = f(&mut frame);
        if let Some(link) = self.link {
            let (protocol, packet) = split_frame(frame);
            if let Err(err) = link.write_packet(protocol, packet) {
                tracing::debug!(%err, "dropping outbound packet");
            }
        }
        result
    }
}

/// Split an assembled IP packet into network header and the rest.
fn split_frame(mut frame: Vec<u8>) -> (NetworkProtocol, PacketBuffer) {
    let (protocol, header_len) = match probe_ip_version(&frame) {
        Some(IpVersion::V6) => (NetworkProtocol::Ipv6, IPV6_HEADER_LEN),
        Some(IpVersion::V4) => (NetworkProtocol::Ipv4, usize::from(frame[0] & 0x0f) * 4),
        None => (NetworkProtocol::Ipv4, 0),
    };
    let data = frame.split_off(header_len.min(frame.len()));
    (
        protocol,
        PacketBuffer {
            network_header: frame,
            transport_header: Vec::new(),
            data,
        },
    )
}

struct SmolDispatcher {
    shared: Weak<Shared>,
}

impl NetworkDispatcher for SmolDispatcher {
    fn deliver_network_packet(
        &self,
        _remote: LinkAddress,
        _local: LinkAddress,
        _protocol: NetworkProtocol,
        packet: Vec<u8>,
    ) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut inner = shared.lock();
        inner.device.rx.push_back(packet);
        inner.poll();
    }
}

fn spawn_timer(shared: &Arc<Shared>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("no tokio runtime: stack timers only advance on traffic");
        return;
    };
    let weak = Arc::downgrade(shared);
    runtime.spawn(async move {
        loop {
            let delay = {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let mut inner = shared.lock();
                inner.poll();
                inner.poll_delay()
            };
            let delay = delay.map_or(MAX_TIMER_DELAY, |d| d.min(MAX_TIMER_DELAY));
            tokio::time::sleep(delay).await;
        }
    });
}

fn random_seed() -> u64 {
    RandomState::new().hash_one(SystemTime::now())
}

fn udp_buffer() -> udp::PacketBuffer<'static> {
    udp::PacketBuffer::new(
        vec![udp::PacketMetadata::EMPTY; DATAGRAM_SLOTS],
        vec![0; DATAGRAM_BUFFER_SIZE],
    )
}

fn icmp_buffer() -> icmp::PacketBuffer<'static> {
    icmp::PacketBuffer::new(
        vec![icmp::PacketMetadata::EMPTY; DATAGRAM_SLOTS],
        vec![0; DATAGRAM_BUFFER_SIZE],
    )
}

impl SmolStack {
    pub fn new(options: StackOptions) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    iface: None,
                    nic: None,
                    device: TunnelDevice {
                        rx: VecDeque::new(),
                        link: None,
                        mtu: 0,
                    },
                    sockets: SocketSet::new(vec![]),
                    endpoints: HashMap::new(),
                    closing: Vec::new(),
                    next_port: EPHEMERAL_PORT_START,
                    epoch: tokio::time::Instant::now(),
                }),
                options,
            }),
        })
    }

    /// Process queued packets and expired timers now.
    pub fn poll(&self) {
        self.shared.lock().poll();
    }

    /// Number of transport sockets still held by the stack, including closing ones.
    pub fn socket_count(&self) -> usize {
        self.shared.lock().sockets.iter().count()
    }
}

impl StackEngine for SmolStack {
    fn create_nic(&self, id: NicId, link: Arc<dyn LinkEndpoint>) -> Result<(), EngineError> {
        if let Some(existing) = self.shared.lock().nic {
            return Err(if existing == id {
                EngineError::DuplicateNic(id)
            } else {
                EngineError::Other(format!("stack already drives nic {existing}"))
            });
        }

        link.attach(Arc::new(SmolDispatcher {
            shared: Arc::downgrade(&self.shared),
        }))?;

        let mut inner = self.shared.lock();
        let mtu = link.mtu() as usize;
        inner.device.mtu = mtu;
        inner.device.link = Some(link);

        let mut config = Config::new(HardwareAddress::Ip);
        config.random_seed = random_seed();
        let now = inner.now();
        let iface = Interface::new(config, &mut inner.device, now);
        inner.iface = Some(iface);
        inner.nic = Some(id);
        // Frames that raced the interface construction.
        inner.poll();
        drop(inner);

        spawn_timer(&self.shared);
        tracing::debug!(nic = id, mtu, "nic created");
        Ok(())
    }

    fn add_address(
        &self,
        nic: NicId,
        protocol: NetworkProtocol,
        address: IpAddr,
        prefix_length: u8,
    ) -> Result<(), EngineError> {
        if !self.shared.options.network_protocols.contains(&protocol) {
            return Err(EngineError::UnknownProtocol);
        }
        let max_prefix = match protocol {
            NetworkProtocol::Ipv4 => 32,
            NetworkProtocol::Ipv6 => 128,
        };
        if !protocol.matches(address) || prefix_length > max_prefix {
            return Err(EngineError::BadAddress);
        }

        let mut inner = self.shared.lock();
        if inner.nic != Some(nic) {
            return Err(EngineError::UnknownNic(nic));
        }
        let iface = inner.iface.as_mut().ok_or(EngineError::UnknownNic(nic))?;

        let mut pushed = Ok(());
        iface.update_ip_addrs(|addrs| {
            if addrs
                .push(IpCidr::new(IpAddress::from(address), prefix_length))
                .is_err()
            {
                pushed = Err(EngineError::Other("address table is full".to_string()));
            }
        });
        pushed?;
        tracing::debug!(nic, %address, prefix_length, "address added");
        Ok(())
    }

    fn set_route_table(&self, routes: Vec<Route>) -> Result<(), EngineError> {
        let mut inner = self.shared.lock();
        let nic = inner.nic;
        let iface = inner
            .iface
            .as_mut()
            .ok_or_else(|| EngineError::Other("no nic to route through".to_string()))?;
        let own_ipv4 = iface.ipv4_addr();
        let full = |_| EngineError::Other("route table is full".to_string());

        iface.routes_mut().update(|table| table.clear());
        for route in routes {
            if Some(route.nic) != nic {
                return Err(EngineError::UnknownNic(route.nic));
            }
            // On-link prefixes come from interface addresses; only default routes are installed.
            if !route.destination.is_default() {
                tracing::debug!(?route, "ignoring non-default route");
                continue;
            }
            match (route.destination.address, route.gateway) {
                (IpAddr::V4(_), Some(IpAddr::V4(gateway))) => {
                    iface
                        .routes_mut()
                        .add_default_ipv4_route(gateway)
                        .map_err(full)?;
                }
                (IpAddr::V4(_), None) => {
                    let gateway = own_ipv4.ok_or(EngineError::NoRoute)?;
                    iface
                        .routes_mut()
                        .add_default_ipv4_route(gateway)
                        .map_err(full)?;
                }
                (IpAddr::V6(_), Some(IpAddr::V6(gateway))) => {
                    iface
                        .routes_mut()
                        .add_default_ipv6_route(gateway)
                        .map_err(full)?;
                }
                (IpAddr::V6(_), None) => {
                    tracing::debug!("ignoring on-link IPv6 default route");
                }
                _ => return Err(EngineError::BadAddress),
            }
        }
        Ok(())
    }

    fn new_endpoint(
        &self,
        transport: TransportProtocol,
        network: NetworkProtocol,
        waiters: Arc<WaiterQueue>,
    ) -> Result<Box<dyn Endpoint>, EngineError> {
        if !self.shared.options.supports(network, transport) {
            return Err(EngineError::UnknownProtocol);
        }

        let mut inner = self.shared.lock();
        let handle = match transport {
            TransportProtocol::Tcp => inner.sockets.add(tcp::Socket::new(
                tcp::SocketBuffer::new(vec![0; TCP_BUFFER_SIZE]),
                tcp::SocketBuffer::new(vec![0; TCP_BUFFER_SIZE]),
            )),
            TransportProtocol::Udp => inner
                .sockets
                .add(udp::Socket::new(udp_buffer(), udp_buffer())),
            TransportProtocol::Icmp => inner
                .sockets
                .add(icmp::Socket::new(icmp_buffer(), icmp_buffer())),
        };
        inner.endpoints.insert(
            handle,
            EndpointState {
                waiters,
                transport,
                connect_started: None,
                established: false,
                error: None,
                default_remote: None,
            },
        );

        Ok(Box::new(SmolEndpoint {
            shared: self.shared.clone(),
            handle,
            transport,
            network,
        }))
    }
}

struct SmolEndpoint {
    shared: Arc<Shared>,
    handle: SocketHandle,
    transport: TransportProtocol,
    network: NetworkProtocol,
}

impl SmolEndpoint {
    /// Run `f` against the live endpoint, then flush whatever it queued.
    fn with_inner<R>(
        &self,
        f: impl FnOnce(&mut Inner) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        self.with_inner_or(EngineError::InvalidEndpointState, f)
    }

    /// Like [`Self::with_inner`], failing with `released` once the endpoint has been closed.
    fn with_inner_or<R>(
        &self,
        released: EngineError,
        f: impl FnOnce(&mut Inner) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let mut inner = self.shared.lock();
        if !inner.endpoints.contains_key(&self.handle) {
            return Err(released);
        }
        let res = f(&mut *inner);
        inner.poll();
        res
    }

    fn remote_endpoint(&self, addr: FullAddress) -> Result<IpEndpoint, EngineError> {
        if !self.network.matches(addr.addr) {
            return Err(EngineError::BadAddress);
        }
        Ok(IpEndpoint::new(IpAddress::from(addr.addr), addr.port))
    }
}

impl Endpoint for SmolEndpoint {
    fn connect(&self, addr: FullAddress) -> Result<(), EngineError> {
        let remote = self.remote_endpoint(addr)?;
        let handle = self.handle;
        self.with_inner(|inner| {
            let now = inner.now();
            let Inner {
                iface,
                sockets,
                endpoints,
                next_port,
                ..
            } = inner;
            let iface = iface.as_mut().ok_or(EngineError::NoRoute)?;
            let state = endpoints
                .get_mut(&handle)
                .ok_or(EngineError::InvalidEndpointState)?;

            match state.transport {
                TransportProtocol::Tcp => {
                    if state.connect_started.is_some() {
                        return Err(EngineError::AlreadyConnected);
                    }
                    let socket = sockets.get_mut::<tcp::Socket>(handle);
                    socket.set_timeout(Some(CONNECT_TIMEOUT));
                    socket
                        .connect(iface.context(), remote, take_port(next_port))
                        .map_err(|err| match err {
                            tcp::ConnectError::Unaddressable => EngineError::NoRoute,
                            tcp::ConnectError::InvalidState => EngineError::AlreadyConnected,
                            #[allow(unreachable_patterns)]
                            other => EngineError::Other(format!("{other:?}")),
                        })?;
                    state.connect_started = Some(now);
                    Err(EngineError::ConnectStarted)
                }
                TransportProtocol::Udp => {
                    let socket = sockets.get_mut::<udp::Socket>(handle);
                    if !socket.is_open() {
                        socket
                            .bind(take_port(next_port))
                            .map_err(|_| EngineError::InvalidEndpointState)?;
                    }
                    state.default_remote = Some(remote);
                    Ok(())
                }
                TransportProtocol::Icmp => {
                    let socket = sockets.get_mut::<icmp::Socket>(handle);
                    if !socket.is_open() {
                        socket
                            .bind(icmp::Endpoint::Ident(take_port(next_port)))
                            .map_err(|_| EngineError::InvalidEndpointState)?;
                    }
                    state.default_remote = Some(remote);
                    Ok(())
                }
            }
        })
    }

    fn write(&self, payload: &[u8], to: Option<FullAddress>) -> Result<usize, EngineError> {
        let to = to.map(|to| self.remote_endpoint(to)).transpose()?;
        let handle = self.handle;
        self.with_inner(|inner| {
            let Inner {
                sockets,
                endpoints,
                next_port,
                ..
            } = inner;
            let state = endpoints
                .get_mut(&handle)
                .ok_or(EngineError::InvalidEndpointState)?;

            match state.transport {
                TransportProtocol::Tcp => {
                    let socket = sockets.get_mut::<tcp::Socket>(handle);
                    if !socket.may_send() {
                        return Err(match socket.state() {
                            tcp::State::SynSent | tcp::State::SynReceived => {
                                EngineError::WouldBlock
                            }
                            _ if state.established => EngineError::ClosedForSend,
                            _ => state.error.clone().unwrap_or(EngineError::NotConnected),
                        });
                    }
                    match socket.send_slice(payload) {
                        Ok(0) if !payload.is_empty() => Err(EngineError::WouldBlock),
                        Ok(n) => Ok(n),
                        Err(_) => Err(EngineError::ClosedForSend),
                    }
                }
                TransportProtocol::Udp => {
                    let remote = to
                        .or(state.default_remote)
                        .ok_or(EngineError::DestinationRequired)?;
                    let socket = sockets.get_mut::<udp::Socket>(handle);
                    if !socket.is_open() {
                        socket
                            .bind(take_port(next_port))
                            .map_err(|_| EngineError::InvalidEndpointState)?;
                    }
                    if payload.len() > socket.payload_send_capacity() {
                        return Err(EngineError::MessageTooLong);
                    }
                    socket
                        .send_slice(payload, remote)
                        .map_err(|err| match err {
                            udp::SendError::BufferFull => EngineError::WouldBlock,
                            udp::SendError::Unaddressable => EngineError::NoRoute,
                            #[allow(unreachable_patterns)]
                            other => EngineError::Other(format!("{other:?}")),
                        })?;
                    Ok(payload.len())
                }
                TransportProtocol::Icmp => {
                    let remote = to
                        .or(state.default_remote)
                        .ok_or(EngineError::DestinationRequired)?;
                    let socket = sockets.get_mut::<icmp::Socket>(handle);
                    if !socket.is_open() {
                        socket
                            .bind(icmp::Endpoint::Ident(take_port(next_port)))
                            .map_err(|_| EngineError::InvalidEndpointState)?;
                    }
                    if payload.len() > socket.payload_send_capacity() {
                        return Err(EngineError::MessageTooLong);
                    }
                    socket
                        .send_slice(payload, remote.addr)
                        .map_err(|err| match err {
                            icmp::SendError::BufferFull => EngineError::WouldBlock,
                            icmp::SendError::Unaddressable => EngineError::NoRoute,
                            #[allow(unreachable_patterns)]
                            other => EngineError::Other(format!("{other:?}")),
                        })?;
                    Ok(payload.len())
                }
            }
        })
    }

    fn read(&self) -> Result<ReadChunk, EngineError> {
        let handle = self.handle;
        // A closed endpoint reads as end-of-stream.
        self.with_inner_or(EngineError::ClosedForReceive, |inner| {
            let nic = inner.nic.unwrap_or_default();
            let Inner {
                sockets, endpoints, ..
            } = inner;
            let state = endpoints
                .get_mut(&handle)
                .ok_or(EngineError::InvalidEndpointState)?;

            match state.transport {
                TransportProtocol::Tcp => {
                    let socket = sockets.get_mut::<tcp::Socket>(handle);
                    if socket.can_recv() {
                        let data = socket
                            .recv(|buf| (buf.len(), buf.to_vec()))
                            .map_err(|_| EngineError::ClosedForReceive)?;
                        return Ok(ReadChunk { data, remote: None });
                    }
                    if is_synchronized(socket.state()) {
                        state.established = true;
                    }
                    match socket.state() {
                        tcp::State::SynSent | tcp::State::SynReceived => Err(EngineError::WouldBlock),
                        _ if socket.may_recv() => Err(EngineError::WouldBlock),
                        _ if state.established => Err(EngineError::ClosedForReceive),
                        _ => Err(state.error.clone().unwrap_or(EngineError::NotConnected)),
                    }
                }
                TransportProtocol::Udp => {
                    let socket = sockets.get_mut::<udp::Socket>(handle);
                    match socket.recv() {
                        Ok((data, meta)) => Ok(ReadChunk {
                            data: data.to_vec(),
                            remote: Some(FullAddress {
                                nic,
                                addr: IpAddr::from(meta.endpoint.addr),
                                port: meta.endpoint.port,
                            }),
                        }),
                        Err(udp::RecvError::Exhausted) => Err(EngineError::WouldBlock),
                        Err(err) => Err(EngineError::Other(format!("{err:?}"))),
                    }
                }
                TransportProtocol::Icmp => {
                    let socket = sockets.get_mut::<icmp::Socket>(handle);
                    match socket.recv() {
                        Ok((data, from)) => Ok(ReadChunk {
                            data: data.to_vec(),
                            remote: Some(FullAddress {
                                nic,
                                addr: IpAddr::from(from),
                                port: 0,
                            }),
                        }),
                        Err(icmp::RecvError::Exhausted) => Err(EngineError::WouldBlock),
                        Err(err) => Err(EngineError::Other(format!("{err:?}"))),
                    }
                }
            }
        })
    }

    fn take_error(&self) -> Option<EngineError> {
        match self.shared.lock().endpoints.get_mut(&self.handle) {
            Some(state) => state.error.take(),
            None => Some(EngineError::InvalidEndpointState),
        }
    }

    fn close(&self) {
        let mut inner = self.shared.lock();
        let Some(state) = inner.endpoints.remove(&self.handle) else {
            return;
        };
        state.waiters.notify(EventMask::all());

        match self.transport {
            TransportProtocol::Tcp => {
                inner.sockets.get_mut::<tcp::Socket>(self.handle).close();
                inner.closing.push(self.handle);
            }
            TransportProtocol::Udp | TransportProtocol::Icmp => {
                inner.sockets.remove(self.handle);
            }
        }
        inner.poll();
    }
}

impl Drop for SmolEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;

    use crate::engine::Subnet;

    #[derive(Default)]
    struct CaptureLink {
        frames: StdMutex<Vec<(NetworkProtocol, PacketBuffer)>>,
        dispatcher: StdMutex<Option<Arc<dyn NetworkDispatcher>>>,
    }

    impl LinkEndpoint for CaptureLink {
        fn mtu(&self) -> u32 {
            1500
        }

        fn capabilities(&self) -> crate::engine::LinkCapabilities {
            crate::engine::LinkCapabilities::empty()
        }

        fn max_header_length(&self) -> u16 {
            0
        }

        fn link_address(&self) -> LinkAddress {
            LinkAddress::PLACEHOLDER
        }

        fn attach(&self, dispatcher: Arc<dyn NetworkDispatcher>) -> Result<(), EngineError> {
            *self.dispatcher.lock().unwrap() = Some(dispatcher);
            Ok(())
        }

        fn is_attached(&self) -> bool {
            self.dispatcher.lock().unwrap().is_some()
        }

        fn write_packet(
            &self,
            protocol: NetworkProtocol,
            packet: PacketBuffer,
        ) -> Result<(), EngineError> {
            self.frames.lock().unwrap().push((protocol, packet));
            Ok(())
        }

        fn write_packets(
            &self,
            _protocol: NetworkProtocol,
            _packets: Vec<PacketBuffer>,
        ) -> Result<usize, EngineError> {
            unreachable!()
        }

        fn write_raw_packet(&self, _frame: Vec<u8>) -> Result<(), EngineError> {
            unreachable!()
        }
    }

    fn all_protocols() -> StackOptions {
        StackOptions {
            network_protocols: vec![NetworkProtocol::Ipv4, NetworkProtocol::Ipv6],
            transport_protocols: vec![
                TransportProtocol::Tcp,
                TransportProtocol::Udp,
                TransportProtocol::Icmp,
            ],
        }
    }

    fn configured_stack() -> (Arc<SmolStack>, Arc<CaptureLink>) {
        let stack = SmolStack::new(all_protocols());
        let link = Arc::new(CaptureLink::default());
        stack.create_nic(1, link.clone()).unwrap();
        stack
            .add_address(1, NetworkProtocol::Ipv4, "10.0.0.5".parse().unwrap(), 24)
            .unwrap();
        stack
            .set_route_table(vec![Route {
                destination: Subnet::IPV4_ANY,
                gateway: Some("10.0.0.1".parse().unwrap()),
                nic: 1,
            }])
            .unwrap();
        (stack, link)
    }

    #[test]
    fn split_frame_separates_ipv4_header() {
        let mut frame = vec![0x45, 0, 0, 24];
        frame.resize(20, 0);
        frame.extend_from_slice(b"abcd");
        let (protocol, packet) = split_frame(frame.clone());
        assert_eq!(protocol, NetworkProtocol::Ipv4);
        assert_eq!(packet.network_header.len(), 20);
        assert_eq!(packet.data, b"abcd");
        assert_eq!(packet.into_frame(), frame);
    }

    #[test]
    fn split_frame_tolerates_short_frames() {
        let (protocol, packet) = split_frame(vec![0x60, 0, 0]);
        assert_eq!(protocol, NetworkProtocol::Ipv6);
        assert_eq!(packet.network_header, vec![0x60, 0, 0]);
        assert!(packet.data.is_empty());
    }

    #[tokio::test]
    async fn second_nic_is_rejected() {
        let (stack, _link) = configured_stack();
        let err = stack
            .create_nic(1, Arc::new(CaptureLink::default()))
            .unwrap_err();
        assert_eq!(err, EngineError::DuplicateNic(1));
    }

    #[tokio::test]
    async fn address_family_must_match_protocol() {
        let (stack, _link) = configured_stack();
        let err = stack
            .add_address(1, NetworkProtocol::Ipv6, "10.0.0.6".parse().unwrap(), 24)
            .unwrap_err();
        assert_eq!(err, EngineError::BadAddress);
        let err = stack
            .add_address(2, NetworkProtocol::Ipv4, "10.0.0.6".parse().unwrap(), 24)
            .unwrap_err();
        assert_eq!(err, EngineError::UnknownNic(2));
    }

    #[tokio::test]
    async fn unsupported_transport_is_rejected() {
        let stack = SmolStack::new(StackOptions {
            network_protocols: vec![NetworkProtocol::Ipv4],
            transport_protocols: vec![TransportProtocol::Tcp],
        });
        let err = stack
            .new_endpoint(
                TransportProtocol::Udp,
                NetworkProtocol::Ipv4,
                Arc::new(WaiterQueue::new()),
            )
            .err()
            .unwrap();
        assert_eq!(err, EngineError::UnknownProtocol);
    }

    #[tokio::test]
    async fn tcp_connect_emits_syn_through_link() {
        let (stack, link) = configured_stack();
        let endpoint = stack
            .new_endpoint(
                TransportProtocol::Tcp,
                NetworkProtocol::Ipv4,
                Arc::new(WaiterQueue::new()),
            )
            .unwrap();

        let err = endpoint
            .connect(FullAddress {
                nic: 1,
                addr: "10.0.0.1".parse().unwrap(),
                port: 80,
            })
            .unwrap_err();
        assert_eq!(err, EngineError::ConnectStarted);

        let frames = link.frames.lock().unwrap();
        let (protocol, packet) = frames.first().expect("SYN was transmitted");
        assert_eq!(*protocol, NetworkProtocol::Ipv4);
        assert_eq!(packet.network_header.len(), 20);
        // Source 10.0.0.5, destination 10.0.0.1.
        assert_eq!(&packet.network_header[12..16], &[10, 0, 0, 5]);
        assert_eq!(&packet.network_header[16..20], &[10, 0, 0, 1]);
        assert_eq!(packet.network_header[9], 6);
    }

    #[tokio::test]
    async fn udp_write_requires_destination() {
        let (stack, link) = configured_stack();
        let endpoint = stack
            .new_endpoint(
                TransportProtocol::Udp,
                NetworkProtocol::Ipv4,
                Arc::new(WaiterQueue::new()),
            )
            .unwrap();
        assert_eq!(
            endpoint.write(b"x", None).unwrap_err(),
            EngineError::DestinationRequired
        );

        let to = FullAddress {
            nic: 1,
            addr: "8.8.8.8".parse().unwrap(),
            port: 53,
        };
        assert_eq!(endpoint.write(b"query", Some(to)), Ok(5));
        let frames = link.frames.lock().unwrap();
        let (_, packet) = frames.last().expect("datagram was transmitted");
        assert_eq!(packet.network_header[9], 17);
        assert!(packet.data.ends_with(b"query"));
    }

    #[tokio::test]
    async fn closed_endpoint_reads_end_of_stream() {
        let (stack, _link) = configured_stack();
        let waiters = Arc::new(WaiterQueue::new());
        let endpoint = stack
            .new_endpoint(TransportProtocol::Udp, NetworkProtocol::Ipv4, waiters)
            .unwrap();
        endpoint.close();
        assert_eq!(endpoint.read().unwrap_err(), EngineError::ClosedForReceive);
        assert_eq!(
            endpoint.write(b"late", None).unwrap_err(),
            EngineError::InvalidEndpointState
        );
        assert_eq!(stack.socket_count(), 0);
    }

    #[tokio::test]
    async fn closed_endpoint_always_has_an_error() {
        let (stack, _link) = configured_stack();
        let waiters = Arc::new(WaiterQueue::new());
        let endpoint = stack
            .new_endpoint(TransportProtocol::Tcp, NetworkProtocol::Ipv4, waiters)
            .unwrap();
        let remote = FullAddress {
            nic: 1,
            addr: "10.0.0.1".parse().unwrap(),
            port: 80,
        };
        assert_eq!(
            endpoint.connect(remote).unwrap_err(),
            EngineError::ConnectStarted
        );
        assert_eq!(endpoint.take_error(), None);

        endpoint.close();
        assert_eq!(
            endpoint.take_error(),
            Some(EngineError::InvalidEndpointState)
        );
        assert_eq!(
            endpoint.take_error(),
            Some(EngineError::InvalidEndpointState)
        );
    }
}
