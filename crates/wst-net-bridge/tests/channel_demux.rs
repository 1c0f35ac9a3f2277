mod common;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{harness, ready_harness, MockEngine, NETCONF};
use tokio::sync::mpsc;
use wst_net_bridge::engine::{
    EngineError, NetworkProtocol, StackEngine, StackOptions, Subnet, TransportProtocol,
};
use wst_net_bridge::{BridgeError, ChannelMessage, Disposition, Inbound, NetContext, NIC_ID};

#[tokio::test]
async fn configuration_bootstraps_the_stack() {
    let h = harness();
    assert!(!h.ctx.is_ready());

    let res = h
        .ctx
        .handle_message(ChannelMessage::Control(NETCONF.to_string()));
    assert_eq!(res, Ok(Inbound::Configured));
    assert!(h.ctx.is_ready());

    let options = h.engine.options.lock().unwrap().clone().unwrap();
    assert!(options.supports(NetworkProtocol::Ipv6, TransportProtocol::Icmp));
    assert!(options.supports(NetworkProtocol::Ipv4, TransportProtocol::Udp));

    assert_eq!(*h.engine.nics.lock().unwrap(), vec![NIC_ID]);
    assert_eq!(
        *h.engine.addresses.lock().unwrap(),
        vec![(
            NIC_ID,
            NetworkProtocol::Ipv4,
            "10.0.0.5".parse::<IpAddr>().unwrap(),
            24
        )]
    );

    let routes = h.engine.routes.lock().unwrap().clone();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].destination, Subnet::IPV4_ANY);
    assert_eq!(routes[0].gateway, Some("10.0.0.1".parse().unwrap()));
    assert_eq!(routes[0].nic, NIC_ID);

    let conf = h.ctx.netconf().expect("configuration is recorded");
    assert_eq!(conf.ipv4.address, "10.0.0.5");
}

#[tokio::test]
async fn second_configuration_is_a_protocol_violation() {
    let h = ready_harness();
    let other = r#"{"ipv4": {"address": "192.168.1.2", "gateway": "192.168.1.1", "prefix_length": 16}}"#;

    let err = h
        .ctx
        .handle_message(ChannelMessage::Control(other.to_string()))
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::ProtocolViolation("got network configuration twice".to_string())
    );

    // The first configuration stays in effect.
    assert_eq!(h.engine.addresses.lock().unwrap().len(), 1);
    assert_eq!(h.ctx.netconf().unwrap().ipv4.address, "10.0.0.5");
}

#[tokio::test]
async fn repeated_configuration_is_rejected_even_when_malformed() {
    let h = ready_harness();
    let err = h
        .ctx
        .handle_message(ChannelMessage::Control("not json".to_string()))
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::ProtocolViolation("got network configuration twice".to_string())
    );
}

#[tokio::test]
async fn malformed_first_configuration_can_be_retried() {
    let h = harness();
    let err = h
        .ctx
        .handle_message(ChannelMessage::Control("{\"ipv4\": 7}".to_string()))
        .unwrap_err();
    assert!(matches!(err, BridgeError::ProtocolViolation(_)), "{err:?}");
    assert!(!h.ctx.is_ready());

    assert_eq!(
        h.ctx
            .handle_message(ChannelMessage::Control(NETCONF.to_string())),
        Ok(Inbound::Configured)
    );
}

#[tokio::test]
async fn packet_before_configuration_is_rejected() {
    let h = harness();
    let err = h
        .ctx
        .handle_message(ChannelMessage::Data(vec![0x45, 0, 0, 20]))
        .unwrap_err();
    assert!(matches!(err, BridgeError::ProtocolViolation(_)), "{err:?}");
    assert!(h.engine.dispatched().is_empty());
    assert!(h.engine.nics.lock().unwrap().is_empty());
}

#[tokio::test]
async fn packets_are_routed_by_version_nibble() {
    let h = ready_harness();

    let v4 = h.ctx.handle_message(ChannelMessage::Data(vec![0x45, 1, 2, 3]));
    let v6 = h.ctx.handle_message(ChannelMessage::Data(vec![0x60, 4, 5]));
    let junk = h.ctx.handle_message(ChannelMessage::Data(vec![0x00, 9]));
    let empty = h.ctx.handle_message(ChannelMessage::Data(Vec::new()));

    assert_eq!(v4, Ok(Inbound::Frame(Disposition::Ipv4)));
    assert_eq!(v6, Ok(Inbound::Frame(Disposition::Ipv6)));
    assert_eq!(
        junk,
        Ok(Inbound::Frame(Disposition::DroppedUnknownVersion(0)))
    );
    assert_eq!(empty, Ok(Inbound::Frame(Disposition::DroppedEmpty)));

    assert_eq!(
        h.engine.dispatched(),
        vec![
            (NetworkProtocol::Ipv4, vec![0x45, 1, 2, 3]),
            (NetworkProtocol::Ipv6, vec![0x60, 4, 5]),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn operations_wait_for_configuration() {
    let h = harness();
    let ctx = h.ctx.clone();
    let create = tokio::spawn(async move { ctx.create_socket_named("ip4", "tcp").await });

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!create.is_finished());
    assert!(h.engine.sockets.lock().unwrap().is_empty());

    h.ctx
        .handle_message(ChannelMessage::Control(NETCONF.to_string()))
        .unwrap();
    let id = create.await.unwrap().unwrap();
    assert_eq!(id.get(), 1);
}

#[tokio::test]
async fn engine_failure_before_nic_attach_can_be_retried() {
    let engine = Arc::new(MockEngine::default());
    let failed_once = Arc::new(AtomicBool::new(false));
    let (tx, _outbound) = mpsc::unbounded_channel::<Vec<u8>>();

    let factory_engine = engine.clone();
    let factory_failed = failed_once.clone();
    let ctx = NetContext::new(
        Arc::new(tx),
        move |_options: StackOptions| -> Result<Arc<dyn StackEngine>, EngineError> {
            if !factory_failed.swap(true, Ordering::SeqCst) {
                return Err(EngineError::Other("out of memory".to_string()));
            }
            Ok(factory_engine.clone())
        },
    );

    let err = ctx
        .handle_message(ChannelMessage::Control(NETCONF.to_string()))
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::StackEngine(EngineError::Other("out of memory".to_string()))
    );
    assert!(!ctx.is_ready());
    assert!(failed_once.load(Ordering::SeqCst));

    assert_eq!(
        ctx.handle_message(ChannelMessage::Control(NETCONF.to_string())),
        Ok(Inbound::Configured)
    );
    assert!(ctx.is_ready());
    assert_eq!(*engine.nics.lock().unwrap(), vec![NIC_ID]);
}
