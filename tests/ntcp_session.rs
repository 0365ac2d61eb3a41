//! Real NTCP sessions over loopback TCP: handshake, framing, and message
//! delivery between two transport stacks.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;

use garliccraft_core::i2np::{I2npMessage, MessageType};
use garliccraft_core::{now_ms, Capabilities, PrivateKeys, RouterAddress, RouterInfo};
use garliccraft_crypto::SigType;
use garliccraft_netdb::NetDb;
use garliccraft_transport::{TransportConfig, Transports};

struct TestRouter {
    keys: Arc<PrivateKeys>,
    transports: Transports,
    inbound: tokio::sync::mpsc::Receiver<garliccraft_transport::InboundMessage>,
    netdb: NetDb,
}

async fn start_router() -> TestRouter {
    let keys = Arc::new(PrivateKeys::generate(SigType::Ed25519).unwrap());
    let mut info = RouterInfo::new(
        keys.identity().clone(),
        now_ms(),
        vec![],
        Capabilities::REACHABLE,
    );
    info.sign(&keys).unwrap();

    let netdb = NetDb::new_for_tests();
    let config = TransportConfig {
        keys: keys.clone(),
        local_info: Arc::new(RwLock::new(Arc::new(info))),
        ntcp_addr: "127.0.0.1:0".parse().unwrap(),
        ssu_addr: "127.0.0.1:0".parse().unwrap(),
    };
    let (transports, inbound) = Transports::new(config, netdb.clone());
    transports.start().await.unwrap();
    TestRouter {
        keys,
        transports,
        inbound,
        netdb,
    }
}

/// A signed RouterInfo advertising the actually-bound NTCP port.
fn advertised_info(router: &TestRouter) -> RouterInfo {
    let addr = router.transports.ntcp_local_addr().expect("started");
    let mut info = RouterInfo::new(
        router.keys.identity().clone(),
        now_ms(),
        vec![RouterAddress::ntcp("127.0.0.1", addr.port())],
        Capabilities::REACHABLE,
    );
    info.sign(&router.keys).unwrap();
    info
}

#[tokio::test]
async fn handshake_and_message_delivery() {
    let alice = start_router().await;
    let mut bob = start_router().await;

    // alice learns how to reach bob
    alice
        .netdb
        .add_router_info(&advertised_info(&bob).to_bytes())
        .unwrap();

    let msg = I2npMessage::new(MessageType::Data, Bytes::from_static(b"over ntcp"));
    let sent_id = msg.msg_id;
    alice
        .transports
        .send_message(bob.keys.hash(), msg.shared());

    let received = tokio::time::timeout(Duration::from_secs(15), bob.inbound.recv())
        .await
        .expect("message within deadline")
        .expect("channel open");
    assert_eq!(received.from, alice.keys.hash());
    assert_eq!(received.msg.msg_id, sent_id);
    assert_eq!(received.msg.payload.as_ref(), b"over ntcp");
}

#[tokio::test]
async fn established_session_carries_many_messages() {
    let alice = start_router().await;
    let mut bob = start_router().await;
    alice
        .netdb
        .add_router_info(&advertised_info(&bob).to_bytes())
        .unwrap();

    for i in 0..20u8 {
        let msg = I2npMessage::new(MessageType::Data, Bytes::from(vec![i; 100]));
        alice.transports.send_message(bob.keys.hash(), msg.shared());
    }
    let mut seen = 0;
    while seen < 20 {
        let received = tokio::time::timeout(Duration::from_secs(15), bob.inbound.recv())
            .await
            .expect("messages keep arriving")
            .expect("channel open");
        assert_eq!(received.msg.payload.len(), 100);
        seen += 1;
    }
    // all rode one session's counters
    assert!(alice.transports.bandwidth().total_sent() > 2000);
    assert!(bob.transports.bandwidth().total_received() > 2000);
}

#[tokio::test]
async fn messages_flow_both_directions() {
    let mut alice = start_router().await;
    let mut bob = start_router().await;
    alice
        .netdb
        .add_router_info(&advertised_info(&bob).to_bytes())
        .unwrap();
    bob.netdb
        .add_router_info(&advertised_info(&alice).to_bytes())
        .unwrap();

    let ping = I2npMessage::new(MessageType::Data, Bytes::from_static(b"ping"));
    alice.transports.send_message(bob.keys.hash(), ping.shared());
    let got = tokio::time::timeout(Duration::from_secs(15), bob.inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.msg.payload.as_ref(), b"ping");

    // reply re-uses or builds a session bob→alice
    let pong = I2npMessage::new(MessageType::Data, Bytes::from_static(b"pong"));
    bob.transports.send_message(alice.keys.hash(), pong.shared());
    let got = tokio::time::timeout(Duration::from_secs(15), alice.inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.msg.payload.as_ref(), b"pong");
}
