//! CHIRP discovery scenarios on loopback address pairs.
//!
//! Each node gets its own 127.0.0.0/8 address and a per-test port, with the
//! peer's address as its broadcast target, so the tests exercise the real
//! datagram path without touching the LAN.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use constellation_core::chirp::{BroadcastRecv, BroadcastSend, ChirpConfig, ChirpManager};
use constellation_core::protocol::chirp::{
    ChirpMessage, ChirpMessageType, ServiceIdentifier,
};
use constellation_core::protocol::Md5Hash;

const ADDR_A: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const ADDR_B: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

/// Reserve a UDP port that is free on loopback.
fn free_udp_port() -> u16 {
    let probe = std::net::UdpSocket::bind((ADDR_A, 0)).expect("bind probe");
    probe.local_addr().expect("probe addr").port()
}

async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn pair_configs(group_a: &str, group_b: &str, port: u16) -> (ChirpConfig, ChirpConfig) {
    let a = ChirpConfig::new(group_a, "sat1")
        .with_listen_address(ADDR_A)
        .with_broadcast_address(ADDR_B)
        .with_port(port);
    let b = ChirpConfig::new(group_b, "sat2")
        .with_listen_address(ADDR_B)
        .with_broadcast_address(ADDR_A)
        .with_port(port);
    (a, b)
}

#[tokio::test]
async fn register_unregister_bookkeeping() {
    let port = free_udp_port();
    let config = ChirpConfig::new("group1", "sat1")
        .with_listen_address(ADDR_A)
        .with_broadcast_address(ADDR_B)
        .with_port(port);
    let manager = ChirpManager::new(config).unwrap();

    assert!(manager
        .register_service(ServiceIdentifier::Control, 23999)
        .await
        .unwrap());
    // second registration is not an effective insert
    assert!(!manager
        .register_service(ServiceIdentifier::Control, 23999)
        .await
        .unwrap());
    assert!(manager
        .unregister_service(ServiceIdentifier::Control, 23999)
        .await
        .unwrap());
    assert!(!manager
        .unregister_service(ServiceIdentifier::Control, 23999)
        .await
        .unwrap());

    manager
        .register_service(ServiceIdentifier::Control, 23999)
        .await
        .unwrap();
    manager
        .register_service(ServiceIdentifier::Control, 24000)
        .await
        .unwrap();
    assert_eq!(manager.registered_services().len(), 2);
    manager.unregister_services().await.unwrap();
    assert!(manager.registered_services().is_empty());
}

#[tokio::test]
async fn one_offer_per_effective_insert() {
    let port = free_udp_port();
    // a raw receiver plays the part of the peer
    let peer = BroadcastRecv::new(ADDR_B, port).unwrap();

    let config = ChirpConfig::new("group1", "sat1")
        .with_listen_address(ADDR_A)
        .with_broadcast_address(ADDR_B)
        .with_port(port);
    let manager = ChirpManager::new(config).unwrap();

    manager
        .register_service(ServiceIdentifier::Data, 24000)
        .await
        .unwrap();
    manager
        .register_service(ServiceIdentifier::Data, 24000)
        .await
        .unwrap();

    let (bytes, _) = peer
        .recv_timeout(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("one OFFER expected");
    let offer = ChirpMessage::disassemble(&bytes).unwrap();
    assert_eq!(offer.msg_type, ChirpMessageType::Offer);
    assert_eq!(offer.host_id, Md5Hash::new("sat1"));
    assert_eq!(offer.group_id, Md5Hash::new("group1"));
    assert_eq!(offer.port, 24000);

    // the duplicate registration must not have broadcast a second OFFER
    assert!(peer
        .recv_timeout(Duration::from_millis(200))
        .await
        .unwrap()
        .is_none());

    manager
        .unregister_service(ServiceIdentifier::Data, 24000)
        .await
        .unwrap();
    let (bytes, _) = peer
        .recv_timeout(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("one DEPART expected");
    assert_eq!(
        ChirpMessage::disassemble(&bytes).unwrap().msg_type,
        ChirpMessageType::Depart
    );
}

#[tokio::test]
async fn discovery_and_departure() {
    let port = free_udp_port();
    let (config_a, config_b) = pair_configs("group1", "group1", port);
    let manager_a = ChirpManager::new(config_a).unwrap();
    let manager_b = ChirpManager::new(config_b).unwrap();
    manager_a.start();
    manager_b.start();

    let hits = Arc::new(AtomicUsize::new(0));
    let last_depart = Arc::new(Mutex::new(None));
    let callback = {
        let hits = Arc::clone(&hits);
        let last_depart = Arc::clone(&last_depart);
        Arc::new(move |service: constellation_core::chirp::DiscoveredService, depart: bool| {
            hits.fetch_add(1, Ordering::SeqCst);
            *last_depart.lock().unwrap() = Some((service, depart));
        })
    };
    manager_b.register_discover_callback(callback, ServiceIdentifier::Control);

    manager_a
        .register_service(ServiceIdentifier::Control, 5000)
        .await
        .unwrap();

    assert!(
        wait_for(
            || manager_b.discovered_services().len() == 1,
            Duration::from_secs(2)
        )
        .await
    );
    let discovered = manager_b.discovered_services();
    assert_eq!(discovered[0].host_id, Md5Hash::new("sat1"));
    assert_eq!(discovered[0].identifier, ServiceIdentifier::Control);
    assert_eq!(discovered[0].port, 5000);

    assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);
    {
        let guard = last_depart.lock().unwrap();
        let (service, depart) = guard.as_ref().expect("callback fired");
        assert!(!depart);
        assert_eq!(service.port, 5000);
    }

    // a replayed OFFER for a known service must not fire the callback again
    manager_b
        .send_request(ServiceIdentifier::Control)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // departure erases the entry and notifies with depart=true
    manager_a
        .unregister_service(ServiceIdentifier::Control, 5000)
        .await
        .unwrap();
    assert!(
        wait_for(
            || manager_b.discovered_services().is_empty(),
            Duration::from_secs(2)
        )
        .await
    );
    assert!(wait_for(|| hits.load(Ordering::SeqCst) == 2, Duration::from_secs(2)).await);
    assert!(last_depart.lock().unwrap().as_ref().unwrap().1);

    manager_a.shutdown().await;
    manager_b.shutdown().await;
}

#[tokio::test]
async fn request_replays_offers() {
    let port = free_udp_port();
    let (config_a, config_b) = pair_configs("group1", "group1", port);

    // A runs first and registers while nobody is listening
    let manager_a = ChirpManager::new(config_a).unwrap();
    manager_a.start();
    manager_a
        .register_service(ServiceIdentifier::Control, 6001)
        .await
        .unwrap();

    // B comes up late and asks for a replay
    let manager_b = ChirpManager::new(config_b).unwrap();
    manager_b.start();
    assert!(manager_b.discovered_services().is_empty());

    manager_b
        .send_request(ServiceIdentifier::Control)
        .await
        .unwrap();

    assert!(
        wait_for(
            || manager_b.discovered_services().len() == 1,
            Duration::from_secs(2)
        )
        .await
    );

    manager_a.shutdown().await;
    manager_b.shutdown().await;
}

#[tokio::test]
async fn group_isolation() {
    let port = free_udp_port();
    let (config_a, config_b) = pair_configs("group1", "group2", port);
    let manager_a = ChirpManager::new(config_a).unwrap();
    let manager_b = ChirpManager::new(config_b).unwrap();
    manager_a.start();
    manager_b.start();

    manager_a
        .register_service(ServiceIdentifier::Control, 7001)
        .await
        .unwrap();
    manager_b
        .register_service(ServiceIdentifier::Data, 7002)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(manager_a.discovered_services().is_empty());
    assert!(manager_b.discovered_services().is_empty());

    manager_a.shutdown().await;
    manager_b.shutdown().await;
}

#[tokio::test]
async fn own_broadcasts_ignored() {
    let port = free_udp_port();
    // broadcast target pointed back at ourselves
    let config = ChirpConfig::new("group1", "sat1")
        .with_listen_address(ADDR_A)
        .with_broadcast_address(ADDR_A)
        .with_port(port);
    let manager = ChirpManager::new(config).unwrap();
    manager.start();

    manager
        .register_service(ServiceIdentifier::Control, 8001)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(manager.discovered_services().is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn malformed_datagrams_are_dropped() {
    let port = free_udp_port();
    let config_b = ChirpConfig::new("group1", "sat2")
        .with_listen_address(ADDR_B)
        .with_broadcast_address(ADDR_A)
        .with_port(port);
    let manager_b = ChirpManager::new(config_b).unwrap();
    manager_b.start();

    // raw garbage, then a valid OFFER from a foreign host
    let sender = BroadcastSend::new([ADDR_B], port, None).unwrap();
    sender.send_broadcast(b"not a chirp datagram").await.unwrap();
    let offer = ChirpMessage::new(
        ChirpMessageType::Offer,
        Md5Hash::new("group1"),
        Md5Hash::new("sat1"),
        ServiceIdentifier::Monitoring,
        9001,
    );
    sender.send_broadcast(&offer.assemble()).await.unwrap();

    assert!(
        wait_for(
            || manager_b.discovered_services().len() == 1,
            Duration::from_secs(2)
        )
        .await
    );

    manager_b.shutdown().await;
}

#[tokio::test]
async fn forget_discovered_services() {
    let port = free_udp_port();
    let (config_a, config_b) = pair_configs("group1", "group1", port);
    let manager_a = ChirpManager::new(config_a).unwrap();
    let manager_b = ChirpManager::new(config_b).unwrap();
    manager_b.start();

    manager_a
        .register_service(ServiceIdentifier::Heartbeat, 9100)
        .await
        .unwrap();
    manager_a
        .register_service(ServiceIdentifier::Monitoring, 9200)
        .await
        .unwrap();
    assert!(
        wait_for(
            || manager_b.discovered_services().len() == 2,
            Duration::from_secs(2)
        )
        .await
    );
    assert_eq!(
        manager_b
            .discovered_services_of(ServiceIdentifier::Heartbeat)
            .len(),
        1
    );

    let depart_hits = Arc::new(AtomicUsize::new(0));
    let callback = {
        let depart_hits = Arc::clone(&depart_hits);
        Arc::new(move |_service: constellation_core::chirp::DiscoveredService, depart: bool| {
            if depart {
                depart_hits.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    manager_b.register_discover_callback(callback, ServiceIdentifier::Heartbeat);

    // forgetting one host's services notifies matching callbacks
    manager_b.forget_discovered_services_of(Md5Hash::new("sat1"));
    assert!(manager_b.discovered_services().is_empty());
    assert!(wait_for(|| depart_hits.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);

    manager_a.shutdown().await;
    manager_b.shutdown().await;
}

#[tokio::test]
async fn callback_registration_identity() {
    let port = free_udp_port();
    let config = ChirpConfig::new("group1", "sat1")
        .with_listen_address(ADDR_A)
        .with_broadcast_address(ADDR_B)
        .with_port(port);
    let manager = ChirpManager::new(config).unwrap();

    let callback: constellation_core::chirp::DiscoverCallback =
        Arc::new(|_service, _depart| {});

    assert!(manager.register_discover_callback(Arc::clone(&callback), ServiceIdentifier::Control));
    // same handle and filter is a duplicate
    assert!(!manager.register_discover_callback(Arc::clone(&callback), ServiceIdentifier::Control));
    // same handle, different filter is distinct
    assert!(manager.register_discover_callback(Arc::clone(&callback), ServiceIdentifier::Data));

    assert!(manager.unregister_discover_callback(&callback, ServiceIdentifier::Control));
    assert!(!manager.unregister_discover_callback(&callback, ServiceIdentifier::Control));
    manager.unregister_discover_callbacks();
    assert!(!manager.unregister_discover_callback(&callback, ServiceIdentifier::Data));
}
