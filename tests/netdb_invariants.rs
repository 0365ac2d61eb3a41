//! NetDb store/selection invariants from the database's public surface.

use std::collections::HashSet;

use garliccraft_core::{
    now_ms, now_secs, routing_key, Capabilities, Hash, PrivateKeys, RouterAddress, RouterInfo,
};
use garliccraft_crypto::SigType;
use garliccraft_netdb::NetDb;

fn signed_router(caps: Capabilities) -> RouterInfo {
    let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
    let mut info = RouterInfo::new(
        keys.identity().clone(),
        now_ms(),
        vec![RouterAddress::ntcp("127.0.0.1", 9000)],
        caps,
    );
    info.sign(&keys).unwrap();
    info
}

#[tokio::test]
async fn insert_then_find_returns_same_record() {
    let netdb = NetDb::new_for_tests();
    let info = signed_router(Capabilities::REACHABLE);
    let hash = info.hash();
    netdb.add_router_info(&info.to_bytes()).unwrap();

    let found = netdb.find_router(&hash).expect("inserted router");
    assert_eq!(found.hash(), hash);
    assert_eq!(found.published(), info.published());
}

#[tokio::test]
async fn floodfill_capability_implies_floodfill_index() {
    let netdb = NetDb::new_for_tests();
    netdb
        .add_router_info(&signed_router(Capabilities::REACHABLE).to_bytes())
        .unwrap();
    assert_eq!(netdb.known_floodfills(), 0);

    netdb
        .add_router_info(
            &signed_router(Capabilities::FLOODFILL | Capabilities::REACHABLE).to_bytes(),
        )
        .unwrap();
    assert_eq!(netdb.known_floodfills(), 1);
    assert_eq!(netdb.known_routers(), 2);
}

#[tokio::test]
async fn closest_floodfill_minimizes_xor_distance() {
    let netdb = NetDb::new_for_tests();
    let mut hashes = Vec::new();
    for _ in 0..12 {
        let info = signed_router(Capabilities::FLOODFILL | Capabilities::REACHABLE);
        hashes.push(info.hash());
        netdb.add_router_info(&info.to_bytes()).unwrap();
    }

    let key = Hash::digest(b"some lookup target");
    let target = routing_key(&key, now_secs());
    let best = netdb
        .closest_floodfill(&key, &HashSet::new())
        .unwrap()
        .hash();
    for other in &hashes {
        assert!(
            best.xor_distance(&target) <= other.xor_distance(&target),
            "{best:?} is not minimal"
        );
    }
}

#[tokio::test]
async fn excluding_best_yields_strictly_worse_or_none() {
    let netdb = NetDb::new_for_tests();
    for _ in 0..6 {
        netdb
            .add_router_info(
                &signed_router(Capabilities::FLOODFILL | Capabilities::REACHABLE).to_bytes(),
            )
            .unwrap();
    }

    let key = Hash::digest(b"target");
    let target = routing_key(&key, now_secs());
    let best = netdb
        .closest_floodfill(&key, &HashSet::new())
        .unwrap()
        .hash();

    let mut excluded = HashSet::new();
    excluded.insert(best);
    match netdb.closest_floodfill(&key, &excluded) {
        None => {}
        Some(second) => {
            assert_ne!(second.hash(), best);
            assert!(second.hash().xor_distance(&target) > best.xor_distance(&target));
        }
    }
}

#[tokio::test]
async fn closest_floodfills_returns_n_smallest_sorted() {
    let netdb = NetDb::new_for_tests();
    for _ in 0..10 {
        netdb
            .add_router_info(
                &signed_router(Capabilities::FLOODFILL | Capabilities::REACHABLE).to_bytes(),
            )
            .unwrap();
    }
    let key = Hash::digest(b"k");
    let target = routing_key(&key, now_secs());
    let three = netdb.closest_floodfills(&key, 3, &HashSet::new());
    assert_eq!(three.len(), 3);
    for pair in three.windows(2) {
        assert!(
            pair[0].hash().xor_distance(&target) <= pair[1].hash().xor_distance(&target),
            "selection not sorted by distance"
        );
    }
}

#[tokio::test]
async fn tampered_record_is_rejected() {
    let netdb = NetDb::new_for_tests();
    let info = signed_router(Capabilities::REACHABLE);
    let mut bytes = info.to_bytes();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;
    assert!(netdb.add_router_info(&bytes).is_err());
    assert!(netdb.find_router(&info.hash()).is_none());
}
