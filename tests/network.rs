//! End-to-end lookups over UDP on a local testnet.
//!
//! Run with: cargo test --test network

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use kadnode::{Dht, Id, Testnet, MAX_BUCKET_SIZE_K, TESTNET_NETWORK_ID};

fn closest_by_brute_force(nodes: &[Dht], target: &Id, except: &Id) -> Vec<Id> {
    let mut ids: Vec<Id> = nodes
        .iter()
        .map(|node| *node.id())
        .filter(|id| id != except)
        .collect();

    ids.sort_by_key(|id| id.xor(target));
    ids.truncate(MAX_BUCKET_SIZE_K);

    ids
}

#[test]
fn lookups_converge() {
    let testnet = Testnet::new(30).unwrap();
    let target = Id::random();

    for node in [&testnet.nodes[1], &testnet.nodes[15], &testnet.nodes[29]] {
        let found: Vec<Id> = node.find_node(target).iter().map(|c| c.id).collect();

        assert_eq!(
            found,
            closest_by_brute_force(&testnet.nodes, &target, node.id())
        );
    }
}

#[test]
fn parallelism_does_not_change_the_result() {
    let testnet = Testnet::new(20).unwrap();
    let target = Id::random();
    let node = &testnet.nodes[7];

    let sequential = node.iterative_find_node(target, 1);
    let parallel = node.iterative_find_node(target, 8);

    assert_eq!(sequential, parallel);
}

#[test]
fn late_joiner_is_found() {
    let testnet = Testnet::new(10).unwrap();

    let id = Id::random();
    let joiner = Dht::builder()
        .id(id)
        .network_id(TESTNET_NETWORK_ID)
        .bind_address(Ipv4Addr::LOCALHOST.into())
        .port(0)
        .bootstrap(&testnet.bootstrap)
        .build()
        .unwrap();

    assert!(joiner.bootstrap());

    let closest = testnet.nodes[5].find_node(id);

    assert_eq!(closest.first(), Some(joiner.contact()));
}

#[test]
fn unreachable_bootstrap_node() {
    let dht = Dht::builder()
        .bind_address(Ipv4Addr::LOCALHOST.into())
        .port(0)
        .request_timeout(Duration::from_millis(100))
        .bootstrap(&["127.0.0.1:9".to_string(), "not a socket address".to_string()])
        .build()
        .unwrap();

    let start = Instant::now();

    assert!(!dht.bootstrap());
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn dropped_nodes_leave_results() {
    let mut testnet = Testnet::new(12).unwrap();
    let target = Id::random();

    let gone: HashSet<Id> = testnet.nodes.drain(6..).map(|node| *node.id()).collect();

    let closest = testnet.nodes[1].find_node(target);

    assert_eq!(closest.len(), 5);
    assert!(closest.iter().all(|contact| !gone.contains(&contact.id)));
}

fn node_with_id(first_byte: u8, eviction_probe: bool) -> Dht {
    let mut bytes = [0; 20];
    bytes[0] = first_byte;

    Dht::builder()
        .id(Id::from(bytes))
        .network_id(TESTNET_NETWORK_ID)
        .bind_address(Ipv4Addr::LOCALHOST.into())
        .port(0)
        .request_timeout(Duration::from_millis(200))
        .eviction_probe(eviction_probe)
        .build()
        .unwrap()
}

fn wait_for_eviction(node: &Dht, index: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);

    while node.routing_table().bucket(index).pending().is_some() {
        assert!(Instant::now() < deadline, "eviction never resolved");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn full_bucket_evicts_only_unresponsive_contacts() {
    let local = node_with_id(0, true);

    let mut peers: Vec<Option<Dht>> = (0..MAX_BUCKET_SIZE_K as u8)
        .map(|i| Some(node_with_id(0x80 | i, false)))
        .collect();

    for peer in peers.iter().flatten() {
        peer.ping(local.local_addr()).unwrap();
    }

    let index = local.routing_table().bucket_index(peers[0].as_ref().unwrap().id());
    assert_eq!(local.routing_table().bucket(index).len(), MAX_BUCKET_SIZE_K);

    // The stalest contact answers and stays.
    let first = node_with_id(0xf0, false);
    first.ping(local.local_addr()).unwrap();
    wait_for_eviction(&local, index);

    let table = local.routing_table();
    assert!(!table.contains(first.id()));
    assert!(table.contains(peers[0].as_ref().unwrap().id()));
    assert_eq!(table.bucket(index).len(), MAX_BUCKET_SIZE_K);

    // The next stalest contact is gone and gets replaced.
    let gone = peers[1].take().unwrap();
    let gone_id = *gone.id();
    drop(gone);

    let second = node_with_id(0xf1, false);
    second.ping(local.local_addr()).unwrap();
    wait_for_eviction(&local, index);

    let table = local.routing_table();
    assert!(table.contains(second.id()));
    assert!(!table.contains(&gone_id));
    assert_eq!(table.bucket(index).len(), MAX_BUCKET_SIZE_K);
}
