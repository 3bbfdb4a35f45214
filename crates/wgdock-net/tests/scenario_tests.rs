//! Scenario tests for the parts of the driver that run without privileges:
//! config parsing, address allocation, option validation, and the values
//! echoed back to the runtime.

use std::io::Write;
use std::net::Ipv4Addr;

use tempfile::NamedTempFile;
use wgdock_common::WgdockError;
use wgdock_net::driver::EndpointInterface;
use wgdock_net::endpoint::Endpoint;
use wgdock_net::{IpAllocator, NetworkOptions, WgConfig};

const PEER_CONF: &str = "\
[Interface]
Address = 10.20.0.1/24
PrivateKey = cPYlh1l4Ylo3l1dYzmTyNbAKrUtcvvVaM7Z5ZVQx03c=
ListenPort = 51820

[Peer]
PublicKey = gQ06q2nVwCdLQnX3nZHTTFkVLUq3Q9lPhcHlqFXK2z0=
Endpoint = 198.51.100.7:51820
AllowedIPs = 10.99.0.0/24
";

fn write_conf(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn config_file_round_trip() {
    let file = write_conf(PEER_CONF);
    let conf = WgConfig::parse(file.path()).unwrap();

    assert_eq!(conf.address.ip(), Ipv4Addr::new(10, 20, 0, 1));
    assert_eq!(conf.listen_port, 51820);
    assert_eq!(conf.peers.len(), 1);
}

#[test]
fn join_routes_point_at_the_bridge() {
    let file = write_conf(PEER_CONF);
    let conf = WgConfig::parse(file.path()).unwrap();

    // With the wireguard address at .1, the bridge takes the first free
    // host address .2; every peer AllowedIPs routes via it.
    let routes = conf.get_routes(Ipv4Addr::new(10, 20, 0, 2));
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].destination, "10.99.0.0/24");
    assert_eq!(routes[0].next_hop, "10.20.0.2");
}

#[test]
fn allocation_order_matches_network_setup() {
    // CreateNetwork marks the wireguard address used, then allocates the
    // bridge address; endpoints come after.
    let mut allocator = IpAllocator::new("10.20.0.0/24".parse().unwrap());
    allocator.mark_used(Ipv4Addr::new(10, 20, 0, 1));

    let bridge = allocator.find_address().unwrap();
    assert_eq!(bridge.ip(), Ipv4Addr::new(10, 20, 0, 2));

    let e1 = Endpoint::build(&EndpointInterface::default(), &mut allocator).unwrap();
    assert_eq!(e1.addr.to_string(), "10.20.0.3/24");
}

#[test]
fn tiny_pool_is_exhausted_by_wireguard_and_bridge() {
    // A /30 has two usable hosts, consumed by wg0 and br0; the first
    // endpoint cannot be allocated.
    let mut allocator = IpAllocator::new("10.20.0.0/30".parse().unwrap());
    allocator.mark_used(Ipv4Addr::new(10, 20, 0, 1));
    let bridge = allocator.find_address().unwrap();
    assert_eq!(bridge.ip(), Ipv4Addr::new(10, 20, 0, 2));

    let result = Endpoint::build(&EndpointInterface::default(), &mut allocator);
    assert!(matches!(result, Err(WgdockError::PoolExhausted)));
}

#[test]
fn preassigned_values_would_be_echoed_empty() {
    let mut allocator = IpAllocator::new("10.20.0.0/24".parse().unwrap());

    let proposed = EndpointInterface {
        address: "10.20.0.50/24".to_string(),
        ..EndpointInterface::default()
    };
    let endpoint = Endpoint::build(&proposed, &mut allocator).unwrap();
    let response = endpoint.interface_response();

    // The driver blanks fields equal to the proposal; equality is what
    // matters here.
    assert_eq!(response.address, proposed.address);
    assert_ne!(response.mac_address, proposed.mac_address);
}

#[test]
fn create_network_options_validation() {
    let full: std::collections::HashMap<String, String> = [
        ("endpoint".to_string(), "203.0.113.5".to_string()),
        ("wgconf".to_string(), "/etc/wg/peer.conf".to_string()),
    ]
    .into();
    let options = NetworkOptions::from_map(&full).unwrap();
    assert!(options.cleanup);

    // Missing endpoint fails before any kernel object is touched.
    let missing: std::collections::HashMap<String, String> =
        [("wgconf".to_string(), "/etc/wg/peer.conf".to_string())].into();
    match NetworkOptions::from_map(&missing) {
        Err(WgdockError::BadOption { name, .. }) => assert_eq!(name, "endpoint"),
        other => panic!("expected BadOption, got {other:?}"),
    }
}

#[test]
fn endpoint_addresses_stay_disjoint() {
    let mut allocator = IpAllocator::new("10.20.0.0/28".parse().unwrap());
    allocator.mark_used(Ipv4Addr::new(10, 20, 0, 1));
    let bridge = allocator.find_address().unwrap();

    let mut seen = vec![Ipv4Addr::new(10, 20, 0, 1), bridge.ip()];
    for _ in 0..5 {
        let ep = Endpoint::build(&EndpointInterface::default(), &mut allocator).unwrap();
        assert!(!seen.contains(&ep.addr.ip()));
        seen.push(ep.addr.ip());
    }
}
