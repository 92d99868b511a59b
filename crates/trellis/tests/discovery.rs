use std::{net::SocketAddr, time::Duration};

use trellis::{Config, Registry, Server, discover_host, discover_hosts};

#[test]
fn discovers_server_and_response_payload() {
    let tcp: SocketAddr = "127.0.0.1:54780".parse().unwrap();
    let udp: SocketAddr = "0.0.0.0:54777".parse().unwrap();
    let config = Config::default();
    let magic = config.discovery_magic;

    let server = Server::new(config, Registry::new()).unwrap();
    server.bind(tcp, Some(udp)).unwrap();
    server.set_discovery_response(vec![0x01, 0x02]);
    server.start().unwrap();

    let found = discover_host(54777, magic, Duration::from_millis(500)).unwrap();
    assert!(found.is_some(), "no server discovered");

    let hosts = discover_hosts(54777, magic, Duration::from_millis(500)).unwrap();
    assert!(
        hosts.iter().any(|h| h.response == vec![0x01, 0x02]),
        "response payload missing: {hosts:?}"
    );

    server.stop();
}

#[test]
fn discovery_times_out_quietly_without_a_server() {
    // nobody listens on this port
    let found = discover_host(54799, 0x2a, Duration::from_millis(200)).unwrap();
    assert_eq!(found, None);
}
