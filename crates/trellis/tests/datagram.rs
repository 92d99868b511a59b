use std::{
    net::SocketAddr,
    sync::{Arc, mpsc},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use trellis::{Client, Config, Registry, Server, TypeListener};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Burst {
    n: u32,
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register::<Burst>();
    registry
}

#[test]
fn datagram_round_trip_after_binding() {
    let tcp: SocketAddr = "127.0.0.1:54790".parse().unwrap();
    let udp: SocketAddr = "0.0.0.0:54791".parse().unwrap();

    let server = Server::new(Config::default(), registry()).unwrap();
    server.bind(tcp, Some(udp)).unwrap();
    let (server_tx, server_rx) = mpsc::channel();
    let routed = TypeListener::new();
    routed.on::<Burst, _>(move |conn, burst: &Burst| {
        let _ = server_tx.send(burst.n);
        let _ = conn.send_udp(&Burst { n: burst.n + 1 });
    });
    server.add_listener(Arc::new(routed));
    server.start().unwrap();

    let client = Client::new(Config::default(), registry()).unwrap();
    let (client_tx, client_rx) = mpsc::channel();
    let routed = TypeListener::new();
    routed.on::<Burst, _>(move |_, burst: &Burst| {
        let _ = client_tx.send(burst.n);
    });
    client.add_listener(Arc::new(routed));
    let conn = client.connect(tcp, Some(54791), Duration::from_secs(5)).unwrap();
    client.start().unwrap();

    // wait until the server acknowledged the datagram binding
    let deadline = Instant::now() + Duration::from_secs(5);
    while !conn.datagram_ready() {
        assert!(Instant::now() < deadline, "datagram channel never bound");
        std::thread::sleep(Duration::from_millis(10));
    }

    // datagrams are lossy even on loopback in theory; retry a few times
    let mut reply = None;
    for n in 0..5u32 {
        conn.send_udp(&Burst { n: n * 10 }).unwrap();
        if let Ok(v) = client_rx.recv_timeout(Duration::from_millis(500)) {
            reply = Some(v);
            break;
        }
    }
    let reply = reply.expect("no datagram reply");
    let sent = server_rx.try_iter().collect::<Vec<_>>();
    assert!(sent.contains(&(reply - 1)), "reply {reply} does not match sends {sent:?}");

    client.stop();
    server.stop();
}
