use std::{
    net::SocketAddr,
    sync::{Arc, mpsc},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use trellis::{Client, Config, Registry, SendError, Server, TypeListener};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Str {
    text: String,
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register::<Str>();
    registry
}

#[test]
fn oversize_send_fails_but_connection_survives() {
    let addr: SocketAddr = "127.0.0.1:54610".parse().unwrap();
    let config = Config::default().with_object_buffer_size(64);

    let server = Server::new(config.clone(), registry()).unwrap();
    server.bind(addr, None).unwrap();
    let (tx, rx) = mpsc::channel();
    let routed = TypeListener::new();
    routed.on::<Str, _>(move |_, msg: &Str| {
        let _ = tx.send(msg.text.clone());
    });
    server.add_listener(Arc::new(routed));
    server.start().unwrap();

    let client = Client::new(config, registry()).unwrap();
    let conn = client.connect(addr, None, Duration::from_secs(5)).unwrap();
    client.start().unwrap();

    let err = conn.send_tcp(&Str { text: "x".repeat(100) }).unwrap_err();
    assert!(matches!(err, SendError::BufferOverflow { .. }), "got {err:?}");
    assert!(conn.is_connected());

    // a small frame still goes through afterwards
    conn.send_tcp(&Str { text: "ok".into() }).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "ok");
    assert!(conn.is_connected());

    client.stop();
    server.stop();
}
