use std::{
    net::SocketAddr,
    sync::{Arc, mpsc},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use trellis::{Client, Config, Connection, Listener, Object, Registry, Server, TypeListener};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Str {
    text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Seq(u32);

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register::<Str>();
    registry.register::<Seq>();
    registry
}

#[derive(Debug, PartialEq)]
enum Event {
    Connected,
    Received(String),
    Disconnected,
}

struct Recorder {
    tx: mpsc::Sender<Event>,
}

impl Listener for Recorder {
    fn connected(&self, _connection: &Connection) {
        let _ = self.tx.send(Event::Connected);
    }

    fn disconnected(&self, _connection: &Connection) {
        let _ = self.tx.send(Event::Disconnected);
    }

    fn received(&self, _connection: &Connection, object: &Object) {
        if let Some(msg) = object.downcast_ref::<Str>() {
            let _ = self.tx.send(Event::Received(msg.text.clone()));
        }
    }
}

#[test]
fn echo_round_trip() {
    let addr: SocketAddr = "127.0.0.1:54555".parse().unwrap();
    let server = Server::new(Config::default(), registry()).unwrap();
    server.bind(addr, None).unwrap();
    let (server_tx, server_rx) = mpsc::channel();
    server.add_listener(Arc::new(Recorder { tx: server_tx }));
    let echo = TypeListener::new();
    echo.on::<Str, _>(|conn, msg: &Str| {
        let _ = conn.send_tcp(&Str { text: format!("{}!", msg.text) });
    });
    server.add_listener(Arc::new(echo));
    server.start().unwrap();

    let client = Client::new(Config::default(), registry()).unwrap();
    let (client_tx, client_rx) = mpsc::channel();
    client.add_listener(Arc::new(Recorder { tx: client_tx }));
    let conn = client.connect(addr, None, Duration::from_secs(5)).unwrap();
    client.start().unwrap();
    conn.send_tcp(&Str { text: "hi".into() }).unwrap();

    // connected strictly precedes received, on both peers
    assert_eq!(client_rx.recv_timeout(Duration::from_secs(5)).unwrap(), Event::Connected);
    assert_eq!(
        client_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Event::Received("hi!".into())
    );
    assert_eq!(server_rx.recv_timeout(Duration::from_secs(5)).unwrap(), Event::Connected);
    assert_eq!(
        server_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Event::Received("hi".into())
    );

    client.stop();
    server.stop();

    // exactly one connected and at most one disconnected per side
    let client_rest: Vec<Event> = client_rx.try_iter().collect();
    let server_rest: Vec<Event> = server_rx.try_iter().collect();
    for rest in [&client_rest, &server_rest] {
        assert!(!rest.contains(&Event::Connected));
        assert!(rest.iter().filter(|e| **e == Event::Disconnected).count() <= 1);
    }
}

#[test]
fn reliable_frames_arrive_in_send_order() {
    let addr: SocketAddr = "127.0.0.1:54602".parse().unwrap();
    let server = Server::new(Config::default(), registry()).unwrap();
    server.bind(addr, None).unwrap();
    let (tx, rx) = mpsc::channel();
    let routed = TypeListener::new();
    routed.on::<Seq, _>(move |_, seq: &Seq| {
        let _ = tx.send(seq.0);
    });
    server.add_listener(Arc::new(routed));
    server.start().unwrap();

    let client = Client::new(Config::default(), registry()).unwrap();
    let conn = client.connect(addr, None, Duration::from_secs(5)).unwrap();
    client.start().unwrap();

    for i in 0..200u32 {
        conn.send_tcp(&Seq(i)).unwrap();
    }
    let received: Vec<u32> =
        (0..200).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
    assert_eq!(received, (0..200).collect::<Vec<_>>());

    client.stop();
    server.stop();
}

#[test]
fn ping_measures_round_trip() {
    let addr: SocketAddr = "127.0.0.1:54604".parse().unwrap();
    let server = Server::new(Config::default(), registry()).unwrap();
    server.bind(addr, None).unwrap();
    server.start().unwrap();

    let client = Client::new(Config::default(), registry()).unwrap();
    let conn = client.connect(addr, None, Duration::from_secs(5)).unwrap();
    client.start().unwrap();

    conn.ping().unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while conn.return_trip_time().is_none() {
        assert!(Instant::now() < deadline, "no ping reply");
        std::thread::sleep(Duration::from_millis(10));
    }

    client.stop();
    server.stop();
}
