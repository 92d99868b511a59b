//! Keep-alive and receive-timeout behavior, observed on the wire through a
//! bare socket standing in for the peer.

use std::{
    io::{Read, Write},
    net::TcpListener,
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use trellis::{Client, Config, Connection, Listener, Registry, msg::RegisterTcp};

fn varint(mut value: u32) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// The registration frame a real server would send on accept.
fn register_frame(id: i32) -> Vec<u8> {
    let registry = Registry::new();
    let mut payload = Vec::new();
    registry.encode(&RegisterTcp { connection_id: id }, &mut payload).unwrap();
    let mut frame = varint(payload.len() as u32);
    frame.extend_from_slice(&payload);
    frame
}

#[test]
fn keep_alives_flow_while_idle() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(&register_frame(1)).unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let started = Instant::now();
        let mut bytes = Vec::new();
        while started.elapsed() < Duration::from_millis(1500) {
            let mut chunk = [0u8; 256];
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => bytes.extend_from_slice(&chunk[..n]),
                Err(ref err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => break,
            }
            // keep the client's receive timeout refreshed
            let _ = stream.write_all(&[0]);
        }
        bytes
    });

    let client = Client::new(
        Config::default()
            .with_keep_alive(Duration::from_millis(200))
            .with_timeout(Duration::from_millis(1000)),
        Registry::new(),
    )
    .unwrap();
    let conn = client.connect(addr, None, Duration::from_secs(5)).unwrap();
    client.start().unwrap();

    thread::sleep(Duration::from_millis(1500));
    assert!(conn.is_connected(), "idle connection must stay open");

    let bytes = peer.join().unwrap();
    // after the handshake the idle client emits nothing but empty frames
    assert!(bytes.iter().all(|b| *b == 0), "unexpected traffic: {bytes:?}");
    assert!(bytes.len() >= 4, "saw only {} keep-alives", bytes.len());

    client.stop();
}

struct DropWatch {
    tx: mpsc::Sender<()>,
}

impl Listener for DropWatch {
    fn disconnected(&self, _connection: &Connection) {
        let _ = self.tx.send(());
    }
}

#[test]
fn silent_peer_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(&register_frame(1)).unwrap();
        // hold the socket open, send nothing
        thread::sleep(Duration::from_millis(2000));
    });

    let client = Client::new(
        Config::default()
            .with_timeout(Duration::from_millis(300))
            .with_keep_alive(Duration::from_secs(10)),
        Registry::new(),
    )
    .unwrap();
    let (tx, rx) = mpsc::channel();
    client.add_listener(Arc::new(DropWatch { tx }));
    let conn = client.connect(addr, None, Duration::from_secs(5)).unwrap();
    client.start().unwrap();

    rx.recv_timeout(Duration::from_secs(3)).expect("receive timeout never fired");
    assert!(!conn.is_connected());

    client.stop();
    peer.join().unwrap();
}
