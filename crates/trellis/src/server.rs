//! Server endpoint: accepts connections, multiplexes all sockets on one
//! selector and dispatches listener events from the update loop.

use std::{
    collections::HashMap,
    io,
    net::{Shutdown, SocketAddr},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, Waker, net::TcpListener, net::UdpSocket};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::Config,
    connection::{ClosedTransition, Connection},
    endpoint::Shared,
    error::{CloseReason, SendError},
    frame::ReadBuf,
    listener::Listener,
    msg::{Ping, RegisterTcp, RegisterUdp},
    pump::{self, Chan},
    serialize::{Message, Object, Registry},
    sockopt::set_socket_buf_size,
    timing::now_millis,
};

const ACCEPT: Token = Token(0);
const DATAGRAM: Token = Token(1);
const WAKER: Token = Token(2);
const FIRST_STREAM: usize = 3;

const WORKER_WAIT: Duration = Duration::from_millis(250);

/// Listens for connections and serves any number of them over one selector.
///
/// Clone-free sharing happens through the handle itself: `Server` is cheap to
/// clone and every clone drives the same endpoint. Drive I/O by calling
/// [`update`](Server::update) in a loop, or hand that loop to a dedicated
/// thread with [`start`](Server::start).
///
/// Listener callbacks run on the update thread; do not call `update`, `bind`
/// or blocking RMI from inside a callback.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    core: Mutex<ServerCore>,
    shared: Shared,
}

struct ServerCore {
    events: Events,
    net: ServerNet,
}

struct ServerNet {
    poll: Poll,
    listener: Option<TcpListener>,
    udp: Option<Arc<UdpSocket>>,
    udp_buf: Box<[u8]>,
    chans: HashMap<Token, Chan>,
    peers: HashMap<SocketAddr, Token>,
    by_id: HashMap<i32, Token>,
    next_token: usize,
    next_id: i32,
}

impl Server {
    pub fn new(config: Config, registry: Registry) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let udp_buf = vec![0; config.object_buffer_size + 8].into_boxed_slice();
        let shared = Shared::new(Arc::new(registry), config, waker);
        Ok(Self {
            inner: Arc::new(ServerInner {
                core: Mutex::new(ServerCore {
                    events: Events::with_capacity(256),
                    net: ServerNet {
                        poll,
                        listener: None,
                        udp: None,
                        udp_buf,
                        chans: HashMap::new(),
                        peers: HashMap::new(),
                        by_id: HashMap::new(),
                        next_token: FIRST_STREAM,
                        next_id: 1,
                    },
                }),
                shared,
            }),
        })
    }

    /// Binds the listening socket and, optionally, the datagram socket that
    /// also answers discovery probes.
    pub fn bind(&self, tcp: SocketAddr, udp: Option<SocketAddr>) -> io::Result<()> {
        // a running worker may be parked in the selector; don't wait it out
        let _ = self.inner.shared.waker.wake();
        let mut core = self.inner.lock_core();
        let net = &mut core.net;
        let mut listener = TcpListener::bind(tcp)?;
        net.poll.registry().register(&mut listener, ACCEPT, Interest::READABLE)?;
        net.listener = Some(listener);
        if let Some(addr) = udp {
            let mut socket = UdpSocket::bind(addr)?;
            net.poll.registry().register(&mut socket, DATAGRAM, Interest::READABLE)?;
            net.udp = Some(Arc::new(socket));
        }
        info!(%tcp, ?udp, "server bound");
        Ok(())
    }

    /// Runs one selector iteration: accept, read, write, then timer checks.
    /// Blocks up to `wait`, less when a timer comes due sooner.
    pub fn update(&self, wait: Duration) -> io::Result<()> {
        self.inner.update(wait)
    }

    /// Spawns a worker looping [`update`](Server::update) until
    /// [`stop`](Server::stop). No-op when already running.
    pub fn start(&self) -> io::Result<()> {
        if self.inner.shared.worker_running() {
            return Ok(());
        }
        let inner = self.inner.clone();
        let handle = thread::Builder::new().name("trellis-server".into()).spawn(move || {
            while !inner.shared.should_stop() {
                if let Err(err) = inner.update(WORKER_WAIT) {
                    error!(?err, "server update failed");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        })?;
        if !self.inner.shared.set_worker(handle) {
            warn!("server already started");
        }
        Ok(())
    }

    /// Stops the worker, closes every connection and releases the sockets.
    pub fn stop(&self) {
        self.inner.shared.stop_worker();
        let mut core = self.inner.lock_core();
        let tokens: Vec<Token> = core.net.chans.keys().copied().collect();
        for token in tokens {
            core.net.close_stream(token, CloseReason::Requested, &self.inner.shared);
        }
        if let Some(mut listener) = core.net.listener.take() {
            let _ = core.net.poll.registry().deregister(&mut listener);
        }
        core.net.udp = None;
        core.net.peers.clear();
        info!("server stopped");
    }

    /// Endpoint-level listener: sees events for every connection, before the
    /// connection's own listeners.
    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.inner.shared.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) -> bool {
        self.inner.shared.listeners.remove(listener)
    }

    /// Opaque payload returned to discovery probes. Default: empty.
    pub fn set_discovery_response(&self, payload: Vec<u8>) {
        *self.inner.shared.discovery_response.lock() = payload;
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.shared.connections_snapshot()
    }

    pub fn send_to_all_tcp<M: Message>(&self, message: &M) {
        for connection in self.inner.shared.connections_snapshot() {
            if let Err(err) = connection.send_tcp(message) {
                debug!(connection = connection.id(), %err, "broadcast send dropped");
            }
        }
    }

    pub fn send_to_all_except_tcp<M: Message>(&self, excluded: i32, message: &M) {
        for connection in self.inner.shared.connections_snapshot() {
            if connection.id() == excluded {
                continue;
            }
            if let Err(err) = connection.send_tcp(message) {
                debug!(connection = connection.id(), %err, "broadcast send dropped");
            }
        }
    }

    pub fn send_to_tcp<M: Message>(&self, id: i32, message: &M) -> Result<usize, SendError> {
        let connection = self.inner.shared.find_connection(id).ok_or(SendError::Closed)?;
        connection.send_tcp(message)
    }

    pub fn send_to_all_udp<M: Message>(&self, message: &M) {
        for connection in self.inner.shared.connections_snapshot() {
            if let Err(err) = connection.send_udp(message) {
                debug!(connection = connection.id(), %err, "datagram broadcast dropped");
            }
        }
    }

    pub fn send_to_udp<M: Message>(&self, id: i32, message: &M) -> Result<usize, SendError> {
        let connection = self.inner.shared.find_connection(id).ok_or(SendError::Closed)?;
        connection.send_udp(message)
    }
}

impl ServerInner {
    fn lock_core(&self) -> MutexGuard<'_, ServerCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, wait: Duration) -> io::Result<()> {
        let mut core = self.lock_core();
        let ServerCore { events, net } = &mut *core;
        let timeout = next_wait(wait, net.chans.values());
        if let Err(err) = net.poll.poll(events, Some(timeout)) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for event in events.iter() {
            match event.token() {
                ACCEPT => net.accept(&self.shared),
                DATAGRAM => net.service_datagrams(&self.shared),
                WAKER => {}
                token => net.service_stream(token, event, &self.shared),
            }
        }
        net.after_poll(&self.shared);
        Ok(())
    }
}

impl ServerNet {
    fn accept(&mut self, shared: &Shared) {
        loop {
            let Some(listener) = &self.listener else { return };
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        trace!(?err, "nodelay not set");
                    }
                    if let Some(size) = shared.config.socket_buf_size {
                        set_socket_buf_size(&stream, size);
                    }
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(err) =
                        self.poll.registry().register(&mut stream, token, Interest::READABLE)
                    {
                        error!(?err, ?addr, "failed to register accepted stream");
                        let _ = stream.shutdown(Shutdown::Both);
                        continue;
                    }
                    let id = self.next_id;
                    self.next_id += 1;
                    let conn = Connection::new(
                        shared.registry.clone(),
                        shared.listeners.clone(),
                        Some(shared.waker.clone()),
                        &shared.config,
                    );
                    conn.set_remote_addr(addr);
                    if let Err(err) = conn.send_tcp(&RegisterTcp { connection_id: id }) {
                        warn!(id, %err, "registration frame not queued");
                    }
                    conn.mark_connected(id);
                    info!(id, ?addr, "connection accepted");
                    shared.add_connection(&conn);
                    self.by_id.insert(id, token);
                    self.chans.insert(
                        token,
                        Chan {
                            stream,
                            read: ReadBuf::new(shared.config.object_buffer_size),
                            conn: conn.clone(),
                            armed: false,
                        },
                    );
                    conn.notify_connected();
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(?err, "accept failed");
                    return;
                }
            }
        }
    }

    fn service_stream(&mut self, token: Token, event: &mio::event::Event, shared: &Shared) {
        let ServerNet { chans, poll, .. } = self;
        let Some(chan) = chans.get_mut(&token) else {
            trace!(?token, "event for unknown token");
            return;
        };
        let mut result = Ok(());
        if event.is_readable() {
            result = pump::service_read(chan, &shared.registry, &mut handle_server_object);
        }
        if result.is_ok() && event.is_writable() {
            result = pump::service_write(chan, poll.registry(), token);
        }
        if let Err(reason) = result {
            self.close_stream(token, reason, shared);
        }
    }

    fn service_datagrams(&mut self, shared: &Shared) {
        let Some(udp) = self.udp.clone() else { return };
        let mut buf = std::mem::take(&mut self.udp_buf);
        loop {
            match udp.recv_from(&mut buf) {
                Ok((n, from)) => self.handle_datagram(&udp, &buf[..n], from, shared),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(?err, "datagram recv failed");
                    break;
                }
            }
        }
        self.udp_buf = buf;
    }

    fn handle_datagram(
        &mut self,
        udp: &Arc<UdpSocket>,
        data: &[u8],
        from: SocketAddr,
        shared: &Shared,
    ) {
        if let Some(&token) = self.peers.get(&from) {
            let Some(chan) = self.chans.get(&token) else {
                self.peers.remove(&from);
                return;
            };
            match shared.registry.decode(data) {
                Ok(object) => {
                    chan.conn.touch_recv();
                    if object.downcast_ref::<RegisterUdp>().is_some() {
                        trace!(connection = chan.conn.id(), "duplicate datagram registration");
                    } else {
                        chan.conn.notify_received(&object);
                    }
                }
                Err(err) => {
                    warn!(connection = chan.conn.id(), %err, "dropping undecodable datagram");
                }
            }
            return;
        }

        // unbound source: a discovery probe or a datagram registration
        if !data.is_empty() && data[0] == shared.config.discovery_magic {
            let response = shared.discovery_response.lock().clone();
            match udp.send_to(&response, from) {
                Ok(_) => debug!(?from, "discovery probe answered"),
                Err(err) => trace!(?err, ?from, "discovery reply dropped"),
            }
            return;
        }
        match shared.registry.decode(data) {
            Ok(object) => {
                if let Some(reg) = object.downcast_ref::<RegisterUdp>() {
                    self.bind_datagram_peer(udp, reg.connection_id, from);
                } else {
                    trace!(?from, "datagram from unbound source dropped");
                }
            }
            Err(_) => trace!(?from, "unintelligible datagram from unbound source dropped"),
        }
    }

    fn bind_datagram_peer(&mut self, udp: &Arc<UdpSocket>, id: i32, from: SocketAddr) {
        let Some(&token) = self.by_id.get(&id) else {
            trace!(id, ?from, "datagram registration for unknown id");
            return;
        };
        let Some(chan) = self.chans.get(&token) else { return };
        if chan.conn.bind_datagram(udp.clone(), from) {
            self.peers.insert(from, token);
            chan.conn.acknowledge_datagram();
            if let Err(err) = chan.conn.send_tcp(&RegisterUdp { connection_id: id }) {
                trace!(id, %err, "datagram ack not queued");
            }
            debug!(id, ?from, "datagram channel bound");
        } else if chan.conn.datagram_peer() != Some(from) {
            // never rebind an id to a new source
            debug!(id, ?from, "datagram rebind attempt dropped");
        }
    }

    fn after_poll(&mut self, shared: &Shared) {
        let now = now_millis();
        let mut pending_close = Vec::new();
        {
            let ServerNet { chans, poll, .. } = self;
            let registry = poll.registry();
            for (&token, chan) in chans.iter_mut() {
                if chan.conn.close_requested() {
                    pending_close.push((token, CloseReason::Requested));
                    continue;
                }
                if chan.conn.timed_out(now) {
                    pending_close.push((token, CloseReason::Timeout));
                    continue;
                }
                if chan.conn.needs_keep_alive(now) {
                    chan.conn.queue_keep_alive();
                }
                if let Err(reason) = pump::arm_if_needed(chan, registry, token) {
                    pending_close.push((token, reason));
                }
            }
        }
        for (token, reason) in pending_close {
            self.close_stream(token, reason, shared);
        }
    }

    fn close_stream(&mut self, token: Token, reason: CloseReason, shared: &Shared) {
        let Some(mut chan) = self.chans.remove(&token) else { return };
        if reason == CloseReason::Requested {
            // flush what we can, then half-close before dropping the socket
            let _ = chan.conn.drain_write(&mut chan.stream);
            let _ = chan.stream.shutdown(Shutdown::Write);
        }
        let _ = self.poll.registry().deregister(&mut chan.stream);
        let _ = chan.stream.shutdown(Shutdown::Both);
        let id = chan.conn.id();
        self.by_id.remove(&id);
        if let Some(peer) = chan.conn.datagram_peer() {
            self.peers.remove(&peer);
        }
        shared.remove_connection(&chan.conn);
        if chan.conn.mark_closed() == ClosedTransition::WasConnected {
            info!(id, ?reason, "disconnected");
            chan.conn.notify_disconnected();
        }
    }
}

fn handle_server_object(conn: &Connection, object: Object) -> Result<(), CloseReason> {
    if let Some(ping) = object.downcast_ref::<Ping>() {
        pump::handle_ping(conn, ping);
        return Ok(());
    }
    if object.downcast_ref::<RegisterTcp>().is_some()
        || object.downcast_ref::<RegisterUdp>().is_some()
    {
        trace!(connection = conn.id(), "stray registration frame ignored");
        return Ok(());
    }
    conn.notify_received(&object);
    Ok(())
}

fn next_wait<'a>(wait: Duration, chans: impl Iterator<Item = &'a Chan>) -> Duration {
    let now = now_millis();
    let mut wait_ms = wait.as_millis() as u64;
    for chan in chans {
        if let Some(at) = chan.conn.next_timer_deadline() {
            wait_ms = wait_ms.min(at.saturating_sub(now));
        }
    }
    Duration::from_millis(wait_ms)
}
