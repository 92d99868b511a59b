//! Client endpoint: owns one connection to a server plus the update loop
//! driving it.

use std::{
    io,
    net::{Ipv4Addr, Shutdown, SocketAddr},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, Waker, net::TcpStream, net::UdpSocket};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::Config,
    connection::{ClosedTransition, Connection},
    endpoint::Shared,
    error::{CloseReason, ConnectError, SendError},
    frame::ReadBuf,
    listener::Listener,
    msg::{Ping, RegisterTcp, RegisterUdp},
    pump::{self, Chan},
    serialize::{Message, Object, Registry},
    sockopt::set_socket_buf_size,
    timing::now_millis,
};

const STREAM: Token = Token(0);
const DATAGRAM: Token = Token(1);
const WAKER: Token = Token(2);

const WORKER_WAIT: Duration = Duration::from_millis(250);
const CONNECT_SLICE: Duration = Duration::from_millis(50);

/// Connects to a [`Server`](crate::Server) and drives the resulting
/// connection. Cheap to clone; all clones drive the same endpoint.
///
/// [`connect`](Client::connect) may be called before or after
/// [`start`](Client::start); it drives the selector itself while waiting for
/// the registration handshake.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    core: Mutex<ClientCore>,
    shared: Shared,
}

struct ClientCore {
    events: Events,
    net: ClientNet,
}

struct ClientNet {
    poll: Poll,
    chan: Option<Chan>,
    udp: Option<Arc<UdpSocket>>,
    udp_buf: Box<[u8]>,
}

impl Client {
    pub fn new(config: Config, registry: Registry) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let udp_buf = vec![0; config.object_buffer_size + 8].into_boxed_slice();
        let shared = Shared::new(Arc::new(registry), config, waker);
        Ok(Self {
            inner: Arc::new(ClientInner {
                core: Mutex::new(ClientCore {
                    events: Events::with_capacity(64),
                    net: ClientNet { poll, chan: None, udp: None, udp_buf },
                }),
                shared,
            }),
        })
    }

    /// Opens a connection and blocks until the server's registration frame
    /// arrives or `timeout` elapses. With `udp_port` set, a datagram socket
    /// is bound and registered with the server during the handshake; only
    /// the reliable registration gates success.
    pub fn connect(
        &self,
        server: SocketAddr,
        udp_port: Option<u16>,
        timeout: Duration,
    ) -> Result<Connection, ConnectError> {
        let conn = {
            // a running worker may be parked in the selector; don't wait it out
            let _ = self.inner.shared.waker.wake();
            let mut core = self.inner.lock_core();
            let net = &mut core.net;
            net.teardown(CloseReason::Requested, &self.inner.shared);
            let mut stream = TcpStream::connect(server)?;
            let _ = stream.set_nodelay(true);
            if let Some(size) = self.inner.shared.config.socket_buf_size {
                set_socket_buf_size(&stream, size);
            }
            net.poll.registry().register(&mut stream, STREAM, Interest::READABLE)?;
            let conn = Connection::new(
                self.inner.shared.registry.clone(),
                self.inner.shared.listeners.clone(),
                Some(self.inner.shared.waker.clone()),
                &self.inner.shared.config,
            );
            conn.set_remote_addr(server);
            if let Some(port) = udp_port {
                let mut socket =
                    UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
                net.poll.registry().register(&mut socket, DATAGRAM, Interest::READABLE)?;
                let socket = Arc::new(socket);
                conn.bind_datagram(socket.clone(), SocketAddr::new(server.ip(), port));
                net.udp = Some(socket);
            }
            net.chan = Some(Chan {
                stream,
                read: ReadBuf::new(self.inner.shared.config.object_buffer_size),
                conn: conn.clone(),
                armed: false,
            });
            self.inner.shared.add_connection(&conn);
            conn
        };

        let deadline = Instant::now() + timeout;
        while !conn.is_connected() {
            if conn.is_closed() {
                return Err(ConnectError::Io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection closed during handshake",
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                self.abort_pending(&conn);
                return Err(ConnectError::Timeout);
            }
            self.inner.update((deadline - now).min(CONNECT_SLICE))?;
        }
        Ok(conn)
    }

    /// Runs one selector iteration; see [`Server::update`](crate::Server::update).
    pub fn update(&self, wait: Duration) -> io::Result<()> {
        self.inner.update(wait)
    }

    pub fn start(&self) -> io::Result<()> {
        if self.inner.shared.worker_running() {
            return Ok(());
        }
        let inner = self.inner.clone();
        let handle = thread::Builder::new().name("trellis-client".into()).spawn(move || {
            while !inner.shared.should_stop() {
                if let Err(err) = inner.update(WORKER_WAIT) {
                    error!(?err, "client update failed");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        })?;
        if !self.inner.shared.set_worker(handle) {
            warn!("client already started");
        }
        Ok(())
    }

    /// Stops the worker and closes the connection.
    pub fn stop(&self) {
        self.inner.shared.stop_worker();
        let mut core = self.inner.lock_core();
        core.net.teardown(CloseReason::Requested, &self.inner.shared);
        info!("client stopped");
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.shared.connections_snapshot().into_iter().next()
    }

    pub fn send_tcp<M: Message>(&self, message: &M) -> Result<usize, SendError> {
        self.connection().ok_or(SendError::Closed)?.send_tcp(message)
    }

    pub fn send_udp<M: Message>(&self, message: &M) -> Result<usize, SendError> {
        self.connection().ok_or(SendError::Closed)?.send_udp(message)
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.inner.shared.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) -> bool {
        self.inner.shared.listeners.remove(listener)
    }

    /// Discards a connection whose handshake never completed.
    fn abort_pending(&self, conn: &Connection) {
        let mut core = self.inner.lock_core();
        if core.net.chan.as_ref().is_some_and(|c| c.conn == *conn) {
            core.net.teardown(CloseReason::Timeout, &self.inner.shared);
        }
    }
}

impl ClientInner {
    fn lock_core(&self) -> MutexGuard<'_, ClientCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, wait: Duration) -> io::Result<()> {
        let mut core = self.lock_core();
        let ClientCore { events, net } = &mut *core;
        let timeout = net
            .chan
            .as_ref()
            .and_then(|c| c.conn.next_timer_deadline())
            .map_or(wait, |at| {
                wait.min(Duration::from_millis(at.saturating_sub(now_millis())))
            });
        if let Err(err) = net.poll.poll(events, Some(timeout)) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for event in events.iter() {
            match event.token() {
                STREAM => net.service_stream(event, &self.shared),
                DATAGRAM => net.service_datagrams(&self.shared),
                WAKER => {}
                token => trace!(?token, "event for unknown token"),
            }
        }
        net.after_poll(&self.shared);
        Ok(())
    }
}

impl ClientNet {
    fn service_stream(&mut self, event: &mio::event::Event, shared: &Shared) {
        let ClientNet { chan, poll, .. } = self;
        let Some(chan) = chan.as_mut() else { return };
        let mut result = Ok(());
        if event.is_readable() {
            result = pump::service_read(chan, &shared.registry, &mut handle_client_object);
        }
        if result.is_ok() && event.is_writable() {
            result = pump::service_write(chan, poll.registry(), STREAM);
        }
        if let Err(reason) = result {
            self.teardown(reason, shared);
        }
    }

    fn service_datagrams(&mut self, shared: &Shared) {
        let Some(udp) = self.udp.clone() else { return };
        let Some(conn) = self.chan.as_ref().map(|c| c.conn.clone()) else { return };
        loop {
            match udp.recv_from(&mut self.udp_buf) {
                Ok((n, _from)) => {
                    match shared.registry.decode(&self.udp_buf[..n]) {
                        Ok(object) => {
                            conn.touch_recv();
                            if object.downcast_ref::<RegisterUdp>().is_none() {
                                conn.notify_received(&object);
                            }
                        }
                        Err(err) => {
                            warn!(connection = conn.id(), %err, "dropping undecodable datagram");
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(?err, "datagram recv failed");
                    return;
                }
            }
        }
    }

    fn after_poll(&mut self, shared: &Shared) {
        let now = now_millis();
        let mut reason = None;
        {
            let ClientNet { chan, poll, .. } = self;
            let Some(chan) = chan.as_mut() else { return };
            if chan.conn.close_requested() {
                reason = Some(CloseReason::Requested);
            } else if chan.conn.timed_out(now) {
                reason = Some(CloseReason::Timeout);
            } else {
                if chan.conn.needs_keep_alive(now) {
                    chan.conn.queue_keep_alive();
                }
                if let Err(err) = pump::arm_if_needed(chan, poll.registry(), STREAM) {
                    reason = Some(err);
                }
            }
        }
        if let Some(reason) = reason {
            self.teardown(reason, shared);
        }
    }

    fn teardown(&mut self, reason: CloseReason, shared: &Shared) {
        let Some(mut chan) = self.chan.take() else { return };
        if reason == CloseReason::Requested {
            let _ = chan.conn.drain_write(&mut chan.stream);
            let _ = chan.stream.shutdown(Shutdown::Write);
        }
        let _ = self.poll.registry().deregister(&mut chan.stream);
        let _ = chan.stream.shutdown(Shutdown::Both);
        self.udp = None;
        let id = chan.conn.id();
        shared.remove_connection(&chan.conn);
        match chan.conn.mark_closed() {
            ClosedTransition::WasConnected => {
                info!(id, ?reason, "disconnected");
                chan.conn.notify_disconnected();
            }
            ClosedTransition::WasConnecting => {
                debug!(?reason, "connection attempt abandoned");
            }
            ClosedTransition::AlreadyClosed => {}
        }
    }
}

fn handle_client_object(conn: &Connection, object: Object) -> Result<(), CloseReason> {
    if !conn.is_connected() {
        let Some(reg) = object.downcast_ref::<RegisterTcp>() else {
            warn!("frame received before registration");
            return Err(CloseReason::Protocol);
        };
        conn.mark_connected(reg.connection_id);
        info!(id = reg.connection_id, "connected");
        if conn.has_datagram()
            && let Err(err) = conn.send_udp(&RegisterUdp { connection_id: reg.connection_id })
        {
            warn!(%err, "datagram registration not sent");
        }
        conn.notify_connected();
        return Ok(());
    }
    if let Some(ping) = object.downcast_ref::<Ping>() {
        pump::handle_ping(conn, ping);
        return Ok(());
    }
    if object.downcast_ref::<RegisterUdp>().is_some() {
        conn.acknowledge_datagram();
        debug!(connection = conn.id(), "datagram channel acknowledged");
        return Ok(());
    }
    if object.downcast_ref::<RegisterTcp>().is_some() {
        trace!(connection = conn.id(), "duplicate registration frame ignored");
        return Ok(());
    }
    conn.notify_received(&object);
    Ok(())
}
