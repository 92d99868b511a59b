//! One peer link: a framed reliable channel, an optional datagram binding,
//! identity, timers, and the listener sets events are dispatched through.

use std::{
    fmt,
    io::{self, Write},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use mio::Waker;
use tracing::{debug, trace};

use crate::{
    config::Config,
    error::{CloseReason, SendError},
    frame::WriteBuf,
    listener::{Listener, ListenerSet},
    msg::Ping,
    serialize::{Message, Object, Registry},
    timing::now_millis,
};

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// What [`Connection::mark_closed`] displaced. `disconnected` is dispatched
/// only for `WasConnected`, keeping the connected-before-disconnected
/// ordering contract for listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClosedTransition {
    AlreadyClosed,
    WasConnecting,
    WasConnected,
}

const RTT_UNKNOWN: u32 = u32::MAX;

pub(crate) struct WriteState {
    pub(crate) buf: WriteBuf,
    scratch: Vec<u8>,
}

pub(crate) struct DatagramPeer {
    pub(crate) socket: Arc<mio::net::UdpSocket>,
    pub(crate) peer: SocketAddr,
}

pub(crate) struct ConnectionInner {
    id: AtomicI32,
    state: AtomicU8,
    close_requested: AtomicBool,
    tcp: spin::Mutex<WriteState>,
    udp: spin::Mutex<Option<DatagramPeer>>,
    udp_acknowledged: AtomicBool,
    remote_addr: spin::Mutex<Option<SocketAddr>>,
    last_recv: AtomicU64,
    last_send: AtomicU64,
    idle_threshold: AtomicU32,
    timeout_ms: AtomicU64,
    keep_alive_ms: AtomicU64,
    ping_seq: AtomicU32,
    ping_sent: AtomicU64,
    rtt_ms: AtomicU32,
    listeners: ListenerSet,
    endpoint_listeners: Arc<ListenerSet>,
    registry: Arc<Registry>,
    waker: Option<Arc<Waker>>,
    object_limit: usize,
}

/// Handle to one connection. Cheap to clone; every clone refers to the same
/// underlying link. Send calls are safe from any thread; socket I/O itself is
/// performed by the endpoint's update loop.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        registry: Arc<Registry>,
        endpoint_listeners: Arc<ListenerSet>,
        waker: Option<Arc<Waker>>,
        config: &Config,
    ) -> Self {
        let now = now_millis();
        Self {
            inner: Arc::new(ConnectionInner {
                id: AtomicI32::new(0),
                state: AtomicU8::new(STATE_CONNECTING),
                close_requested: AtomicBool::new(false),
                tcp: spin::Mutex::new(WriteState {
                    buf: WriteBuf::new(config.write_buffer_size),
                    scratch: Vec::with_capacity(256),
                }),
                udp: spin::Mutex::new(None),
                udp_acknowledged: AtomicBool::new(false),
                remote_addr: spin::Mutex::new(None),
                last_recv: AtomicU64::new(now),
                last_send: AtomicU64::new(now),
                idle_threshold: AtomicU32::new(config.idle_threshold.to_bits()),
                timeout_ms: AtomicU64::new(config.timeout.as_millis() as u64),
                keep_alive_ms: AtomicU64::new(config.keep_alive.as_millis() as u64),
                ping_seq: AtomicU32::new(0),
                ping_sent: AtomicU64::new(0),
                rtt_ms: AtomicU32::new(RTT_UNKNOWN),
                listeners: ListenerSet::new(),
                endpoint_listeners,
                registry,
                waker,
                object_limit: config.object_buffer_size,
            }),
        }
    }

    /// Server-assigned id. Zero until the connection is registered.
    pub fn id(&self) -> i32 {
        self.inner.id.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_CONNECTED
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.inner.remote_addr.lock()
    }

    /// Whether a datagram peer is bound locally.
    pub fn has_datagram(&self) -> bool {
        self.inner.udp.lock().is_some()
    }

    /// Whether the server confirmed the datagram binding.
    pub fn datagram_ready(&self) -> bool {
        self.inner.udp_acknowledged.load(Ordering::Acquire)
    }

    /// Frames `message` and queues it on the reliable channel. Returns the
    /// framed byte count. The whole frame is committed or nothing is.
    pub fn send_tcp<M: Message>(&self, message: &M) -> Result<usize, SendError> {
        if self.inner.state.load(Ordering::Acquire) == STATE_CLOSED {
            return Err(SendError::Closed);
        }
        let queued = {
            let mut tcp = self.inner.tcp.lock();
            let WriteState { buf, scratch } = &mut *tcp;
            scratch.clear();
            self.inner.registry.encode(message, scratch)?;
            if scratch.len() > self.inner.object_limit {
                return Err(SendError::BufferOverflow {
                    needed: scratch.len(),
                    free: self.inner.object_limit,
                });
            }
            buf.push_frame(scratch)?
        };
        self.inner.last_send.store(now_millis(), Ordering::Release);
        self.wake();
        Ok(queued)
    }

    /// Sends `message` as one datagram to the bound peer. Never blocks;
    /// transient failures surface as [`SendError::DatagramUnsent`] and are
    /// not retried.
    pub fn send_udp<M: Message>(&self, message: &M) -> Result<usize, SendError> {
        if self.inner.state.load(Ordering::Acquire) == STATE_CLOSED {
            return Err(SendError::Closed);
        }
        let (socket, peer) = {
            let udp = self.inner.udp.lock();
            let Some(bound) = udp.as_ref() else {
                return Err(SendError::NoDatagram);
            };
            (bound.socket.clone(), bound.peer)
        };
        let mut payload = Vec::with_capacity(128);
        self.inner.registry.encode(message, &mut payload)?;
        if payload.len() > self.inner.object_limit {
            return Err(SendError::BufferOverflow {
                needed: payload.len(),
                free: self.inner.object_limit,
            });
        }
        let sent = socket.send_to(&payload, peer).map_err(SendError::DatagramUnsent)?;
        self.inner.last_send.store(now_millis(), Ordering::Release);
        Ok(sent)
    }

    /// Requests an orderly close. Idempotent; the `disconnected` callback
    /// fires exactly once, from the update loop.
    pub fn close(&self) {
        if self.inner.state.load(Ordering::Acquire) == STATE_CLOSED {
            return;
        }
        self.inner.close_requested.store(true, Ordering::Release);
        self.wake();
    }

    /// Write-buffer free ratio above which `idle` fires after a drain.
    pub fn set_idle_threshold(&self, threshold: f32) {
        self.inner
            .idle_threshold
            .store(threshold.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    /// Receive timeout; the connection is closed when nothing arrives for
    /// this long. Zero disables.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.timeout_ms.store(timeout.as_millis() as u64, Ordering::Release);
    }

    /// Keep-alive interval; an empty frame is sent when nothing was sent for
    /// this long. Zero disables.
    pub fn set_keep_alive(&self, keep_alive: Duration) {
        self.inner.keep_alive_ms.store(keep_alive.as_millis() as u64, Ordering::Release);
    }

    /// Appends a listener; takes effect on the next dispatch cycle.
    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Sends a round-trip-time probe; the peer echoes it back.
    pub fn ping(&self) -> Result<(), SendError> {
        let id = self.inner.ping_seq.fetch_add(1, Ordering::AcqRel);
        self.inner.ping_sent.store(now_millis(), Ordering::Release);
        self.send_tcp(&Ping { id, is_reply: false })?;
        Ok(())
    }

    /// Last measured round trip time, if a ping completed.
    pub fn return_trip_time(&self) -> Option<Duration> {
        match self.inner.rtt_ms.load(Ordering::Acquire) {
            RTT_UNKNOWN => None,
            ms => Some(Duration::from_millis(u64::from(ms))),
        }
    }

    fn wake(&self) {
        if let Some(waker) = &self.inner.waker
            && let Err(err) = waker.wake()
        {
            trace!(?err, "selector wakeup failed");
        }
    }

    // ---- update-loop internals -------------------------------------------

    pub(crate) fn set_remote_addr(&self, addr: SocketAddr) {
        *self.inner.remote_addr.lock() = Some(addr);
    }

    pub(crate) fn mark_connected(&self, id: i32) -> bool {
        self.inner.id.store(id, Ordering::Release);
        self.inner
            .state
            .compare_exchange(
                STATE_CONNECTING,
                STATE_CONNECTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Transitions to `Closed`. Only the first caller observes a transition.
    pub(crate) fn mark_closed(&self) -> ClosedTransition {
        let prev = self.inner.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev != STATE_CLOSED {
            self.inner.id.store(0, Ordering::Release);
        }
        match prev {
            STATE_CONNECTED => ClosedTransition::WasConnected,
            STATE_CONNECTING => ClosedTransition::WasConnecting,
            _ => ClosedTransition::AlreadyClosed,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.inner.close_requested.load(Ordering::Acquire)
    }

    pub(crate) fn bind_datagram(&self, socket: Arc<mio::net::UdpSocket>, peer: SocketAddr) -> bool {
        let mut udp = self.inner.udp.lock();
        if udp.is_some() {
            return false;
        }
        *udp = Some(DatagramPeer { socket, peer });
        true
    }

    pub(crate) fn datagram_peer(&self) -> Option<SocketAddr> {
        self.inner.udp.lock().as_ref().map(|b| b.peer)
    }

    pub(crate) fn acknowledge_datagram(&self) {
        self.inner.udp_acknowledged.store(true, Ordering::Release);
    }

    pub(crate) fn touch_recv(&self) {
        self.inner.last_recv.store(now_millis(), Ordering::Release);
    }

    pub(crate) fn note_ping_reply(&self, id: u32) {
        let sent = self.inner.ping_sent.load(Ordering::Acquire);
        let rtt = now_millis().saturating_sub(sent);
        self.inner.rtt_ms.store(rtt.min(u64::from(u32::MAX - 1)) as u32, Ordering::Release);
        trace!(connection = self.id(), ping = id, rtt_ms = rtt, "ping reply");
    }

    pub(crate) fn wants_write(&self) -> bool {
        !self.inner.tcp.lock().buf.is_empty()
    }

    /// Drains the write buffer into the socket. `Ok(true)` when fully
    /// drained, `Ok(false)` when the kernel pushed back.
    pub(crate) fn drain_write(&self, stream: &mut mio::net::TcpStream) -> Result<bool, CloseReason> {
        let mut tcp = self.inner.tcp.lock();
        while !tcp.buf.is_empty() {
            match stream.write(tcp.buf.pending()) {
                Ok(0) => return Err(CloseReason::Io),
                Ok(n) => tcp.buf.consume(n),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(connection = self.id(), ?err, "stream write failed");
                    return Err(CloseReason::Io);
                }
            }
        }
        Ok(true)
    }

    pub(crate) fn timed_out(&self, now: u64) -> bool {
        let timeout = self.inner.timeout_ms.load(Ordering::Acquire);
        timeout > 0
            && self.is_connected()
            && now.saturating_sub(self.inner.last_recv.load(Ordering::Acquire)) > timeout
    }

    pub(crate) fn needs_keep_alive(&self, now: u64) -> bool {
        let keep_alive = self.inner.keep_alive_ms.load(Ordering::Acquire);
        keep_alive > 0
            && self.is_connected()
            && now.saturating_sub(self.inner.last_send.load(Ordering::Acquire)) >= keep_alive
    }

    /// Queues an empty frame. Skipped silently when the buffer is full:
    /// a full buffer means traffic is pending anyway.
    pub(crate) fn queue_keep_alive(&self) {
        let pushed = self.inner.tcp.lock().buf.push_frame(&[]);
        match pushed {
            Ok(_) => self.inner.last_send.store(now_millis(), Ordering::Release),
            Err(err) => trace!(connection = self.id(), %err, "keep-alive skipped"),
        }
    }

    /// Millisecond deadline of the next timer this connection cares about.
    pub(crate) fn next_timer_deadline(&self) -> Option<u64> {
        if !self.is_connected() {
            return None;
        }
        let mut next = None;
        let keep_alive = self.inner.keep_alive_ms.load(Ordering::Acquire);
        if keep_alive > 0 {
            let at = self.inner.last_send.load(Ordering::Acquire) + keep_alive;
            next = Some(at);
        }
        let timeout = self.inner.timeout_ms.load(Ordering::Acquire);
        if timeout > 0 {
            let at = self.inner.last_recv.load(Ordering::Acquire) + timeout;
            next = Some(next.map_or(at, |n: u64| n.min(at)));
        }
        next
    }

    pub(crate) fn maybe_notify_idle(&self) {
        let threshold = f32::from_bits(self.inner.idle_threshold.load(Ordering::Acquire));
        let free = self.inner.tcp.lock().buf.free_ratio();
        if free > threshold {
            self.notify_idle();
        }
    }

    // ---- dispatch --------------------------------------------------------

    fn each_listener(&self, mut f: impl FnMut(&Arc<dyn Listener>)) {
        let endpoint = self.inner.endpoint_listeners.snapshot();
        let own = self.inner.listeners.snapshot();
        for listener in endpoint.iter().chain(own.iter()) {
            f(listener);
        }
    }

    pub(crate) fn notify_connected(&self) {
        self.each_listener(|l| l.connected(self));
    }

    pub(crate) fn notify_disconnected(&self) {
        self.each_listener(|l| l.disconnected(self));
    }

    pub(crate) fn notify_received(&self, object: &Object) {
        self.each_listener(|l| l.received(self, object));
    }

    pub(crate) fn notify_idle(&self) {
        self.each_listener(|l| l.idle(self));
    }

    #[cfg(test)]
    pub(crate) fn unregistered_for_tests() -> Self {
        Self::new(
            Arc::new(Registry::new()),
            Arc::new(ListenerSet::new()),
            None,
            &Config::default(),
        )
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        trace!(id = self.id.load(Ordering::Relaxed), "connection dropped");
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("connected", &self.is_connected())
            .finish()
    }
}
