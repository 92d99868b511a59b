//! Listener fabric.
//!
//! [`Listener`] is the application-facing callback surface. The wrappers in
//! this module change *where* callbacks run, by composition: a
//! [`QueuedListener`] turns each callback into a closure and hands it to an
//! [`EventSink`]; the sink decides on a worker pool ([`ThreadedListener`]) or
//! a delayed delivery queue ([`LagListener`]).
//!
//! Whatever the wrapping, per connection `connected` strictly precedes any
//! `received`, which strictly precedes `disconnected`.

use std::{
    any::{Any, TypeId},
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::debug;

use crate::{connection::Connection, serialize::Object};

/// Connection event callbacks. All default to no-ops; implement the ones you
/// care about. Callbacks run on the endpoint's update thread unless wrapped.
pub trait Listener: Send + Sync + 'static {
    fn connected(&self, _connection: &Connection) {}
    fn disconnected(&self, _connection: &Connection) {}
    fn received(&self, _connection: &Connection, _object: &Object) {}
    fn idle(&self, _connection: &Connection) {}
}

/// Ordered listener collection with copy-on-write snapshots: mutation builds
/// a fresh list, dispatch iterates the snapshot taken at its start.
pub(crate) struct ListenerSet {
    inner: spin::Mutex<Arc<Vec<Arc<dyn Listener>>>>,
}

impl ListenerSet {
    pub(crate) fn new() -> Self {
        Self { inner: spin::Mutex::new(Arc::new(Vec::new())) }
    }

    pub(crate) fn add(&self, listener: Arc<dyn Listener>) {
        let mut guard = self.inner.lock();
        let mut next = (**guard).clone();
        next.push(listener);
        *guard = Arc::new(next);
    }

    /// Removes by identity. Returns whether anything was removed.
    pub(crate) fn remove(&self, listener: &Arc<dyn Listener>) -> bool {
        let mut guard = self.inner.lock();
        let before = guard.len();
        let next: Vec<_> =
            guard.iter().filter(|l| !Arc::ptr_eq(l, listener)).cloned().collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<dyn Listener>>> {
        self.inner.lock().clone()
    }
}

type Handler = Arc<dyn Fn(&Connection, &Object) + Send + Sync>;

/// Routes `received` objects to one handler per concrete message type.
/// Objects of unhandled types are dropped silently.
pub struct TypeListener {
    handlers: spin::Mutex<HashMap<TypeId, Handler>>,
}

impl TypeListener {
    pub fn new() -> Self {
        Self { handlers: spin::Mutex::new(HashMap::new()) }
    }

    /// Installs the handler for `M`, replacing any previous one.
    pub fn on<M, F>(&self, handler: F)
    where
        M: Any + Send + Sync,
        F: Fn(&Connection, &M) + Send + Sync + 'static,
    {
        let wrapped: Handler = Arc::new(move |connection, object| {
            if let Some(message) = object.downcast_ref::<M>() {
                handler(connection, message);
            }
        });
        self.handlers.lock().insert(TypeId::of::<M>(), wrapped);
    }

    pub fn remove<M: Any>(&self) -> bool {
        self.handlers.lock().remove(&TypeId::of::<M>()).is_some()
    }

    /// Number of distinct message types with a handler.
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    pub fn clear(&self) {
        self.handlers.lock().clear();
    }
}

impl Default for TypeListener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener for TypeListener {
    fn received(&self, connection: &Connection, object: &Object) {
        let key = (**object).type_id();
        let handler = self.handlers.lock().get(&key).cloned();
        if let Some(handler) = handler {
            handler(connection, object);
        }
    }
}

type Event = Box<dyn FnOnce() + Send>;

/// Destination for deferred listener callbacks. Implementations must deliver
/// events from one producer in enqueue order if they promise ordering at all.
pub trait EventSink: Send + Sync + 'static {
    fn enqueue(&self, event: Event);
}

/// Wraps a delegate listener so every callback is packaged as a closure and
/// queued on the sink instead of running inline.
pub struct QueuedListener<S: EventSink> {
    delegate: Arc<dyn Listener>,
    sink: S,
}

impl<S: EventSink> QueuedListener<S> {
    pub fn new(delegate: Arc<dyn Listener>, sink: S) -> Self {
        Self { delegate, sink }
    }
}

impl<S: EventSink> Listener for QueuedListener<S> {
    fn connected(&self, connection: &Connection) {
        let delegate = self.delegate.clone();
        let connection = connection.clone();
        self.sink.enqueue(Box::new(move || delegate.connected(&connection)));
    }

    fn disconnected(&self, connection: &Connection) {
        let delegate = self.delegate.clone();
        let connection = connection.clone();
        self.sink.enqueue(Box::new(move || delegate.disconnected(&connection)));
    }

    fn received(&self, connection: &Connection, object: &Object) {
        let delegate = self.delegate.clone();
        let connection = connection.clone();
        let object = object.clone();
        self.sink.enqueue(Box::new(move || delegate.received(&connection, &object)));
    }

    fn idle(&self, connection: &Connection) {
        let delegate = self.delegate.clone();
        let connection = connection.clone();
        self.sink.enqueue(Box::new(move || delegate.idle(&connection)));
    }
}

/// Runs queued events on dedicated worker threads. Events are spread
/// round-robin; only a single worker preserves per-connection order.
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Event>>,
    next: AtomicUsize,
    workers: spin::Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let mut senders = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let (tx, rx) = mpsc::channel::<Event>();
            senders.push(tx);
            let handle = thread::Builder::new()
                .name(format!("trellis-listener-{i}"))
                .spawn(move || {
                    while let Ok(event) = rx.recv() {
                        event();
                    }
                })
                .expect("failed to spawn listener worker");
            workers.push(handle);
        }
        Self { senders, next: AtomicUsize::new(0), workers: spin::Mutex::new(workers) }
    }
}

impl EventSink for WorkerPool {
    fn enqueue(&self, event: Event) {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        if self.senders[i].send(event).is_err() {
            debug!("listener worker gone, dropping event");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.senders.clear();
        let current = thread::current().id();
        for handle in self.workers.lock().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

/// Dispatches callbacks on a worker pool instead of the update thread.
pub type ThreadedListener = QueuedListener<WorkerPool>;

impl ThreadedListener {
    /// Single worker: per-connection ordering preserved.
    pub fn threaded(delegate: Arc<dyn Listener>) -> Self {
        Self::new(delegate, WorkerPool::new(1))
    }

    /// `workers > 1` trades ordering for parallelism.
    pub fn threaded_with(delegate: Arc<dyn Listener>, workers: usize) -> Self {
        Self::new(delegate, WorkerPool::new(workers))
    }
}

struct DelayState {
    queue: VecDeque<(Instant, Event)>,
    last_due: Instant,
    stopped: bool,
}

struct DelayShared {
    state: Mutex<DelayState>,
    wakeup: Condvar,
}

/// Delivers each event after a uniform random delay in `[min, max]`.
///
/// Delivery stays FIFO: an event is never scheduled before the one enqueued
/// ahead of it, even when the random draws would reorder them.
pub struct DelaySink {
    min: Duration,
    max: Duration,
    shared: Arc<DelayShared>,
    worker: spin::Mutex<Option<thread::JoinHandle<()>>>,
}

impl DelaySink {
    pub fn new(min: Duration, max: Duration) -> Self {
        let shared = Arc::new(DelayShared {
            state: Mutex::new(DelayState {
                queue: VecDeque::new(),
                last_due: Instant::now(),
                stopped: false,
            }),
            wakeup: Condvar::new(),
        });
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("trellis-lag".into())
                .spawn(move || Self::run(&shared))
                .expect("failed to spawn lag worker")
        };
        Self { min: min.min(max), max, shared, worker: spin::Mutex::new(Some(worker)) }
    }

    fn run(shared: &DelayShared) {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if state.queue.is_empty() {
                if state.stopped {
                    return;
                }
                state = shared.wakeup.wait(state).unwrap_or_else(|e| e.into_inner());
                continue;
            }
            let due = state.queue[0].0;
            let now = Instant::now();
            if now < due {
                let (next, _) = shared
                    .wakeup
                    .wait_timeout(state, due - now)
                    .unwrap_or_else(|e| e.into_inner());
                state = next;
                continue;
            }
            let (_, event) = state.queue.pop_front().expect("checked non-empty");
            drop(state);
            event();
            state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl EventSink for DelaySink {
    fn enqueue(&self, event: Event) {
        let delay_ms = rand::rng().random_range(self.min.as_millis()..=self.max.as_millis());
        let due = Instant::now() + Duration::from_millis(delay_ms as u64);
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let due = due.max(state.last_due);
        state.last_due = due;
        state.queue.push_back((due, event));
        drop(state);
        self.shared.wakeup.notify_one();
    }
}

impl Drop for DelaySink {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.stopped = true;
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

/// Simulates network lag by delaying every callback.
pub type LagListener = QueuedListener<DelaySink>;

impl LagListener {
    pub fn lagging(delegate: Arc<dyn Listener>, min: Duration, max: Duration) -> Self {
        Self::new(delegate, DelaySink::new(min, max))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[derive(Debug)]
    struct NoteA(u32);
    #[derive(Debug)]
    struct NoteB;

    #[test]
    fn type_listener_replaces_handler_per_type() {
        let hits = Arc::new(AtomicU32::new(0));
        let routed = TypeListener::new();

        let first = hits.clone();
        routed.on::<NoteA, _>(move |_, _| {
            first.store(1, Ordering::SeqCst);
        });
        let second = hits.clone();
        routed.on::<NoteA, _>(move |_, note: &NoteA| {
            second.store(note.0, Ordering::SeqCst);
        });
        routed.on::<NoteB, _>(|_, _| {});
        assert_eq!(routed.len(), 2);

        let connection = Connection::unregistered_for_tests();
        let object: Object = Arc::new(NoteA(7));
        routed.received(&connection, &object);
        assert_eq!(hits.load(Ordering::SeqCst), 7);

        assert!(routed.remove::<NoteB>());
        assert!(!routed.remove::<NoteB>());
        assert_eq!(routed.len(), 1);
        routed.clear();
        assert!(routed.is_empty());
    }

    #[test]
    fn type_listener_drops_unhandled_types() {
        let routed = TypeListener::new();
        let connection = Connection::unregistered_for_tests();
        let object: Object = Arc::new(NoteB);
        // no handler installed: must not panic, must not dispatch
        routed.received(&connection, &object);
    }

    #[test]
    fn lag_sink_preserves_fifo_order() {
        let order = Arc::new(spin::Mutex::new(Vec::new()));
        let sink = DelaySink::new(Duration::from_millis(1), Duration::from_millis(30));
        for i in 0..8u32 {
            let order = order.clone();
            sink.enqueue(Box::new(move || order.lock().push(i)));
        }
        thread::sleep(Duration::from_millis(400));
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }
}
