//! State shared between an endpoint's public handle and its update loop.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use mio::Waker;
use tracing::trace;

use crate::{config::Config, connection::Connection, listener::ListenerSet, serialize::Registry};

pub(crate) struct Shared {
    pub(crate) registry: Arc<Registry>,
    pub(crate) config: Config,
    pub(crate) listeners: Arc<ListenerSet>,
    pub(crate) connections: spin::Mutex<Vec<Connection>>,
    pub(crate) discovery_response: spin::Mutex<Vec<u8>>,
    pub(crate) waker: Arc<Waker>,
    stop: AtomicBool,
    worker: spin::Mutex<Option<thread::JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn new(registry: Arc<Registry>, config: Config, waker: Arc<Waker>) -> Self {
        Self {
            registry,
            config,
            listeners: Arc::new(ListenerSet::new()),
            connections: spin::Mutex::new(Vec::new()),
            discovery_response: spin::Mutex::new(Vec::new()),
            waker,
            stop: AtomicBool::new(false),
            worker: spin::Mutex::new(None),
        }
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Installs the worker handle. False when one is already running.
    pub(crate) fn set_worker(&self, handle: thread::JoinHandle<()>) -> bool {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return false;
        }
        self.stop.store(false, Ordering::Release);
        *worker = Some(handle);
        true
    }

    pub(crate) fn worker_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Signals the worker, wakes the selector and joins, unless called from
    /// the worker itself (a listener callback calling `stop`).
    pub(crate) fn stop_worker(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            trace!(?err, "selector wakeup failed");
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }

    pub(crate) fn add_connection(&self, connection: &Connection) {
        self.connections.lock().push(connection.clone());
    }

    pub(crate) fn remove_connection(&self, connection: &Connection) {
        self.connections.lock().retain(|c| c != connection);
    }

    pub(crate) fn connections_snapshot(&self) -> Vec<Connection> {
        self.connections.lock().clone()
    }

    pub(crate) fn find_connection(&self, id: i32) -> Option<Connection> {
        self.connections.lock().iter().find(|c| c.id() == id).cloned()
    }
}
