//! The calling half: a proxy handle whose typed invocations travel as
//! `InvokeMethod` frames, with responses correlated by a 6-bit rolling id.

use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, trace};
use trellis::{Connection, Listener, Object};

use crate::{
    error::RmiError,
    msg::{FLAG_EXCEPTIONS, FLAG_RETURN_VALUE, InvokeMethod, InvokeResult, Outcome},
};

/// Ids 1..=63; 0 is reserved for "no response expected".
const ID_SPACE: u8 = 63;

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

struct SlotState {
    /// Bit `i` set while id `i` is outstanding.
    outstanding: u64,
    cursor: u8,
    results: HashMap<u8, Outcome>,
    dead: bool,
}

struct ResponseSlots {
    state: Mutex<SlotState>,
    ready: Condvar,
}

#[inline]
fn bit(id: u8) -> u64 {
    1u64 << id
}

impl ResponseSlots {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                outstanding: 0,
                cursor: 0,
                results: HashMap::new(),
                dead: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rolls the counter through 1..=63, skipping live ids.
    fn allocate(&self) -> Result<u8, RmiError> {
        let mut state = self.lock();
        for _ in 0..ID_SPACE {
            state.cursor = state.cursor % ID_SPACE + 1;
            let id = state.cursor;
            if state.outstanding & bit(id) == 0 {
                state.outstanding |= bit(id);
                return Ok(id);
            }
        }
        Err(RmiError::Overload)
    }

    fn release(&self, id: u8) {
        let mut state = self.lock();
        state.outstanding &= !bit(id);
        state.results.remove(&id);
    }

    fn complete(&self, id: u8, outcome: Outcome) {
        let mut state = self.lock();
        if state.outstanding & bit(id) == 0 {
            debug!(id, "response for a released id dropped");
            return;
        }
        state.results.insert(id, outcome);
        drop(state);
        self.ready.notify_all();
    }

    fn mark_dead(&self) {
        self.lock().dead = true;
        self.ready.notify_all();
    }

    /// Parks until the result for `id` lands, the peer goes away or the
    /// deadline passes. The id is released on every exit path.
    fn take(&self, id: u8, deadline: Instant) -> Result<Outcome, RmiError> {
        let mut state = self.lock();
        loop {
            if let Some(outcome) = state.results.remove(&id) {
                state.outstanding &= !bit(id);
                return Ok(outcome);
            }
            if state.dead {
                state.outstanding &= !bit(id);
                return Err(RmiError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                state.outstanding &= !bit(id);
                return Err(RmiError::Timeout);
            }
            let (next, _) = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;
        }
    }

    fn outstanding_count(&self) -> usize {
        self.lock().outstanding.count_ones() as usize
    }
}

struct ResponseRouter {
    object_id: u32,
    slots: Arc<ResponseSlots>,
}

impl Listener for ResponseRouter {
    fn received(&self, _connection: &Connection, object: &Object) {
        if let Some(result) = object.downcast_ref::<InvokeResult>()
            && result.object_id == self.object_id
            && result.response_id != 0
        {
            self.slots.complete(result.response_id, result.outcome.clone());
        }
    }

    fn disconnected(&self, _connection: &Connection) {
        self.slots.mark_dead();
    }
}

/// A deferred invocation. [`wait`](PendingResponse::wait) parks until the
/// response lands and releases the id. Dropping without waiting leaves the
/// id outstanding; [`forget`](PendingResponse::forget) releases it without
/// waiting.
pub struct PendingResponse<R> {
    slots: Arc<ResponseSlots>,
    id: u8,
    timeout: Duration,
    _result: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> PendingResponse<R> {
    pub fn response_id(&self) -> u8 {
        self.id
    }

    pub fn wait(self) -> Result<R, RmiError> {
        let timeout = self.timeout;
        self.wait_for(timeout)
    }

    pub fn wait_for(self, timeout: Duration) -> Result<R, RmiError> {
        decode_outcome(self.slots.take(self.id, Instant::now() + timeout)?)
    }

    /// Releases the id without waiting for the response.
    pub fn forget(self) {
        self.slots.release(self.id);
    }
}

fn decode_outcome<R: DeserializeOwned>(outcome: Outcome) -> Result<R, RmiError> {
    match outcome {
        Outcome::Return(bytes) => bitcode::deserialize(&bytes).map_err(RmiError::Codec),
        Outcome::Fault(message) => Err(RmiError::Remote(message)),
    }
}

/// Proxy for one remote object: (space id, object id) on the far side of a
/// connection.
///
/// Typed calls go through [`invoke`](RemoteObject::invoke) (blocking),
/// [`invoke_deferred`](RemoteObject::invoke_deferred) (correlated, parked on
/// demand) or [`invoke_oneway`](RemoteObject::invoke_oneway) (no response).
/// The per-proxy settings mirror the wire flags; see the crate docs.
pub struct RemoteObject {
    conn: Connection,
    space_id: u8,
    object_id: u32,
    slots: Arc<ResponseSlots>,
    router: Arc<dyn Listener>,
    transmit_return_value: AtomicBool,
    transmit_exceptions: AtomicBool,
    use_datagram: AtomicBool,
    remember_last: AtomicBool,
    response_timeout_ms: AtomicU64,
    last_response: spin::Mutex<Option<u8>>,
}

impl RemoteObject {
    /// Builds the proxy and hooks its response router into the connection's
    /// listener set. Call [`detach`](RemoteObject::detach) when done.
    pub fn bind(conn: &Connection, space_id: u8, object_id: u32) -> Self {
        let slots = Arc::new(ResponseSlots::new());
        let router: Arc<dyn Listener> =
            Arc::new(ResponseRouter { object_id, slots: slots.clone() });
        conn.add_listener(router.clone());
        Self {
            conn: conn.clone(),
            space_id,
            object_id,
            slots,
            router,
            transmit_return_value: AtomicBool::new(true),
            transmit_exceptions: AtomicBool::new(true),
            use_datagram: AtomicBool::new(false),
            remember_last: AtomicBool::new(false),
            response_timeout_ms: AtomicU64::new(DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64),
            last_response: spin::Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    /// Unhooks the response router from the connection.
    pub fn detach(&self) {
        self.conn.remove_listener(&self.router);
    }

    /// Whether return values travel back. Off, blocking calls can only
    /// observe faults; pair with `invoke::<_, ()>`.
    pub fn set_transmit_return_value(&self, on: bool) {
        self.transmit_return_value.store(on, Ordering::Release);
    }

    /// Whether remote fault messages travel back verbatim.
    pub fn set_transmit_exceptions(&self, on: bool) {
        self.transmit_exceptions.store(on, Ordering::Release);
    }

    /// Route invocations over the datagram channel.
    pub fn set_use_datagram(&self, on: bool) {
        self.use_datagram.store(on, Ordering::Release);
    }

    /// Keep the id of each deferred call for
    /// [`wait_for_last_response`](RemoteObject::wait_for_last_response).
    pub fn set_remember_last_response(&self, on: bool) {
        self.remember_last.store(on, Ordering::Release);
    }

    pub fn set_response_timeout(&self, timeout: Duration) {
        self.response_timeout_ms.store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms.load(Ordering::Acquire))
    }

    /// Number of response ids currently in flight. Diagnostic.
    pub fn outstanding_responses(&self) -> usize {
        self.slots.outstanding_count()
    }

    /// Blocking call: parks until the response arrives or the response
    /// timeout elapses. The allocated id is released on every exit path.
    pub fn invoke<A, R>(&self, method: u8, args: &A) -> Result<R, RmiError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let id = self.slots.allocate()?;
        if let Err(err) = self.send_call(method, args, id) {
            self.slots.release(id);
            return Err(err);
        }
        trace!(object = self.object_id, method, response = id, "invocation sent");
        decode_outcome(self.slots.take(id, Instant::now() + self.response_timeout())?)
    }

    /// Non-blocking call with correlation: returns a [`PendingResponse`]
    /// immediately.
    pub fn invoke_deferred<A, R>(
        &self,
        method: u8,
        args: &A,
    ) -> Result<PendingResponse<R>, RmiError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let id = self.slots.allocate()?;
        if let Err(err) = self.send_call(method, args, id) {
            self.slots.release(id);
            return Err(err);
        }
        if self.remember_last.load(Ordering::Acquire) {
            *self.last_response.lock() = Some(id);
        }
        Ok(PendingResponse {
            slots: self.slots.clone(),
            id,
            timeout: self.response_timeout(),
            _result: PhantomData,
        })
    }

    /// Fire-and-forget: no id is allocated, no response is sent.
    pub fn invoke_oneway<A: Serialize>(&self, method: u8, args: &A) -> Result<(), RmiError> {
        self.send_call(method, args, 0)
    }

    /// Parks on the most recent remembered deferred call.
    pub fn wait_for_last_response<R: DeserializeOwned>(&self) -> Result<R, RmiError> {
        let id = self.last_response.lock().take().ok_or(RmiError::NoPendingResponse)?;
        decode_outcome(self.slots.take(id, Instant::now() + self.response_timeout())?)
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.transmit_return_value.load(Ordering::Acquire) {
            flags |= FLAG_RETURN_VALUE;
        }
        if self.transmit_exceptions.load(Ordering::Acquire) {
            flags |= FLAG_EXCEPTIONS;
        }
        flags
    }

    fn send_call<A: Serialize>(
        &self,
        method: u8,
        args: &A,
        response_id: u8,
    ) -> Result<(), RmiError> {
        let call = InvokeMethod {
            space_id: self.space_id,
            object_id: self.object_id,
            method,
            args: bitcode::serialize(args).map_err(RmiError::Codec)?,
            response_id,
            flags: self.flags(),
        };
        if self.use_datagram.load(Ordering::Acquire) {
            self.conn.send_udp(&call)?;
        } else {
            self.conn.send_tcp(&call)?;
        }
        Ok(())
    }
}

impl Drop for RemoteObject {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_wraps_and_skips_live_ids() {
        let slots = ResponseSlots::new();
        let first = slots.allocate().unwrap();
        assert_eq!(first, 1);
        for expected in 2..=63u8 {
            assert_eq!(slots.allocate().unwrap(), expected);
        }
        assert!(matches!(slots.allocate(), Err(RmiError::Overload)));

        slots.release(17);
        assert_eq!(slots.allocate().unwrap(), 17);
        assert_eq!(slots.outstanding_count(), 63);
    }

    #[test]
    fn take_returns_timeout_and_frees_the_id() {
        let slots = ResponseSlots::new();
        let id = slots.allocate().unwrap();
        let err = slots.take(id, Instant::now() + Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, RmiError::Timeout));
        assert_eq!(slots.outstanding_count(), 0);
        // a late response for the freed id is dropped
        slots.complete(id, Outcome::Return(Vec::new()));
        assert_eq!(slots.outstanding_count(), 0);
    }

    #[test]
    fn completed_result_is_delivered_once() {
        let slots = ResponseSlots::new();
        let id = slots.allocate().unwrap();
        slots.complete(id, Outcome::Fault("nope".into()));
        let outcome = slots.take(id, Instant::now() + Duration::from_millis(20)).unwrap();
        assert!(matches!(outcome, Outcome::Fault(f) if f == "nope"));
        assert_eq!(slots.outstanding_count(), 0);
    }
}
