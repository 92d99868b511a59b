//! The serving half: a registry of invocable objects exposed to peers.

use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};
use trellis::{Connection, Listener, Object};

use crate::msg::{FLAG_EXCEPTIONS, FLAG_RETURN_VALUE, InvokeMethod, InvokeResult, Outcome};

/// Failure raised by a method table. The message travels to the caller when
/// the call had [`FLAG_EXCEPTIONS`](crate::msg::FLAG_EXCEPTIONS) set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeFault {
    pub message: String,
}

impl InvokeFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for InvokeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for InvokeFault {}

/// Explicit method table of one exposed object. Both peers index methods
/// identically; argument tuples and return values travel as encoded bytes.
///
/// ```
/// use trellis_rmi::{Invocable, InvokeFault, decode_args, encode_return};
///
/// struct Adder;
///
/// impl Invocable for Adder {
///     fn invoke(&self, method: u8, args: &[u8]) -> Result<Vec<u8>, InvokeFault> {
///         match method {
///             0 => {
///                 let (a, b): (i32, i32) = decode_args(args)?;
///                 encode_return(&(a + b))
///             }
///             _ => Err(InvokeFault::new(format!("no method {method}"))),
///         }
///     }
/// }
/// ```
pub trait Invocable: Send + Sync + 'static {
    fn invoke(&self, method: u8, args: &[u8]) -> Result<Vec<u8>, InvokeFault>;
}

/// Decodes the argument tuple of an invocation.
pub fn decode_args<A: DeserializeOwned>(args: &[u8]) -> Result<A, InvokeFault> {
    bitcode::deserialize(args)
        .map_err(|err| InvokeFault::new(format!("argument decoding failed: {err}")))
}

/// Encodes a method's return value.
pub fn encode_return<R: Serialize>(value: &R) -> Result<Vec<u8>, InvokeFault> {
    bitcode::serialize(value)
        .map_err(|err| InvokeFault::new(format!("return encoding failed: {err}")))
}

struct SpaceInner {
    space_id: u8,
    objects: spin::Mutex<HashMap<u32, Arc<dyn Invocable>>>,
}

/// Registry mapping object ids to local invocation targets.
///
/// Expose the space on an endpoint by adding [`ObjectSpace::listener`] to it
/// (or to individual connections). Invocations run on the update thread;
/// wrap the listener in a
/// [`ThreadedListener`](trellis::ThreadedListener) when targets may block.
#[derive(Clone)]
pub struct ObjectSpace {
    inner: Arc<SpaceInner>,
}

impl ObjectSpace {
    pub fn new(space_id: u8) -> Self {
        Self {
            inner: Arc::new(SpaceInner { space_id, objects: spin::Mutex::new(HashMap::new()) }),
        }
    }

    pub fn space_id(&self) -> u8 {
        self.inner.space_id
    }

    /// Exposes `target` under `object_id`, replacing any previous target.
    pub fn register(&self, object_id: u32, target: Arc<dyn Invocable>) {
        self.inner.objects.lock().insert(object_id, target);
    }

    pub fn remove(&self, object_id: u32) -> bool {
        self.inner.objects.lock().remove(&object_id).is_some()
    }

    /// The listener that services `InvokeMethod` traffic for this space.
    pub fn listener(&self) -> Arc<dyn Listener> {
        Arc::new(SpaceListener { inner: self.inner.clone() })
    }
}

struct SpaceListener {
    inner: Arc<SpaceInner>,
}

impl Listener for SpaceListener {
    fn received(&self, connection: &Connection, object: &Object) {
        let Some(call) = object.downcast_ref::<InvokeMethod>() else { return };
        if call.space_id != self.inner.space_id {
            return;
        }
        let target = self.inner.objects.lock().get(&call.object_id).cloned();
        let result = match target {
            Some(target) => target.invoke(call.method, &call.args),
            None => Err(InvokeFault::new(format!("no object {}", call.object_id))),
        };
        if call.response_id == 0 {
            if let Err(fault) = result {
                warn!(object = call.object_id, method = call.method, %fault, "one-way invocation failed");
            }
            return;
        }
        let outcome = match result {
            Ok(value) => {
                if call.flags & FLAG_RETURN_VALUE != 0 {
                    Outcome::Return(value)
                } else {
                    Outcome::Return(Vec::new())
                }
            }
            Err(fault) => {
                debug!(object = call.object_id, method = call.method, %fault, "invocation failed");
                if call.flags & FLAG_EXCEPTIONS != 0 {
                    Outcome::Fault(fault.message)
                } else {
                    Outcome::Fault("remote invocation failed".into())
                }
            }
        };
        let reply = InvokeResult {
            object_id: call.object_id,
            response_id: call.response_id,
            outcome,
        };
        if let Err(err) = connection.send_tcp(&reply) {
            warn!(connection = connection.id(), %err, "invocation response not queued");
        }
    }
}
