//! Framework messages. Exchanged through the same registry as application
//! traffic but intercepted by the endpoints, never dispatched to listeners.

use serde::{Deserialize, Serialize};

/// Server to client on accept: carries the id the server assigned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegisterTcp {
    pub connection_id: i32,
}

/// Client to server over the datagram channel: binds the datagram source
/// address to the connection. Echoed back over the reliable channel by the
/// server once the binding is in place.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegisterUdp {
    pub connection_id: i32,
}

/// Round-trip-time probe. A peer receiving one with `is_reply == false`
/// echoes it back with the flag set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ping {
    pub id: u32,
    pub is_reply: bool,
}
