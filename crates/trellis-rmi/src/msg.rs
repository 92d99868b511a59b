//! Invocation wire messages. Ordinary registered messages, not a separate
//! wire format; [`register_messages`] must be called at the same point in
//! registration order on both peers.

use serde::{Deserialize, Serialize};
use trellis::Registry;

/// The call carries its return value back when set.
pub const FLAG_RETURN_VALUE: u8 = 0b0000_0001;
/// Remote fault messages are transmitted verbatim when set; otherwise the
/// caller sees a generic failure text.
pub const FLAG_EXCEPTIONS: u8 = 0b0000_0010;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeMethod {
    pub space_id: u8,
    pub object_id: u32,
    /// Index into the target's method table.
    pub method: u8,
    /// Encoded argument tuple.
    pub args: Vec<u8>,
    /// 1..=63, or 0 when no response is expected.
    pub response_id: u8,
    pub flags: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResult {
    pub object_id: u32,
    pub response_id: u8,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome {
    /// Encoded return value; empty when return transmission was off.
    Return(Vec<u8>),
    /// Remote fault description.
    Fault(String),
}

/// Appends the invocation messages to `registry`.
pub fn register_messages(registry: &mut Registry) {
    registry.register::<InvokeMethod>();
    registry.register::<InvokeResult>();
}
