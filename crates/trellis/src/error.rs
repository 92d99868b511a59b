use std::io;

use thiserror::Error;

/// Failures inside the serialization registry. Never fatal to a connection:
/// on the receive path the frame is logged and discarded, on the send path the
/// error is returned to the caller.
#[derive(Error, Debug)]
pub enum SerializeError {
    #[error("type {0} is not registered")]
    Unregistered(&'static str),
    #[error("unknown message id {0}")]
    UnknownId(u32),
    #[error("message id prefix is malformed")]
    BadPrefix,
    #[error("encoding {type_name} failed: {source}")]
    Encode {
        type_name: &'static str,
        source: bitcode::Error,
    },
    #[error("decoding {type_name} failed: {source}")]
    Decode {
        type_name: &'static str,
        source: bitcode::Error,
    },
}

/// Failures of a single send call. The connection stays open after any of
/// these.
#[derive(Error, Debug)]
pub enum SendError {
    /// The frame does not fit in the free region of the write buffer (or
    /// exceeds the object buffer of the receiving side). Nothing was queued.
    #[error("write buffer full: frame needs {needed} bytes, {free} free")]
    BufferOverflow { needed: usize, free: usize },
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error("connection is closed")]
    Closed,
    #[error("no datagram channel is bound")]
    NoDatagram,
    /// Transient datagram failure. Not retried.
    #[error("datagram not sent: {0}")]
    DatagramUnsent(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("connection attempt timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Why a connection transitioned to `Closed`. Surfaced through the
/// `disconnected` listener callback and the log, never as a return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally.
    Requested,
    /// No bytes received within the configured receive timeout.
    Timeout,
    /// Orderly close by the peer.
    PeerClosed,
    /// Handshake violation or unexpected frame before registration.
    Protocol,
    /// Incoming length prefix exceeds the object buffer.
    FrameTooLarge,
    /// Underlying socket error.
    Io,
}
