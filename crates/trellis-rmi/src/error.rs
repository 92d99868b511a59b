use thiserror::Error;
use trellis::SendError;

/// Invocation failures. None of these close the underlying connection.
#[derive(Error, Debug)]
pub enum RmiError {
    #[error("all 63 response ids are outstanding")]
    Overload,
    #[error("no response within the timeout")]
    Timeout,
    #[error("remote invocation failed: {0}")]
    Remote(String),
    #[error("connection closed before the response arrived")]
    Disconnected,
    #[error("no deferred response is pending")]
    NoPendingResponse,
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("argument or result encoding failed: {0}")]
    Codec(bitcode::Error),
}
