//! Errors surfaced by session operations.

use std::time::Duration;

use crate::bridge::protocol::RemoteError;
use crate::bridge::transport::SpawnError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to start worker: {0}")]
    Spawn(#[from] SpawnError),

    /// No response arrived before the call's deadline. The remote side is not
    /// told; a late response is discarded.
    #[error("call to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    /// The invoked function failed on the other side.
    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),

    /// Request rejected before reaching the transport.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Worker exited or the pipe broke while the call was outstanding.
    #[error("transport closed")]
    TransportClosed,

    #[error("session stopped")]
    Stopped,

    /// Writing this request failed; the session itself keeps running.
    #[error("transport write failed: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The remote failure, if the call reached the worker and raised.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}
