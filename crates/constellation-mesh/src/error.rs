//! Network error kinds.

use std::sync::Arc;

use constellation_protocol::ProtocolError;
use thiserror::Error;

/// Socket-level failures; fatal for the loop that observes them.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Binding a local socket failed.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Connecting to a remote endpoint failed.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Sending on an established socket failed.
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),

    /// Receiving on an established socket failed.
    #[error("receive failed: {0}")]
    Recv(#[source] std::io::Error),

    /// The peer or the local socket has been closed.
    #[error("socket closed")]
    Closed,

    /// The discovery receive loop died; the process can no longer take part
    /// in its group.
    #[error("discovery loop failed: {0}")]
    Discovery(Arc<NetworkError>),

    /// A protocol-level encoding or decoding failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
