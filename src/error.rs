//! Connection Manager Error Types

use thiserror::Error;

use crate::protocol::state::{Operation, State};
use crate::protocol::types::ConnectionId;

/// Errors returned synchronously by connection manager operations. None are
/// silently swallowed; anomalies that arrive asynchronously surface as
/// `Unhandled` events instead of terminating the poll loop.
#[derive(Debug, Error)]
pub enum CmError {
    /// Identifier table or event pool allocation failure.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Operation invoked from a state that does not permit it.
    #[error("operation {op} not permitted in state {state}")]
    InvalidState { op: Operation, state: State },

    /// Malformed path record, service identifier, or oversized payload.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Retry budget exhausted awaiting a peer response. The device reports
    /// this asynchronously as a `ReqTimeout` event; callers turning that
    /// event into a synchronous result use this kind.
    #[error("retry budget exhausted waiting for peer response")]
    Timeout,

    /// Peer actively refused the connection request. Arrives as a
    /// `RejectReceived` event; callers turning that event into a
    /// synchronous result use this kind.
    #[error("peer rejected the connection request")]
    PeerRejected,

    /// Operation referenced an identifier that is not live.
    #[error("unknown connection identifier {0}")]
    NotFound(ConnectionId),

    /// The device's event stream has shut down.
    #[error("event stream closed")]
    EventStreamClosed,
}

pub type CmResult<T> = std::result::Result<T, CmError>;
