use thiserror::Error;

use crate::listen::ListenState;

/// Failure to obtain or validate a local port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("local port {port} is already in use")]
    AddrInUse { port: u16 },

    #[error("no local port available in range {low}..={high}")]
    PortsExhausted { low: u16, high: u16 },
}

/// Returned by [`AcceptQueue::enqueue`](crate::accept_queue::AcceptQueue::enqueue),
/// handing the rejected connection back so the caller decides how to drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError<C> {
    #[error("accept queue full")]
    Full(C),
    #[error("accept queue closed")]
    Closed(C),
}

impl<C> EnqueueError<C> {
    pub fn into_inner(self) -> C {
        match self {
            EnqueueError::Full(c) | EnqueueError::Closed(c) => c,
        }
    }
}

/// Outcome of a blocking accept that did not yield a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcceptError {
    #[error("accept timed out")]
    TimedOut,
    #[error("accept interrupted")]
    Interrupted,
    #[error("endpoint stopped listening")]
    NotListening,
    #[error("endpoint is not listening")]
    InvalidState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ListenError {
    #[error("address in use: {0}")]
    AddrInUse(#[source] BindError),

    #[error("operation invalid while endpoint is {0:?}")]
    InvalidState(ListenState),
}

/// Why an inbound request was not admitted into the half-open table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error("endpoint is not listening")]
    NotListening,
    #[error("half-open table is full")]
    SynQueueFull,
    #[error("accept queue is full and young requests are pending")]
    AcceptQueueOverflow,
}

/// Failure to promote a half-open request; the child connection is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompleteError<C> {
    #[error("no pending request matches the handle")]
    UnknownRequest(C),
    #[error("accept queue full, request kept as acknowledged")]
    AcceptQueueFull(C),
    #[error("endpoint is not listening")]
    NotListening(C),
}

impl<C> CompleteError<C> {
    pub fn into_child(self) -> C {
        match self {
            CompleteError::UnknownRequest(c)
            | CompleteError::AcceptQueueFull(c)
            | CompleteError::NotListening(c) => c,
        }
    }
}

/// Reported by a [`Protocol`](crate::protocol::Protocol) when a handshake reply
/// could not be retransmitted. The reaper evicts the request instead of
/// propagating this.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("retransmit failed: {reason}")]
pub struct RetransmitError {
    pub reason: std::borrow::Cow<'static, str>,
}

impl RetransmitError {
    pub fn new(reason: impl Into<std::borrow::Cow<'static, str>>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
