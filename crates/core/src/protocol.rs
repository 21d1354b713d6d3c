//! Hooks supplied by the connection-oriented protocol that sits on top of the
//! admission machinery.

use crate::{errors::RetransmitError, half_open::PendingRequest};

/// Decision returned by [`Protocol::on_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutAction {
    /// Let the reaper apply its usual expire/resend rules.
    #[default]
    Continue,
    /// Drop the request on this visit regardless of its retransmit count.
    Evict,
}

/// Per-protocol behaviour invoked by the reaper and the listen endpoint.
///
/// Hooks are called while the half-open table's write lock is held for the
/// bucket being swept, so they must not call back into the same table.
pub trait Protocol: Send + Sync + 'static {
    /// Opaque per-request state kept alongside each half-open request.
    type Payload: Send + Sync + 'static;
    /// Handle to a child connection produced once a handshake completes.
    type Child: Send + 'static;

    /// Resends the handshake reply for `request`.
    ///
    /// An error evicts the request.
    fn retransmit(&self, request: &PendingRequest<Self::Payload>) -> Result<(), RetransmitError>;

    /// Called for every expired request before the reaper decides its fate.
    fn on_timeout(&self, _request: &PendingRequest<Self::Payload>) -> TimeoutAction {
        TimeoutAction::Continue
    }

    /// Forcibly disconnects a child that was still waiting to be accepted
    /// when the endpoint stopped listening.
    fn disconnect(&self, child: &mut Self::Child);
}
