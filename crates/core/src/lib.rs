//! Passive-open connection admission.
//!
//! Turns inbound connection attempts into either matured connections ready
//! to be accepted, or dropped and aged-out attempts, while protecting a
//! listening endpoint from exhaustion under a flood of handshakes that are
//! never completed.
//!
//! Requests flow through [`ListenEndpoint::admit`] into a [`HalfOpenTable`],
//! are retransmitted and aged by a [`Reaper`] until the protocol's handshake
//! validator promotes them with [`ListenEndpoint::complete`], and end up in
//! an [`AcceptQueue`] drained by [`ListenEndpoint::accept`]. Local ports are
//! handed out by a [`PortAllocator`] shared between endpoints.

/// Bounded queue of connections waiting to be accepted.
pub mod accept_queue;

/// Tunables, loadable from TOML.
pub mod config;

pub mod errors;

/// Fixed-capacity table of half-open requests.
pub mod half_open;

/// Listening endpoint lifecycle.
pub mod listen;

/// Local port assignment and reuse rules.
pub mod port_alloc;

/// Hooks supplied by the protocol on top.
pub mod protocol;

/// Periodic retransmit and eviction sweep.
pub mod reaper;

pub mod tracing;

#[cfg(test)]
pub(crate) mod test_utils;

pub use accept_queue::AcceptQueue;
pub use config::{AdmissionConfig, PortConfig, SynQueueConfig};
pub use errors::{
    AcceptError, AdmitError, BindError, CompleteError, EnqueueError, ListenError, RetransmitError,
};
pub use half_open::{EntryId, HalfOpenTable, PendingRequest};
pub use listen::{ListenEndpoint, ListenState, MaturedConnection, StopReport};
pub use port_alloc::{
    BindConflict, BindOwner, InetBindConflict, NamespaceId, OwnerId, PortAllocator,
};
pub use protocol::{Protocol, TimeoutAction};
pub use reaper::{Reaper, ReaperConfig, SweepReport};
