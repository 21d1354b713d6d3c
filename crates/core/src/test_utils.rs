//! Shared helpers for unit tests.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{
    errors::RetransmitError,
    half_open::PendingRequest,
    protocol::{Protocol, TimeoutAction},
};

/// A distinct remote endpoint per `n`.
pub fn remote_addr(n: u32) -> SocketAddr {
    SocketAddr::new(
        IpAddr::V4(Ipv4Addr::from(0xc633_6400 + n)),
        1024 + (n % 60_000) as u16,
    )
}

/// Child connection handed out by [`RecordingProtocol`].
#[derive(Debug, PartialEq, Eq)]
pub struct TestChild {
    pub id: u32,
    pub disconnected: bool,
}

impl TestChild {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            disconnected: false,
        }
    }
}

/// Protocol double counting every hook invocation.
#[derive(Debug, Default)]
pub struct RecordingProtocol {
    retransmits: AtomicUsize,
    timeouts: AtomicUsize,
    disconnects: AtomicUsize,
    fail_retransmits: AtomicBool,
    evict_on_timeout: AtomicBool,
}

impl RecordingProtocol {
    pub fn retransmits(&self) -> usize {
        self.retransmits.load(Ordering::SeqCst)
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn fail_retransmits(&self, fail: bool) {
        self.fail_retransmits.store(fail, Ordering::SeqCst);
    }

    pub fn evict_on_timeout(&self, evict: bool) {
        self.evict_on_timeout.store(evict, Ordering::SeqCst);
    }
}

impl Protocol for RecordingProtocol {
    type Payload = u32;
    type Child = TestChild;

    fn retransmit(&self, _request: &PendingRequest<u32>) -> Result<(), RetransmitError> {
        if self.fail_retransmits.load(Ordering::SeqCst) {
            return Err(RetransmitError::new("link down"));
        }
        self.retransmits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_timeout(&self, _request: &PendingRequest<u32>) -> TimeoutAction {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
        if self.evict_on_timeout.load(Ordering::SeqCst) {
            TimeoutAction::Evict
        } else {
            TimeoutAction::Continue
        }
    }

    fn disconnect(&self, child: &mut TestChild) {
        child.disconnected = true;
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}
