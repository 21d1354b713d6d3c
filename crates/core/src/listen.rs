//! A passively opened endpoint: half-open table, accept queue and reaper
//! task driven through one lifecycle.
//!
//! ```text
//!   Idle --start--> Listening --stop--> Stopped
//!     \                                    ^
//!      `------------- failed start -------'  (stays Idle)
//! ```
//!
//! A stopped endpoint cannot listen again. Inbound traffic enters through
//! [`ListenEndpoint::admit`], the handshake validator promotes finished
//! requests with [`ListenEndpoint::complete`], and the application drains
//! them with [`ListenEndpoint::accept`].

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::RwLock;
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    accept_queue::AcceptQueue,
    config::SynQueueConfig,
    errors::{AcceptError, AdmitError, CompleteError, EnqueueError, ListenError},
    half_open::{EntryId, HalfOpenTable, PendingRequest},
    port_alloc::{BindConflict, BindOwner, InetBindConflict, PortAllocator},
    protocol::Protocol,
    reaper::{Reaper, ReaperConfig},
};

/// Externally visible endpoint state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Closed,
    Listening,
}

/// A connection whose handshake completed, waiting to be accepted.
#[derive(Debug)]
pub struct MaturedConnection<C> {
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub child: C,
}

impl<C> MaturedConnection<C> {
    pub fn into_child(self) -> C {
        self.child
    }
}

/// What [`ListenEndpoint::stop`] tore down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Queued children that were disconnected.
    pub disconnected: usize,
    /// Half-open requests dropped.
    pub evicted: usize,
}

struct Active<Pr: Protocol> {
    table: Arc<HalfOpenTable<Pr::Payload>>,
    queue: Arc<AcceptQueue<MaturedConnection<Pr::Child>>>,
    reaper: Arc<Reaper<Pr>>,
    task: JoinHandle<()>,
    port: u16,
}

enum Phase<Pr: Protocol> {
    Idle,
    Listening(Active<Pr>),
    Stopped,
}

impl<Pr: Protocol> Phase<Pr> {
    fn state(&self) -> ListenState {
        match self {
            Phase::Listening(_) => ListenState::Listening,
            Phase::Idle | Phase::Stopped => ListenState::Closed,
        }
    }
}

pub struct ListenEndpoint<Pr: Protocol, B: BindConflict = InetBindConflict> {
    owner: BindOwner,
    requested_port: u16,
    protocol: Arc<Pr>,
    ports: Arc<PortAllocator<B>>,
    config: SynQueueConfig,
    phase: RwLock<Phase<Pr>>,
}

impl<Pr: Protocol, B: BindConflict> ListenEndpoint<Pr, B> {
    /// Creates a closed endpoint that will listen on `requested_port`, or on
    /// an automatically chosen port when it is 0.
    pub fn new(
        owner: BindOwner,
        requested_port: u16,
        protocol: Arc<Pr>,
        ports: Arc<PortAllocator<B>>,
        config: SynQueueConfig,
    ) -> Self {
        Self {
            owner,
            requested_port,
            protocol,
            ports,
            config,
            phase: RwLock::new(Phase::Idle),
        }
    }

    pub fn state(&self) -> ListenState {
        self.phase.read().state()
    }

    /// Port held while listening.
    pub fn local_port(&self) -> Option<u16> {
        match &*self.phase.read() {
            Phase::Listening(active) => Some(active.port),
            _ => None,
        }
    }

    /// Starts listening and returns the local port.
    ///
    /// Sizes the half-open table for `backlog` and the accept queue for
    /// `min(backlog, somaxconn)`, then claims the port as a listening owner.
    /// If the port cannot be claimed the endpoint stays closed and may be
    /// started again. Spawns the reaper, so it must be called from within a
    /// Tokio runtime.
    pub fn start(&self, backlog: usize) -> Result<u16, ListenError> {
        let mut phase = self.phase.write();
        if !matches!(*phase, Phase::Idle) {
            return Err(ListenError::InvalidState(phase.state()));
        }

        let table = HalfOpenTable::allocate(backlog, self.config.max_syn_backlog);
        let max_accept = backlog.min(self.config.somaxconn).max(1);
        let owner = BindOwner {
            listening: true,
            ..self.owner.clone()
        };
        let port = match self.ports.acquire(&owner, self.requested_port) {
            Ok(port) => port,
            Err(error) => {
                tracing::warn!(requested = self.requested_port, %error, "Failed to claim listen port");
                table.destroy();
                return Err(ListenError::AddrInUse(error));
            }
        };
        let table = Arc::new(table);

        let reaper = Arc::new(Reaper::new(
            table.clone(),
            self.protocol.clone(),
            ReaperConfig::from(&self.config),
        ));
        let task = tokio::spawn(reaper.clone().run());
        tracing::info!(
            port,
            backlog,
            capacity = table.capacity(),
            max_accept,
            "Listening"
        );
        *phase = Phase::Listening(Active {
            table,
            queue: Arc::new(AcceptQueue::new(max_accept)),
            reaper,
            task,
            port,
        });
        Ok(port)
    }

    /// Records a new inbound request.
    ///
    /// Refused when the table is full, or when the accept queue is full while
    /// more than one young request is already waiting.
    pub fn admit(&self, mut request: PendingRequest<Pr::Payload>) -> Result<EntryId, AdmitError> {
        let phase = self.phase.read();
        let Phase::Listening(active) = &*phase else {
            return Err(AdmitError::NotListening);
        };
        let remote = request.remote();
        request.set_expires(Instant::now() + self.config.synack_timeout());
        let young_limit = active.queue.is_full().then_some(1);
        let (id, was_empty) = match active.table.try_insert(request, young_limit) {
            Ok(inserted) => inserted,
            Err(error) => {
                tracing::warn!(%remote, port = active.port, %error, "Dropping inbound request");
                return Err(error);
            }
        };
        if was_empty {
            active.reaper.arm();
        }
        Ok(id)
    }

    /// Promotes the request behind `id` to a matured connection carrying
    /// `child`.
    ///
    /// When the accept queue is full the request stays in the table, marked
    /// acknowledged, and `child` is handed back.
    pub fn complete(&self, id: EntryId, child: Pr::Child) -> Result<(), CompleteError<Pr::Child>> {
        let phase = self.phase.read();
        let Phase::Listening(active) = &*phase else {
            return Err(CompleteError::NotListening(child));
        };
        let slot = match active.queue.reserve() {
            Ok(slot) => slot,
            Err(EnqueueError::Full(())) => {
                if !active.table.mark_acked(id) {
                    return Err(CompleteError::UnknownRequest(child));
                }
                tracing::warn!(port = active.port, "Accept queue full, keeping acknowledged request");
                return Err(CompleteError::AcceptQueueFull(child));
            }
            Err(EnqueueError::Closed(())) => return Err(CompleteError::NotListening(child)),
        };
        let Some(request) = active.table.remove(id) else {
            return Err(CompleteError::UnknownRequest(child));
        };
        tracing::trace!(remote = %request.remote(), retransmits = request.retransmits(), "Connection matured");
        slot.push(MaturedConnection {
            remote: request.remote(),
            local: request.local(),
            child,
        });
        Ok(())
    }

    /// Table of pending requests, for the handshake validator.
    pub fn half_open(&self) -> Option<Arc<HalfOpenTable<Pr::Payload>>> {
        match &*self.phase.read() {
            Phase::Listening(active) => Some(active.table.clone()),
            _ => None,
        }
    }

    /// Number of connections waiting to be accepted.
    pub fn pending_accepts(&self) -> usize {
        match &*self.phase.read() {
            Phase::Listening(active) => active.queue.len(),
            _ => 0,
        }
    }

    /// Waits for the next matured connection. `None` waits without deadline.
    pub async fn accept(
        &self,
        timeout: Option<Duration>,
    ) -> Result<MaturedConnection<Pr::Child>, AcceptError> {
        self.accept_interruptible(timeout, std::future::pending()).await
    }

    /// Like [`ListenEndpoint::accept`], giving up with
    /// [`AcceptError::Interrupted`] once `interrupt` completes.
    pub async fn accept_interruptible<F>(
        &self,
        timeout: Option<Duration>,
        interrupt: F,
    ) -> Result<MaturedConnection<Pr::Child>, AcceptError>
    where
        F: Future<Output = ()>,
    {
        let queue = match &*self.phase.read() {
            Phase::Listening(active) => active.queue.clone(),
            _ => return Err(AcceptError::InvalidState),
        };
        queue.dequeue_blocking(timeout, interrupt).await
    }

    /// Stops listening: disconnects every connection still waiting to be
    /// accepted, drops every half-open request and releases the port.
    /// Blocked acceptors wake with [`AcceptError::NotListening`].
    pub fn stop(&self) -> Result<StopReport, ListenError> {
        let active = {
            let mut phase = self.phase.write();
            match std::mem::replace(&mut *phase, Phase::Stopped) {
                Phase::Listening(active) => active,
                other => {
                    *phase = other;
                    return Err(ListenError::InvalidState(ListenState::Closed));
                }
            }
        };
        active.task.abort();

        let mut report = StopReport::default();
        for mut conn in active.queue.close() {
            self.protocol.disconnect(&mut conn.child);
            report.disconnected += 1;
        }
        report.evicted = active.table.drain().len();
        self.ports
            .release(self.owner.namespace, self.owner.id, active.port);
        tracing::info!(
            port = active.port,
            disconnected = report.disconnected,
            evicted = report.evicted,
            "Stopped listening"
        );
        Ok(report)
    }
}

impl<Pr: Protocol, B: BindConflict> Drop for ListenEndpoint<Pr, B> {
    fn drop(&mut self) {
        if self.state() == ListenState::Listening {
            let _ = self.stop();
        }
    }
}

impl<Pr: Protocol, B: BindConflict> std::fmt::Debug for ListenEndpoint<Pr, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenEndpoint")
            .field("owner", &self.owner)
            .field("state", &self.state())
            .field("port", &self.local_port())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PortConfig,
        port_alloc::{NamespaceId, OwnerId},
        test_utils::{remote_addr, RecordingProtocol, TestChild},
    };
    use std::net::{IpAddr, Ipv4Addr};

    const LOCAL: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8080);

    fn ports() -> Arc<PortAllocator> {
        let config = PortConfig {
            low: 40000,
            high: 40099,
            ..Default::default()
        };
        Arc::new(PortAllocator::new(&config).unwrap())
    }

    fn endpoint(
        id: u64,
        port: u16,
        ports: Arc<PortAllocator>,
    ) -> (Arc<RecordingProtocol>, ListenEndpoint<RecordingProtocol>) {
        let protocol = Arc::new(RecordingProtocol::default());
        let owner = BindOwner::new(
            OwnerId(id),
            NamespaceId(0),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        );
        let endpoint = ListenEndpoint::new(
            owner,
            port,
            protocol.clone(),
            ports,
            SynQueueConfig::default(),
        );
        (protocol, endpoint)
    }

    fn request(n: u32) -> PendingRequest<u32> {
        PendingRequest::new(remote_addr(n), LOCAL, Instant::now(), n)
    }

    #[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_admit_complete_accept() -> testresult::TestResult {
        let (_protocol, endpoint) = endpoint(1, 8080, ports());
        assert_eq!(endpoint.start(16)?, 8080);
        assert_eq!(endpoint.state(), ListenState::Listening);

        let id = endpoint.admit(request(1))?;
        let table = endpoint.half_open().unwrap();
        assert_eq!(table.find(remote_addr(1), LOCAL.ip()), Some(id));
        let expires = table.with_entry(id, |r| r.expires()).unwrap();
        assert_eq!(expires, Instant::now() + SynQueueConfig::default().synack_timeout());

        endpoint
            .complete(id, TestChild::new(1))
            .map_err(|e| e.to_string())?;
        assert!(table.is_empty());

        let conn = endpoint.accept(Some(Duration::from_secs(1))).await?;
        assert_eq!(conn.remote, remote_addr(1));
        assert_eq!(conn.local, LOCAL);
        assert_eq!(conn.into_child(), TestChild::new(1));
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_accept_requires_listening() {
        let (_protocol, endpoint) = endpoint(1, 8080, ports());
        assert_eq!(endpoint.accept(None).await.err(), Some(AcceptError::InvalidState));
        assert_eq!(endpoint.admit(request(1)).err(), Some(AdmitError::NotListening));
    }

    #[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_full_accept_queue_keeps_request_acked() -> testresult::TestResult {
        // somaxconn caps the queue at one connection.
        let protocol = Arc::new(RecordingProtocol::default());
        let owner = BindOwner::new(OwnerId(1), NamespaceId(0), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let config = SynQueueConfig {
            somaxconn: 1,
            ..Default::default()
        };
        let endpoint = ListenEndpoint::new(owner, 8080, protocol, ports(), config);
        endpoint.start(16)?;

        let first = endpoint.admit(request(1))?;
        let second = endpoint.admit(request(2))?;
        endpoint
            .complete(first, TestChild::new(1))
            .map_err(|e| e.to_string())?;

        let refused = endpoint.complete(second, TestChild::new(2));
        assert!(matches!(refused, Err(CompleteError::AcceptQueueFull(_))));
        assert_eq!(refused.unwrap_err().into_child(), TestChild::new(2));
        let table = endpoint.half_open().unwrap();
        assert_eq!(table.with_entry(second, |r| r.acked()), Some(true));

        // Only one young request pending: still admitted.
        endpoint.admit(request(3))?;
        // Two young requests pending with a full queue: refused.
        assert_eq!(
            endpoint.admit(request(4)).err(),
            Some(AdmitError::AcceptQueueOverflow)
        );

        endpoint.accept(None).await?;
        endpoint
            .complete(second, TestChild::new(2))
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_full_table_refuses_admission() -> testresult::TestResult {
        let (_protocol, endpoint) = endpoint(1, 8080, ports());
        endpoint.start(5)?;
        let capacity = endpoint.half_open().unwrap().capacity();
        assert_eq!(capacity, 8);
        for n in 0..capacity as u32 {
            endpoint.admit(request(n))?;
        }
        assert_eq!(endpoint.admit(request(99)).err(), Some(AdmitError::SynQueueFull));
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_full_table_reported_before_accept_overflow() -> testresult::TestResult {
        let protocol = Arc::new(RecordingProtocol::default());
        let owner = BindOwner::new(OwnerId(1), NamespaceId(0), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let config = SynQueueConfig {
            somaxconn: 1,
            ..Default::default()
        };
        let endpoint = ListenEndpoint::new(owner, 8080, protocol, ports(), config);
        endpoint.start(5)?;
        let first = endpoint.admit(request(0))?;
        endpoint
            .complete(first, TestChild::new(0))
            .map_err(|e| e.to_string())?;
        assert_eq!(endpoint.pending_accepts(), 1);

        // Fill the table directly, bypassing the overflow check.
        let table = endpoint.half_open().unwrap();
        for n in 1..=table.capacity() as u32 {
            table.insert(request(n));
        }
        assert!(table.young_len() > 1);
        assert_eq!(endpoint.admit(request(99)).err(), Some(AdmitError::SynQueueFull));
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_concurrent_admits_respect_capacity() -> testresult::TestResult {
        let (_protocol, endpoint) = endpoint(1, 8080, ports());
        let endpoint = Arc::new(endpoint);
        endpoint.start(5)?;
        let table = endpoint.half_open().unwrap();

        let admitters: Vec<_> = (0..16u32)
            .map(|t| {
                let endpoint = endpoint.clone();
                tokio::task::spawn_blocking(move || {
                    (0..4)
                        .filter(|i| endpoint.admit(request(t * 4 + i)).is_ok())
                        .count()
                })
            })
            .collect();
        let mut admitted = 0;
        for admitter in admitters {
            admitted += admitter.await?;
        }
        assert_eq!(admitted, table.capacity());
        assert_eq!(table.len(), table.capacity());
        table.check_invariants();
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_stop_tears_everything_down() -> testresult::TestResult {
        let ports = ports();
        let (protocol, endpoint) = endpoint(1, 8080, ports.clone());
        endpoint.start(16)?;
        for n in 0..3 {
            let id = endpoint.admit(request(n))?;
            endpoint
                .complete(id, TestChild::new(n))
                .map_err(|e| e.to_string())?;
        }
        endpoint.admit(request(10))?;
        endpoint.admit(request(11))?;
        assert_eq!(ports.owner_count(NamespaceId(0), 8080), 1);

        let report = endpoint.stop()?;
        assert_eq!(
            report,
            StopReport {
                disconnected: 3,
                evicted: 2
            }
        );
        assert_eq!(protocol.disconnects(), 3);
        assert_eq!(ports.owner_count(NamespaceId(0), 8080), 0);
        assert_eq!(endpoint.state(), ListenState::Closed);
        assert!(endpoint.half_open().is_none());

        assert_eq!(
            endpoint.start(16),
            Err(ListenError::InvalidState(ListenState::Closed))
        );
        assert_eq!(
            endpoint.stop(),
            Err(ListenError::InvalidState(ListenState::Closed))
        );
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_start_twice_is_invalid() -> testresult::TestResult {
        let (_protocol, endpoint) = endpoint(1, 0, ports());
        let port = endpoint.start(16)?;
        assert!((40000..=40099).contains(&port));
        assert_eq!(endpoint.local_port(), Some(port));
        assert_eq!(
            endpoint.start(16),
            Err(ListenError::InvalidState(ListenState::Listening))
        );
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_reaper_evicts_unanswered_requests() -> testresult::TestResult {
        let (protocol, endpoint) = endpoint(1, 8080, ports());
        endpoint.start(16)?;
        endpoint.admit(request(1))?;
        let table = endpoint.half_open().unwrap();

        // 3s << 5 retransmits plus sweep slack.
        tokio::time::sleep(Duration::from_secs(3 * 64 + 10)).await;
        assert!(table.is_empty());
        assert_eq!(protocol.retransmits(), 5);
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_drop_releases_port() -> testresult::TestResult {
        let ports = ports();
        {
            let (_protocol, endpoint) = endpoint(1, 8080, ports.clone());
            endpoint.start(16)?;
            assert_eq!(ports.bound_sockets(), 1);
        }
        assert_eq!(ports.bound_sockets(), 0);
        Ok(())
    }
}
