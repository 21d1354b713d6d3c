use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use passive_open::{
    AcceptError, BindError, BindOwner, ListenEndpoint, ListenError, ListenState, NamespaceId,
    OwnerId, PendingRequest, PortAllocator, PortConfig, Protocol, RetransmitError,
    SynQueueConfig,
};
use testresult::TestResult;
use tokio::time::Instant;

const LOCAL: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 8080);

#[derive(Default)]
struct CountingProtocol {
    retransmits: AtomicUsize,
    disconnects: AtomicUsize,
}

impl Protocol for CountingProtocol {
    type Payload = ();
    type Child = u32;

    fn retransmit(&self, _request: &PendingRequest<()>) -> Result<(), RetransmitError> {
        self.retransmits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self, _child: &mut u32) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

fn remote(n: u32) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, n as u8)), 50_000 + n as u16)
}

fn ports(low: u16, high: u16) -> Arc<PortAllocator> {
    let config = PortConfig {
        low,
        high,
        ..Default::default()
    };
    Arc::new(PortAllocator::new(&config).expect("valid port range"))
}

fn endpoint(
    id: u64,
    port: u16,
    ports: Arc<PortAllocator>,
    config: SynQueueConfig,
) -> (Arc<CountingProtocol>, ListenEndpoint<CountingProtocol>) {
    let protocol = Arc::new(CountingProtocol::default());
    let owner = BindOwner::new(OwnerId(id), NamespaceId(0), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let endpoint = ListenEndpoint::new(owner, port, protocol.clone(), ports, config);
    (protocol, endpoint)
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn stop_wakes_blocked_acceptors() -> TestResult {
    let (_protocol, endpoint) = endpoint(1, 8080, ports(40000, 40100), SynQueueConfig::default());
    let endpoint = Arc::new(endpoint);
    endpoint.start(16)?;

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.accept(None).await.map(|conn| conn.child) })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    endpoint.stop()?;

    for waiter in waiters {
        let result = tokio::time::timeout(Duration::from_secs(5), waiter).await??;
        assert_eq!(result, Err(AcceptError::NotListening));
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
async fn failed_start_rolls_back_and_can_retry() -> TestResult {
    let ports = ports(40000, 40100);
    let (_a, first) = endpoint(1, 8080, ports.clone(), SynQueueConfig::default());
    let (_b, second) = endpoint(2, 8080, ports.clone(), SynQueueConfig::default());
    first.start(16)?;

    assert_eq!(
        second.start(16),
        Err(ListenError::AddrInUse(BindError::AddrInUse { port: 8080 }))
    );
    assert_eq!(second.state(), ListenState::Closed);
    assert!(second.half_open().is_none());

    first.stop()?;
    assert_eq!(second.start(16)?, 8080);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
async fn automatic_ports_run_out() -> TestResult {
    let ports = ports(40000, 40001);
    let (_a, first) = endpoint(1, 0, ports.clone(), SynQueueConfig::default());
    let (_b, second) = endpoint(2, 0, ports.clone(), SynQueueConfig::default());
    let (_c, third) = endpoint(3, 0, ports.clone(), SynQueueConfig::default());

    let a = first.start(8)?;
    let b = second.start(8)?;
    assert_ne!(a, b);
    assert!(matches!(
        third.start(8),
        Err(ListenError::AddrInUse(BindError::PortsExhausted { .. }))
    ));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
async fn unanswered_requests_are_evicted_in_bounded_time() -> TestResult {
    let config = SynQueueConfig {
        synack_retries: 3,
        synack_timeout_ms: 1_000,
        sweep_interval_ms: 500,
        ..Default::default()
    };
    let (protocol, endpoint) = endpoint(1, 8080, ports(40000, 40100), config);
    endpoint.start(5)?;
    let table = endpoint.half_open().expect("listening");
    assert_eq!(table.capacity(), 8);

    for n in 0..5 {
        endpoint.admit(PendingRequest::new(remote(n), LOCAL, Instant::now(), ()))?;
    }
    assert_eq!(table.young_len(), 5);

    // timeout << max_retries
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert!(table.is_empty(), "{} requests left", table.len());
    assert!(protocol.retransmits.load(Ordering::SeqCst) >= 5);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
async fn accept_honours_timeout_and_interrupt() -> TestResult {
    let (_protocol, endpoint) = endpoint(1, 8080, ports(40000, 40100), SynQueueConfig::default());
    endpoint.start(16)?;

    let start = Instant::now();
    let timed_out = endpoint.accept(Some(Duration::from_secs(2))).await;
    assert_eq!(timed_out.err(), Some(AcceptError::TimedOut));
    assert!(start.elapsed() >= Duration::from_secs(2));

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let interrupt = async move {
        let _ = rx.await;
    };
    let accept = endpoint.accept_interruptible(None, interrupt);
    tokio::pin!(accept);
    tokio::select! {
        _ = &mut accept => panic!("accept returned before the interrupt"),
        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
    }
    tx.send(()).ok();
    assert_eq!(accept.await.err(), Some(AcceptError::Interrupted));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
async fn matured_connections_are_accepted_in_order() -> TestResult {
    let (protocol, endpoint) = endpoint(1, 8080, ports(40000, 40100), SynQueueConfig::default());
    endpoint.start(16)?;

    let ids: Vec<_> = (0..4)
        .map(|n| endpoint.admit(PendingRequest::new(remote(n), LOCAL, Instant::now(), ())))
        .collect::<Result<_, _>>()?;
    for (n, id) in ids.into_iter().enumerate().rev() {
        endpoint
            .complete(id, n as u32)
            .map_err(|e| e.to_string())?;
    }
    for expected in (0..4u32).rev().take(3) {
        let conn = endpoint.accept(Some(Duration::ZERO)).await?;
        assert_eq!(conn.child, expected);
        assert_eq!(conn.remote, remote(expected));
    }

    let report = endpoint.stop()?;
    assert_eq!(report.disconnected, 1);
    assert_eq!(protocol.disconnects.load(Ordering::SeqCst), 1);
    Ok(())
}
