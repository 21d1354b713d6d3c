//! Drives a listening endpoint with a mix of legitimate handshakes and a
//! flood of requests that never complete, then reports what happened.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use passive_open::{
    AcceptError, AdmissionConfig, BindOwner, ListenEndpoint, NamespaceId, OwnerId,
    PendingRequest, PortAllocator, Protocol, RetransmitError,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::time::Instant;
use tracing::level_filters::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "admission-sim", version, about)]
struct Args {
    /// Listen backlog.
    #[arg(long, default_value_t = 128)]
    backlog: usize,

    /// Port to listen on; 0 picks one from the configured range.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Legitimate clients that complete their handshake.
    #[arg(long, default_value_t = 200)]
    legit: u32,

    /// Flood requests that are never acknowledged.
    #[arg(long, default_value_t = 2000)]
    flood: u32,

    /// Upper bound on the handshake completion delay of legitimate clients.
    #[arg(long, default_value_t = 500)]
    max_rtt_ms: u64,

    #[arg(long, default_value_t = 30)]
    duration_secs: u64,

    /// TOML configuration file.
    #[arg(long, env = "ADMISSION_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<LevelFilter>,
}

#[derive(Debug, Clone, Copy)]
enum Client {
    Legit,
    Flood,
}

#[derive(Debug)]
struct SimConnection {
    remote: SocketAddr,
    open: bool,
}

#[derive(Debug, Default)]
struct SimStats {
    admitted: AtomicU64,
    dropped: AtomicU64,
    matured: AtomicU64,
    refused: AtomicU64,
    retransmits: AtomicU64,
    disconnected: AtomicU64,
}

/// Pretends to resend handshake replies; nothing goes on the wire.
#[derive(Debug, Default)]
struct SimProtocol {
    stats: SimStats,
}

impl Protocol for SimProtocol {
    type Payload = Client;
    type Child = SimConnection;

    fn retransmit(&self, request: &PendingRequest<Client>) -> Result<(), RetransmitError> {
        self.stats.retransmits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(remote = %request.remote(), kind = ?request.payload, retransmits = request.retransmits(), "Resending handshake reply");
        Ok(())
    }

    fn disconnect(&self, child: &mut SimConnection) {
        child.open = false;
        self.stats.disconnected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(remote = %child.remote, "Disconnected unaccepted connection");
    }
}

type Endpoint = ListenEndpoint<SimProtocol>;

fn remote_for(n: u32) -> SocketAddr {
    let ip = Ipv4Addr::from(0x0a00_0000 | (n >> 8));
    SocketAddr::new(IpAddr::V4(ip), 1024 + (n & 0xff) as u16 * 200)
}

async fn generate_traffic(
    endpoint: Arc<Endpoint>,
    protocol: Arc<SimProtocol>,
    local: SocketAddr,
    args: Args,
) {
    let total = args.legit + args.flood;
    if total == 0 {
        return;
    }
    let spacing = Duration::from_secs(args.duration_secs) / total;
    let mut rng = SmallRng::from_entropy();
    let (mut legit_left, mut flood_left) = (args.legit, args.flood);

    for n in 0..total {
        let client = if rng.gen_range(0..legit_left + flood_left) < legit_left {
            legit_left -= 1;
            Client::Legit
        } else {
            flood_left -= 1;
            Client::Flood
        };
        let remote = remote_for(n);
        let request = PendingRequest::new(remote, local, Instant::now(), client);
        match endpoint.admit(request) {
            Ok(id) => {
                protocol.stats.admitted.fetch_add(1, Ordering::Relaxed);
                if let Client::Legit = client {
                    let rtt = Duration::from_millis(rng.gen_range(1..=args.max_rtt_ms.max(1)));
                    let endpoint = endpoint.clone();
                    let protocol = protocol.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(rtt).await;
                        let child = SimConnection { remote, open: true };
                        match endpoint.complete(id, child) {
                            Ok(()) => {
                                protocol.stats.matured.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(error) => {
                                protocol.stats.refused.fetch_add(1, Ordering::Relaxed);
                                tracing::debug!(%remote, %error, "Handshake completion refused");
                            }
                        }
                    });
                }
            }
            Err(error) => {
                protocol.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%remote, kind = ?client, %error, "Request not admitted");
            }
        }
        tokio::time::sleep(spacing).await;
    }
}

async fn accept_loop(endpoint: Arc<Endpoint>) -> u64 {
    let mut accepted = 0;
    loop {
        match endpoint.accept(None).await {
            Ok(conn) => {
                accepted += 1;
                tracing::debug!(remote = %conn.remote, open = conn.child.open, "Accepted connection");
            }
            Err(AcceptError::NotListening | AcceptError::InvalidState) => break,
            Err(error) => tracing::warn!(%error, "Accept failed"),
        }
    }
    accepted
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => AdmissionConfig::load(path)?,
        None => AdmissionConfig::default(),
    };
    let ports = Arc::new(PortAllocator::new(&config.ports)?);
    let protocol = Arc::new(SimProtocol::default());
    let owner = BindOwner::new(OwnerId(1), NamespaceId(0), IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        .with_reuse(true);
    let endpoint = Arc::new(ListenEndpoint::new(
        owner,
        args.port,
        protocol.clone(),
        ports,
        config.syn_queue.clone(),
    ));
    let port = endpoint.start(args.backlog)?;
    let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

    let duration = Duration::from_secs(args.duration_secs);
    let acceptor = tokio::spawn(accept_loop(endpoint.clone()));
    let traffic = tokio::spawn(generate_traffic(
        endpoint.clone(),
        protocol.clone(),
        local,
        args,
    ));

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Interrupted, stopping");
        }
    }
    traffic.abort();

    let report = endpoint.stop()?;
    let accepted = acceptor.await?;

    let stats = &protocol.stats;
    let admitted = stats.admitted.load(Ordering::Relaxed);
    let matured = stats.matured.load(Ordering::Relaxed);
    let reaped = admitted.saturating_sub(matured + report.evicted as u64);
    tracing::info!(
        admitted,
        dropped = stats.dropped.load(Ordering::Relaxed),
        matured,
        refused = stats.refused.load(Ordering::Relaxed),
        accepted,
        reaped,
        retransmits = stats.retransmits.load(Ordering::Relaxed),
        pending_at_stop = report.evicted,
        disconnected = report.disconnected,
        "Simulation finished"
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    passive_open::tracing::set_logger(args.log_level)?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?;
    rt.block_on(run(args))
}
