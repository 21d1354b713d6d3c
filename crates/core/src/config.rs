//! Tunables for the admission subsystem.
//!
//! Everything here is passed explicitly to [`PortAllocator`](crate::port_alloc::PortAllocator)
//! and [`ListenEndpoint`](crate::listen::ListenEndpoint); there is no ambient global state.
//! The configuration can be loaded from a TOML file:
//!
//! ```toml
//! [syn-queue]
//! max-syn-backlog = 1024
//! synack-retries = 3
//!
//! [ports]
//! low = 40000
//! high = 49999
//! reserved = [45000]
//! ```

use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Default ceiling for the half-open table backlog.
pub const DEFAULT_MAX_SYN_BACKLOG: usize = 256;
/// Default ceiling for the accept queue backlog.
pub const DEFAULT_SOMAXCONN: usize = 128;
/// Default number of handshake reply retransmits before a request is dropped.
pub const DEFAULT_SYNACK_RETRIES: u32 = 5;
/// Default initial retransmit timeout.
pub const DEFAULT_SYNACK_TIMEOUT: Duration = Duration::from_secs(3);
/// Default period of the reaper sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(200);
/// Default cap on the backed-off retransmit timeout.
pub const DEFAULT_MAX_RTO: Duration = Duration::from_secs(120);

pub const DEFAULT_LOCAL_PORT_LOW: u16 = 32768;
pub const DEFAULT_LOCAL_PORT_HIGH: u16 = 61000;
const DEFAULT_BIND_HASH_SIZE: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default, rename = "syn-queue")]
    pub syn_queue: SynQueueConfig,

    #[serde(default)]
    pub ports: PortConfig,
}

impl AdmissionConfig {
    /// Read and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: AdmissionConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded admission configuration");
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.syn_queue.validate()?;
        self.ports.validate()
    }
}

/// Half-open table, reaper and accept queue tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynQueueConfig {
    /// Upper bound applied to the requested backlog when sizing the half-open table.
    #[serde(default = "default_max_syn_backlog", rename = "max-syn-backlog")]
    pub max_syn_backlog: usize,

    /// Upper bound applied to the requested backlog when sizing the accept queue.
    #[serde(default = "default_somaxconn")]
    pub somaxconn: usize,

    /// Retransmits of the handshake reply before a request expires.
    #[serde(default = "default_synack_retries", rename = "synack-retries")]
    pub synack_retries: u32,

    /// Deferred accept, expressed as a retransmit count. `0` disables it.
    ///
    /// While deferring, an acknowledged request is kept without resending
    /// until `defer-accept - 1` retransmit periods have passed, giving the
    /// peer a chance to send data before the connection is handed out.
    #[serde(default, rename = "defer-accept")]
    pub defer_accept: u32,

    #[serde(default = "default_synack_timeout_ms", rename = "synack-timeout-ms")]
    pub synack_timeout_ms: u64,

    #[serde(default = "default_sweep_interval_ms", rename = "sweep-interval-ms")]
    pub sweep_interval_ms: u64,

    #[serde(default = "default_max_rto_ms", rename = "max-rto-ms")]
    pub max_rto_ms: u64,
}

impl Default for SynQueueConfig {
    fn default() -> Self {
        Self {
            max_syn_backlog: DEFAULT_MAX_SYN_BACKLOG,
            somaxconn: DEFAULT_SOMAXCONN,
            synack_retries: DEFAULT_SYNACK_RETRIES,
            defer_accept: 0,
            synack_timeout_ms: default_synack_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_rto_ms: default_max_rto_ms(),
        }
    }
}

impl SynQueueConfig {
    pub fn synack_timeout(&self) -> Duration {
        Duration::from_millis(self.synack_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sweep_interval_ms == 0 {
            anyhow::bail!("sweep-interval-ms must be greater than zero");
        }
        if self.synack_timeout_ms < self.sweep_interval_ms {
            anyhow::bail!(
                "synack-timeout-ms ({}) must not be shorter than sweep-interval-ms ({})",
                self.synack_timeout_ms,
                self.sweep_interval_ms
            );
        }
        if self.max_rto_ms < self.synack_timeout_ms {
            anyhow::bail!("max-rto-ms must not be shorter than synack-timeout-ms");
        }
        if self.somaxconn == 0 {
            anyhow::bail!("somaxconn must be greater than zero");
        }
        Ok(())
    }
}

/// Local port range and bind table sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default = "default_local_port_low")]
    pub low: u16,

    #[serde(default = "default_local_port_high")]
    pub high: u16,

    /// Ports inside the range that automatic allocation must skip.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reserved: Vec<u16>,

    /// Number of lock-protected slots in the port bucket table.
    #[serde(default = "default_bind_hash_size", rename = "bind-hash-size")]
    pub bind_hash_size: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOCAL_PORT_LOW,
            high: DEFAULT_LOCAL_PORT_HIGH,
            reserved: Vec::new(),
            bind_hash_size: DEFAULT_BIND_HASH_SIZE,
        }
    }
}

impl PortConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.low == 0 {
            anyhow::bail!("port range must not include port 0");
        }
        if self.low > self.high {
            anyhow::bail!("invalid port range {}..={}", self.low, self.high);
        }
        if !self.bind_hash_size.is_power_of_two() {
            anyhow::bail!(
                "bind-hash-size must be a power of two, got {}",
                self.bind_hash_size
            );
        }
        Ok(())
    }

    /// Number of ports in the range.
    pub fn range_size(&self) -> usize {
        usize::from(self.high - self.low) + 1
    }
}

fn default_max_syn_backlog() -> usize {
    DEFAULT_MAX_SYN_BACKLOG
}

fn default_somaxconn() -> usize {
    DEFAULT_SOMAXCONN
}

fn default_synack_retries() -> u32 {
    DEFAULT_SYNACK_RETRIES
}

const fn default_synack_timeout_ms() -> u64 {
    DEFAULT_SYNACK_TIMEOUT.as_millis() as u64
}

const fn default_sweep_interval_ms() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_millis() as u64
}

const fn default_max_rto_ms() -> u64 {
    DEFAULT_MAX_RTO.as_millis() as u64
}

const fn default_local_port_low() -> u16 {
    DEFAULT_LOCAL_PORT_LOW
}

const fn default_local_port_high() -> u16 {
    DEFAULT_LOCAL_PORT_HIGH
}

fn default_bind_hash_size() -> usize {
    DEFAULT_BIND_HASH_SIZE
}
