//! Periodic sweep over a [`HalfOpenTable`] that retransmits, ages and evicts
//! half-open requests.
//!
//! Normally every request matures on its first timeout. Requests that stay
//! unacknowledged mean a lost reply, a lost acknowledgement, a long round
//! trip, or nobody intending to answer at all (a SYN flood). Once the table is
//! at least half full, the retransmit threshold is lowered for as long as old
//! requests outnumber young ones, so that roughly half of the room stays
//! reserved for young requests while old ones are dropped early. A young
//! burst of possibly legitimate requests keeps the full threshold.
//!
//! Each sweep touches a bounded number of buckets, enough for the whole table
//! to be covered about twice per retransmit timeout, and resumes from where
//! the previous sweep stopped.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};

use crate::{
    config::SynQueueConfig,
    half_open::{HalfOpenTable, PendingRequest, Verdict},
    protocol::{Protocol, TimeoutAction},
};

/// Lowest threshold the flood defence will fall to.
const MIN_THRESHOLD: u32 = 2;

/// Timing and retry parameters of a [`Reaper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Handshake reply retransmits before a request expires.
    pub max_retries: u32,
    /// Deferred accept period as a retransmit count; `0` disables it.
    pub defer_accept: u32,
    /// Initial retransmit timeout.
    pub timeout: Duration,
    /// Period between sweeps.
    pub interval: Duration,
    /// Upper bound of the backed-off retransmit timeout.
    pub max_rto: Duration,
}

impl From<&SynQueueConfig> for ReaperConfig {
    fn from(config: &SynQueueConfig) -> Self {
        Self {
            max_retries: config.synack_retries,
            defer_accept: config.defer_accept,
            timeout: config.synack_timeout(),
            interval: config.sweep_interval(),
            max_rto: config.max_rto(),
        }
    }
}

/// Summary of one [`Reaper::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Buckets visited.
    pub visited: usize,
    /// Expired requests kept and rescheduled.
    pub rescheduled: usize,
    /// Requests dropped.
    pub evicted: usize,
    /// Entries left in the table afterwards.
    pub remaining: usize,
    /// Retransmit threshold used for this sweep.
    pub threshold: u32,
}

/// Retransmit count at which requests expire, given the table occupancy.
///
/// Starts at `max_retries`. When at least half of the table is in use, it
/// drops by one for each doubling of the young count that `len` still
/// reaches, never below 2.
pub fn retransmit_threshold(len: usize, young: usize, capacity_log: u32, max_retries: u32) -> u32 {
    let mut threshold = max_retries;
    if len >> capacity_log.saturating_sub(1) != 0 {
        let mut young = young << 1;
        while threshold > MIN_THRESHOLD {
            if len < young {
                break;
            }
            threshold -= 1;
            young <<= 1;
        }
    }
    threshold
}

/// Buckets visited per sweep: `2 * capacity / (timeout / interval)`, at least
/// one and at most the whole table.
pub fn sweep_budget(capacity: usize, timeout: Duration, interval: Duration) -> usize {
    let sweeps_per_timeout = (timeout.as_nanos() / interval.as_nanos().max(1)).max(1);
    let sweeps_per_timeout = usize::try_from(sweeps_per_timeout).unwrap_or(usize::MAX);
    (2 * (capacity / sweeps_per_timeout)).clamp(1, capacity)
}

/// Retransmit timeout after `retransmits` resends: `timeout << retransmits`,
/// capped at `max_rto`.
pub fn backoff(timeout: Duration, retransmits: u32, max_rto: Duration) -> Duration {
    let multiplier = 1u32.checked_shl(retransmits).unwrap_or(u32::MAX);
    timeout.saturating_mul(multiplier).min(max_rto)
}

/// `(expire, resend)` for an expired request.
fn expire_and_resend<P>(
    request: &PendingRequest<P>,
    threshold: u32,
    max_retries: u32,
    defer_accept: u32,
) -> (bool, bool) {
    let retransmits = request.retransmits();
    if defer_accept == 0 {
        return (retransmits >= threshold, true);
    }
    let expire = retransmits >= threshold && (!request.acked() || retransmits >= max_retries);
    // Hold off resending while waiting for data after the acknowledgement, and
    // resend on the last deferred period to give the peer one more chance.
    let resend = !request.acked() || retransmits >= defer_accept - 1;
    (expire, resend)
}

/// Sweeps the half-open table of one listening endpoint.
pub struct Reaper<Pr: Protocol> {
    table: Arc<HalfOpenTable<Pr::Payload>>,
    protocol: Arc<Pr>,
    config: ReaperConfig,
    /// Bucket the next sweep starts from.
    cursor: Mutex<usize>,
    armed: Notify,
}

impl<Pr: Protocol> Reaper<Pr> {
    pub fn new(table: Arc<HalfOpenTable<Pr::Payload>>, protocol: Arc<Pr>, config: ReaperConfig) -> Self {
        Self {
            table,
            protocol,
            config,
            cursor: Mutex::new(0),
            armed: Notify::new(),
        }
    }

    pub fn cursor(&self) -> usize {
        *self.cursor.lock()
    }

    /// Wakes the sweep task after the table went from empty to non-empty.
    pub fn arm(&self) {
        self.armed.notify_one();
    }

    /// Runs one sweep as of `now`.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut cursor = self.cursor.lock();
        let (len, young) = self.table.counts();
        if len == 0 {
            return SweepReport::default();
        }

        let capacity = self.table.capacity();
        let threshold =
            retransmit_threshold(len, young, self.table.capacity_log(), self.config.max_retries);
        let max_retries = if self.config.defer_accept > 0 {
            self.config.defer_accept
        } else {
            self.config.max_retries
        };
        let budget = sweep_budget(capacity, self.config.timeout, self.config.interval);

        let mut report = SweepReport {
            threshold,
            ..Default::default()
        };
        let mut released = Vec::new();
        let mut bucket = *cursor;
        for _ in 0..budget {
            let evicted = self.table.sweep_bucket(bucket, |request| {
                if now < request.expires() {
                    return Verdict::Keep;
                }
                let (mut expire, resend) =
                    expire_and_resend(request, threshold, max_retries, self.config.defer_accept);
                if self.protocol.on_timeout(request) == TimeoutAction::Evict {
                    expire = true;
                }
                if !expire && (!resend || self.retransmit(request) || request.acked()) {
                    request.record_retransmit();
                    let timeout =
                        backoff(self.config.timeout, request.retransmits(), self.config.max_rto);
                    request.set_expires(now + timeout);
                    report.rescheduled += 1;
                    return Verdict::Keep;
                }
                Verdict::Evict
            });
            report.evicted += evicted.len();
            released.extend(evicted);
            bucket = (bucket + 1) & (capacity - 1);
            report.visited += 1;
        }
        *cursor = bucket;
        drop(cursor);

        report.remaining = self.table.len();
        if report.evicted > 0 {
            tracing::debug!(
                evicted = report.evicted,
                remaining = report.remaining,
                threshold,
                young,
                "Evicted half-open requests"
            );
        }
        drop(released);
        report
    }

    fn retransmit(&self, request: &PendingRequest<Pr::Payload>) -> bool {
        match self.protocol.retransmit(request) {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!(remote = %request.remote(), %error, "Dropping half-open request");
                false
            }
        }
    }

    /// Sweeps every `interval` while the table has entries and parks until
    /// [`Reaper::arm`] is called once it empties. Runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.table.is_empty() {
                self.armed.notified().await;
            }
            tokio::time::sleep(self.config.interval).await;
            let report = self.sweep(Instant::now());
            tracing::trace!(?report, "Half-open sweep");
        }
    }
}
