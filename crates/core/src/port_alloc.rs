//! Local port ownership across namespaces.
//!
//! Ports are registered in [`PortBucket`]s kept in a fixed array of hash
//! slots, each behind its own mutex, so binds on ports that land in
//! different slots never contend. A bucket is fast-reuse while every owner
//! allows reuse and none is listening; in that state further reuse-enabled,
//! non-listening owners join without a conflict scan.

use std::{
    collections::HashSet,
    net::IpAddr,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use rand::Rng;

use crate::{config::PortConfig, errors::BindError};

/// Full-range passes made by the automatic search when the chosen reusable
/// port turns out to conflict.
const MAX_SEARCH_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

/// The bind-relevant view of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOwner {
    pub id: OwnerId,
    pub namespace: NamespaceId,
    /// Allows sharing the port with other reuse-enabled owners.
    pub reuse: bool,
    pub listening: bool,
    /// Network device the owner is bound to, if any.
    pub bound_dev: Option<u32>,
    /// Local address; unspecified means every address.
    pub addr: IpAddr,
    /// An IPv6 owner that does not accept IPv4 traffic.
    pub v6_only: bool,
}

impl BindOwner {
    pub fn new(id: OwnerId, namespace: NamespaceId, addr: IpAddr) -> Self {
        Self {
            id,
            namespace,
            reuse: false,
            listening: false,
            bound_dev: None,
            addr,
            v6_only: false,
        }
    }

    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn with_listening(mut self, listening: bool) -> Self {
        self.listening = listening;
        self
    }

    pub fn with_bound_dev(mut self, dev: u32) -> Self {
        self.bound_dev = Some(dev);
        self
    }

    pub fn with_v6_only(mut self, v6_only: bool) -> Self {
        self.v6_only = v6_only;
        self
    }

    fn wants_reuse(&self) -> bool {
        self.reuse && !self.listening
    }
}

/// Registration record of one local port.
#[derive(Debug, Clone)]
pub struct PortBucket {
    namespace: NamespaceId,
    port: u16,
    owners: Vec<BindOwner>,
    fast_reuse: bool,
}

impl PortBucket {
    fn new(namespace: NamespaceId, port: u16) -> Self {
        Self {
            namespace,
            port,
            owners: Vec::new(),
            fast_reuse: false,
        }
    }

    fn is(&self, namespace: NamespaceId, port: u16) -> bool {
        self.namespace == namespace && self.port == port
    }

    fn recompute_fast_reuse(&mut self) {
        self.fast_reuse =
            !self.owners.is_empty() && self.owners.iter().all(BindOwner::wants_reuse);
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn owners(&self) -> &[BindOwner] {
        &self.owners
    }

    pub fn fast_reuse(&self) -> bool {
        self.fast_reuse
    }
}

/// Decides whether a new owner may share a port with an existing one.
pub trait BindConflict: Send + Sync {
    /// `owner` and `existing` are always distinct owners.
    fn conflicts(&self, owner: &BindOwner, existing: &BindOwner) -> bool;
}

/// Internet address family rules.
///
/// Two owners conflict when their devices overlap, their reuse settings do
/// not allow sharing (either disables reuse, or the existing owner is
/// listening), and their addresses overlap. An IPv6-only owner never
/// conflicts with an IPv4 one.
#[derive(Debug, Clone, Copy, Default)]
pub struct InetBindConflict;

impl BindConflict for InetBindConflict {
    fn conflicts(&self, owner: &BindOwner, existing: &BindOwner) -> bool {
        if existing.v6_only && owner.addr.is_ipv4() {
            return false;
        }
        let devices_overlap = match (owner.bound_dev, existing.bound_dev) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        if !devices_overlap {
            return false;
        }
        if owner.reuse && existing.reuse && !existing.listening {
            return false;
        }
        owner.addr.is_unspecified() || existing.addr.is_unspecified() || owner.addr == existing.addr
    }
}

pub struct PortAllocator<B = InetBindConflict> {
    low: u16,
    high: u16,
    range: usize,
    reserved: HashSet<u16>,
    slots: Box<[Mutex<Vec<PortBucket>>]>,
    bound_sockets: AtomicUsize,
    conflict: B,
}

impl PortAllocator<InetBindConflict> {
    pub fn new(config: &PortConfig) -> anyhow::Result<Self> {
        Self::with_conflict(config, InetBindConflict)
    }
}

impl<B: BindConflict> PortAllocator<B> {
    /// Fails when `config` does not pass [`PortConfig::validate`].
    pub fn with_conflict(config: &PortConfig, conflict: B) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            low: config.low,
            high: config.high,
            range: config.range_size(),
            reserved: config.reserved.iter().copied().collect(),
            slots: (0..config.bind_hash_size)
                .map(|_| Mutex::new(Vec::new()))
                .collect(),
            bound_sockets: AtomicUsize::new(0),
            conflict,
        })
    }

    fn slot(&self, namespace: NamespaceId, port: u16) -> &Mutex<Vec<PortBucket>> {
        let index = (usize::from(port) + namespace.0 as usize) & (self.slots.len() - 1);
        &self.slots[index]
    }

    /// Assigns `requested` to `owner`, or searches the configured range for a
    /// port when `requested` is 0.
    pub fn acquire(&self, owner: &BindOwner, requested: u16) -> Result<u16, BindError> {
        if requested != 0 {
            return self.bind(owner, requested).map(|()| requested);
        }
        self.search(owner)
    }

    /// Registers `owner` on the explicitly chosen `port`.
    pub fn bind(&self, owner: &BindOwner, port: u16) -> Result<(), BindError> {
        if port == 0 {
            return self.search(owner).map(drop);
        }
        let mut slot = self.slot(owner.namespace, port).lock();
        self.bind_locked(&mut slot, owner, port, false)
    }

    fn search(&self, owner: &BindOwner) -> Result<u16, BindError> {
        let range = self.range;
        let mut attempts = MAX_SEARCH_ATTEMPTS;
        loop {
            let offset = rand::thread_rng().gen_range(0..range);
            // `offset < range`, so the sum stays within `low..=high`.
            let mut rover = self.low + offset as u16;
            let mut smallest: Option<(usize, u16)> = None;

            for _ in 0..range {
                if !self.reserved.contains(&rover) {
                    let mut slot = self.slot(owner.namespace, rover).lock();
                    match slot.iter().position(|b| b.is(owner.namespace, rover)) {
                        None => {
                            self.register(&mut slot, None, owner, rover);
                            return Ok(rover);
                        }
                        Some(index) => {
                            let bucket = &slot[index];
                            let owners = bucket.owners.len();
                            if bucket.fast_reuse
                                && owner.wants_reuse()
                                && smallest.map_or(true, |(fewest, _)| owners < fewest)
                            {
                                smallest = Some((owners, rover));
                                if self.bound_sockets() > range {
                                    break;
                                }
                            }
                        }
                    }
                }
                rover = if rover >= self.high { self.low } else { rover + 1 };
            }

            let Some((_, port)) = smallest else {
                tracing::debug!(low = self.low, high = self.high, "Local port range exhausted");
                return Err(BindError::PortsExhausted {
                    low: self.low,
                    high: self.high,
                });
            };

            let mut slot = self.slot(owner.namespace, port).lock();
            match self.bind_locked(&mut slot, owner, port, true) {
                Ok(()) => return Ok(port),
                Err(error) if owner.wants_reuse() && attempts > 0 => {
                    attempts -= 1;
                    tracing::debug!(port, attempts, %error, "Reusable port conflicted, searching again");
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// `candidate` marks a port picked by the search as the least shared
    /// reusable bucket; those always take the conflict scan.
    fn bind_locked(
        &self,
        slot: &mut Vec<PortBucket>,
        owner: &BindOwner,
        port: u16,
        candidate: bool,
    ) -> Result<(), BindError> {
        let index = slot.iter().position(|b| b.is(owner.namespace, port));
        if let Some(bucket) = index.map(|i| &slot[i]) {
            let fast = bucket.fast_reuse && owner.wants_reuse() && !candidate;
            if !fast
                && bucket
                    .owners
                    .iter()
                    .any(|existing| existing.id != owner.id && self.conflict.conflicts(owner, existing))
            {
                tracing::debug!(port, owner = owner.id.0, "Local port in use");
                return Err(BindError::AddrInUse { port });
            }
        }
        self.register(slot, index, owner, port);
        Ok(())
    }

    fn register(
        &self,
        slot: &mut Vec<PortBucket>,
        index: Option<usize>,
        owner: &BindOwner,
        port: u16,
    ) {
        let index = index.unwrap_or_else(|| {
            slot.push(PortBucket::new(owner.namespace, port));
            slot.len() - 1
        });
        let bucket = &mut slot[index];
        match bucket.owners.iter_mut().find(|o| o.id == owner.id) {
            Some(existing) => *existing = owner.clone(),
            None => {
                bucket.owners.push(owner.clone());
                self.bound_sockets.fetch_add(1, Ordering::Relaxed);
            }
        }
        bucket.recompute_fast_reuse();
        tracing::debug!(
            port,
            owner = owner.id.0,
            owners = bucket.owners.len(),
            fast_reuse = bucket.fast_reuse,
            "Bound local port"
        );
    }

    /// Removes `owner` from `port`. The bucket goes away with its last owner.
    pub fn release(&self, namespace: NamespaceId, owner: OwnerId, port: u16) -> bool {
        let mut slot = self.slot(namespace, port).lock();
        let Some(index) = slot.iter().position(|b| b.is(namespace, port)) else {
            return false;
        };
        let bucket = &mut slot[index];
        let Some(position) = bucket.owners.iter().position(|o| o.id == owner) else {
            return false;
        };
        bucket.owners.swap_remove(position);
        self.bound_sockets.fetch_sub(1, Ordering::Relaxed);
        bucket.recompute_fast_reuse();
        if bucket.owners.is_empty() {
            slot.swap_remove(index);
        }
        tracing::trace!(port, owner = owner.0, "Released local port");
        true
    }

    pub fn owner_count(&self, namespace: NamespaceId, port: u16) -> usize {
        self.slot(namespace, port)
            .lock()
            .iter()
            .find(|b| b.is(namespace, port))
            .map_or(0, |b| b.owners.len())
    }

    pub fn is_fast_reuse(&self, namespace: NamespaceId, port: u16) -> bool {
        self.slot(namespace, port)
            .lock()
            .iter()
            .find(|b| b.is(namespace, port))
            .is_some_and(|b| b.fast_reuse)
    }

    /// Owners registered across every port.
    pub fn bound_sockets(&self) -> usize {
        self.bound_sockets.load(Ordering::Relaxed)
    }
}

impl<B> std::fmt::Debug for PortAllocator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("low", &self.low)
            .field("high", &self.high)
            .field("bound_sockets", &self.bound_sockets.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
