//! Table of half-open connection requests for one listening endpoint.
//!
//! Requests are chained per bucket; the bucket is picked by a seeded hash of
//! the remote address and port so that a remote party cannot aim its requests
//! at a single chain. Chains are singly linked lists threaded through an arena
//! of nodes, with new requests prepended (most recent first).
//!
//! All mutation happens under the table's read/write lock. The reaper walks
//! the table one bucket at a time with [`HalfOpenTable::sweep_bucket`],
//! taking the write lock per bucket so new requests are not starved while a
//! sweep is in progress.

use std::net::{IpAddr, SocketAddr};

use parking_lot::RwLock;
use rand::Rng;
use tokio::time::Instant;

use crate::errors::AdmitError;

/// Smallest table the allocator will produce.
pub const MIN_CAPACITY: usize = 8;

/// One half-open connection attempt.
#[derive(Debug)]
pub struct PendingRequest<P> {
    remote: SocketAddr,
    local: SocketAddr,
    retransmits: u32,
    expires: Instant,
    acked: bool,
    /// Per-protocol state, opaque to the table.
    pub payload: P,
}

impl<P> PendingRequest<P> {
    /// Creates a request that expires at `expires`.
    ///
    /// [`ListenEndpoint::admit`](crate::listen::ListenEndpoint::admit) overwrites
    /// the expiry with the configured initial timeout.
    pub fn new(remote: SocketAddr, local: SocketAddr, expires: Instant, payload: P) -> Self {
        Self {
            remote,
            local,
            retransmits: 0,
            expires,
            acked: false,
            payload,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn retransmits(&self) -> u32 {
        self.retransmits
    }

    pub fn expires(&self) -> Instant {
        self.expires
    }

    /// Whether the final handshake acknowledgement (or data) has been seen
    /// while the request was kept in the table.
    pub fn acked(&self) -> bool {
        self.acked
    }

    /// A young request has never been retransmitted.
    pub fn is_young(&self) -> bool {
        self.retransmits == 0
    }

    pub fn mark_acked(&mut self) {
        self.acked = true;
    }

    pub(crate) fn set_expires(&mut self, expires: Instant) {
        self.expires = expires;
    }

    pub(crate) fn record_retransmit(&mut self) {
        self.retransmits = self.retransmits.saturating_add(1);
    }

    fn matches(&self, remote: SocketAddr, local_addr: IpAddr) -> bool {
        self.remote.port() == remote.port()
            && self.remote.ip() == remote.ip()
            && self.local.ip() == local_addr
    }
}

/// Handle to an entry in a [`HalfOpenTable`].
///
/// Handles are generation checked: once the entry is removed, the handle no
/// longer resolves, even if its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

/// What the sweep decided for one visited request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Keep,
    Evict,
}

struct Node<P> {
    request: PendingRequest<P>,
    next: Option<u32>,
    bucket: u32,
}

struct Slot<P> {
    generation: u32,
    node: Option<Node<P>>,
}

struct Chains<P> {
    heads: Box<[Option<u32>]>,
    slots: Vec<Slot<P>>,
    free: Vec<u32>,
    len: usize,
    young: usize,
}

impl<P> Chains<P> {
    fn node(&self, id: EntryId) -> Option<&Node<P>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_mut(&mut self, id: EntryId) -> Option<&mut Node<P>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    fn occupied(&self, index: u32) -> &Node<P> {
        self.slots[index as usize]
            .node
            .as_ref()
            .expect("half-open chain links a vacant slot")
    }

    fn occupied_mut(&mut self, index: u32) -> &mut Node<P> {
        self.slots[index as usize]
            .node
            .as_mut()
            .expect("half-open chain links a vacant slot")
    }

    fn alloc(&mut self, node: Node<P>) -> EntryId {
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.node.is_none());
                slot.node = Some(node);
                index
            }
            None => {
                let index = u32::try_from(self.slots.len()).expect("half-open arena overflow");
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                index
            }
        };
        EntryId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// Vacates the slot and bumps its generation so outstanding handles go stale.
    fn release(&mut self, index: u32) -> PendingRequest<P> {
        let slot = &mut self.slots[index as usize];
        let node = slot.node.take().expect("released a vacant slot");
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;
        if node.request.is_young() {
            self.young -= 1;
        }
        node.request
    }

    fn link(&mut self, bucket: usize, request: PendingRequest<P>) -> EntryId {
        let young = request.is_young();
        let next = self.heads[bucket];
        let id = self.alloc(Node {
            request,
            next,
            bucket: bucket as u32,
        });
        self.heads[bucket] = Some(id.index);
        self.len += 1;
        if young {
            self.young += 1;
        }
        id
    }

    /// Detaches `index` from its chain given its predecessor (`None` for the head).
    fn unlink(&mut self, bucket: usize, prev: Option<u32>, index: u32) -> PendingRequest<P> {
        let next = self.occupied(index).next;
        match prev {
            Some(prev) => self.occupied_mut(prev).next = next,
            None => self.heads[bucket] = next,
        }
        self.release(index)
    }
}

/// Fixed-capacity hash table of [`PendingRequest`]s.
pub struct HalfOpenTable<P> {
    hasher: ahash::RandomState,
    capacity_log: u32,
    chains: RwLock<Chains<P>>,
}

impl<P> HalfOpenTable<P> {
    /// Sizes a table for `requested_backlog`, bounded by `max_backlog`.
    ///
    /// The backlog plus one slot of headroom is clamped to
    /// `[MIN_CAPACITY, max_backlog + 1]` and rounded up to a power of two.
    pub fn allocate(requested_backlog: usize, max_backlog: usize) -> Self {
        let capacity = Self::capacity_for(requested_backlog, max_backlog);
        let mut rng = rand::thread_rng();
        let hasher = ahash::RandomState::with_seeds(rng.gen(), rng.gen(), rng.gen(), rng.gen());
        let capacity_log = capacity.trailing_zeros();

        tracing::trace!(requested_backlog, capacity, "Allocated half-open table");

        Self {
            hasher,
            capacity_log,
            chains: RwLock::new(Chains {
                heads: vec![None; capacity].into_boxed_slice(),
                slots: Vec::new(),
                free: Vec::new(),
                len: 0,
                young: 0,
            }),
        }
    }

    /// Bucket array length picked by [`HalfOpenTable::allocate`].
    pub fn capacity_for(requested_backlog: usize, max_backlog: usize) -> usize {
        let ceiling = max_backlog.saturating_add(1).max(MIN_CAPACITY);
        requested_backlog
            .saturating_add(1)
            .clamp(MIN_CAPACITY, ceiling)
            .next_power_of_two()
    }

    pub fn capacity(&self) -> usize {
        1 << self.capacity_log
    }

    /// `log2(capacity)`.
    pub fn capacity_log(&self) -> u32 {
        self.capacity_log
    }

    /// Bucket for a remote endpoint. Stable for the lifetime of the table.
    pub fn hash(&self, remote: SocketAddr) -> usize {
        let h = std::hash::BuildHasher::hash_one(&self.hasher, (remote.ip(), remote.port()));
        (h as usize) & (self.capacity() - 1)
    }

    pub fn len(&self) -> usize {
        self.chains.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries that have never been retransmitted.
    pub fn young_len(&self) -> usize {
        self.chains.read().young
    }

    /// `(len, young_len)` read under a single lock acquisition.
    pub fn counts(&self) -> (usize, usize) {
        let chains = self.chains.read();
        (chains.len, chains.young)
    }

    /// Whether the table holds as many entries as it has buckets.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Prepends `request` to the chain of its bucket.
    pub fn insert(&self, request: PendingRequest<P>) -> EntryId {
        let bucket = self.hash(request.remote);
        let mut chains = self.chains.write();
        chains.link(bucket, request)
    }

    /// Inserts `request` unless the table is full, or unless more than
    /// `young_limit` young entries are already pending. Both checks and the
    /// insert happen under one write lock. Also reports whether the table was
    /// empty just before.
    pub(crate) fn try_insert(
        &self,
        request: PendingRequest<P>,
        young_limit: Option<usize>,
    ) -> Result<(EntryId, bool), AdmitError> {
        let bucket = self.hash(request.remote);
        let mut chains = self.chains.write();
        if chains.len >= self.capacity() {
            return Err(AdmitError::SynQueueFull);
        }
        if young_limit.is_some_and(|limit| chains.young > limit) {
            return Err(AdmitError::AcceptQueueOverflow);
        }
        let was_empty = chains.len == 0;
        Ok((chains.link(bucket, request), was_empty))
    }

    /// Looks up the request from `remote` addressed to `local_addr`.
    pub fn find(&self, remote: SocketAddr, local_addr: IpAddr) -> Option<EntryId> {
        let bucket = self.hash(remote);
        let chains = self.chains.read();
        let mut cursor = chains.heads[bucket];
        while let Some(index) = cursor {
            let node = chains.occupied(index);
            if node.request.matches(remote, local_addr) {
                return Some(EntryId {
                    index,
                    generation: chains.slots[index as usize].generation,
                });
            }
            cursor = node.next;
        }
        None
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.chains.read().node(id).is_some()
    }

    pub fn with_entry<R>(&self, id: EntryId, f: impl FnOnce(&PendingRequest<P>) -> R) -> Option<R> {
        let chains = self.chains.read();
        chains.node(id).map(|node| f(&node.request))
    }

    /// Mutable access for the handshake validator. The retransmit count is
    /// not reachable through this path, so the young counter stays exact.
    pub fn with_entry_mut<R>(
        &self,
        id: EntryId,
        f: impl FnOnce(&mut PendingRequest<P>) -> R,
    ) -> Option<R> {
        let mut chains = self.chains.write();
        chains.node_mut(id).map(|node| f(&mut node.request))
    }

    /// Records that the final acknowledgement arrived for `id`.
    pub fn mark_acked(&self, id: EntryId) -> bool {
        self.with_entry_mut(id, PendingRequest::mark_acked).is_some()
    }

    /// Unlinks and returns the entry behind `id`.
    pub fn remove(&self, id: EntryId) -> Option<PendingRequest<P>> {
        let mut chains = self.chains.write();
        let bucket = chains.node(id)?.bucket as usize;
        let mut prev = None;
        let mut cursor = chains.heads[bucket];
        while let Some(index) = cursor {
            if index == id.index {
                return Some(chains.unlink(bucket, prev, index));
            }
            prev = Some(index);
            cursor = chains.occupied(index).next;
        }
        panic!("half-open entry {id:?} is live but not linked into bucket {bucket}");
    }

    /// Visits every request of `bucket` with the write lock held, unlinking
    /// the ones `visit` evicts. Evicted requests are returned for release
    /// after the lock is dropped.
    pub(crate) fn sweep_bucket(
        &self,
        bucket: usize,
        mut visit: impl FnMut(&mut PendingRequest<P>) -> Verdict,
    ) -> Vec<PendingRequest<P>> {
        let mut evicted = Vec::new();
        let mut chains = self.chains.write();
        let mut prev = None;
        let mut cursor = chains.heads[bucket];
        while let Some(index) = cursor {
            let node = chains.occupied_mut(index);
            let was_young = node.request.is_young();
            let verdict = visit(&mut node.request);
            let next = node.next;
            let now_young = node.request.is_young();
            match verdict {
                Verdict::Keep => {
                    if was_young && !now_young {
                        chains.young -= 1;
                    }
                    prev = Some(index);
                }
                Verdict::Evict => {
                    if was_young && !now_young {
                        // `release` only accounts for entries that are still young.
                        chains.young -= 1;
                    }
                    evicted.push(chains.unlink(bucket, prev, index));
                }
            }
            cursor = next;
        }
        evicted
    }

    /// Evicts and returns every remaining entry. Vacated slots keep their
    /// bumped generations, so handles taken before the drain stay stale.
    pub fn drain(&self) -> Vec<PendingRequest<P>> {
        let mut chains = self.chains.write();
        let mut drained = Vec::with_capacity(chains.len);
        for bucket in 0..chains.heads.len() {
            while let Some(index) = chains.heads[bucket] {
                drained.push(chains.unlink(bucket, None, index));
            }
        }
        assert_eq!(chains.len, 0, "half-open entry count out of sync after drain");
        assert_eq!(chains.young, 0, "half-open young count out of sync after drain");
        tracing::trace!(evicted = drained.len(), "Drained half-open table");
        drained
    }

    /// Consumes the table, evicting every entry.
    pub fn destroy(self) -> usize {
        self.drain().len()
    }

    /// Walks every chain and asserts the counters match what is reachable.
    pub fn check_invariants(&self) {
        let chains = self.chains.read();
        let mut reachable = 0;
        let mut young = 0;
        for (bucket, head) in chains.heads.iter().enumerate() {
            let mut cursor = *head;
            while let Some(index) = cursor {
                let node = chains.occupied(index);
                assert_eq!(node.bucket as usize, bucket, "entry linked into foreign bucket");
                assert_eq!(self.hash(node.request.remote), bucket, "entry hashed elsewhere");
                reachable += 1;
                if node.request.is_young() {
                    young += 1;
                }
                cursor = node.next;
            }
        }
        assert_eq!(reachable, chains.len, "entry count does not match reachable entries");
        assert_eq!(young, chains.young, "young count does not match reachable entries");
        assert!(chains.young <= chains.len);
    }
}

impl<P> std::fmt::Debug for HalfOpenTable<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (len, young) = self.counts();
        f.debug_struct("HalfOpenTable")
            .field("capacity", &self.capacity())
            .field("len", &len)
            .field("young", &young)
            .finish()
    }
}
