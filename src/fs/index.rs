//! Partitioned, latched index of live handles.
//!
//! The index is split into `P` shards, each an ordered tree keyed by
//! [`FhKey`] under its own mutex. A probe returns *holding* the shard lock
//! as a [`Latch`], so the caller can decide — admit on miss, bump on hit —
//! with no window for a concurrent creator to race in. The latch is a
//! move-only guard: it is consumed by [`HandleIndex::insert_latched`] /
//! [`HandleIndex::erase_latched`], or released by drop on the paths that
//! give up.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::fs::handle::FileHandle;
use crate::fs::key::FhKey;

type Shard = BTreeMap<FhKey, Arc<FileHandle>>;

/// Scoped shard lock returned by a probe. Holding one pins the shard: no
/// other thread can look up, admit, or erase any key in it.
pub struct Latch<'a> {
    shard: usize,
    guard: MutexGuard<'a, Shard>,
}

impl Latch<'_> {
    /// Whether `selector` maps to the shard this latch holds.
    pub(crate) fn covers(&self, selector: u64, partitions: usize) -> bool {
        self.shard == shard_of(selector, partitions)
    }

    /// Remove `key` from the held shard.
    pub(crate) fn erase(&mut self, key: &FhKey) -> Option<Arc<FileHandle>> {
        self.guard.remove(key)
    }
}

/// Outcome of a latched probe.
pub enum Probe<'a> {
    Hit(Arc<FileHandle>, Latch<'a>),
    Miss(Latch<'a>),
}

fn shard_of(selector: u64, partitions: usize) -> usize {
    (selector % partitions as u64) as usize
}

pub struct HandleIndex {
    shards: Vec<Mutex<Shard>>,
    /// Per-shard size hint; sizes teardown batches.
    capacity_hint: usize,
}

impl HandleIndex {
    #[must_use]
    pub fn new(partitions: usize, capacity_hint: usize) -> Self {
        let partitions = partitions.max(1);
        Self {
            shards: (0..partitions).map(|_| Mutex::new(BTreeMap::new())).collect(),
            capacity_hint,
        }
    }

    #[must_use]
    pub fn partitions(&self) -> usize {
        self.shards.len()
    }

    fn lock_shard(&self, shard: usize) -> MutexGuard<'_, Shard> {
        // Poisoning means a holder panicked with the tree half-updated.
        self.shards[shard].lock().expect("handle shard mutex poisoned")
    }

    /// Probe for `key` in the shard selected by `selector`, returning with
    /// the shard lock held either way.
    pub fn find_latch(&self, selector: u64, key: &FhKey) -> Probe<'_> {
        let shard = shard_of(selector, self.shards.len());
        let guard = self.lock_shard(shard);
        let found = guard.get(key).cloned();
        match found {
            Some(fh) => Probe::Hit(fh, Latch { shard, guard }),
            None => Probe::Miss(Latch { shard, guard }),
        }
    }

    /// Acquire a shard latch without blocking; used by the reclaimer, which
    /// already holds a lane latch and must not wait on a shard.
    pub(crate) fn try_latch(&self, selector: u64) -> Option<Latch<'_>> {
        let shard = shard_of(selector, self.shards.len());
        self.shards[shard]
            .try_lock()
            .ok()
            .map(|guard| Latch { shard, guard })
    }

    /// Publish a handle under a held latch, consuming the latch.
    ///
    /// The caller's probe must have missed under this same latch; a
    /// duplicate here means the protocol was violated.
    pub fn insert_latched(&self, fh: Arc<FileHandle>, mut latch: Latch<'_>) {
        debug_assert!(
            latch.covers(fh.key().object, self.shards.len()),
            "latch does not cover the handle's shard"
        );
        let prev = latch.guard.insert(*fh.key(), fh);
        assert!(
            prev.is_none(),
            "duplicate handle key admitted under a held latch"
        );
    }

    /// Erase `key` under a held latch, consuming the latch.
    pub fn erase_latched(&self, key: &FhKey, mut latch: Latch<'_>) -> Option<Arc<FileHandle>> {
        latch.erase(key)
    }

    /// Number of live entries across all shards.
    #[must_use]
    pub fn len(&self) -> usize {
        (0..self.shards.len()).map(|s| self.lock_shard(s).len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty every shard at teardown, handing each handle to `visitor`.
    /// Shards are cleared one at a time; new probes are expected to have
    /// been fenced off by the caller.
    pub fn drain(&self, mut visitor: impl FnMut(Arc<FileHandle>)) {
        for shard in 0..self.shards.len() {
            let mut batch = Vec::with_capacity(self.capacity_hint);
            {
                let mut guard = self.lock_shard(shard);
                while let Some((_, fh)) = guard.pop_first() {
                    batch.push(fh);
                }
            }
            // Visit outside the shard lock.
            for fh in batch {
                visitor(fh);
            }
        }
    }
}
