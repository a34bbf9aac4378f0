//! LRU reclamation lanes.
//!
//! Handles are spread across `L` independent ordered lanes, each under its
//! own mutex, so reference bumps and eviction scans on different lanes
//! never contend. A handle is assigned a lane round-robin at allocation
//! and keeps it for the life of the allocation, recycling included.
//!
//! Within a lane the map front is the LRU end and the back is the MRU end.
//! Refreshing an entry is remove-and-reinsert, which lands it at the back.
//!
//! Lock order: a probe path acquires an index latch first and a lane latch
//! second. The reclaimer inside [`LruLanes::insert`] runs in the opposite
//! direction — lane latch held, victim's shard wanted — so it only ever
//! *try*-locks the shard (or reuses the creator's already-held latch when
//! the victim shares it) and skips the victim on contention. No blocking
//! cycle exists.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;
use hashlink::LinkedHashMap;
use rustc_hash::FxBuildHasher;
use tracing::trace;

use crate::fs::handle::{FileHandle, HandleFactory};
use crate::fs::index::{HandleIndex, Latch};
use crate::fs::key::FhKey;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RefFlags: u32 {
        /// The initial reference taken by a latched lookup. Does not
        /// refresh the handle's lane position.
        const INITIAL = 0x0001;
    }
}

type LaneMap = LinkedHashMap<FhKey, Arc<FileHandle>, FxBuildHasher>;

struct Lane {
    map: LaneMap,
}

pub struct LruLanes {
    lanes: Vec<Mutex<Lane>>,
    /// Per-lane handle count at which inserts reclaim instead of growing.
    hiwat: usize,
    next_lane: AtomicUsize,
}

impl LruLanes {
    #[must_use]
    pub fn new(lanes: usize, hiwat: usize) -> Self {
        let lanes = lanes.max(1);
        Self {
            lanes: (0..lanes)
                .map(|_| {
                    Mutex::new(Lane {
                        map: LinkedHashMap::with_hasher(FxBuildHasher),
                    })
                })
                .collect(),
            hiwat: hiwat.max(1),
            next_lane: AtomicUsize::new(0),
        }
    }

    fn lock_lane(&self, lane: usize) -> MutexGuard<'_, Lane> {
        self.lanes[lane].lock().expect("lru lane mutex poisoned")
    }

    /// Take a reference on `fh`. Fails when a reclaimer has already
    /// claimed the handle; the caller must drop its latch and retry the
    /// lookup. Non-initial references refresh the handle to the MRU end.
    #[must_use]
    pub fn ref_handle(&self, fh: &Arc<FileHandle>, flags: RefFlags) -> bool {
        let mut lane = self.lock_lane(fh.lane());
        if fh.is_reclaiming() {
            return false;
        }
        fh.add_ref();
        if !flags.contains(RefFlags::INITIAL)
            && let Some(entry) = lane.map.remove(fh.key())
        {
            lane.map.insert(*fh.key(), entry);
        }
        true
    }

    /// Drop a reference. A handle reaching zero stays where it is; its
    /// lane position already reflects its last admission or refresh.
    pub fn unref(&self, fh: &Arc<FileHandle>) {
        let _lane = self.lock_lane(fh.lane());
        fh.release_ref();
    }

    /// Admit a new handle built by `factory`, returning it with one
    /// reference held.
    ///
    /// Below the lane watermark this is a plain allocation. At the
    /// watermark, the lane is scanned from the LRU end for a handle with
    /// no references that agrees to be reclaimed; the victim is detached
    /// from the index (through `latch` when it shares the creator's shard,
    /// otherwise via a non-blocking shard acquisition) and reset in place
    /// to the new identity. Returns `None` when the lane is full and
    /// nothing is reclaimable.
    pub(crate) fn insert(
        &self,
        index: &HandleIndex,
        latch: &mut Latch<'_>,
        factory: &HandleFactory,
    ) -> Option<Arc<FileHandle>> {
        let lane_id = self.next_lane.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
        let mut lane = self.lock_lane(lane_id);

        if lane.map.len() < self.hiwat {
            let fh = factory.alloc(lane_id);
            lane.map.insert(*fh.key(), Arc::clone(&fh));
            return Some(fh);
        }

        let partitions = index.partitions();
        let mut victim_key = None;
        for (k, h) in lane.map.iter() {
            if h.refs() != 0 || !h.reclaim() {
                continue;
            }
            h.set_reclaiming(true);
            if latch.covers(k.object, partitions) {
                latch.erase(k);
            } else if let Some(mut shard) = index.try_latch(k.object) {
                shard.erase(k);
            } else {
                // Shard busy; claiming it here could deadlock. Next victim.
                h.set_reclaiming(false);
                continue;
            }
            victim_key = Some(*k);
            break;
        }

        let victim_key = victim_key?;
        let victim = lane
            .map
            .remove(&victim_key)
            .unwrap_or_else(|| unreachable!("victim vanished from its lane"));
        trace!(?victim_key, new_key = ?factory.key, lane = lane_id, "recycling handle");

        let fh = match Arc::try_unwrap(victim) {
            Ok(mut raw) => {
                // Sole owner: reset the allocation in place.
                factory.recycle(&mut raw);
                Arc::new(raw)
            }
            // Somebody still holds the allocation (a child's lineage
            // pointer, typically). Leave it to die on its own.
            Err(_shared) => factory.alloc(lane_id),
        };
        lane.map.insert(*fh.key(), Arc::clone(&fh));
        Some(fh)
    }

    /// Detach a handle from its lane without touching its refcount. Used
    /// when a name is removed from the namespace while holders remain.
    pub(crate) fn forget(&self, fh: &Arc<FileHandle>) {
        let mut lane = self.lock_lane(fh.lane());
        lane.map.remove(fh.key());
    }

    /// Total handles across all lanes.
    #[must_use]
    pub fn len(&self) -> usize {
        (0..self.lanes.len())
            .map(|l| self.lock_lane(l).map.len())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty every lane at teardown, handing each handle to `visitor`.
    pub fn drain(&self, mut visitor: impl FnMut(Arc<FileHandle>)) {
        for lane_id in 0..self.lanes.len() {
            let drained: Vec<_> = {
                let mut lane = self.lock_lane(lane_id);
                let mut out = Vec::with_capacity(lane.map.len());
                while let Some((_, fh)) = lane.map.pop_front() {
                    out.push(fh);
                }
                out
            };
            for fh in drained {
                visitor(fh);
            }
        }
    }
}
