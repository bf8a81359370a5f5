//! Per-process memory-type cache: maps address ranges to memory-kind tags.
//!
//! Grounded on `original_source/src/ucs/memory/memtype_cache.c` /
//! `memtype_cache.h`. The update/remove algorithm (read-find-split-reinsert)
//! is ported line for line; see [`MemTypeCache::update_internal`].

use std::sync::RwLock;

use log::warn;

use crate::interval::{Interval, IntervalMap};

/// Closed enumeration of memory classes a region can be tagged with.
/// `UnknownNonHost` means "this is not host memory, but its precise class
/// was not determined at the time it was cached" (spec section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    Host,
    Cuda,
    CudaManaged,
    Rocm,
    RocmManaged,
    UnknownNonHost,
}

/// An alloc/free notification delivered by an external event source.
#[derive(Debug, Clone, Copy)]
pub enum MemTypeEvent {
    Alloc {
        address: u64,
        size: u64,
        kind: MemKind,
    },
    Free {
        address: u64,
        size: u64,
    },
}

enum Action {
    Set(MemKind),
    Remove,
}

/// Per-process cache of address-range -> memory-kind tags.
///
/// Lookups take the lock in shared mode; `update`/`remove` take it
/// exclusive (spec section 4.2, "Concurrency"). The cache may be updated
/// from a different thread than the one issuing lookups (e.g. an
/// allocation-event delivery thread versus the progress thread); this is
/// the one piece of shared, lock-protected state in the whole engine (spec
/// section 5).
pub struct MemTypeCache {
    regions: RwLock<IntervalMap<MemKind>>,
}

impl Default for MemTypeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTypeCache {
    pub fn new() -> Self {
        MemTypeCache {
            regions: RwLock::new(IntervalMap::new()),
        }
    }

    /// Feeds an external alloc/free event into the cache.
    pub fn handle_event(&self, event: MemTypeEvent) {
        match event {
            MemTypeEvent::Alloc {
                address,
                size,
                kind,
            } => self.update(address, size, kind),
            MemTypeEvent::Free { address, size } => self.remove(address, size),
        }
    }

    /// Succeeds iff `[address, address+size)` is fully contained in a
    /// single stored region; a proper overhang past the region's end
    /// yields `None` (spec section 4.2).
    pub fn lookup(&self, address: u64, size: u64) -> Option<MemKind> {
        let query = Interval::new(address, size)?;
        let guard = self.regions.read().unwrap();
        let (region, kind) = guard.find(query)?;
        if region.contains(&query) {
            Some(*kind)
        } else {
            None
        }
    }

    /// Records `[address, address+size)` as `kind`, splitting any
    /// overlapping stored regions around the new one.
    pub fn update(&self, address: u64, size: u64, kind: MemKind) {
        let Some(interval) = Interval::new(address, size) else {
            return;
        };
        self.update_internal(interval, Action::Set(kind));
    }

    /// Removes `[address, address+size)` from the cache, splitting any
    /// overlapping stored regions around the removed range.
    pub fn remove(&self, address: u64, size: u64) {
        let Some(interval) = Interval::new(address, size) else {
            return;
        };
        self.update_internal(interval, Action::Remove);
    }

    pub fn is_empty(&self) -> bool {
        self.regions.read().unwrap().is_empty()
    }

    /// Shared update/remove algorithm (spec section 4.2, "Update
    /// algorithm"):
    ///
    /// 1. find every stored region overlapping `interval`, removing each as
    ///    it's found;
    /// 2. for each removed region, reinsert whatever part of it falls
    ///    strictly outside `interval`, keeping that region's original kind;
    /// 3. if this is a `Set`, insert the new region.
    ///
    /// All of this happens under a single write-lock acquisition, so
    /// concurrent lookups observe either the fully-old or fully-new state,
    /// never an intermediate split.
    fn update_internal(&self, interval: Interval, action: Action) {
        let mut guard = self.regions.write().unwrap();

        let mut removed = Vec::new();
        while let Some(region) = guard.remove_overlapping(interval) {
            removed.push(region);
        }

        for (region_interval, region_kind) in removed {
            if region_interval.base < interval.base {
                let left_len = interval.base - region_interval.base;
                if let Some(left) = Interval::new(region_interval.base, left_len) {
                    if guard.insert(left, region_kind).is_err() {
                        warn!(
                            target: "uct::memtype",
                            "dropped left remainder [{:#x}, {:#x}) while splitting region during cache update",
                            left.base, left.end()
                        );
                    }
                }
            }
            if region_interval.end() > interval.end() {
                let right_len = region_interval.end() - interval.end();
                if let Some(right) = Interval::new(interval.end(), right_len) {
                    if guard.insert(right, region_kind).is_err() {
                        warn!(
                            target: "uct::memtype",
                            "dropped right remainder [{:#x}, {:#x}) while splitting region during cache update",
                            right.base, right.end()
                        );
                    }
                }
            }
        }

        if let Action::Set(kind) = action {
            if guard.insert(interval, kind).is_err() {
                warn!(
                    target: "uct::memtype",
                    "failed to insert region [{:#x}, {:#x}) into memtype cache",
                    interval.base, interval.end()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_on_update() {
        let cache = MemTypeCache::new();
        cache.update(0x1000, 0x1000, MemKind::Cuda); // [0x1000, 0x2000)
        cache.update(0x1800, 0x400, MemKind::Host); // [0x1800, 0x1C00)

        assert_eq!(cache.lookup(0x1900, 1), Some(MemKind::Host));
        assert_eq!(cache.lookup(0x1000, 0x800), Some(MemKind::Cuda)); // [0x1000,0x1800)
        assert_eq!(cache.lookup(0x1c00, 0x400), Some(MemKind::Cuda)); // [0x1C00,0x2000)

        // spans the Host/Cuda boundary: not fully contained in either
        assert_eq!(cache.lookup(0x1fff, 2), None);
    }

    #[test]
    fn lookup_on_empty_cache_misses() {
        let cache = MemTypeCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.lookup(0, 8), None);
    }

    #[test]
    fn remove_without_reinsert() {
        let cache = MemTypeCache::new();
        cache.update(0, 100, MemKind::Cuda);
        cache.remove(20, 10); // punches a hole [20,30) out of [0,100)

        assert_eq!(cache.lookup(0, 20), Some(MemKind::Cuda));
        assert_eq!(cache.lookup(30, 70), Some(MemKind::Cuda));
        assert_eq!(cache.lookup(15, 10), None); // spans the hole
    }

    #[test]
    fn event_alloc_then_free() {
        let cache = MemTypeCache::new();
        cache.handle_event(MemTypeEvent::Alloc {
            address: 0x4000,
            size: 0x1000,
            kind: MemKind::Rocm,
        });
        assert_eq!(cache.lookup(0x4000, 0x1000), Some(MemKind::Rocm));

        cache.handle_event(MemTypeEvent::Free {
            address: 0x4000,
            size: 0x1000,
        });
        assert!(cache.is_empty());
    }
}
