//! End-to-end scenario for the memory-type cache (spec section 8:
//! "memtype split" -- a later, narrower allocation event splits an
//! existing cached region into the surviving halves plus the new kind).

use uct_core::memtype::{MemKind, MemTypeCache, MemTypeEvent};

#[test]
fn narrower_alloc_splits_existing_region() {
    let cache = MemTypeCache::new();

    cache.handle_event(MemTypeEvent::Alloc {
        address: 0,
        size: 4096,
        kind: MemKind::Cuda,
    });
    assert_eq!(cache.lookup(0, 4096), Some(MemKind::Cuda));

    // A narrower host allocation lands in the middle of the CUDA region
    // (e.g. a pinned staging buffer carved out of a larger CUDA unified
    // allocation).
    cache.handle_event(MemTypeEvent::Alloc {
        address: 1024,
        size: 256,
        kind: MemKind::Host,
    });

    assert_eq!(cache.lookup(0, 1024), Some(MemKind::Cuda));
    assert_eq!(cache.lookup(1024, 256), Some(MemKind::Host));
    assert_eq!(cache.lookup(1280, 2816), Some(MemKind::Cuda));

    cache.handle_event(MemTypeEvent::Free { address: 1024, size: 256 });
    assert_eq!(cache.lookup(1024, 256), None);
    assert_eq!(cache.lookup(0, 1024), Some(MemKind::Cuda));
    assert_eq!(cache.lookup(1280, 2816), Some(MemKind::Cuda));
}

#[test]
fn lookup_miss_on_untracked_range_is_none_not_error() {
    let cache = MemTypeCache::new();
    assert_eq!(cache.lookup(0x1000, 64), None);
}
