use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

use super::*;

// counts frees for test_reclaim_grace_period, other tests go through
// to_stats() so they can run in parallel.
static FREED: AtomicUsize = AtomicUsize::new(0);

unsafe fn drop_counted(ptr: *mut u8) {
    drop(Box::from_raw(ptr as *mut u64));
    FREED.fetch_add(1, SeqCst);
}

unsafe fn drop_plain(ptr: *mut u8) {
    drop(Box::from_raw(ptr as *mut u64));
}

fn mark_one(reclaim: &Reclaim, slot: usize, deleter: unsafe fn(*mut u8)) {
    let ptr = Box::into_raw(Box::new(0_u64)) as *mut u8;
    reclaim.mark(slot, ptr, deleter);
}

#[test]
fn test_reclaim_grace_period() {
    let reclaim = Reclaim::new();
    reclaim.set_gc_threshold(4);
    let slot_a = reclaim.register_slot();
    let slot_b = reclaim.register_slot();
    assert_eq!((slot_a, slot_b), (0, 1));

    // slot-a pins the current epoch, the way an in-flight reader would.
    reclaim.enter(slot_a);

    reclaim.enter(slot_b);
    for _ in 0..6 {
        mark_one(&reclaim, slot_b, drop_counted);
    }
    reclaim.exit_and_clean(slot_b);

    // sweep ran, but everything is stamped at the pinned epoch.
    let stats = reclaim.to_stats();
    assert_eq!(FREED.load(SeqCst), 0);
    assert_eq!(stats.n_added, 6);
    assert_eq!(stats.n_freed, 0);
    assert_eq!(stats.n_pending, 6);

    // release the pin, next sweep frees the lot.
    reclaim.park(slot_a);
    reclaim.enter(slot_b);
    for _ in 0..6 {
        mark_one(&reclaim, slot_b, drop_counted);
    }
    reclaim.exit_and_clean(slot_b);

    let stats = reclaim.to_stats();
    assert_eq!(FREED.load(SeqCst), 12);
    assert_eq!(stats.n_added, 12);
    assert_eq!(stats.n_freed, 12);
    assert_eq!(stats.n_pending, 0);
    println!("test_reclaim_grace_period stats {}", stats);
}

#[test]
fn test_reclaim_epoch_progress() {
    let reclaim = Reclaim::new();
    let slot = reclaim.register_slot();

    // every 64th deferred node advances the global epoch by one.
    let before = reclaim.current_epoch();
    for _ in 0..129 {
        reclaim.enter(slot);
        mark_one(&reclaim, slot, drop_plain);
        reclaim.exit_and_clean(slot);
    }
    let after = reclaim.current_epoch();
    assert!(after >= before + 2, "{} {}", before, after);

    reclaim.drain_all();
}

#[test]
fn test_reclaim_batch_chains() {
    let reclaim = Reclaim::new();
    reclaim.set_gc_threshold(100);
    let slot = reclaim.register_slot();

    // more entries than one label-batch holds.
    reclaim.enter(slot);
    for _ in 0..75 {
        mark_one(&reclaim, slot, drop_plain);
    }
    reclaim.exit_and_clean(slot);
    assert_eq!(reclaim.to_stats().n_pending, 75);

    reclaim.enter(slot);
    for _ in 0..30 {
        mark_one(&reclaim, slot, drop_plain);
    }
    reclaim.exit_and_clean(slot);

    let stats = reclaim.to_stats();
    assert_eq!(stats.n_added, 105);
    assert_eq!(stats.n_freed as usize + stats.n_pending, 105);

    reclaim.drain_all();
    let stats = reclaim.to_stats();
    assert_eq!(stats.n_freed, 105);
    assert_eq!(stats.n_pending, 0);
}

#[test]
#[should_panic(expected = "slots exhausted")]
fn test_reclaim_slot_limit() {
    let reclaim = Reclaim::new();
    for _ in 0..=SLOT_LIMIT {
        reclaim.register_slot();
    }
}
