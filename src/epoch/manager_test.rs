use std::{thread, time};

use super::*;
use crate::epoch::{extract_epoch_id, extract_txn_id, Timestamp};

#[test]
fn test_manager_single_thread() {
    let mgr = EpochManager::new("test-single");
    assert_eq!(mgr.to_name(), "test-single".to_string());
    assert_eq!(mgr.current_epoch_id(), 1);
    assert_eq!(mgr.next_epoch_id(), 2);

    mgr.register_thread(0);
    mgr.set_current_epoch_id(2);

    // a transaction begins at epoch 2.
    let cid = mgr.enter_epoch(0, Timestamp::Read);
    assert_eq!(extract_epoch_id(cid), 2);
    assert!(extract_txn_id(cid) > 0);
    assert_eq!(mgr.expired_epoch_id(), 1);

    mgr.set_current_epoch_id(3);
    assert_eq!(mgr.expired_epoch_id(), 1);

    mgr.exit_epoch(0, cid);
    mgr.set_current_epoch_id(4);
    assert_eq!(mgr.expired_epoch_id(), 3);
    assert_eq!(mgr.expired_cid(), (3_u64 << 32) | 0xFFFF_FFFF);

    mgr.deregister_thread(0);
}

#[test]
fn test_manager_multiple_threads() {
    let mgr = EpochManager::new("test-multi");

    mgr.register_thread(0);
    mgr.register_thread(1);
    mgr.register_thread(2); // this one stays idle.

    mgr.set_current_epoch_id(2);
    let cid1 = mgr.enter_epoch(0, Timestamp::Read);
    assert_eq!(mgr.expired_epoch_id(), 1);

    mgr.set_current_epoch_id(3);
    let cid2 = mgr.enter_epoch(1, Timestamp::Read);
    assert_eq!(mgr.expired_epoch_id(), 1);

    mgr.exit_epoch(0, cid1);
    mgr.set_current_epoch_id(5);

    // one transaction still running at epoch 3.
    assert_eq!(mgr.expired_epoch_id(), 2);

    mgr.exit_epoch(1, cid2);
    assert_eq!(mgr.expired_epoch_id(), 4);

    mgr.deregister_thread(0);
    mgr.deregister_thread(1);
    mgr.deregister_thread(2);
    assert_eq!(mgr.expired_epoch_id(), 4);
}

#[test]
fn test_manager_read_only() {
    let mgr = EpochManager::new("test-ro");
    mgr.register_thread(0);
    mgr.set_current_epoch_id(10);

    let cid = mgr.enter_epoch(0, Timestamp::ReadOnly);
    assert_eq!(extract_epoch_id(cid), 10);
    assert_eq!(extract_txn_id(cid), 0);

    let cid_rw = mgr.enter_epoch(0, Timestamp::Read);
    assert!(extract_txn_id(cid_rw) > 0);

    mgr.exit_epoch(0, cid);
    mgr.exit_epoch(0, cid_rw);

    // snapshot reads are always admitted.
    let cid = mgr.enter_epoch(0, Timestamp::SnapshotRead);
    assert_eq!(extract_txn_id(cid), 0);
    mgr.exit_epoch(0, cid);
}

#[test]
fn test_manager_ticker() {
    let mut mgr = EpochManager::new("test-ticker");
    mgr.set_epoch_length(time::Duration::from_millis(2));
    mgr.register_thread(0);

    let before = mgr.current_epoch_id();
    mgr.start_epoch();
    mgr.start_epoch(); // idempotent

    thread::sleep(time::Duration::from_millis(100));
    let n_ticks = mgr.stop_epoch().unwrap();
    let after = mgr.current_epoch_id();

    assert!(n_ticks > 0, "{}", n_ticks);
    assert_eq!(after, before + n_ticks);
    assert_eq!(mgr.stop_epoch().unwrap(), 0);

    // expired epoch is non-decreasing while the clock advances.
    mgr.start_epoch();
    let mut prev = mgr.expired_epoch_id();
    for _ in 0..10 {
        thread::sleep(time::Duration::from_millis(5));
        let cur = mgr.expired_epoch_id();
        assert!(cur >= prev, "{} {}", prev, cur);
        prev = cur;
    }
    mgr.stop_epoch().unwrap();
}

#[test]
fn test_manager_stale_epoch_retry() {
    let mgr = EpochManager::new("test-stale");
    mgr.register_thread(0);
    mgr.set_current_epoch_id(10);

    // retire epochs below 14 on the local record.
    let cid_a = mgr.enter_epoch(0, Timestamp::Read);
    mgr.set_current_epoch_id(15);
    let cid_b = mgr.enter_epoch(0, Timestamp::Read);
    mgr.exit_epoch(0, cid_a);
    assert_eq!(mgr.expired_epoch_id(), 14);

    // a fresh enter observes the current epoch and succeeds first try.
    let cid = mgr.enter_epoch(0, Timestamp::Read);
    assert_eq!(extract_epoch_id(cid), 15);

    mgr.exit_epoch(0, cid);
    mgr.exit_epoch(0, cid_b);
}

#[test]
fn test_transaction_epoch_binding() {
    use crate::{Art, ArtKey};

    let mut mgr = EpochManager::new("test-binding");
    mgr.set_epoch_length(time::Duration::from_millis(5));
    mgr.register_thread(0);
    mgr.start_epoch();

    let index = Art::new("test-binding-index", |tid, key: &mut ArtKey| {
        key.set_u64(tid)
    });
    let ti = index.thread_info();

    // a transaction's begin-cid doubles as its snapshot identifier,
    // index operations run inside the transaction's epoch window.
    let cid = mgr.enter_epoch(0, Timestamp::Read);
    for n in 0..100_u64 {
        assert!(index.insert(&ArtKey::from(n), n, &ti));
    }
    assert_eq!(index.lookup(&ArtKey::from(42_u64), &ti), vec![42]);
    assert!(mgr.expired_epoch_id() < extract_epoch_id(cid));
    mgr.exit_epoch(0, cid);

    // with the transaction gone, its begin-epoch expires within a
    // bounded number of ticks.
    let begin = extract_epoch_id(cid);
    for _ in 0..200 {
        if mgr.expired_epoch_id() >= begin {
            break;
        }
        thread::sleep(time::Duration::from_millis(5));
    }
    assert!(mgr.expired_epoch_id() >= begin);
    mgr.stop_epoch().unwrap();
}

#[test]
#[should_panic(expected = "not registered")]
fn test_manager_unregistered() {
    let mgr = EpochManager::new("test-unregistered");
    mgr.enter_epoch(99, Timestamp::Read);
}
