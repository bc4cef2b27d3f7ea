use super::*;

#[test]
fn test_vlock_protocol() {
    let vlock = Vlock::new(NodeType::N48);
    assert_eq!(vlock.node_type(), NodeType::N48);

    let v = vlock.read_lock().unwrap();
    assert!(!Vlock::is_locked(v));
    assert!(!Vlock::is_obsolete(v));
    vlock.read_unlock(v).unwrap();

    let w = vlock.upgrade(v).unwrap();
    assert!(Vlock::is_locked(w));
    assert!(vlock.read_lock().is_err());
    assert!(vlock.upgrade(v).is_err());
    vlock.write_unlock();

    // version moved on, the old sample is stale.
    assert!(vlock.check(v).is_err());
    let v2 = vlock.read_lock().unwrap();
    assert!(v2 > v);
    assert_eq!(vlock.node_type(), NodeType::N48);

    vlock.upgrade(v2).unwrap();
    vlock.write_unlock_obsolete();
    assert!(vlock.read_lock().is_err());
    assert!(vlock.read_lock_spin().is_err());
}

#[test]
fn test_node_ptr_tags() {
    assert!(NodePtr::NULL.is_null());
    assert!(NodePtr::NULL.decode().is_none());

    let node = Box::into_raw(Box::new(Node4::new(&[], 0))) as *mut Header;
    let ptr = NodePtr::from_inner(node);
    assert!(!ptr.is_leaf());
    match ptr.decode() {
        Some(Child::Inner(h)) => assert_eq!(h, node),
        _ => panic!("expected inner"),
    }
    unsafe { free_node(node) };

    for tid in [1_u64, 0xDEAD_BEEF, (1 << 62) | 5, (1 << 63) - 1].iter() {
        let ptr = NodePtr::from_inlined(*tid);
        assert!(ptr.is_leaf());
        match ptr.decode() {
            Some(Child::Inlined(t)) => assert_eq!(t, *tid),
            _ => panic!("expected inlined"),
        }
    }

    let leaf = Box::into_raw(Leaf::pair(1, 2));
    let ptr = NodePtr::from_external(leaf);
    assert!(ptr.is_leaf());
    match ptr.decode() {
        Some(Child::External(l)) => assert_eq!(l, leaf),
        _ => panic!("expected external"),
    }
    unsafe { drop(Box::from_raw(leaf)) };
}

#[test]
fn test_header_prefix() {
    let hdr = Header::new(NodeType::N4, &[1, 2, 3], 3);
    assert!(hdr.has_prefix());
    assert_eq!(hdr.prefix_len(), 3);
    assert_eq!((0..3).map(|i| hdr.prefix_byte(i)).collect::<Vec<u8>>(), vec![1, 2, 3]);

    // true length beyond the inline capacity.
    let long: Vec<u8> = (0..MAX_PREFIX_LEN as u8).collect();
    hdr.set_prefix(&long, 20);
    assert_eq!(hdr.prefix_len(), 20);
    assert_eq!(hdr.prefix_byte(MAX_PREFIX_LEN - 1), (MAX_PREFIX_LEN - 1) as u8);

    hdr.set_prefix(&[], 0);
    assert!(!hdr.has_prefix());
}

#[test]
fn test_add_prefix_before() {
    // parent node with prefix [1,2], pivot byte 9, child with prefix [7].
    let parent = Header::new(NodeType::N4, &[1, 2], 2);
    let child = Header::new(NodeType::N4, &[7], 1);
    child.add_prefix_before(&parent, 9);

    assert_eq!(child.prefix_len(), 4);
    let got: Vec<u8> = (0..4).map(|i| child.prefix_byte(i)).collect();
    assert_eq!(got, vec![1, 2, 9, 7]);
}

#[test]
fn test_node4_fanout() {
    let node = Node4::new(&[9], 1);
    assert!(!node.is_full());
    assert!(!node.is_underfull());

    for (key, tid) in [(30_u8, 300_u64), (10, 100), (20, 200), (40, 400)].iter() {
        node.insert(*key, NodePtr::from_inlined(*tid));
    }
    assert!(node.is_full());
    assert_eq!(node.header().count(), 4);

    for (key, tid) in [(10_u8, 100_u64), (20, 200), (30, 300), (40, 400)].iter() {
        match node.get_child(*key).decode() {
            Some(Child::Inlined(t)) => assert_eq!(t, *tid),
            _ => panic!("missing child {}", key),
        }
    }
    assert!(node.get_child(50).is_null());

    // sorted enumeration.
    let mut buf = ChildBuf::default();
    node.collect_children(0, 255, &mut buf);
    let keys: Vec<u8> = buf.as_slice().iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![10, 20, 30, 40]);

    let mut buf = ChildBuf::default();
    node.collect_children(15, 35, &mut buf);
    let keys: Vec<u8> = buf.as_slice().iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![20, 30]);

    node.change(20, NodePtr::from_inlined(999));
    match node.get_child(20).decode() {
        Some(Child::Inlined(t)) => assert_eq!(t, 999),
        _ => panic!("change failed"),
    }

    node.remove(20);
    node.remove(30);
    assert_eq!(node.header().count(), 2);
    let (second, second_key) = node.get_second_child(10);
    assert_eq!(second_key, 40);
    match second.decode() {
        Some(Child::Inlined(t)) => assert_eq!(t, 400),
        _ => panic!("second child"),
    }
}

#[test]
fn test_node16_fanout() {
    let node = Node16::new(&[], 0);
    // keys straddling the sign-flip boundary.
    let keys = [200_u8, 0, 255, 100, 127, 128];
    for key in keys.iter() {
        node.insert(*key, NodePtr::from_inlined(*key as u64 + 1000));
    }
    assert_eq!(node.header().count(), keys.len());
    assert!(!node.is_full());

    let mut buf = ChildBuf::default();
    node.collect_children(0, 255, &mut buf);
    let got: Vec<u8> = buf.as_slice().iter().map(|(k, _)| *k).collect();
    assert_eq!(got, vec![0, 100, 127, 128, 200, 255]);

    for key in keys.iter() {
        match node.get_child(*key).decode() {
            Some(Child::Inlined(t)) => assert_eq!(t, *key as u64 + 1000),
            _ => panic!("missing child {}", key),
        }
    }
    assert!(node.get_child(1).is_null());

    node.remove(127);
    assert!(node.get_child(127).is_null());
    assert_eq!(node.header().count(), 5);

    for key in 0..11_u8 {
        node.insert(key * 3 + 1, NodePtr::from_inlined(key as u64));
    }
    assert!(node.is_full());
}

#[test]
fn test_node48_fanout() {
    let node = Node48::new(&[], 0);
    for key in 0..48_u8 {
        node.insert(key.wrapping_mul(5), NodePtr::from_inlined(key as u64));
    }
    assert!(node.is_full());

    let mut buf = ChildBuf::default();
    node.collect_children(0, 255, &mut buf);
    assert_eq!(buf.count, 48);
    let keys: Vec<u8> = buf.as_slice().iter().map(|(k, _)| *k).collect();
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    assert_eq!(keys, sorted);

    node.remove(5);
    assert!(node.get_child(5).is_null());
    assert_eq!(node.header().count(), 47);
    // freed slot is reused.
    node.insert(7, NodePtr::from_inlined(7000));
    match node.get_child(7).decode() {
        Some(Child::Inlined(t)) => assert_eq!(t, 7000),
        _ => panic!("slot reuse"),
    }
}

#[test]
fn test_node256_fanout() {
    let node = Node256::new(&[], 0);
    assert!(!node.is_full());
    for key in 0..=255_u8 {
        node.insert(key, NodePtr::from_inlined(key as u64));
    }
    assert!(!node.is_full());
    assert_eq!(node.header().count(), 256);

    let mut buf = ChildBuf::default();
    node.collect_children(10, 20, &mut buf);
    assert_eq!(buf.count, 11);

    for key in 0..220_u8 {
        node.remove(key);
    }
    assert_eq!(node.header().count(), 36);
    assert!(node.is_underfull() || node.header().count() < 37);
}

#[test]
fn test_grow_copy() {
    // grown node keeps every child, whatever the variant pair.
    let small = Node4::new(&[3, 4], 2);
    for key in [1_u8, 2, 3, 4].iter() {
        small.insert(*key, NodePtr::from_inlined(*key as u64 * 7));
    }
    let big = Node16::new(&[3, 4], 2);
    unsafe { copy_children(small.header() as *const Header, &big) };
    assert_eq!(big.header().count(), 4);
    for key in [1_u8, 2, 3, 4].iter() {
        match big.get_child(*key).decode() {
            Some(Child::Inlined(t)) => assert_eq!(t, *key as u64 * 7),
            _ => panic!("lost child {}", key),
        }
    }
}
