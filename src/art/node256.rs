//! Largest fan-out variant, a direct 256-entry child array. The tree
//! root is always a Node256.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use crate::art::node::{Fanout, Header, NodePtr, NodeType, ChildBuf};

#[repr(C)]
pub(crate) struct Node256 {
    hdr: Header,
    children: [AtomicU64; 256],
}

#[allow(clippy::declare_interior_mutable_const)]
const CHILD_INIT: AtomicU64 = AtomicU64::new(0);

impl Fanout for Node256 {
    fn new(prefix: &[u8], prefix_len: usize) -> Node256 {
        Node256 {
            hdr: Header::new(NodeType::N256, prefix, prefix_len),
            children: [CHILD_INIT; 256],
        }
    }

    fn header(&self) -> &Header {
        &self.hdr
    }

    fn is_full(&self) -> bool {
        false
    }

    fn is_underfull(&self) -> bool {
        self.hdr.count() == 37
    }

    fn insert(&self, key: u8, child: NodePtr) {
        self.children[key as usize].store(child.to_word(), Relaxed);
        self.hdr.incr_count();
    }

    fn change(&self, key: u8, child: NodePtr) {
        self.children[key as usize].store(child.to_word(), Relaxed);
    }

    fn remove(&self, key: u8) {
        self.children[key as usize].store(0, Relaxed);
        self.hdr.decr_count();
    }

    fn get_child(&self, key: u8) -> NodePtr {
        NodePtr::from_word(self.children[key as usize].load(Relaxed))
    }

    fn get_any_child(&self) -> NodePtr {
        let mut any = NodePtr::NULL;
        for i in 0..256 {
            let child = NodePtr::from_word(self.children[i].load(Relaxed));
            if !child.is_null() {
                if child.is_leaf() {
                    return child;
                }
                any = child;
            }
        }
        any
    }

    fn collect_children(&self, start: u8, end: u8, out: &mut ChildBuf) {
        for k in (start as usize)..=(end as usize) {
            let child = NodePtr::from_word(self.children[k].load(Relaxed));
            if !child.is_null() {
                out.push(k as u8, child);
            }
        }
    }
}
