//! Fan-out variant holding upto 48 children, indirected through a
//! 256-entry byte-to-slot index. Empty index entries hold the sentinel
//! [EMPTY_MARKER].

use std::sync::atomic::{
    AtomicU64, AtomicU8,
    Ordering::Relaxed,
};

use crate::art::node::{Fanout, Header, NodePtr, NodeType, ChildBuf};

pub(crate) const EMPTY_MARKER: u8 = 48;

#[repr(C)]
pub(crate) struct Node48 {
    hdr: Header,
    child_index: [AtomicU8; 256],
    children: [AtomicU64; 48],
}

#[allow(clippy::declare_interior_mutable_const)]
const INDEX_INIT: AtomicU8 = AtomicU8::new(EMPTY_MARKER);
#[allow(clippy::declare_interior_mutable_const)]
const CHILD_INIT: AtomicU64 = AtomicU64::new(0);

impl Fanout for Node48 {
    fn new(prefix: &[u8], prefix_len: usize) -> Node48 {
        Node48 {
            hdr: Header::new(NodeType::N48, prefix, prefix_len),
            child_index: [INDEX_INIT; 256],
            children: [CHILD_INIT; 48],
        }
    }

    fn header(&self) -> &Header {
        &self.hdr
    }

    fn is_full(&self) -> bool {
        self.hdr.count() == 48
    }

    fn is_underfull(&self) -> bool {
        self.hdr.count() == 12
    }

    fn insert(&self, key: u8, child: NodePtr) {
        let mut pos = self.hdr.count();
        if self.children[pos].load(Relaxed) != 0 {
            pos = 0;
            while self.children[pos].load(Relaxed) != 0 {
                pos += 1;
            }
        }
        self.children[pos].store(child.to_word(), Relaxed);
        self.child_index[key as usize].store(pos as u8, Relaxed);
        self.hdr.incr_count();
    }

    fn change(&self, key: u8, child: NodePtr) {
        let pos = self.child_index[key as usize].load(Relaxed);
        self.children[pos as usize].store(child.to_word(), Relaxed);
    }

    fn remove(&self, key: u8) {
        let pos = self.child_index[key as usize].load(Relaxed);
        self.children[pos as usize].store(0, Relaxed);
        self.child_index[key as usize].store(EMPTY_MARKER, Relaxed);
        self.hdr.decr_count();
    }

    fn get_child(&self, key: u8) -> NodePtr {
        match self.child_index[key as usize].load(Relaxed) {
            EMPTY_MARKER => NodePtr::NULL,
            pos => NodePtr::from_word(self.children[pos as usize].load(Relaxed)),
        }
    }

    fn get_any_child(&self) -> NodePtr {
        let mut any = NodePtr::NULL;
        for i in 0..256 {
            let pos = self.child_index[i].load(Relaxed);
            if pos != EMPTY_MARKER {
                let child = NodePtr::from_word(self.children[pos as usize].load(Relaxed));
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
            let pos = self.child_index[k].load(Relaxed);
            if pos != EMPTY_MARKER {
                out.push(
                    k as u8,
                    NodePtr::from_word(self.children[pos as usize].load(Relaxed)),
                );
            }
        }
    }
}
