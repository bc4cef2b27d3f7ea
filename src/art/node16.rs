//! Fan-out variant holding upto 16 children.
//!
//! Key bytes are stored flipped, XOR 128, so that a signed comparison
//! over the stored array yields unsigned key order. The original design
//! runs a 16-lane SSE equality compare and picks the slot from the
//! trailing-zero count of the resulting bitfield, the same bitfield
//! search is done here portably.

use std::sync::atomic::{
    AtomicU64, AtomicU8,
    Ordering::Relaxed,
};

use crate::art::node::{Fanout, Header, NodePtr, NodeType, ChildBuf};

#[repr(C)]
pub(crate) struct Node16 {
    hdr: Header,
    keys: [AtomicU8; 16],
    children: [AtomicU64; 16],
}

// Flip the sign bit, enables signed comparison of unsigned values.
#[inline]
fn flip_sign(key: u8) -> u8 {
    key ^ 128
}

impl Node16 {
    fn child_pos(&self, key: u8) -> Option<usize> {
        let flipped = flip_sign(key);
        let count = self.hdr.count();
        let mut bitfield: u32 = 0;
        for i in 0..count {
            if self.keys[i].load(Relaxed) == flipped {
                bitfield |= 1 << i;
            }
        }
        if bitfield != 0 {
            Some(bitfield.trailing_zeros() as usize)
        } else {
            None
        }
    }
}

impl Fanout for Node16 {
    fn new(prefix: &[u8], prefix_len: usize) -> Node16 {
        Node16 {
            hdr: Header::new(NodeType::N16, prefix, prefix_len),
            keys: Default::default(),
            children: Default::default(),
        }
    }

    fn header(&self) -> &Header {
        &self.hdr
    }

    fn is_full(&self) -> bool {
        self.hdr.count() == 16
    }

    fn is_underfull(&self) -> bool {
        self.hdr.count() == 3
    }

    fn insert(&self, key: u8, child: NodePtr) {
        let flipped = flip_sign(key);
        let count = self.hdr.count();
        let mut pos = 0;
        while pos < count {
            let stored = self.keys[pos].load(Relaxed);
            if (flipped as i8) < (stored as i8) {
                break;
            }
            pos += 1;
        }
        for i in (pos..count).rev() {
            self.keys[i + 1].store(self.keys[i].load(Relaxed), Relaxed);
            self.children[i + 1].store(self.children[i].load(Relaxed), Relaxed);
        }
        self.keys[pos].store(flipped, Relaxed);
        self.children[pos].store(child.to_word(), Relaxed);
        self.hdr.incr_count();
    }

    fn change(&self, key: u8, child: NodePtr) {
        match self.child_pos(key) {
            Some(pos) => self.children[pos].store(child.to_word(), Relaxed),
            None => panic!("change for missing key {}! call the programmer", key),
        }
    }

    fn remove(&self, key: u8) {
        let pos = match self.child_pos(key) {
            Some(pos) => pos,
            None => return,
        };
        let count = self.hdr.count();
        for i in pos..(count - 1) {
            self.keys[i].store(self.keys[i + 1].load(Relaxed), Relaxed);
            self.children[i].store(self.children[i + 1].load(Relaxed), Relaxed);
        }
        self.hdr.decr_count();
    }

    fn get_child(&self, key: u8) -> NodePtr {
        match self.child_pos(key) {
            Some(pos) => NodePtr::from_word(self.children[pos].load(Relaxed)),
            None => NodePtr::NULL,
        }
    }

    fn get_any_child(&self) -> NodePtr {
        for i in 0..self.hdr.count() {
            let child = NodePtr::from_word(self.children[i].load(Relaxed));
            if child.is_leaf() {
                return child;
            }
        }
        NodePtr::from_word(self.children[0].load(Relaxed))
    }

    fn collect_children(&self, start: u8, end: u8, out: &mut ChildBuf) {
        for i in 0..self.hdr.count() {
            let k = flip_sign(self.keys[i].load(Relaxed));
            if k >= start && k <= end {
                out.push(k, NodePtr::from_word(self.children[i].load(Relaxed)));
            }
        }
    }
}
