//! Smallest fan-out variant, upto 4 children in parallel key/child
//! arrays, searched by linear scan.

use std::sync::atomic::{
    AtomicU64, AtomicU8,
    Ordering::Relaxed,
};

use crate::art::node::{Fanout, Header, NodePtr, NodeType, ChildBuf};

#[repr(C)]
pub(crate) struct Node4 {
    hdr: Header,
    keys: [AtomicU8; 4],
    children: [AtomicU64; 4],
}

impl Node4 {
    /// Return the other child of this two-children node, along with its
    /// key byte.
    pub fn get_second_child(&self, key: u8) -> (NodePtr, u8) {
        for i in 0..self.hdr.count() {
            let k = self.keys[i].load(Relaxed);
            if k != key {
                return (NodePtr::from_word(self.children[i].load(Relaxed)), k);
            }
        }
        (NodePtr::NULL, 0)
    }
}

impl Fanout for Node4 {
    fn new(prefix: &[u8], prefix_len: usize) -> Node4 {
        Node4 {
            hdr: Header::new(NodeType::N4, prefix, prefix_len),
            keys: Default::default(),
            children: Default::default(),
        }
    }

    fn header(&self) -> &Header {
        &self.hdr
    }

    fn is_full(&self) -> bool {
        self.hdr.count() == 4
    }

    fn is_underfull(&self) -> bool {
        false
    }

    fn insert(&self, key: u8, child: NodePtr) {
        let count = self.hdr.count();
        let mut pos = 0;
        while pos < count && self.keys[pos].load(Relaxed) < key {
            pos += 1;
        }
        for i in (pos..count).rev() {
            self.keys[i + 1].store(self.keys[i].load(Relaxed), Relaxed);
            self.children[i + 1].store(self.children[i].load(Relaxed), Relaxed);
        }
        self.keys[pos].store(key, Relaxed);
        self.children[pos].store(child.to_word(), Relaxed);
        self.hdr.incr_count();
    }

    fn change(&self, key: u8, child: NodePtr) {
        for i in 0..self.hdr.count() {
            if self.keys[i].load(Relaxed) == key {
                self.children[i].store(child.to_word(), Relaxed);
                return;
            }
        }
        panic!("change for missing key {}! call the programmer", key);
    }

    fn remove(&self, key: u8) {
        let count = self.hdr.count();
        for i in 0..count {
            if self.keys[i].load(Relaxed) == key {
                for j in i..(count - 1) {
                    self.keys[j].store(self.keys[j + 1].load(Relaxed), Relaxed);
                    self.children[j].store(self.children[j + 1].load(Relaxed), Relaxed);
                }
                self.hdr.decr_count();
                return;
            }
        }
    }

    fn get_child(&self, key: u8) -> NodePtr {
        for i in 0..self.hdr.count() {
            if self.keys[i].load(Relaxed) == key {
                return NodePtr::from_word(self.children[i].load(Relaxed));
            }
        }
        NodePtr::NULL
    }

    fn get_any_child(&self) -> NodePtr {
        let mut any = NodePtr::NULL;
        for i in 0..self.hdr.count() {
            let child = NodePtr::from_word(self.children[i].load(Relaxed));
            if child.is_leaf() {
                return child;
            }
            any = child;
        }
        any
    }

    fn collect_children(&self, start: u8, end: u8, out: &mut ChildBuf) {
        for i in 0..self.hdr.count() {
            let k = self.keys[i].load(Relaxed);
            if k >= start && k <= end {
                out.push(k, NodePtr::from_word(self.children[i].load(Relaxed)));
            }
        }
    }
}
