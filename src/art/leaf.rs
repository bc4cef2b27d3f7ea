//! Module `leaf` implement the external multi-value leaf.
//!
//! A key holding a single tuple-identifier is inlined into its parent's
//! child slot, refer to [NodePtr][crate::art::node::NodePtr]. The second
//! identifier promotes the slot to an external `Leaf`, a version-locked,
//! fixed-capacity array of identifiers. Capacity starts at
//! [INITIAL_CAPACITY] and doubles by allocating a replacement leaf, the
//! old one is retired through the epoch machinery. When the count drops
//! back to one the leaf is demoted to inlined form, an external leaf
//! never holds fewer than two identifiers.

use std::sync::atomic::{
    AtomicU32, AtomicU64,
    Ordering::Relaxed,
};

use crate::art::node::{Checked, Vlock};

pub(crate) const INITIAL_CAPACITY: usize = 4;

pub(crate) struct Leaf {
    vlock: Vlock,
    count: AtomicU32,
    tids: Box<[AtomicU64]>,
}

impl Leaf {
    pub fn with_capacity(capacity: usize) -> Leaf {
        let mut tids = Vec::with_capacity(capacity);
        tids.resize_with(capacity, || AtomicU64::new(0));
        Leaf {
            vlock: Vlock::plain(),
            count: AtomicU32::new(0),
            tids: tids.into_boxed_slice(),
        }
    }

    /// Fresh leaf holding exactly two identifiers, the promotion of an
    /// inlined slot.
    pub fn pair(a: u64, b: u64) -> Box<Leaf> {
        let leaf = Leaf::with_capacity(INITIAL_CAPACITY);
        leaf.push_unpublished(a);
        leaf.push_unpublished(b);
        Box::new(leaf)
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Relaxed) as usize
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() == self.tids.len()
    }

    // append without version traffic, only valid before the leaf is
    // published into the tree.
    fn push_unpublished(&self, tid: u64) {
        let n = self.count();
        self.tids[n].store(tid, Relaxed);
        self.count.store((n + 1) as u32, Relaxed);
    }

    /// Copy this leaf's identifiers into `out`. On conflict with a
    /// writer `out` is truncated back to its incoming length.
    pub fn snapshot(&self, out: &mut Vec<u64>) -> Checked<()> {
        let base = out.len();
        let version = self.vlock.read_lock()?;
        let n = self.count();
        for i in 0..n {
            out.push(self.tids[i].load(Relaxed));
        }
        match self.vlock.read_unlock(version) {
            Ok(_) => Ok(()),
            Err(restart) => {
                out.truncate(base);
                Err(restart)
            }
        }
    }

    /// Version-checked read of one representative identifier.
    pub fn any_tid(&self) -> Checked<u64> {
        let version = self.vlock.read_lock()?;
        let tid = self.tids[0].load(Relaxed);
        self.vlock.read_unlock(version)?;
        Ok(tid)
    }

    // The methods below require the owning node's write lock, which
    // excludes every other leaf writer. The leaf's own version still
    // gets bumped so optimistic leaf readers notice the mutation.

    pub fn first(&self) -> u64 {
        self.tids[0].load(Relaxed)
    }

    pub fn contains(&self, tid: u64) -> bool {
        (0..self.count()).any(|i| self.tids[i].load(Relaxed) == tid)
    }

    /// Identifiers as a plain vector, for predicate evaluation.
    pub fn to_vec(&self) -> Vec<u64> {
        (0..self.count()).map(|i| self.tids[i].load(Relaxed)).collect()
    }

    /// Append `tid`, caller has checked capacity beforehand.
    pub fn append(&self, tid: u64) {
        self.vlock.write_lock_plain();
        let n = self.count();
        self.tids[n].store(tid, Relaxed);
        self.count.store((n + 1) as u32, Relaxed);
        self.vlock.write_unlock();
    }

    /// Remove `tid`. The last identifier takes its slot, order within a
    /// leaf is not meaningful.
    pub fn remove(&self, tid: u64) {
        self.vlock.write_lock_plain();
        let n = self.count();
        for i in 0..n {
            if self.tids[i].load(Relaxed) == tid {
                self.tids[i].store(self.tids[n - 1].load(Relaxed), Relaxed);
                self.count.store((n - 1) as u32, Relaxed);
                break;
            }
        }
        self.vlock.write_unlock();
    }

    /// For a two-identifier leaf, return the identifier other than
    /// `tid`, the survivor of a demotion.
    pub fn other_of(&self, tid: u64) -> u64 {
        if self.tids[0].load(Relaxed) == tid {
            self.tids[1].load(Relaxed)
        } else {
            self.tids[0].load(Relaxed)
        }
    }

    /// Build the replacement leaf at double capacity, holding this
    /// leaf's identifiers plus `tid`.
    pub fn grow_with(&self, tid: u64) -> Box<Leaf> {
        let grown = Leaf::with_capacity(self.tids.len() * 2);
        for i in 0..self.count() {
            grown.push_unpublished(self.tids[i].load(Relaxed));
        }
        grown.push_unpublished(tid);
        Box::new(grown)
    }

    /// Mark this leaf obsolete, every concurrent optimistic reader
    /// restarts. Done right before deferring the leaf for reclamation.
    pub fn retire(&self) {
        self.vlock.write_lock_plain();
        self.vlock.write_unlock_obsolete();
    }
}

#[cfg(test)]
#[path = "leaf_test.rs"]
mod leaf_test;
