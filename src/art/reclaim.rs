//! Module `reclaim` implement epoch-deferred memory reclamation for the
//! tree.
//!
//! Every thread operating on the tree registers once and gets a
//! [ThreadInfo], backed by a cache-line-aligned slot out of a fixed
//! array of [SLOT_LIMIT]. Each operation runs under a guard: on entry
//! the thread publishes the current global epoch into its slot, on exit
//! it parks the slot at `u64::MAX`. Nodes unlinked from the tree are
//! pushed, with their deleter, into the owning slot's deletion-list,
//! stamped with the global epoch. Once a list grows past the configured
//! threshold, guard-exit sweeps it, freeing every entry stamped before
//! the oldest epoch still published by any slot.
//!
//! The global epoch needs no dedicated ticker here, every 64th deferred
//! node bumps it, which is enough forward progress for the sweep.

use log::{debug, trace};

use std::{
    cell::{Cell, UnsafeCell},
    fmt, ptr, result,
    sync::{
        atomic::{
            AtomicU32, AtomicU64, AtomicUsize,
            Ordering::{Acquire, Relaxed, Release},
        },
        Arc,
    },
};

use crate::art::leaf::Leaf;
use crate::art::node::{drop_leaf_ptr, drop_node_ptr, Header};

/// Number of participant slots in a tree, fixed at construction.
pub const SLOT_LIMIT: usize = 1024;

/// Deferred entries per label-batch.
const BATCH_SIZE: usize = 32;

/// Deferred entries a slot accumulates before guard-exit attempts a
/// sweep.
pub const DEFAULT_GC_THRESHOLD: usize = 256;

type Deleter = unsafe fn(*mut u8);

unsafe fn noop_deleter(_: *mut u8) {}

struct Batch {
    epoch: u64,
    count: usize,
    entries: [(*mut u8, Deleter); BATCH_SIZE],
    next: Option<Box<Batch>>,
}

impl Batch {
    fn new() -> Batch {
        Batch {
            epoch: 0,
            count: 0,
            entries: [(ptr::null_mut(), noop_deleter as Deleter); BATCH_SIZE],
            next: None,
        }
    }
}

// Singly linked chain of label-batches, owned by exactly one slot.
// Exhausted batches are recycled through the free list.
struct DeletionList {
    head: Option<Box<Batch>>,
    free: Option<Box<Batch>>,
    count: usize,
    threshold_counter: usize,
    added: u64,
    freed: u64,
}

impl DeletionList {
    fn new() -> DeletionList {
        DeletionList {
            head: None,
            free: None,
            count: 0,
            threshold_counter: 0,
            added: 0,
            freed: 0,
        }
    }

    fn add(&mut self, ptr: *mut u8, deleter: Deleter, epoch: u64) {
        self.count += 1;
        self.threshold_counter += 1;
        self.added += 1;

        let full = match &self.head {
            Some(batch) => batch.count == BATCH_SIZE,
            None => true,
        };
        if full {
            let mut batch = match self.free.take() {
                Some(mut batch) => {
                    self.free = batch.next.take();
                    batch.count = 0;
                    batch
                }
                None => Box::new(Batch::new()),
            };
            batch.next = self.head.take();
            self.head = Some(batch);
        }
        if let Some(batch) = self.head.as_mut() {
            batch.entries[batch.count] = (ptr, deleter);
            batch.count += 1;
            batch.epoch = epoch;
        }
    }

    // free batches stamped before `oldest`, return entries freed.
    fn sweep(&mut self, oldest: u64) -> usize {
        let mut kept: Vec<Box<Batch>> = vec![];
        let mut freed = 0;

        let mut chain = self.head.take();
        while let Some(mut batch) = chain {
            chain = batch.next.take();
            if batch.epoch < oldest {
                for &(ptr, deleter) in batch.entries.iter().take(batch.count) {
                    unsafe { deleter(ptr) };
                }
                freed += batch.count;
                batch.next = self.free.take();
                self.free = Some(batch);
            } else {
                kept.push(batch);
            }
        }
        for mut batch in kept.into_iter().rev() {
            batch.next = self.head.take();
            self.head = Some(batch);
        }

        self.count -= freed;
        self.freed += freed as u64;
        freed
    }

    // teardown, free everything regardless of epoch.
    fn drain(&mut self) -> usize {
        self.sweep(u64::MAX)
    }
}

impl Drop for DeletionList {
    fn drop(&mut self) {
        self.drain();
    }
}

#[repr(align(128))]
struct Slot {
    local_epoch: AtomicU64,
    cleanup_latch: AtomicU32,
    list: UnsafeCell<DeletionList>,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            local_epoch: AtomicU64::new(u64::MAX),
            cleanup_latch: AtomicU32::new(0),
            list: UnsafeCell::new(DeletionList::new()),
        }
    }
}

// The deletion-list inside a slot is mutated only by the slot's owner
// thread, through its unique ThreadInfo, with the cleanup latch
// excluding re-entry. Other threads only touch the atomics.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

pub(crate) struct Reclaim {
    current_epoch: AtomicU64,
    gc_threshold: AtomicUsize,
    n_slots: AtomicUsize,
    slots: Box<[Slot]>,
}

impl Reclaim {
    pub fn new() -> Reclaim {
        let mut slots = Vec::with_capacity(SLOT_LIMIT);
        slots.resize_with(SLOT_LIMIT, Slot::new);
        Reclaim {
            current_epoch: AtomicU64::new(0),
            gc_threshold: AtomicUsize::new(DEFAULT_GC_THRESHOLD),
            n_slots: AtomicUsize::new(0),
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn set_gc_threshold(&self, threshold: usize) {
        self.gc_threshold.store(threshold, Relaxed);
    }

    pub fn register_slot(&self) -> usize {
        let slot = self.n_slots.fetch_add(1, Relaxed);
        if slot >= self.slots.len() {
            panic!("thread-info slots exhausted, limit {}", self.slots.len());
        }
        trace!(target: "cart", "registered thread-info slot {}", slot);
        slot
    }

    pub fn enter(&self, slot: usize) {
        let epoch = self.current_epoch.load(Relaxed);
        self.slots[slot].local_epoch.store(epoch, Release);
    }

    pub fn park(&self, slot: usize) {
        self.slots[slot].local_epoch.store(u64::MAX, Release);
    }

    pub fn mark(&self, slot: usize, ptr: *mut u8, deleter: Deleter) {
        let epoch = self.current_epoch.load(Relaxed);
        let list = unsafe { &mut *self.slots[slot].list.get() };
        list.add(ptr, deleter, epoch);
    }

    pub fn exit_and_clean(&self, slot: usize) {
        let s = &self.slots[slot];
        s.local_epoch.store(u64::MAX, Release);

        let list = unsafe { &mut *s.list.get() };
        if (list.threshold_counter & (64 - 1)) == 1 {
            self.current_epoch.fetch_add(1, Relaxed);
        }

        let threshold = self.gc_threshold.load(Relaxed);
        if list.threshold_counter > threshold && s.cleanup_latch.load(Relaxed) == 0 {
            if s.cleanup_latch.compare_exchange(0, 1, Acquire, Relaxed).is_ok() {
                if list.count > 0 {
                    let oldest = self.oldest_epoch();
                    let freed = list.sweep(oldest);
                    if freed > 0 {
                        debug!(
                            target: "cart",
                            "slot-{} reclaimed {} deferred, {} pending",
                            slot, freed, list.count
                        );
                    }
                }
                list.threshold_counter = 0;
                s.cleanup_latch.store(0, Release);
            }
        }
    }

    // smallest epoch still published by any registered slot.
    fn oldest_epoch(&self) -> u64 {
        let n = self.n_slots.load(Relaxed).min(self.slots.len());
        let mut oldest = u64::MAX;
        for slot in self.slots.iter().take(n) {
            let epoch = slot.local_epoch.load(Acquire);
            if epoch < oldest {
                oldest = epoch;
            }
        }
        oldest
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Relaxed)
    }

    // teardown path, caller guarantees quiescence.
    pub fn drain_all(&self) {
        let n = self.n_slots.load(Relaxed).min(self.slots.len());
        for slot in self.slots.iter().take(n) {
            let list = unsafe { &mut *slot.list.get() };
            list.drain();
        }
    }

    pub fn to_stats(&self) -> Stats {
        let n = self.n_slots.load(Relaxed).min(self.slots.len());
        let mut stats = Stats {
            n_slots: n,
            current_epoch: self.current_epoch.load(Relaxed),
            ..Stats::default()
        };
        for slot in self.slots.iter().take(n) {
            let list = unsafe { &*slot.list.get() };
            stats.n_added += list.added;
            stats.n_freed += list.freed;
            stats.n_pending += list.count;
        }
        stats
    }
}

/// Per-thread registration handle for a tree instance.
///
/// Obtained from [Index::thread_info][crate::art::Index::thread_info],
/// passed by reference into every tree operation. Move it to the thread
/// that operates the tree, it cannot be shared or cloned.
pub struct ThreadInfo {
    reclaim: Arc<Reclaim>,
    slot: usize,
    // deletion-list mutation is tied to this handle, keep it !Sync.
    _own: Cell<()>,
}

impl ThreadInfo {
    pub(crate) fn new(reclaim: Arc<Reclaim>) -> ThreadInfo {
        let slot = reclaim.register_slot();
        ThreadInfo {
            reclaim,
            slot,
            _own: Cell::new(()),
        }
    }

    pub(crate) fn is_of(&self, reclaim: &Arc<Reclaim>) -> bool {
        Arc::ptr_eq(&self.reclaim, reclaim)
    }

    pub(crate) fn defer_free_node(&self, hdr: *mut Header) {
        self.reclaim.mark(self.slot, hdr as *mut u8, drop_node_ptr);
    }

    pub(crate) fn defer_free_leaf(&self, leaf: *mut Leaf) {
        self.reclaim.mark(self.slot, leaf as *mut u8, drop_leaf_ptr);
    }
}

impl Drop for ThreadInfo {
    fn drop(&mut self) {
        self.reclaim.park(self.slot);
    }
}

/// Epoch guard over one tree operation.
pub(crate) struct Guard<'a> {
    ti: &'a ThreadInfo,
    cleanup: bool,
}

impl<'a> Guard<'a> {
    /// Guard for mutating operations, exit runs deferred cleanup.
    pub fn new(ti: &'a ThreadInfo) -> Guard<'a> {
        ti.reclaim.enter(ti.slot);
        Guard { ti, cleanup: true }
    }

    /// Guard for read-only operations, exit just parks the slot.
    pub fn read_only(ti: &'a ThreadInfo) -> Guard<'a> {
        ti.reclaim.enter(ti.slot);
        Guard { ti, cleanup: false }
    }
}

impl<'a> Drop for Guard<'a> {
    fn drop(&mut self) {
        if self.cleanup {
            self.ti.reclaim.exit_and_clean(self.ti.slot);
        } else {
            self.ti.reclaim.park(self.ti.slot);
        }
    }
}

/// Statistic type, to capture deferred-reclamation metrics.
#[derive(Default)]
pub struct Stats {
    /// Number of registered thread-info slots.
    pub n_slots: usize,
    /// Global reclamation epoch.
    pub current_epoch: u64,
    /// Total nodes deferred so far, across slots.
    pub n_added: u64,
    /// Total nodes freed so far, across slots.
    pub n_freed: u64,
    /// Nodes deferred but not yet freed.
    pub n_pending: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            concat!(
                "{{ n_slots = {}, current_epoch = {}, n_added = {}, ",
                "n_freed = {}, n_pending = {} }}",
            ),
            self.n_slots, self.current_epoch, self.n_added, self.n_freed, self.n_pending,
        )
    }
}

#[cfg(test)]
#[path = "reclaim_test.rs"]
mod reclaim_test;
