//! Module `node` implement the inner-node machinery for the adaptive
//! radix tree.
//!
//! Every inner node embeds a [Header] as its first field. Nodes are
//! handled through type-erased `*mut Header` pointers and dispatched on
//! the node-type packed inside the version word. The version word packs,
//!
//! ```text
//! +----------+----------------------+----------+------------+
//! |  2b type |     60b version      | 1b lock  | 1b obsolete|
//! +----------+----------------------+----------+------------+
//! ```
//!
//! Refer to [Vlock] for the optimistic locking protocol over this word.
//!
//! Child slots hold a tagged 64-bit word, the top two bits decide the
//! flavor, refer to [NodePtr].

use std::sync::atomic::{
    AtomicU16, AtomicU32, AtomicU64, AtomicU8,
    Ordering::{Acquire, Relaxed, Release},
};
use std::{cmp, result};

use crate::art::leaf::Leaf;
use crate::art::node16::Node16;
use crate::art::node256::Node256;
use crate::art::node4::Node4;
use crate::art::node48::Node48;
use crate::art::reclaim::ThreadInfo;

/// Maximum number of prefix bytes stored inline within a node. A node's
/// true prefix length can exceed this, in which case the tail bytes are
/// recovered from a descendant key, the optimistic-prefix case.
pub const MAX_PREFIX_LEN: usize = 11;

/// Sentinel signalling that an optimistic read raced with a writer and
/// the whole operation must retry from the root.
#[derive(Debug)]
pub(crate) struct Restart;

/// Return type for every version-validated step.
pub(crate) type Checked<T> = result::Result<T, Restart>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum NodeType {
    N4 = 0,
    N16 = 1,
    N48 = 2,
    N256 = 3,
}

/// Version-lock word, one per node and per external leaf.
///
/// * `read_lock` samples the word, failing on locked or obsolete.
/// * `check`/`read_unlock` re-validate a sampled version.
/// * `upgrade` CASes lock-bit on, from a sampled version.
/// * `write_unlock` adds 0b10, clearing lock and bumping version.
/// * `write_unlock_obsolete` adds 0b11, additionally marking the word
///   obsolete so every concurrent optimistic reader restarts.
pub(crate) struct Vlock {
    word: AtomicU64,
}

impl Vlock {
    // version 1, unlocked, not obsolete.
    const SEED: u64 = 0b100;

    pub fn new(t: NodeType) -> Vlock {
        let word = AtomicU64::new(Self::SEED | ((t as u64) << 62));
        Vlock { word }
    }

    /// Version word for external leaves, type bits left zero.
    pub fn plain() -> Vlock {
        Vlock {
            word: AtomicU64::new(Self::SEED),
        }
    }

    #[inline]
    pub fn node_type(&self) -> NodeType {
        match self.word.load(Relaxed) >> 62 {
            0 => NodeType::N4,
            1 => NodeType::N16,
            2 => NodeType::N48,
            _ => NodeType::N256,
        }
    }

    #[inline]
    pub fn is_locked(word: u64) -> bool {
        (word & 0b10) == 0b10
    }

    #[inline]
    pub fn is_obsolete(word: u64) -> bool {
        (word & 0b01) == 0b01
    }

    pub fn read_lock(&self) -> Checked<u64> {
        let word = self.word.load(Acquire);
        if Self::is_locked(word) || Self::is_obsolete(word) {
            Err(Restart)
        } else {
            Ok(word)
        }
    }

    /// Like [Vlock::read_lock], but spin through transient writer locks.
    /// Fails only when the node went obsolete.
    pub fn read_lock_spin(&self) -> Checked<u64> {
        loop {
            let word = self.word.load(Acquire);
            if Self::is_obsolete(word) {
                break Err(Restart);
            } else if Self::is_locked(word) {
                std::hint::spin_loop();
            } else {
                break Ok(word);
            }
        }
    }

    #[inline]
    pub fn check(&self, version: u64) -> Checked<()> {
        if self.word.load(Acquire) == version {
            Ok(())
        } else {
            Err(Restart)
        }
    }

    #[inline]
    pub fn read_unlock(&self, version: u64) -> Checked<()> {
        self.check(version)
    }

    pub fn upgrade(&self, version: u64) -> Checked<u64> {
        match self
            .word
            .compare_exchange(version, version + 0b10, Acquire, Relaxed)
        {
            Ok(_) => Ok(version + 0b10),
            Err(_) => Err(Restart),
        }
    }

    pub fn write_lock(&self) -> Checked<u64> {
        let version = self.read_lock()?;
        self.upgrade(version)
    }

    /// Take the write lock without contending. Valid only when every
    /// other writer is already excluded, e.g. a leaf whose owning node
    /// is write-locked by the caller.
    #[inline]
    pub fn write_lock_plain(&self) {
        self.word.fetch_add(0b10, Acquire);
    }

    #[inline]
    pub fn write_unlock(&self) {
        self.word.fetch_add(0b10, Release);
    }

    #[inline]
    pub fn write_unlock_obsolete(&self) {
        self.word.fetch_add(0b11, Release);
    }
}

/// Common header embedded, as first field, in every inner node variant.
///
/// `count` and the prefix fields are read by optimistic readers racing
/// with a locked writer, hence they are relaxed atomics. A torn view is
/// harmless, the version re-check throws such readers out.
#[repr(C)]
pub(crate) struct Header {
    pub(crate) vlock: Vlock,
    prefix_len: AtomicU32,
    count: AtomicU16,
    prefix: [AtomicU8; MAX_PREFIX_LEN],
}

impl Header {
    pub fn new(t: NodeType, prefix: &[u8], prefix_len: usize) -> Header {
        let hdr = Header {
            vlock: Vlock::new(t),
            prefix_len: AtomicU32::new(0),
            count: AtomicU16::new(0),
            prefix: Default::default(),
        };
        hdr.set_prefix(prefix, prefix_len);
        hdr
    }

    #[inline]
    pub fn node_type(&self) -> NodeType {
        self.vlock.node_type()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Relaxed) as usize
    }

    #[inline]
    pub fn incr_count(&self) {
        self.count.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn decr_count(&self) {
        self.count.fetch_sub(1, Relaxed);
    }

    #[inline]
    pub fn prefix_len(&self) -> usize {
        self.prefix_len.load(Relaxed) as usize
    }

    #[inline]
    pub fn has_prefix(&self) -> bool {
        self.prefix_len() > 0
    }

    #[inline]
    pub fn prefix_byte(&self, i: usize) -> u8 {
        self.prefix[i].load(Relaxed)
    }

    /// Store `length` as the true prefix length and upto
    /// [MAX_PREFIX_LEN] leading bytes of `prefix` inline.
    pub fn set_prefix(&self, prefix: &[u8], length: usize) {
        let n = cmp::min(length, MAX_PREFIX_LEN);
        for (i, byte) in prefix.iter().take(n).enumerate() {
            self.prefix[i].store(*byte, Relaxed);
        }
        self.prefix_len.store(length as u32, Relaxed);
    }

    /// Prepend `node`'s prefix and the pivot byte `key` to this node's
    /// prefix. Used when a single surviving child is merged into its
    /// grand-parent slot. Both nodes must be write-locked by the caller.
    pub fn add_prefix_before(&self, node: &Header, key: u8) {
        let node_len = node.prefix_len();
        let self_len = self.prefix_len();

        let copy_count = cmp::min(MAX_PREFIX_LEN, node_len + 1);
        let keep_count = cmp::min(self_len, MAX_PREFIX_LEN - copy_count);

        let mut scratch = [0_u8; MAX_PREFIX_LEN];
        for (i, slot) in scratch.iter_mut().enumerate().take(keep_count) {
            *slot = self.prefix_byte(i);
        }
        for i in (0..keep_count).rev() {
            self.prefix[copy_count + i].store(scratch[i], Relaxed);
        }
        for i in 0..cmp::min(copy_count, node_len) {
            self.prefix[i].store(node.prefix_byte(i), Relaxed);
        }
        if node_len < MAX_PREFIX_LEN {
            self.prefix[copy_count - 1].store(key, Relaxed);
        }
        self.prefix_len
            .store((self_len + node_len + 1) as u32, Relaxed);
    }
}

/// Tagged child word. Top two bits decide the flavor:
///
/// * `0b00` pointer to an inner node, `*mut Header`.
/// * `0b01`, `0b10` inlined tuple-identifier, bit-62 of the identifier
///   rides in the low tag bit so 63-bit identifiers survive tagging.
/// * `0b11` pointer to an external multi-value [Leaf].
///
/// Heap pointers are naturally aligned and well below 2^62 on the
/// platforms this package targets, the tag bits are free.
#[derive(Clone, Copy, PartialEq)]
pub(crate) struct NodePtr {
    word: u64,
}

const TAG_MASK: u64 = 0b11 << 62;
const PAYLOAD_MASK: u64 = !TAG_MASK;

/// Decoded form of a non-null [NodePtr].
#[derive(Clone, Copy)]
pub(crate) enum Child {
    Inner(*mut Header),
    Inlined(u64),
    External(*mut Leaf),
}

impl NodePtr {
    pub const NULL: NodePtr = NodePtr { word: 0 };

    pub fn from_inner(hdr: *mut Header) -> NodePtr {
        let word = hdr as u64;
        assert!(word & TAG_MASK == 0, "unmappable node address {:x}", word);
        NodePtr { word }
    }

    pub fn from_inlined(tid: u64) -> NodePtr {
        assert!(tid >> 63 == 0, "tid {:x} has bit-63 set, cannot inline", tid);
        let tag = 0b01 + ((tid >> 62) & 1);
        NodePtr {
            word: (tag << 62) | (tid & PAYLOAD_MASK),
        }
    }

    pub fn from_external(leaf: *mut Leaf) -> NodePtr {
        let word = leaf as u64;
        assert!(word & TAG_MASK == 0, "unmappable leaf address {:x}", word);
        NodePtr {
            word: word | TAG_MASK,
        }
    }

    #[inline]
    pub fn from_word(word: u64) -> NodePtr {
        NodePtr { word }
    }

    #[inline]
    pub fn to_word(self) -> u64 {
        self.word
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.word == 0
    }

    pub fn decode(self) -> Option<Child> {
        if self.is_null() {
            return None;
        }
        let child = match self.word >> 62 {
            0b00 => Child::Inner(self.word as *mut Header),
            0b11 => Child::External((self.word & PAYLOAD_MASK) as *mut Leaf),
            tag => Child::Inlined((self.word & ((1 << 62) - 1)) | ((tag - 1) << 62)),
        };
        Some(child)
    }

    #[inline]
    pub fn is_leaf(self) -> bool {
        !self.is_null() && (self.word & TAG_MASK) != 0
    }
}

/// Fan-out behavior common to the four inner node variants. All methods
/// that mutate require the node's write lock to be held by the caller.
pub(crate) trait Fanout {
    fn new(prefix: &[u8], prefix_len: usize) -> Self;

    fn header(&self) -> &Header;

    fn is_full(&self) -> bool;

    fn is_underfull(&self) -> bool;

    fn insert(&self, key: u8, child: NodePtr);

    fn change(&self, key: u8, child: NodePtr);

    fn remove(&self, key: u8);

    fn get_child(&self, key: u8) -> NodePtr;

    /// Return some child, preferring leaves, used to resolve a
    /// representative key for optimistic prefixes.
    fn get_any_child(&self) -> NodePtr;

    /// Collect `(key-byte, child)` pairs for key bytes within
    /// `[start, end]`, in ascending key order.
    fn collect_children(&self, start: u8, end: u8, out: &mut ChildBuf);
}

/// Children collected from one node, stack allocated, at most 256.
pub(crate) struct ChildBuf {
    pub items: [(u8, NodePtr); 256],
    pub count: usize,
}

impl Default for ChildBuf {
    fn default() -> ChildBuf {
        ChildBuf {
            items: [(0, NodePtr::NULL); 256],
            count: 0,
        }
    }
}

impl ChildBuf {
    #[inline]
    pub fn push(&mut self, key: u8, child: NodePtr) {
        self.items[self.count] = (key, child);
        self.count += 1;
    }

    #[inline]
    pub fn as_slice(&self) -> &[(u8, NodePtr)] {
        &self.items[..self.count]
    }
}

macro_rules! dispatch {
    ($hdr:expr, $n:ident, $body:expr) => {
        match (*$hdr).node_type() {
            NodeType::N4 => {
                let $n = &*($hdr as *const Node4);
                $body
            }
            NodeType::N16 => {
                let $n = &*($hdr as *const Node16);
                $body
            }
            NodeType::N48 => {
                let $n = &*($hdr as *const Node48);
                $body
            }
            NodeType::N256 => {
                let $n = &*($hdr as *const Node256);
                $body
            }
        }
    };
}

pub(crate) unsafe fn get_child(hdr: *const Header, key: u8) -> NodePtr {
    dispatch!(hdr, n, n.get_child(key))
}

pub(crate) unsafe fn change(hdr: *const Header, key: u8, child: NodePtr) {
    dispatch!(hdr, n, n.change(key, child))
}

pub(crate) unsafe fn get_any_child(hdr: *const Header) -> NodePtr {
    dispatch!(hdr, n, n.get_any_child())
}

pub(crate) unsafe fn collect_children(
    hdr: *const Header,
    start: u8,
    end: u8,
    out: &mut ChildBuf,
) -> Checked<u64> {
    // loops through transient writers, gives up only on obsolete nodes.
    loop {
        let version = (*hdr).vlock.read_lock_spin()?;
        out.count = 0;
        dispatch!(hdr, n, n.collect_children(start, end, out));
        if (*hdr).vlock.check(version).is_ok() {
            break Ok(version);
        }
    }
}

/// Collect children without version validation, for teardown and
/// quiescent tree walks only.
pub(crate) unsafe fn collect_children_raw(hdr: *const Header, out: &mut ChildBuf) {
    dispatch!(hdr, n, n.collect_children(0, 255, out))
}

/// Return the other child of a two-children [Node4], along with its key
/// byte. Collapse only happens on Node4, larger variants shrink first.
pub(crate) unsafe fn get_second_child(hdr: *const Header, key: u8) -> (NodePtr, u8) {
    match (*hdr).node_type() {
        NodeType::N4 => (*(hdr as *const Node4)).get_second_child(key),
        _ => panic!("collapse on {:?} node! call the programmer", (*hdr).node_type()),
    }
}

/// Descend from `hdr` to any leaf and return one of its tuple
/// identifiers, version-checked at every hop.
pub(crate) unsafe fn get_any_child_tid(hdr: *const Header) -> Checked<u64> {
    let mut node = hdr;
    loop {
        let version = (*node).vlock.read_lock()?;
        let next = get_any_child(node);
        (*node).vlock.read_unlock(version)?;

        match next.decode() {
            Some(Child::Inner(child)) => node = child,
            Some(Child::Inlined(tid)) => break Ok(tid),
            Some(Child::External(leaf)) => break (*leaf).any_tid(),
            None => break Err(Restart),
        }
    }
}

/// Insert `(key, child)` into `node`, growing it to the next bigger
/// variant when full. Caller holds read versions on `node` and its
/// parent, both are released, or upgraded and released, by this call.
pub(crate) unsafe fn insert_and_unlock(
    node: *mut Header,
    version: u64,
    parent: Option<(*mut Header, u64, u8)>,
    key: u8,
    child: NodePtr,
    ti: &ThreadInfo,
) -> Checked<()> {
    match (*node).node_type() {
        NodeType::N4 => {
            insert_grow::<Node4, Node16>(node as *mut Node4, version, parent, key, child, ti)
        }
        NodeType::N16 => {
            insert_grow::<Node16, Node48>(node as *mut Node16, version, parent, key, child, ti)
        }
        NodeType::N48 => {
            insert_grow::<Node48, Node256>(node as *mut Node48, version, parent, key, child, ti)
        }
        NodeType::N256 => {
            insert_grow::<Node256, Node256>(node as *mut Node256, version, parent, key, child, ti)
        }
    }
}

unsafe fn insert_grow<C, B>(
    node: *mut C,
    version: u64,
    parent: Option<(*mut Header, u64, u8)>,
    key: u8,
    child: NodePtr,
    ti: &ThreadInfo,
) -> Checked<()>
where
    C: Fanout,
    B: Fanout,
{
    let n = &*node;
    if !n.is_full() {
        if let Some((p, pv, _)) = parent {
            (*p).vlock.read_unlock(pv)?;
        }
        n.header().vlock.upgrade(version)?;
        n.insert(key, child);
        n.header().vlock.write_unlock();
        return Ok(());
    }

    // grow to the bigger variant, parent and node both write-locked.
    let (p, pv, kp) = match parent {
        Some(parent) => parent,
        None => panic!("root node grown beyond 256! call the programmer"),
    };
    (*p).vlock.upgrade(pv)?;
    if n.header().vlock.upgrade(version).is_err() {
        (*p).vlock.write_unlock();
        return Err(Restart);
    }

    let mut prefix = [0_u8; MAX_PREFIX_LEN];
    let prefix_len = n.header().prefix_len();
    for (i, slot) in prefix.iter_mut().enumerate().take(cmp::min(prefix_len, MAX_PREFIX_LEN)) {
        *slot = n.header().prefix_byte(i);
    }
    let big = Box::new(B::new(&prefix, prefix_len));
    copy_children(n.header() as *const Header, &*big);
    big.insert(key, child);
    let big = Box::into_raw(big) as *mut Header;

    change(p, kp, NodePtr::from_inner(big));

    n.header().vlock.write_unlock_obsolete();
    ti.defer_free_node(n.header() as *const Header as *mut Header);
    (*p).vlock.write_unlock();
    Ok(())
}

/// Remove the child at `key` from `node`, shrinking to the next smaller
/// variant when underfull. `node` is already write-locked, parent holds
/// a read version. All locks are released before returning.
pub(crate) unsafe fn remove_locked_and_unlock(
    node: *mut Header,
    parent: Option<(*mut Header, u64, u8)>,
    key: u8,
    ti: &ThreadInfo,
) -> Checked<()> {
    match (*node).node_type() {
        NodeType::N4 => {
            remove_shrink::<Node4, Node4>(node as *mut Node4, parent, key, ti)
        }
        NodeType::N16 => {
            remove_shrink::<Node16, Node4>(node as *mut Node16, parent, key, ti)
        }
        NodeType::N48 => {
            remove_shrink::<Node48, Node16>(node as *mut Node48, parent, key, ti)
        }
        NodeType::N256 => {
            remove_shrink::<Node256, Node48>(node as *mut Node256, parent, key, ti)
        }
    }
}

unsafe fn remove_shrink<C, S>(
    node: *mut C,
    parent: Option<(*mut Header, u64, u8)>,
    key: u8,
    ti: &ThreadInfo,
) -> Checked<()>
where
    C: Fanout,
    S: Fanout,
{
    let n = &*node;
    if !n.is_underfull() || parent.is_none() {
        if let Some((p, pv, _)) = parent {
            if (*p).vlock.read_unlock(pv).is_err() {
                n.header().vlock.write_unlock();
                return Err(Restart);
            }
        }
        n.remove(key);
        n.header().vlock.write_unlock();
        return Ok(());
    }

    let (p, pv, kp) = match parent {
        Some(parent) => parent,
        None => unreachable!(),
    };
    if (*p).vlock.upgrade(pv).is_err() {
        n.header().vlock.write_unlock();
        return Err(Restart);
    }

    let mut prefix = [0_u8; MAX_PREFIX_LEN];
    let prefix_len = n.header().prefix_len();
    for (i, slot) in prefix.iter_mut().enumerate().take(cmp::min(prefix_len, MAX_PREFIX_LEN)) {
        *slot = n.header().prefix_byte(i);
    }
    let small = Box::new(S::new(&prefix, prefix_len));
    copy_children(n.header() as *const Header, &*small);
    small.remove(key);
    let small = Box::into_raw(small) as *mut Header;

    change(p, kp, NodePtr::from_inner(small));

    n.header().vlock.write_unlock_obsolete();
    ti.defer_free_node(n.header() as *const Header as *mut Header);
    (*p).vlock.write_unlock();
    Ok(())
}

unsafe fn copy_children<D: Fanout>(src: *const Header, dst: &D) {
    let mut buf = ChildBuf::default();
    collect_children_raw(src, &mut buf);
    for (key, child) in buf.as_slice() {
        dst.insert(*key, *child);
    }
}

/// Free `hdr` and, recursively, everything under it. Only called on
/// teardown when no other thread holds a reference into the tree.
pub(crate) unsafe fn free_subtree(hdr: *mut Header) {
    let mut buf = ChildBuf::default();
    collect_children_raw(hdr, &mut buf);
    for (_, child) in buf.as_slice() {
        match child.decode() {
            Some(Child::Inner(inner)) => free_subtree(inner),
            Some(Child::External(leaf)) => drop(Box::from_raw(leaf)),
            Some(Child::Inlined(_)) | None => (),
        }
    }
    free_node(hdr);
}

pub(crate) unsafe fn free_node(hdr: *mut Header) {
    match (*hdr).node_type() {
        NodeType::N4 => drop(Box::from_raw(hdr as *mut Node4)),
        NodeType::N16 => drop(Box::from_raw(hdr as *mut Node16)),
        NodeType::N48 => drop(Box::from_raw(hdr as *mut Node48)),
        NodeType::N256 => drop(Box::from_raw(hdr as *mut Node256)),
    }
}

/// Deleter installed in deletion-lists for inner nodes.
pub(crate) unsafe fn drop_node_ptr(ptr: *mut u8) {
    free_node(ptr as *mut Header)
}

/// Deleter installed in deletion-lists for external leaves.
pub(crate) unsafe fn drop_leaf_ptr(ptr: *mut u8) {
    drop(Box::from_raw(ptr as *mut Leaf))
}

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;
