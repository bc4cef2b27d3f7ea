// Module ``art`` implement a concurrent, path-compressed radix tree
// mapping binary keys to sets of tuple-identifiers.
//
// [Index] type allow concurrent read and write access at API level.
// Readers never block, every node carries a version word that readers
// sample before and re-validate after consulting the node, a mismatch
// restarts the whole operation from the root. Writers upgrade sampled
// versions to exclusive write locks, parent before child, and publish
// structural changes by swapping child pointers before releasing the
// locks. Replaced nodes are marked obsolete and handed to the epoch
// machinery in [reclaim][crate::art::reclaim], they are freed once no
// in-flight operation can still hold a reference.
//
// Keys of one index instance are expected to be fixed-length, the way
// the hosting database encodes its composite index keys. Lookups with
// keys of foreign length are answered correctly, mutations assume the
// invariant.

use std::{cmp, ptr, sync::Arc, thread};

use crate::art::key::ArtKey;
use crate::art::leaf::Leaf;
use crate::art::node::{
    self, Checked, Child, ChildBuf, Fanout, Header, NodePtr, Restart, MAX_PREFIX_LEN,
};
use crate::art::node256::Node256;
use crate::art::node4::Node4;
use crate::art::reclaim::{Guard, Reclaim, ThreadInfo};
use crate::art::stats::Stats;
use crate::{Error, Result};

/// Callback resolving a tuple-identifier to its full key.
///
/// Supplied by the caller at construction time and invoked whenever
/// optimistic prefix handling needs a representative key for a
/// descendant. Must be deterministic, repeated calls with the same
/// identifier fill equal keys, and the identifier must be live, which
/// the epoch protection guarantees.
pub type LoadKey = Box<dyn Fn(u64, &mut ArtKey) + Send + Sync>;

// spin for the first couple of conflicts, then get out of the way.
fn backoff(retries: &mut usize) {
    *retries += 1;
    if *retries > 3 {
        thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}

enum CheckPrefix {
    Match,
    NoMatch,
    Optimistic,
}

enum Pessimistic {
    Match,
    NoMatch {
        non_matching: u8,
        remaining: [u8; MAX_PREFIX_LEN],
    },
}

enum PrefixCompare {
    Smaller,
    Equal,
    Bigger,
}

enum PrefixEquals {
    BothMatch,
    Contained,
    NoMatch,
}

/// Index type for a concurrent adaptive radix tree.
///
/// Every thread touching the index registers once through
/// [Index::thread_info] and passes its handle into each operation. All
/// operations are infallible at the API boundary, conflicts between
/// concurrent operations are resolved internally by restarting.
pub struct Index {
    name: String,
    root: *mut Header,
    load_key: LoadKey,
    reclaim: Arc<Reclaim>,
}

unsafe impl Send for Index {}
unsafe impl Sync for Index {}

impl Drop for Index {
    fn drop(&mut self) {
        unsafe { node::free_subtree(self.root) };
        self.reclaim.drain_all();
    }
}

impl Index {
    pub fn new<F>(name: &str, load_key: F) -> Index
    where
        F: 'static + Fn(u64, &mut ArtKey) + Send + Sync,
    {
        let root = Box::new(Node256::new(&[], 0));
        Index {
            name: name.to_string(),
            root: Box::into_raw(root) as *mut Header,
            load_key: Box::new(load_key),
            reclaim: Arc::new(Reclaim::new()),
        }
    }

    /// Deferred nodes a thread accumulates before attempting a
    /// reclamation sweep.
    pub fn set_gc_threshold(&self, threshold: usize) -> &Index {
        self.reclaim.set_gc_threshold(threshold);
        self
    }

    /// Register the calling thread with this index. The handle must be
    /// passed into every subsequent operation from that thread.
    pub fn thread_info(&self) -> ThreadInfo {
        ThreadInfo::new(Arc::clone(&self.reclaim))
    }

    /// Return name of this index instance.
    #[inline]
    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    pub fn to_stats(&self) -> Result<Stats> {
        let mut stats = Stats::new(&self.name);
        stats.reclaim = self.reclaim.to_stats();
        Ok(stats)
    }

    pub fn close(self) -> Result<()> {
        Ok(())
    }

    pub fn purge(self) -> Result<()> {
        Ok(())
    }

    fn check_thread_info(&self, ti: &ThreadInfo) {
        if !ti.is_of(&self.reclaim) {
            panic!("thread-info from another index! call the programmer");
        }
    }

    fn check_key(&self, tid: u64, key: &ArtKey) -> bool {
        let mut kt = ArtKey::default();
        (self.load_key)(tid, &mut kt);
        kt == *key
    }
}

impl Index {
    /// Return the set of tuple-identifiers stored at `key`, empty when
    /// the key is absent.
    pub fn lookup(&self, key: &ArtKey, ti: &ThreadInfo) -> Vec<u64> {
        self.check_thread_info(ti);
        let _guard = Guard::read_only(ti);

        let mut out = vec![];
        let mut retries = 0;
        loop {
            out.clear();
            match unsafe { self.do_lookup(key, &mut out) } {
                Ok(_) => break out,
                Err(Restart) => backoff(&mut retries),
            }
        }
    }

    /// Insert `(key, tid)` into the index. Return false iff the exact
    /// `(key, tid)` pair is already present.
    pub fn insert(&self, key: &ArtKey, tid: u64, ti: &ThreadInfo) -> bool {
        self.check_thread_info(ti);
        let _guard = Guard::new(ti);

        let mut retries = 0;
        loop {
            match unsafe { self.do_put(key, tid, None, ti) } {
                Ok(done) => break done,
                Err(Restart) => backoff(&mut retries),
            }
        }
    }

    /// Insert `(key, tid)` unless `predicate` approves of any identifier
    /// already stored at `key`, or the exact pair exists. Return whether
    /// the pair was inserted. This is the primary/unique-index insert.
    pub fn conditional_insert<P>(
        &self,
        key: &ArtKey,
        tid: u64,
        predicate: P,
        ti: &ThreadInfo,
    ) -> bool
    where
        P: Fn(u64) -> bool,
    {
        self.check_thread_info(ti);
        let _guard = Guard::new(ti);

        let mut retries = 0;
        loop {
            match unsafe { self.do_put(key, tid, Some(&predicate), ti) } {
                Ok(done) => break done,
                Err(Restart) => backoff(&mut retries),
            }
        }
    }

    /// Remove `(key, tid)` from the index. Return false iff the pair
    /// was not present.
    pub fn remove(&self, key: &ArtKey, tid: u64, ti: &ThreadInfo) -> bool {
        self.check_thread_info(ti);
        let _guard = Guard::new(ti);

        let mut retries = 0;
        loop {
            match unsafe { self.do_remove(key, tid, ti) } {
                Ok(done) => break done,
                Err(Restart) => backoff(&mut retries),
            }
        }
    }

    /// Return upto `soft_max` tuple-identifiers whose keys fall within
    /// `[start, end]`, both bounds inclusive, in ascending key order.
    /// When more results remain, also return the first key not covered,
    /// pass it as the next `start` to resume the scan.
    ///
    /// All identifiers of one key are emitted together, the result may
    /// exceed `soft_max` by one key's worth of identifiers.
    pub fn lookup_range(
        &self,
        start: &ArtKey,
        end: &ArtKey,
        soft_max: usize,
        ti: &ThreadInfo,
    ) -> (Vec<u64>, Option<ArtKey>) {
        self.check_thread_info(ti);

        for i in 0..cmp::min(start.len(), end.len()) {
            if start[i] > end[i] {
                return (vec![], None);
            } else if start[i] < end[i] {
                break;
            }
        }

        let _guard = Guard::new(ti);

        let mut retries = 0;
        loop {
            let mut scanner = Scanner {
                index: self,
                start,
                end,
                soft_max,
                out: vec![],
                to_continue: None,
            };
            match unsafe { scanner.scan() } {
                Ok(_) => {
                    let continue_key = scanner.to_continue.map(|tid| {
                        let mut key = ArtKey::default();
                        (self.load_key)(tid, &mut key);
                        key
                    });
                    break (scanner.out, continue_key);
                }
                Err(Restart) => backoff(&mut retries),
            }
        }
    }

    /// Return every tuple-identifier in the index, in key order.
    pub fn full_scan(&self, ti: &ThreadInfo) -> Vec<u64> {
        self.check_thread_info(ti);
        let _guard = Guard::new(ti);

        let mut out = vec![];
        let mut retries = 0;
        loop {
            out.clear();
            match unsafe { self.do_scan_all(self.root, &mut out) } {
                Ok(_) => break out,
                Err(Restart) => backoff(&mut retries),
            }
        }
    }

    /// Walk the tree checking structural invariants, return counting
    /// statistics. Call only on a quiescent index, the walk does not
    /// take part in the locking protocol.
    pub fn validate(&self) -> Result<Stats> {
        let mut stats = Stats::new(&self.name);
        unsafe { self.validate_node(self.root, true, &mut stats)? };
        stats.reclaim = self.reclaim.to_stats();
        Ok(stats)
    }
}

impl Index {
    unsafe fn do_lookup(&self, key: &ArtKey, out: &mut Vec<u64>) -> Checked<()> {
        let mut level = 0_usize;
        let mut optimistic = false;

        let mut node = self.root;
        let mut version = (*node).vlock.read_lock()?;
        loop {
            match check_prefix(&*node, key, &mut level) {
                CheckPrefix::NoMatch => {
                    (*node).vlock.read_unlock(version)?;
                    return Ok(());
                }
                CheckPrefix::Optimistic => optimistic = true,
                CheckPrefix::Match => (),
            }
            if key.len() <= level {
                (*node).vlock.read_unlock(version)?;
                return Ok(());
            }

            let parent = node;
            let child = node::get_child(parent, key[level]);
            (*parent).vlock.check(version)?;

            match child.decode() {
                None => return Ok(()),
                Some(Child::Inlined(tid)) => {
                    (*parent).vlock.read_unlock(version)?;
                    if (level < key.len() - 1 || optimistic) && !self.check_key(tid, key) {
                        return Ok(());
                    }
                    out.push(tid);
                    return Ok(());
                }
                Some(Child::External(leaf)) => {
                    (*parent).vlock.read_unlock(version)?;
                    (*leaf).snapshot(out)?;
                    if (level < key.len() - 1 || optimistic) && !out.is_empty() {
                        if !self.check_key(out[0], key) {
                            out.clear();
                        }
                    }
                    return Ok(());
                }
                Some(Child::Inner(next)) => {
                    level += 1;
                    let next_version = (*next).vlock.read_lock()?;
                    (*parent).vlock.read_unlock(version)?;
                    node = next;
                    version = next_version;
                }
            }
        }
    }

    unsafe fn do_put(
        &self,
        key: &ArtKey,
        tid: u64,
        predicate: Option<&dyn Fn(u64) -> bool>,
        ti: &ThreadInfo,
    ) -> Checked<bool> {
        let mut node: *mut Header = ptr::null_mut();
        let mut next = self.root;
        let mut node_key = 0_u8;
        let mut parent_version = 0_u64;
        let mut level = 0_usize;

        loop {
            let parent = node;
            let parent_key = node_key;
            node = next;
            let version = (*node).vlock.read_lock()?;

            let mut next_level = level;
            match self.check_prefix_pessimistic(node, key, &mut next_level)? {
                Pessimistic::NoMatch {
                    non_matching,
                    remaining,
                } => {
                    // split, a fresh Node4 takes the matched part of the
                    // prefix, `node` keeps the tail past the divergence.
                    if parent.is_null() {
                        panic!("prefix mismatch at root! call the programmer");
                    }
                    (*parent).vlock.upgrade(parent_version)?;
                    if (*node).vlock.upgrade(version).is_err() {
                        (*parent).vlock.write_unlock();
                        return Err(Restart);
                    }

                    let mut prefix = [0_u8; MAX_PREFIX_LEN];
                    let matched = next_level - level;
                    for (i, slot) in prefix.iter_mut().enumerate().take(cmp::min(matched, MAX_PREFIX_LEN)) {
                        *slot = (*node).prefix_byte(i);
                    }
                    let new4 = Box::new(Node4::new(&prefix, matched));
                    new4.insert(key[next_level], NodePtr::from_inlined(tid));
                    new4.insert(non_matching, NodePtr::from_inner(node));
                    let new4 = Box::into_raw(new4) as *mut Header;

                    node::change(parent, parent_key, NodePtr::from_inner(new4));
                    (*parent).vlock.write_unlock();

                    let prefix_len = (*node).prefix_len();
                    (*node).set_prefix(&remaining, prefix_len - (matched + 1));
                    (*node).vlock.write_unlock();
                    return Ok(true);
                }
                Pessimistic::Match => (),
            }
            level = next_level;
            node_key = key[level];
            let child = node::get_child(node, node_key);
            (*node).vlock.check(version)?;

            match child.decode() {
                None => {
                    let parent = match parent.is_null() {
                        true => None,
                        false => Some((parent, parent_version, parent_key)),
                    };
                    let leaf = NodePtr::from_inlined(tid);
                    node::insert_and_unlock(node, version, parent, node_key, leaf, ti)?;
                    return Ok(true);
                }
                Some(Child::Inner(inner)) => {
                    if !parent.is_null() {
                        (*parent).vlock.read_unlock(parent_version)?;
                    }
                    level += 1;
                    parent_version = version;
                    next = inner;
                }
                Some(leaf) => {
                    if !parent.is_null() {
                        (*parent).vlock.read_unlock(parent_version)?;
                    }
                    (*node).vlock.upgrade(version)?;
                    return Ok(self.put_at_leaf(node, child, leaf, key, tid, predicate, level, ti));
                }
            }
        }
    }

    // `node` is write-locked, its child at key[level] is a leaf. Add
    // `tid` when the keys fully match, else split the slot under a
    // fresh Node4. Unlocks `node` on every path.
    #[allow(clippy::too_many_arguments)]
    unsafe fn put_at_leaf(
        &self,
        node: *mut Header,
        child_ptr: NodePtr,
        child: Child,
        key: &ArtKey,
        tid: u64,
        predicate: Option<&dyn Fn(u64) -> bool>,
        level: usize,
        ti: &ThreadInfo,
    ) -> bool {
        let node_key = key[level];
        let existing_tid = match child {
            Child::Inlined(t) => t,
            Child::External(leaf) => (*leaf).first(),
            Child::Inner(_) => unreachable!(),
        };
        let mut existing_key = ArtKey::default();
        (self.load_key)(existing_tid, &mut existing_key);

        if existing_key == *key {
            let existing = match child {
                Child::Inlined(t) => vec![t],
                Child::External(leaf) => (*leaf).to_vec(),
                Child::Inner(_) => unreachable!(),
            };
            let duplicate = existing.iter().any(|t| *t == tid);
            let rejected = match predicate {
                Some(predicate) => existing.iter().any(|t| predicate(*t)),
                None => false,
            };
            if duplicate || rejected {
                (*node).vlock.write_unlock();
                return false;
            }
            match child {
                Child::Inlined(t0) => {
                    let leaf = Box::into_raw(Leaf::pair(t0, tid));
                    node::change(node, node_key, NodePtr::from_external(leaf));
                }
                Child::External(leaf) => {
                    if (*leaf).is_full() {
                        let grown = Box::into_raw((*leaf).grow_with(tid));
                        node::change(node, node_key, NodePtr::from_external(grown));
                        (*leaf).retire();
                        ti.defer_free_leaf(leaf);
                    } else {
                        (*leaf).append(tid);
                    }
                }
                Child::Inner(_) => unreachable!(),
            }
            (*node).vlock.write_unlock();
            return true;
        }

        // keys diverge past this slot, split under a fresh Node4.
        let level = level + 1;
        let mut matched = 0;
        while level + matched < key.len()
            && level + matched < existing_key.len()
            && existing_key[level + matched] == key[level + matched]
        {
            matched += 1;
        }

        let prefix = &key.as_bytes()[level..level + cmp::min(matched, MAX_PREFIX_LEN)];
        let n4 = Box::new(Node4::new(prefix, matched));
        n4.insert(key[level + matched], NodePtr::from_inlined(tid));
        n4.insert(existing_key[level + matched], child_ptr);
        let n4 = Box::into_raw(n4) as *mut Header;

        node::change(node, node_key, NodePtr::from_inner(n4));
        (*node).vlock.write_unlock();
        true
    }

    unsafe fn do_remove(&self, key: &ArtKey, tid: u64, ti: &ThreadInfo) -> Checked<bool> {
        let mut node: *mut Header = ptr::null_mut();
        let mut next = self.root;
        let mut node_key = 0_u8;
        let mut parent_version = 0_u64;
        let mut level = 0_usize;
        let mut optimistic = false;

        loop {
            let parent = node;
            let parent_key = node_key;
            node = next;
            let version = (*node).vlock.read_lock()?;

            match check_prefix(&*node, key, &mut level) {
                CheckPrefix::NoMatch => {
                    (*node).vlock.read_unlock(version)?;
                    return Ok(false);
                }
                CheckPrefix::Optimistic => optimistic = true,
                CheckPrefix::Match => (),
            }
            if key.len() <= level {
                (*node).vlock.read_unlock(version)?;
                return Ok(false);
            }
            node_key = key[level];
            let child = node::get_child(node, node_key);
            (*node).vlock.check(version)?;

            match child.decode() {
                None => {
                    (*node).vlock.read_unlock(version)?;
                    return Ok(false);
                }
                Some(Child::Inner(inner)) => {
                    level += 1;
                    parent_version = version;
                    next = inner;
                }
                Some(Child::Inlined(t0)) => {
                    (*node).vlock.upgrade(version)?;
                    let foreign =
                        (level < key.len() - 1 || optimistic) && !self.check_key(t0, key);
                    if foreign || t0 != tid {
                        (*node).vlock.write_unlock();
                        return Ok(false);
                    }
                    let parent = match parent.is_null() {
                        true => None,
                        false => Some((parent, parent_version, parent_key)),
                    };
                    self.remove_child(node, parent, node_key, ti)?;
                    return Ok(true);
                }
                Some(Child::External(leaf)) => {
                    (*node).vlock.upgrade(version)?;
                    let foreign = (level < key.len() - 1 || optimistic)
                        && !self.check_key((*leaf).first(), key);
                    if foreign || !(*leaf).contains(tid) {
                        (*node).vlock.write_unlock();
                        return Ok(false);
                    }
                    if (*leaf).count() > 2 {
                        (*leaf).remove(tid);
                    } else {
                        // demote the survivor back to inlined form.
                        let survivor = (*leaf).other_of(tid);
                        node::change(node, node_key, NodePtr::from_inlined(survivor));
                        (*leaf).retire();
                        ti.defer_free_leaf(leaf);
                    }
                    (*node).vlock.write_unlock();
                    return Ok(true);
                }
            }
        }
    }

    // `node` is write-locked and loses its child at `node_key`. A node
    // left with a single child is merged into the grand-parent slot,
    // larger variants shrink. Unlocks everything on every path.
    unsafe fn remove_child(
        &self,
        node: *mut Header,
        parent: Option<(*mut Header, u64, u8)>,
        node_key: u8,
        ti: &ThreadInfo,
    ) -> Checked<()> {
        match parent {
            Some((parent, parent_version, parent_key)) if (*node).count() == 2 => {
                if (*parent).vlock.upgrade(parent_version).is_err() {
                    (*node).vlock.write_unlock();
                    return Err(Restart);
                }
                let (second, second_key) = node::get_second_child(node, node_key);
                match second.decode() {
                    Some(Child::Inner(survivor)) => {
                        // merging an inner survivor rewrites its prefix,
                        // lock it or give the whole operation up.
                        if (*survivor).vlock.write_lock().is_err() {
                            (*node).vlock.write_unlock();
                            (*parent).vlock.write_unlock();
                            return Err(Restart);
                        }
                        node::change(parent, parent_key, second);
                        (*parent).vlock.write_unlock();

                        (*survivor).add_prefix_before(&*node, second_key);
                        (*survivor).vlock.write_unlock();

                        (*node).vlock.write_unlock_obsolete();
                        ti.defer_free_node(node);
                    }
                    Some(_) => {
                        node::change(parent, parent_key, second);
                        (*parent).vlock.write_unlock();

                        (*node).vlock.write_unlock_obsolete();
                        ti.defer_free_node(node);
                    }
                    None => panic!("two-children node missing second child! call the programmer"),
                }
                Ok(())
            }
            parent => node::remove_locked_and_unlock(node, parent, node_key, ti),
        }
    }

    unsafe fn do_scan_all(&self, hdr: *mut Header, out: &mut Vec<u64>) -> Checked<()> {
        let mut buf = ChildBuf::default();
        node::collect_children(hdr, 0, 255, &mut buf)?;
        for (_, child) in buf.as_slice() {
            match child.decode() {
                Some(Child::Inner(inner)) => self.do_scan_all(inner, out)?,
                Some(Child::Inlined(tid)) => out.push(tid),
                Some(Child::External(leaf)) => (*leaf).snapshot(out)?,
                None => (),
            }
        }
        Ok(())
    }

    unsafe fn validate_node(
        &self,
        hdr: *mut Header,
        is_root: bool,
        stats: &mut Stats,
    ) -> Result<()> {
        use crate::art::node::NodeType;

        match (*hdr).node_type() {
            NodeType::N4 => stats.n_node4 += 1,
            NodeType::N16 => stats.n_node16 += 1,
            NodeType::N48 => stats.n_node48 += 1,
            NodeType::N256 => stats.n_node256 += 1,
        }
        let count = (*hdr).count();
        if !is_root && count < 2 {
            return err_at!(Fatal, msg: "inner node with {} children", count);
        }

        let mut buf = ChildBuf::default();
        node::collect_children_raw(hdr, &mut buf);
        if buf.count != count {
            return err_at!(Fatal, msg: "node count {} vs {} children", count, buf.count);
        }
        for (_, child) in buf.as_slice() {
            match child.decode() {
                Some(Child::Inner(inner)) => self.validate_node(inner, false, stats)?,
                Some(Child::Inlined(_)) => {
                    stats.n_inlined += 1;
                    stats.n_tids += 1;
                }
                Some(Child::External(leaf)) => {
                    let n = (*leaf).count();
                    if n < 2 {
                        return err_at!(Fatal, msg: "external leaf with {} tids", n);
                    }
                    stats.n_external += 1;
                    stats.n_tids += n;
                }
                None => return err_at!(Fatal, msg: "null child collected"),
            }
        }
        Ok(())
    }
}

// Prefix checks. The optimistic variant only consults the inline bytes,
// the others resolve the tail of an over-long prefix through a
// representative descendant key.

fn check_prefix(hdr: &Header, key: &ArtKey, level: &mut usize) -> CheckPrefix {
    if hdr.has_prefix() {
        let prefix_len = hdr.prefix_len();
        if key.len() <= *level + prefix_len {
            return CheckPrefix::NoMatch;
        }
        for i in 0..cmp::min(prefix_len, MAX_PREFIX_LEN) {
            if hdr.prefix_byte(i) != key[*level] {
                return CheckPrefix::NoMatch;
            }
            *level += 1;
        }
        if prefix_len > MAX_PREFIX_LEN {
            *level += prefix_len - MAX_PREFIX_LEN;
            return CheckPrefix::Optimistic;
        }
    }
    CheckPrefix::Match
}

impl Index {
    unsafe fn check_prefix_pessimistic(
        &self,
        hdr: *const Header,
        key: &ArtKey,
        level: &mut usize,
    ) -> Checked<Pessimistic> {
        if !(*hdr).has_prefix() {
            return Ok(Pessimistic::Match);
        }
        let prev_level = *level;
        let prefix_len = (*hdr).prefix_len();
        let mut kt = ArtKey::default();
        for i in 0..prefix_len {
            if i == MAX_PREFIX_LEN {
                let tid = node::get_any_child_tid(hdr)?;
                (self.load_key)(tid, &mut kt);
            }
            let current = if i >= MAX_PREFIX_LEN {
                kt[*level]
            } else {
                (*hdr).prefix_byte(i)
            };
            if current != key[*level] {
                let mut remaining = [0_u8; MAX_PREFIX_LEN];
                if prefix_len > MAX_PREFIX_LEN {
                    if i < MAX_PREFIX_LEN {
                        let tid = node::get_any_child_tid(hdr)?;
                        (self.load_key)(tid, &mut kt);
                    }
                    let n = cmp::min(prefix_len - (*level - prev_level) - 1, MAX_PREFIX_LEN);
                    for (j, slot) in remaining.iter_mut().enumerate().take(n) {
                        *slot = kt[*level + 1 + j];
                    }
                } else {
                    for (j, slot) in remaining.iter_mut().enumerate().take(prefix_len - i - 1) {
                        *slot = (*hdr).prefix_byte(i + 1 + j);
                    }
                }
                return Ok(Pessimistic::NoMatch {
                    non_matching: current,
                    remaining,
                });
            }
            *level += 1;
        }
        Ok(Pessimistic::Match)
    }

    unsafe fn check_prefix_compare(
        &self,
        hdr: *const Header,
        key: &ArtKey,
        fill: u8,
        level: &mut usize,
    ) -> Checked<PrefixCompare> {
        if !(*hdr).has_prefix() {
            return Ok(PrefixCompare::Equal);
        }
        let prefix_len = (*hdr).prefix_len();
        let mut kt = ArtKey::default();
        for i in 0..prefix_len {
            if i == MAX_PREFIX_LEN {
                let tid = node::get_any_child_tid(hdr)?;
                (self.load_key)(tid, &mut kt);
            }
            let key_byte = if key.len() > *level { key[*level] } else { fill };
            let current = if i >= MAX_PREFIX_LEN {
                kt[*level]
            } else {
                (*hdr).prefix_byte(i)
            };
            if current < key_byte {
                return Ok(PrefixCompare::Smaller);
            } else if current > key_byte {
                return Ok(PrefixCompare::Bigger);
            }
            *level += 1;
        }
        Ok(PrefixCompare::Equal)
    }

    unsafe fn check_prefix_equals(
        &self,
        hdr: *const Header,
        level: &mut usize,
        start: &ArtKey,
        end: &ArtKey,
    ) -> Checked<PrefixEquals> {
        if !(*hdr).has_prefix() {
            return Ok(PrefixEquals::BothMatch);
        }
        let prefix_len = (*hdr).prefix_len();
        let mut kt = ArtKey::default();
        for i in 0..prefix_len {
            if i == MAX_PREFIX_LEN {
                let tid = node::get_any_child_tid(hdr)?;
                (self.load_key)(tid, &mut kt);
            }
            let start_byte = if start.len() > *level { start[*level] } else { 0 };
            let end_byte = if end.len() > *level { end[*level] } else { 255 };
            let current = if i >= MAX_PREFIX_LEN {
                kt[*level]
            } else {
                (*hdr).prefix_byte(i)
            };
            if current > start_byte && current < end_byte {
                return Ok(PrefixEquals::Contained);
            } else if current < start_byte || current > end_byte {
                return Ok(PrefixEquals::NoMatch);
            }
            *level += 1;
        }
        Ok(PrefixEquals::BothMatch)
    }
}

// One bounded range scan. Restarting throws the whole scanner away,
// partial results are never observable.
struct Scanner<'a> {
    index: &'a Index,
    start: &'a ArtKey,
    end: &'a ArtKey,
    soft_max: usize,
    out: Vec<u64>,
    to_continue: Option<u64>,
}

// child re-resolved through its parent after a conflict.
enum Reread {
    Gone,
    Leaf(NodePtr),
    Inner(*mut Header),
}

impl<'a> Scanner<'a> {
    unsafe fn scan(&mut self) -> Checked<()> {
        let mut node: *mut Header = ptr::null_mut();
        let mut next = self.index.root;
        let mut version = 0_u64;
        let mut level = 0_usize;

        loop {
            let parent = node;
            let parent_version = version;
            node = next;
            version = (*node).vlock.read_lock()?;

            let mut lvl = level;
            let eq = self
                .index
                .check_prefix_equals(node, &mut lvl, self.start, self.end)?;
            if !parent.is_null() {
                (*parent).vlock.read_unlock(parent_version)?;
            }
            (*node).vlock.read_unlock(version)?;

            match eq {
                PrefixEquals::NoMatch => return Ok(()),
                PrefixEquals::Contained => return self.copy_node(NodePtr::from_inner(node)),
                PrefixEquals::BothMatch => {
                    let start_byte = if self.start.len() > lvl { self.start[lvl] } else { 0 };
                    let end_byte = if self.end.len() > lvl { self.end[lvl] } else { 255 };

                    if start_byte != end_byte {
                        let mut buf = ChildBuf::default();
                        let v = node::collect_children(node, start_byte, end_byte, &mut buf)?;
                        for (k, child) in buf.as_slice() {
                            if *k == start_byte {
                                self.find_start(*child, *k, lvl + 1, node, v)?;
                            } else if *k == end_byte {
                                self.find_end(*child, *k, lvl + 1, node, v)?;
                            } else {
                                self.copy_node(*child)?;
                            }
                            if self.to_continue.is_some() {
                                break;
                            }
                        }
                        return Ok(());
                    }

                    let child = node::get_child(node, start_byte);
                    (*node).vlock.read_unlock(version)?;
                    match child.decode() {
                        None => return Ok(()),
                        Some(Child::Inner(inner)) => {
                            level = lvl + 1;
                            next = inner;
                        }
                        Some(_) => return self.copy_leaf_checked(child, true, true),
                    }
                }
            }
        }
    }

    // emit every identifier under `child`, already known to be within
    // the scan bounds.
    unsafe fn copy_node(&mut self, child: NodePtr) -> Checked<()> {
        if self.to_continue.is_some() {
            return Ok(());
        }
        match child.decode() {
            None => Ok(()),
            Some(Child::Inlined(tid)) => {
                self.emit(&[tid]);
                Ok(())
            }
            Some(Child::External(leaf)) => {
                let mut tids = vec![];
                (*leaf).snapshot(&mut tids)?;
                self.emit(&tids);
                Ok(())
            }
            Some(Child::Inner(inner)) => {
                let mut buf = ChildBuf::default();
                node::collect_children(inner, 0, 255, &mut buf)?;
                for (_, child) in buf.as_slice() {
                    self.copy_node(*child)?;
                    if self.to_continue.is_some() {
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    // leaves on the start/end spines share only a path prefix with the
    // bounds, the unrepresented key tail still needs checking.
    unsafe fn copy_leaf_checked(
        &mut self,
        child: NodePtr,
        check_start: bool,
        check_end: bool,
    ) -> Checked<()> {
        if self.to_continue.is_some() {
            return Ok(());
        }
        let tids = match child.decode() {
            Some(Child::Inlined(tid)) => vec![tid],
            Some(Child::External(leaf)) => {
                let mut tids = vec![];
                (*leaf).snapshot(&mut tids)?;
                tids
            }
            _ => return Ok(()),
        };
        if tids.is_empty() {
            return Ok(());
        }
        let mut key = ArtKey::default();
        (self.index.load_key)(tids[0], &mut key);
        if check_start && key < *self.start {
            return Ok(());
        }
        if check_end && key > *self.end {
            return Ok(());
        }
        self.emit(&tids);
        Ok(())
    }

    // all identifiers of one key are emitted together, when the budget
    // is already spent the key becomes the continue point instead.
    fn emit(&mut self, tids: &[u64]) {
        if tids.is_empty() {
            return;
        }
        if self.out.len() >= self.soft_max {
            self.to_continue = Some(tids[0]);
            return;
        }
        self.out.extend_from_slice(tids);
    }

    unsafe fn reread_child(
        &self,
        parent: *mut Header,
        parent_version: &mut u64,
        node_key: u8,
    ) -> Checked<Reread> {
        loop {
            let version = (*parent).vlock.read_lock_spin()?;
            let child = node::get_child(parent, node_key);
            if (*parent).vlock.read_unlock(version).is_err() {
                continue;
            }
            *parent_version = version;
            break Ok(match child.decode() {
                None => Reread::Gone,
                Some(Child::Inner(inner)) => Reread::Inner(inner),
                Some(_) => Reread::Leaf(child),
            });
        }
    }

    // descend the left spine of the scan so emission begins at the
    // first key >= start.
    unsafe fn find_start(
        &mut self,
        child: NodePtr,
        node_key: u8,
        level: usize,
        parent: *mut Header,
        parent_version: u64,
    ) -> Checked<()> {
        let mut node = match child.decode() {
            None => return Ok(()),
            Some(Child::Inner(inner)) => inner,
            Some(_) => return self.copy_leaf_checked(child, true, false),
        };
        let mut parent_version = parent_version;

        let (compare, lvl) = loop {
            let mut lvl = level;
            let view = match (*node).vlock.read_lock_spin() {
                Ok(version) => self
                    .index
                    .check_prefix_compare(node, self.start, 0, &mut lvl)
                    .map(|compare| (compare, version)),
                Err(restart) => Err(restart),
            };
            let (compare, version) = match view {
                Ok(view) => view,
                Err(_) => {
                    // node raced away, re-resolve through the parent.
                    match self.reread_child(parent, &mut parent_version, node_key)? {
                        Reread::Gone => return Ok(()),
                        Reread::Leaf(child) => return self.copy_leaf_checked(child, true, false),
                        Reread::Inner(inner) => {
                            node = inner;
                            continue;
                        }
                    }
                }
            };
            if (*parent).vlock.read_unlock(parent_version).is_err() {
                match self.reread_child(parent, &mut parent_version, node_key)? {
                    Reread::Gone => return Ok(()),
                    Reread::Leaf(child) => return self.copy_leaf_checked(child, true, false),
                    Reread::Inner(inner) => {
                        node = inner;
                        continue;
                    }
                }
            }
            if (*node).vlock.read_unlock(version).is_err() {
                continue;
            }
            break (compare, lvl);
        };

        match compare {
            PrefixCompare::Bigger => self.copy_node(NodePtr::from_inner(node)),
            PrefixCompare::Smaller => Ok(()),
            PrefixCompare::Equal => {
                let start_byte = if self.start.len() > lvl { self.start[lvl] } else { 0 };
                let mut buf = ChildBuf::default();
                let version = node::collect_children(node, start_byte, 255, &mut buf)?;
                for (k, child) in buf.as_slice() {
                    if *k == start_byte {
                        self.find_start(*child, *k, lvl + 1, node, version)?;
                    } else {
                        self.copy_node(*child)?;
                    }
                    if self.to_continue.is_some() {
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    // descend the right spine of the scan so emission ends at the last
    // key <= end.
    unsafe fn find_end(
        &mut self,
        child: NodePtr,
        node_key: u8,
        level: usize,
        parent: *mut Header,
        parent_version: u64,
    ) -> Checked<()> {
        let mut node = match child.decode() {
            None => return Ok(()),
            Some(Child::Inner(inner)) => inner,
            Some(_) => return self.copy_leaf_checked(child, false, true),
        };
        let mut parent_version = parent_version;

        let (compare, lvl) = loop {
            let mut lvl = level;
            let view = match (*node).vlock.read_lock_spin() {
                Ok(version) => self
                    .index
                    .check_prefix_compare(node, self.end, 255, &mut lvl)
                    .map(|compare| (compare, version)),
                Err(restart) => Err(restart),
            };
            let (compare, version) = match view {
                Ok(view) => view,
                Err(_) => {
                    match self.reread_child(parent, &mut parent_version, node_key)? {
                        Reread::Gone => return Ok(()),
                        Reread::Leaf(child) => return self.copy_leaf_checked(child, false, true),
                        Reread::Inner(inner) => {
                            node = inner;
                            continue;
                        }
                    }
                }
            };
            if (*parent).vlock.read_unlock(parent_version).is_err() {
                match self.reread_child(parent, &mut parent_version, node_key)? {
                    Reread::Gone => return Ok(()),
                    Reread::Leaf(child) => return self.copy_leaf_checked(child, false, true),
                    Reread::Inner(inner) => {
                        node = inner;
                        continue;
                    }
                }
            }
            if (*node).vlock.read_unlock(version).is_err() {
                continue;
            }
            break (compare, lvl);
        };

        match compare {
            PrefixCompare::Smaller => self.copy_node(NodePtr::from_inner(node)),
            PrefixCompare::Bigger => Ok(()),
            PrefixCompare::Equal => {
                let end_byte = if self.end.len() > lvl { self.end[lvl] } else { 255 };
                let mut buf = ChildBuf::default();
                let version = node::collect_children(node, 0, end_byte, &mut buf)?;
                for (k, child) in buf.as_slice() {
                    if *k == end_byte {
                        self.find_end(*child, *k, lvl + 1, node, version)?;
                    } else {
                        self.copy_node(*child)?;
                    }
                    if self.to_continue.is_some() {
                        break;
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[path = "index_test.rs"]
mod index_test;
