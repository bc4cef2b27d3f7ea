//! Module `manager` implement the process-wide face of the epoch
//! machinery.

use log::debug;

use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicU32, AtomicU64,
            Ordering::{AcqRel, Acquire, Relaxed},
        },
        mpsc, Arc,
    },
    time,
};

use crate::epoch::{extract_epoch_id, pack_cid, LocalEpoch, Timestamp};
use crate::util::{thread::Rx, Spinlock, Thread};
use crate::Result;

/// Period between two global-epoch advances, when the ticker runs.
pub const DEFAULT_EPOCH_LENGTH: time::Duration = time::Duration::from_millis(40);

/// EpochManager type, the decentralized epoch manager.
///
/// Worker threads register once, enter an epoch at transaction begin,
/// obtaining the transaction's commit-identifier, and exit it at
/// transaction end. The background ticker advances the global epoch
/// every [DEFAULT_EPOCH_LENGTH], configurable via
/// [EpochManager::set_epoch_length].
///
/// The expired epoch, refer to [EpochManager::expired_epoch_id], is the
/// system's reclamation boundary, state obsoleted before it can never
/// be observed by an in-flight transaction.
pub struct EpochManager {
    name: String,
    epoch_length: time::Duration,

    current_epoch_id: Arc<AtomicU64>,
    next_txn_id: AtomicU32,
    locals: Spinlock<HashMap<usize, Arc<LocalEpoch>>>,
    ticker: Option<Thread<Tick, (), u64>>,
}

enum Tick {
    Close,
}

impl EpochManager {
    /// Create a new manager. The global epoch starts at 1, epoch zero
    /// never exists, an expired-epoch of zero thus means nothing has
    /// expired yet.
    pub fn new(name: &str) -> EpochManager {
        EpochManager {
            name: name.to_string(),
            epoch_length: DEFAULT_EPOCH_LENGTH,

            current_epoch_id: Arc::new(AtomicU64::new(1)),
            next_txn_id: AtomicU32::new(0),
            locals: Spinlock::new(HashMap::new()),
            ticker: None,
        }
    }

    /// Configure the ticker period, call before [EpochManager::start_epoch].
    pub fn set_epoch_length(&mut self, epoch_length: time::Duration) -> &mut Self {
        self.epoch_length = epoch_length;
        self
    }

    /// Start the background ticker.
    pub fn start_epoch(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        debug!(
            target: "cart",
            "{} starting epoch ticker, period {:?}", self.name, self.epoch_length
        );
        let epoch = Arc::clone(&self.current_epoch_id);
        let period = self.epoch_length;
        let ticker = Thread::new("epoch-ticker", move |rx: Rx<Tick>| move || {
            let mut n_ticks = 0;
            loop {
                match rx.recv_timeout(period) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        epoch.fetch_add(1, AcqRel);
                        n_ticks += 1;
                    }
                    Ok((Tick::Close, _)) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                        break n_ticks;
                    }
                }
            }
        });
        self.ticker = Some(ticker);
    }

    /// Stop the background ticker, return the number of ticks it made.
    pub fn stop_epoch(&mut self) -> Result<u64> {
        match self.ticker.take() {
            Some(ticker) => {
                ticker.to_tx().post(Tick::Close).ok();
                let n_ticks = ticker.join()?;
                debug!(target: "cart", "{} epoch ticker stopped after {} ticks", self.name, n_ticks);
                Ok(n_ticks)
            }
            None => Ok(0),
        }
    }

    /// Install a fresh local record for `thread_id`. Re-registering a
    /// live id is undefined, the old record is silently replaced.
    pub fn register_thread(&self, thread_id: usize) {
        let mut locals = self.locals.write();
        locals.insert(thread_id, Arc::new(LocalEpoch::new(thread_id)));
    }

    /// Remove the local record for `thread_id`. The thread must have
    /// exited all its transactions, its record then vouches for every
    /// epoch and simply drops out of the minimum.
    pub fn deregister_thread(&self, thread_id: usize) {
        let mut locals = self.locals.write();
        locals.remove(&thread_id);
    }

    /// A transaction on `thread_id` begins. Returns its
    /// commit-identifier, composed of the observed global epoch and,
    /// for read-write transactions, a fresh transaction-id. Loops with
    /// a refreshed global epoch when the local record rejects an
    /// already-expired one.
    pub fn enter_epoch(&self, thread_id: usize, ts: Timestamp) -> u64 {
        let local = self.to_local(thread_id);
        loop {
            let epoch_id = self.current_epoch_id.load(Acquire);
            if local.enter_epoch(epoch_id, ts) {
                let txn_id = match ts {
                    Timestamp::Read => self.next_txn_id.fetch_add(1, Relaxed) + 1,
                    Timestamp::ReadOnly | Timestamp::SnapshotRead => 0,
                };
                break pack_cid(epoch_id, txn_id);
            }
        }
    }

    /// The transaction that began with `cid` on `thread_id` ends.
    pub fn exit_epoch(&self, thread_id: usize, cid: u64) {
        let local = self.to_local(thread_id);
        local.exit_epoch(extract_epoch_id(cid));
    }

    /// Largest epoch all of whose transactions have exited. Anything
    /// reachable only from state obsoleted at or before it is dead.
    pub fn expired_epoch_id(&self) -> u64 {
        let global = self.current_epoch_id.load(Acquire);
        let locals = self.locals.read();
        if locals.is_empty() {
            return global.saturating_sub(1);
        }
        let mut min_epoch_id = u64::MAX;
        for local in locals.values() {
            let tail = local.tail_epoch_id(global);
            if tail < min_epoch_id {
                min_epoch_id = tail;
            }
        }
        min_epoch_id
    }

    /// Visibility boundary as a commit-identifier, the expired epoch
    /// with a saturated transaction-id.
    pub fn expired_cid(&self) -> u64 {
        (self.expired_epoch_id() << 32) | 0xFFFF_FFFF
    }

    #[inline]
    pub fn current_epoch_id(&self) -> u64 {
        self.current_epoch_id.load(Acquire)
    }

    #[inline]
    pub fn next_epoch_id(&self) -> u64 {
        self.current_epoch_id.load(Acquire) + 1
    }

    /// Force the global epoch, resets the transaction counter. Meant
    /// for tests and recovery, the epoch must never move backwards
    /// while transactions are in flight.
    pub fn set_current_epoch_id(&self, epoch_id: u64) {
        assert!(epoch_id > 0, "epoch zero never exists");
        self.current_epoch_id.store(epoch_id, Relaxed);
        self.next_txn_id.store(0, Relaxed);
    }

    /// Return name of this manager.
    #[inline]
    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    fn to_local(&self, thread_id: usize) -> Arc<LocalEpoch> {
        let locals = self.locals.read();
        match locals.get(&thread_id) {
            Some(local) => Arc::clone(local),
            None => panic!("thread {} not registered! call the programmer", thread_id),
        }
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        self.stop_epoch().ok();
    }
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod manager_test;
