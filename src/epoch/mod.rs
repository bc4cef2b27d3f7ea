//! Module `epoch` implement the decentralized epoch manager.
//!
//! A monotonic global epoch, advanced by a background ticker, acts as
//! the coarse logical clock of the system. Every worker thread
//! registers a [LocalEpoch] and reports the epochs of its in-flight
//! transactions there, nothing is ever published to a central queue.
//! The expired epoch, the largest epoch all of whose transactions have
//! exited, is computed on demand as the minimum tail across the local
//! records, and serves as the grace boundary for safe reclamation.
//!
//! The manager doubles as the commit-identifier authority. A commit
//! identifier packs the begin-epoch in its upper 32 bits and a
//! process-wide transaction counter in its lower 32 bits, read-only
//! transactions carry counter zero and reserve no write slot.

mod local;
mod manager;

pub use local::LocalEpoch;
pub use manager::{EpochManager, DEFAULT_EPOCH_LENGTH};

/// How a transaction participates in its epoch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Timestamp {
    /// Read-write transaction, consumes a transaction-id.
    Read,
    /// Read-only transaction, carries transaction-id zero.
    ReadOnly,
    /// Read-only transaction over an old snapshot, always admitted,
    /// even into an epoch the local record already retired.
    SnapshotRead,
}

/// Compose a commit-identifier from begin-epoch and transaction-id.
#[inline]
pub fn pack_cid(epoch_id: u64, txn_id: u32) -> u64 {
    (epoch_id << 32) | (txn_id as u64)
}

/// Begin-epoch of a commit-identifier.
#[inline]
pub fn extract_epoch_id(cid: u64) -> u64 {
    cid >> 32
}

/// Transaction-id of a commit-identifier, zero for read-only.
#[inline]
pub fn extract_txn_id(cid: u64) -> u32 {
    (cid & 0xFFFF_FFFF) as u32
}
