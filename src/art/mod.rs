//! Module `art` implement a concurrent Adaptive Radix Tree.
//!
//! The tree maps binary keys, [ArtKey], to sets of 64-bit opaque
//! tuple-identifiers. Four adaptive inner-node variants keep the fan-out
//! proportional to the population, path compression keeps chains of
//! single-child nodes out of the tree, and an optimistic
//! version-validated locking protocol keeps readers lock-free. Deleted
//! nodes are reclaimed through decentralized epochs, refer to [reclaim].

mod key;
mod leaf;
mod node;
mod node16;
mod node256;
mod node4;
mod node48;
pub mod reclaim;
mod stats;

mod index;

pub use index::Index;
pub use key::{ArtKey, INLINE_KEY_LEN};
pub use node::MAX_PREFIX_LEN;
pub use reclaim::ThreadInfo;
pub use stats::Stats;
