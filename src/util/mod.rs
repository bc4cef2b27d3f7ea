//! Module implement common utility types for non-blocking concurrency.

pub mod spinlock;
pub mod thread;

pub use spinlock::Spinlock;
pub use thread::Thread;
