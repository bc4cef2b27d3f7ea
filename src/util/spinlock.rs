//! Module `spinlock` implement read-write-spinlock, useful for
//! non-blocking concurrency.
//!
//! Blocking concurrency can have impact on latency. When operations
//! that require rw-exclusion are going to be quick and short, we can
//! use non-blocking primitives like latch-and-spin.
//!
//! **What is Latch and spin ?**
//!
//! Latch-and-lock mechanism allow one writer along with many readers.
//! A **reader** shall enter the critical section only when the latch
//! and the lock are both free. A **writer** shall first acquire the
//! latch, which stops new readers from entering, and then acquire the
//! lock once every reader already inside has exited. While waiting for
//! either permission the caller thread shall spin.

use std::convert::TryFrom;
use std::{
    fmt,
    ops::{Deref, DerefMut},
    result,
    sync::atomic::{AtomicU32, Ordering::SeqCst},
};

use crate::{Error, Result};

/// Spinlock implements latch-and-spin mechanism for non-blocking
/// concurrency.
///
/// It uses AtomicU32 for:
/// * ref-count, bits [0-29].
/// * latch flag, bit 30.
/// * lock flag, bit 31.
pub struct Spinlock<T> {
    latchlock: AtomicU32,
    read_locks: AtomicU32,
    write_locks: AtomicU32,
    conflicts: AtomicU32,

    value: T,
}

impl<T> Spinlock<T> {
    const LATCH_FLAG: u32 = 0x40000000;
    const LOCK_FLAG: u32 = 0x80000000;
    const LATCH_LOCK_FLAG: u32 = 0xC0000000;
    const READERS_FLAG: u32 = 0x3FFFFFFF;

    /// Create a new Spinlock over `value`.
    pub fn new(value: T) -> Spinlock<T> {
        Spinlock {
            latchlock: AtomicU32::new(0),
            read_locks: AtomicU32::new(0),
            write_locks: AtomicU32::new(0),
            conflicts: AtomicU32::new(0),

            value,
        }
    }

    /// Acquire latch for read permission.
    pub fn read(&self) -> ReadGuard<T> {
        loop {
            let old = self.latchlock.load(SeqCst);
            if (old & Self::LATCH_LOCK_FLAG) == 0 {
                // latch is not acquired by a writer
                if self
                    .latchlock
                    .compare_exchange(old, old + 1, SeqCst, SeqCst)
                    .is_ok()
                {
                    if cfg!(feature = "debug") {
                        self.read_locks.fetch_add(1, SeqCst);
                    }
                    break ReadGuard { door: self };
                }
            }
            if cfg!(feature = "debug") {
                self.conflicts.fetch_add(1, SeqCst);
            }
        }
    }

    /// Acquire latch for write permission.
    pub fn write(&self) -> WriteGuard<T> {
        // acquire latch
        loop {
            let old = self.latchlock.load(SeqCst);
            if (old & Self::LATCH_FLAG) == 0 {
                if (old & Self::LOCK_FLAG) != 0 {
                    panic!("latch is off, lock is on! call the programmer");
                }
                let new = old | Self::LATCH_FLAG;
                if self
                    .latchlock
                    .compare_exchange(old, new, SeqCst, SeqCst)
                    .is_ok()
                {
                    break;
                }
            }
            if cfg!(feature = "debug") {
                self.conflicts.fetch_add(1, SeqCst);
            }
        }
        // acquire lock
        loop {
            let old = self.latchlock.load(SeqCst);
            if (old & Self::READERS_FLAG) == 0 {
                let new = old | Self::LOCK_FLAG;
                if self
                    .latchlock
                    .compare_exchange(old, new, SeqCst, SeqCst)
                    .is_ok()
                {
                    if cfg!(feature = "debug") {
                        self.write_locks.fetch_add(1, SeqCst);
                    }
                    let door = unsafe {
                        let door = self as *const Self as *mut Self;
                        door.as_mut().unwrap()
                    };
                    break WriteGuard { door };
                }
                panic!("latch is on, ZERO readers, cannot lock! call the programmer");
            }
            if cfg!(feature = "debug") {
                self.conflicts.fetch_add(1, SeqCst);
            }
        }
    }

    pub fn to_stats(&self) -> Result<Stats> {
        let rl = err_at!(FailConvert, usize::try_from(self.read_locks.load(SeqCst)))?;
        let wl = err_at!(FailConvert, usize::try_from(self.write_locks.load(SeqCst)))?;
        let cn = err_at!(FailConvert, usize::try_from(self.conflicts.load(SeqCst)))?;
        Ok(Stats {
            latchlock: self.latchlock.load(SeqCst),
            read_locks: rl,
            write_locks: wl,
            conflicts: cn,
        })
    }
}

/// Type to handle read-latch, when value gets dropped the latch is released.
pub struct ReadGuard<'a, T> {
    door: &'a Spinlock<T>,
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.door.value
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.door.latchlock.fetch_sub(1, SeqCst);
    }
}

/// Type to handle write-latch, when value gets dropped the latch is released.
pub struct WriteGuard<'a, T> {
    door: &'a mut Spinlock<T>,
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.door.value
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.door.value
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        let old = self.door.latchlock.load(SeqCst);
        if (old & Spinlock::<T>::READERS_FLAG) > 0 {
            panic!("active readers while lock is held! call the programmer");
        }
        if self
            .door
            .latchlock
            .compare_exchange(old, 0, SeqCst, SeqCst)
            .is_err()
        {
            panic!("latchlock got modified while locked! call the programmer")
        }
    }
}

/// Statistic type, to capture [Spinlock] metrics.
#[derive(Default)]
pub struct Stats {
    /// Actual 32-bit value of the latchlock when [Spinlock::to_stats]
    /// is called.
    pub latchlock: u32,
    /// Total number of read locks so far.
    pub read_locks: usize,
    /// Total number of write locks so far.
    pub write_locks: usize,
    /// Total number of conflicts so far, while acquiring the latch.
    pub conflicts: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            concat!(
                "{{ latchlock = {:X}, read_locks = {}, ",
                "write_locks = {}, conflicts = {} }}",
            ),
            self.latchlock, self.read_locks, self.write_locks, self.conflicts,
        )
    }
}

#[cfg(test)]
#[path = "spinlock_test.rs"]
mod spinlock_test;
