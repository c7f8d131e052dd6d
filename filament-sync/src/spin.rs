//! Synchronous spinning-based synchronization primitives.
//!
//! These primitives block the current thread by *spinning*: issuing pause
//! or yield instructions in a loop until some value changes. They are meant
//! for very short critical sections, such as pushing to or popping from a
//! scheduler run queue.
//!
//! This module provides the following APIs:
//!
//! - [`RwSpinWait`]: a fair, ticket-ordered [reader-writer] spinlock, with
//!   separate [reader](RwSpinWait::reader_access) and
//!   [writer](RwSpinWait::writer_access) acquisition.
//! - [`TicketRwLock`]: an [`RwSpinWait`] that owns the data it protects.
//! - [`AtomicDoOnce`]: a flag that runs an initializer exactly once across
//!   all callers.
//!
//! [reader-writer]: https://en.wikipedia.org/wiki/Readers%E2%80%93writer_lock
pub mod once;
mod rwlock;

pub use self::{
    once::AtomicDoOnce,
    rwlock::{RwLockReadGuard, RwLockWriteGuard, TicketRwLock},
};

use crate::{
    backoff::{Backoff, BackoffStrategy, Pause, Yield},
    loom::sync::atomic::{
        AtomicU64,
        Ordering::{AcqRel, Acquire, Relaxed},
    },
};
use core::fmt;

/// A fair, ticket-ordered reader/writer spinlock.
///
/// The lock state is a single 64-bit word holding three wrapping 16-bit
/// counters:
///
/// - `TICKETS`, the number of tickets issued,
/// - `WRITES`, the ticket currently allowed to take the write lock,
/// - `READS`, the ticket currently allowed to take the read lock.
///
/// Every acquirer, reader or writer, draws a ticket and is served in ticket
/// order, so writers cannot be starved by a stream of readers and writers
/// are admitted in strict FIFO order. A reader that is served immediately
/// advances `READS`, admitting the next reader in line, so consecutive
/// readers hold the lock concurrently.
///
/// Because the counters are 16 bits wide, at most 65535 threads may be
/// waiting on the lock at the same time.
pub struct RwSpinWait {
    word: AtomicU64,
}

/// The writer side of a [`RwSpinWait`].
///
/// Returned by [`RwSpinWait::writer_access`].
#[derive(Copy, Clone)]
pub struct WriterAccess<'lock> {
    lock: &'lock RwSpinWait,
}

/// The reader side of a [`RwSpinWait`].
///
/// Returned by [`RwSpinWait::reader_access`].
#[derive(Copy, Clone)]
pub struct ReaderAccess<'lock> {
    lock: &'lock RwSpinWait,
}

/// An RAII guard for a write lock on a [`RwSpinWait`].
///
/// The lock is released when the guard is dropped.
#[must_use = "if unused, the lock will immediately unlock"]
pub struct ExclusiveGuard<'lock> {
    lock: &'lock RwSpinWait,
    ticket: u16,
}

/// An RAII guard for a read lock on a [`RwSpinWait`].
///
/// The lock is released when the guard is dropped.
#[must_use = "if unused, the lock will immediately unlock"]
pub struct SharedGuard<'lock> {
    lock: &'lock RwSpinWait,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a [`RwSpinWait`]'s state word.
    #[derive(PartialEq, Eq)]
    struct Word<u64> {
        /// The ticket currently admitted to the read lock.
        const READS: u16;
        /// The ticket currently admitted to the write lock.
        const WRITES: u16;
        const _RESERVED = 16;
        /// The number of tickets issued so far.
        ///
        /// This is the most significant field so that drawing a ticket can
        /// be a plain `fetch_add`: overflow falls off the end of the word
        /// instead of carrying into another counter.
        const TICKETS: u16;
    }
}

/// The amount added to the state word to draw one ticket.
const ONE_TICKET: u64 = 1 << 48;

// === impl RwSpinWait ===

impl RwSpinWait {
    loom_const_fn! {
        /// Returns a new `RwSpinWait`, in the unlocked state.
        #[must_use]
        pub fn new() -> Self {
            Self { word: AtomicU64::new(0) }
        }
    }

    /// Returns the writer side of this lock.
    #[inline]
    pub fn writer_access(&self) -> WriterAccess<'_> {
        WriterAccess { lock: self }
    }

    /// Returns the reader side of this lock.
    #[inline]
    pub fn reader_access(&self) -> ReaderAccess<'_> {
        ReaderAccess { lock: self }
    }

    /// Acquires the write lock, spinning until it is available, and returns
    /// an RAII guard that releases it.
    #[cfg_attr(test, track_caller)]
    pub fn write(&self) -> ExclusiveGuard<'_> {
        let ticket = self.lock_exclusive_with::<Pause, Yield>();
        ExclusiveGuard { lock: self, ticket }
    }

    /// Attempts to acquire the write lock without spinning.
    #[cfg_attr(test, track_caller)]
    pub fn try_write(&self) -> Option<ExclusiveGuard<'_>> {
        let ticket = self.try_lock_exclusive()?;
        Some(ExclusiveGuard { lock: self, ticket })
    }

    /// Acquires a read lock, spinning until it is available, and returns an
    /// RAII guard that releases it.
    #[cfg_attr(test, track_caller)]
    pub fn read(&self) -> SharedGuard<'_> {
        self.lock_shared_with::<Pause, Yield>();
        SharedGuard { lock: self }
    }

    /// Attempts to acquire a read lock without spinning.
    #[cfg_attr(test, track_caller)]
    pub fn try_read(&self) -> Option<SharedGuard<'_>> {
        if self.try_lock_shared() {
            Some(SharedGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns `true` if the lock is held by a reader or writer, or if any
    /// thread is waiting to acquire it.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        let word = self.load(Relaxed);
        word.get(Word::WRITES) != word.get(Word::TICKETS)
    }

    #[inline]
    fn load(&self, order: core::sync::atomic::Ordering) -> Word {
        Word::from_bits(self.word.load(order))
    }

    #[inline]
    fn draw_ticket(&self) -> u16 {
        let prev = Word::from_bits(self.word.fetch_add(ONE_TICKET, Acquire));
        test_dbg!(prev.get(Word::TICKETS))
    }

    /// Applies `f` to the current state word until a compare-and-swap
    /// succeeds, or until `f` returns `None`.
    ///
    /// Returns the state the update was applied to, or the state that `f`
    /// rejected.
    #[cfg_attr(test, track_caller)]
    fn transition(&self, mut f: impl FnMut(Word) -> Option<Word>) -> Result<Word, Word> {
        let mut current = self.load(Acquire);
        loop {
            test_trace!("RwSpinWait::transition; current:\n{}", current);
            let next = match f(current) {
                Some(next) => next,
                None => return Err(current),
            };
            match self
                .word
                .compare_exchange_weak(current.0, next.0, AcqRel, Acquire)
            {
                Ok(_) => return Ok(current),
                Err(actual) => current = Word::from_bits(actual),
            }
        }
    }

    fn lock_exclusive_with<S: BackoffStrategy, F: BackoffStrategy>(&self) -> u16 {
        let ticket = self.draw_ticket();
        let mut boff = Backoff::<S, F>::new();
        while test_dbg!(self.load(Acquire).get(Word::WRITES)) != ticket {
            boff.spin();
        }
        ticket
    }

    fn try_lock_exclusive(&self) -> Option<u16> {
        self.transition(|word| {
            let tickets = word.get(Word::TICKETS);
            if word.get(Word::WRITES) != tickets {
                return None;
            }
            Some(word.with(Word::TICKETS, tickets.wrapping_add(1)))
        })
        .ok()
        .map(|prev| prev.get(Word::TICKETS))
    }

    /// # Safety
    ///
    /// The caller must hold the write lock.
    unsafe fn unlock_exclusive(&self) {
        // Only `TICKETS` can change while the write lock is held, so this
        // retries only when another thread draws a ticket concurrently.
        let _prev = self.transition(|word| {
            Some(
                word.with(Word::READS, word.get(Word::READS).wrapping_add(1))
                    .with(Word::WRITES, word.get(Word::WRITES).wrapping_add(1)),
            )
        });
        debug_assert!(_prev.is_ok());
    }

    fn lock_shared_with<S: BackoffStrategy, F: BackoffStrategy>(&self) {
        let ticket = self.draw_ticket();
        let mut boff = Backoff::<S, F>::new();
        while test_dbg!(self.load(Acquire).get(Word::READS)) != ticket {
            boff.spin();
        }
        // Admit the next reader in line.
        let _ = self.transition(|word| {
            Some(word.with(Word::READS, word.get(Word::READS).wrapping_add(1)))
        });
    }

    fn try_lock_shared(&self) -> bool {
        self.transition(|word| {
            let tickets = word.get(Word::TICKETS);
            if word.get(Word::READS) != tickets {
                return None;
            }
            let next = tickets.wrapping_add(1);
            Some(word.with(Word::READS, next).with(Word::TICKETS, next))
        })
        .is_ok()
    }

    /// # Safety
    ///
    /// The caller must hold a read lock.
    unsafe fn unlock_shared(&self) {
        let _ = self.transition(|word| {
            Some(word.with(Word::WRITES, word.get(Word::WRITES).wrapping_add(1)))
        });
    }
}

impl Default for RwSpinWait {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwSpinWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A single load, so the three counters are a consistent snapshot.
        let word = self.load(Relaxed);
        f.debug_struct("RwSpinWait")
            .field("reads", &word.get(Word::READS))
            .field("writes", &word.get(Word::WRITES))
            .field("tickets", &word.get(Word::TICKETS))
            .finish()
    }
}

// === impl WriterAccess ===

impl WriterAccess<'_> {
    /// Acquires the write lock, spinning with the default backoff.
    #[cfg_attr(test, track_caller)]
    pub fn lock(&self) {
        self.lock_with::<Pause, Yield>();
    }

    /// Acquires the write lock, spinning with a `Backoff<S, F>`.
    ///
    /// Returns the ticket this writer was served under.
    #[cfg_attr(test, track_caller)]
    pub fn lock_with<S: BackoffStrategy, F: BackoffStrategy>(&self) -> u16 {
        self.lock.lock_exclusive_with::<S, F>()
    }

    /// Attempts to acquire the write lock without spinning.
    ///
    /// This fails if the lock is held, or if any other thread holds a
    /// ticket for it.
    #[cfg_attr(test, track_caller)]
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.lock.try_lock_exclusive().is_some()
    }

    /// Releases the write lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the write lock, acquired through
    /// [`lock`](Self::lock) or [`try_lock`](Self::try_lock).
    #[cfg_attr(test, track_caller)]
    pub unsafe fn unlock(&self) {
        self.lock.unlock_exclusive()
    }
}

impl fmt::Debug for WriterAccess<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WriterAccess").field(self.lock).finish()
    }
}

// === impl ReaderAccess ===

impl ReaderAccess<'_> {
    /// Acquires a read lock, spinning with the default backoff.
    #[cfg_attr(test, track_caller)]
    pub fn lock(&self) {
        self.lock_with::<Pause, Yield>();
    }

    /// Acquires a read lock, spinning with a `Backoff<S, F>`.
    #[cfg_attr(test, track_caller)]
    pub fn lock_with<S: BackoffStrategy, F: BackoffStrategy>(&self) {
        self.lock.lock_shared_with::<S, F>()
    }

    /// Attempts to acquire a read lock without spinning.
    #[cfg_attr(test, track_caller)]
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.lock.try_lock_shared()
    }

    /// Releases a read lock.
    ///
    /// # Safety
    ///
    /// The caller must hold a read lock, acquired through
    /// [`lock`](Self::lock) or [`try_lock`](Self::try_lock).
    #[cfg_attr(test, track_caller)]
    pub unsafe fn unlock(&self) {
        self.lock.unlock_shared()
    }
}

impl fmt::Debug for ReaderAccess<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReaderAccess").field(self.lock).finish()
    }
}

// === impl ExclusiveGuard ===

impl ExclusiveGuard<'_> {
    /// Returns the ticket this guard's writer was served under.
    #[inline]
    #[must_use]
    pub fn ticket(&self) -> u16 {
        self.ticket
    }
}

impl Drop for ExclusiveGuard<'_> {
    #[inline]
    #[cfg_attr(test, track_caller)]
    fn drop(&mut self) {
        unsafe {
            // Safety: the guard exists, so we hold the write lock.
            self.lock.unlock_exclusive()
        }
    }
}

impl fmt::Debug for ExclusiveGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveGuard")
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

// === impl SharedGuard ===

impl Drop for SharedGuard<'_> {
    #[inline]
    #[cfg_attr(test, track_caller)]
    fn drop(&mut self) {
        unsafe {
            // Safety: the guard exists, so we hold a read lock.
            self.lock.unlock_shared()
        }
    }
}

impl fmt::Debug for SharedGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedGuard").finish_non_exhaustive()
    }
}
