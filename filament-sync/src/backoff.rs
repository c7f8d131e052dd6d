//! [Exponential backoff] for spin loops, with pluggable strategies.
//!
//! A [`Backoff`] is parameterized by two [`BackoffStrategy`] types: the
//! *spin* strategy, which is issued an exponentially increasing number of
//! times while the backoff has not yet reached its maximum exponent, and the
//! *fallback* strategy, which is issued once per call after that. The
//! default, `Backoff<Pause, Yield>`, issues CPU pause hints at first and
//! then starts yielding the OS thread once contention has gone on for a
//! while.
//!
//! The strategy is chosen per call site through the type parameters, so
//! selecting one costs nothing at runtime:
//!
//! ```
//! use filament_sync::backoff::{Backoff, NoOp, Pause, Yield};
//!
//! // pause, then yield to the OS
//! let mut boff = Backoff::<Pause, Yield>::new();
//! boff.spin();
//!
//! // a pure busy-wait that never gives up the thread
//! let mut hot = Backoff::<NoOp, NoOp>::new();
//! while hot.bounded_pause() {}
//! ```
//!
//! [Exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
use core::{fmt, marker::PhantomData};

/// A policy for what to do on each iteration of a spin loop.
pub trait BackoffStrategy {
    /// Performs one unit of backoff.
    fn backoff();
}

/// A [`BackoffStrategy`] that does nothing.
///
/// Spinning with `NoOp` is a pure busy-wait: lowest latency, highest CPU
/// usage.
#[derive(Debug, Copy, Clone, Default)]
pub struct NoOp;

/// A [`BackoffStrategy`] that yields the current OS thread to the scheduler.
#[derive(Debug, Copy, Clone, Default)]
pub struct Yield;

/// A [`BackoffStrategy`] that issues a CPU [spin loop hint] (`pause` on x86,
/// `yield` on ARM).
///
/// [spin loop hint]: core::hint::spin_loop
#[derive(Debug, Copy, Clone, Default)]
pub struct Pause;

/// An exponential backoff for spin loops.
///
/// Each call to [`spin`](Self::spin) issues `2^exp` rounds of the spin
/// strategy `S`, where `exp` starts at 0 and is incremented after every
/// call. Once `exp` passes the configured maximum, each call instead issues
/// a single round of the fallback strategy `F`.
pub struct Backoff<S = Pause, F = Yield> {
    exp: u8,
    max: u8,
    _strategy: PhantomData<fn() -> (S, F)>,
}

// === impl NoOp ===

impl BackoffStrategy for NoOp {
    #[inline(always)]
    fn backoff() {
        // loom can't make progress on a loop that never yields.
        #[cfg(loom)]
        loom::thread::yield_now();
    }
}

// === impl Yield ===

impl BackoffStrategy for Yield {
    #[inline(always)]
    fn backoff() {
        crate::loom::thread::yield_now();
    }
}

// === impl Pause ===

impl BackoffStrategy for Pause {
    #[inline(always)]
    fn backoff() {
        #[cfg(not(loom))]
        crate::loom::hint::spin_loop();

        #[cfg(loom)]
        loom::thread::yield_now();
    }
}

// === impl Backoff ===

impl<S, F> Backoff<S, F>
where
    S: BackoffStrategy,
    F: BackoffStrategy,
{
    /// The default maximum exponent (2^4 = 16 spins).
    ///
    /// This is the maximum exponent used by [`Backoff::new()`] and
    /// [`Backoff::default()`]. To override it, use
    /// [`Backoff::with_max_exponent()`].
    pub const DEFAULT_MAX_EXPONENT: u8 = 4;

    /// The largest maximum exponent accepted by
    /// [`Backoff::with_max_exponent()`].
    pub const MAX_EXPONENT: u8 = 16;

    /// Returns a new exponential backoff with the maximum exponent set to
    /// [`Self::DEFAULT_MAX_EXPONENT`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
            _strategy: PhantomData,
        }
    }

    /// Returns a new exponential backoff with the provided max exponent.
    ///
    /// # Panics
    ///
    /// If `max` is greater than [`Self::MAX_EXPONENT`].
    #[must_use]
    pub fn with_max_exponent(max: u8) -> Self {
        assert!(max <= Self::MAX_EXPONENT);
        Self {
            exp: 0,
            max,
            _strategy: PhantomData,
        }
    }

    /// Backs off in a spin loop.
    ///
    /// This should be used when an operation needs to be retried because
    /// another thread made progress. While the backoff has not been
    /// exhausted, this issues `2^exp` rounds of the spin strategy and
    /// increments the exponent. Afterwards, each call issues one round of the
    /// fallback strategy.
    #[inline(always)]
    pub fn spin(&mut self) {
        if !self.bounded_pause() {
            F::backoff();
        }
    }

    /// Backs off using only the spin strategy.
    ///
    /// Returns `false` without spinning if the backoff is already exhausted.
    /// This lets callers switch to something else entirely (such as
    /// blocking) once spinning stops being worthwhile.
    #[inline(always)]
    pub fn bounded_pause(&mut self) -> bool {
        if self.exp > self.max {
            return false;
        }

        let spins = 1u32 << self.exp;
        for _ in 0..spins {
            S::backoff();
        }

        self.exp += 1;
        true
    }

    /// Returns `true` once [`bounded_pause`](Self::bounded_pause) would
    /// return `false`.
    #[inline]
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exp > self.max
    }

    /// Resets the backoff to its initial state.
    #[inline]
    pub fn reset(&mut self) {
        self.exp = 0;
    }
}

impl<S, F> Default for Backoff<S, F>
where
    S: BackoffStrategy,
    F: BackoffStrategy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, F> Clone for Backoff<S, F> {
    fn clone(&self) -> Self {
        Self {
            exp: self.exp,
            max: self.max,
            _strategy: PhantomData,
        }
    }
}

impl<S, F> fmt::Debug for Backoff<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff")
            .field("exp", &self.exp)
            .field("max", &self.max)
            .field("spin", &core::any::type_name::<S>())
            .field("fallback", &core::any::type_name::<F>())
            .finish()
    }
}

/// Backs off with `Backoff<S, F>` for as long as `cond` returns `true`.
#[inline]
pub fn backoff_while<S, F>(mut cond: impl FnMut() -> bool)
where
    S: BackoffStrategy,
    F: BackoffStrategy,
{
    let mut boff = Backoff::<S, F>::new();
    while cond() {
        boff.spin();
    }
}

/// Backs off for as long as `load()` returns a value equal to `value`.
///
/// Returns the first value that differed.
#[inline]
pub fn backoff_while_eq<S, F, T>(mut load: impl FnMut() -> T, value: T) -> T
where
    S: BackoffStrategy,
    F: BackoffStrategy,
    T: PartialEq,
{
    let mut boff = Backoff::<S, F>::new();
    loop {
        let current = load();
        if current != value {
            return current;
        }
        boff.spin();
    }
}

/// Backs off for as long as `load()` returns a value that is not equal to
/// `value`.
#[inline]
pub fn backoff_while_ne<S, F, T>(mut load: impl FnMut() -> T, value: T)
where
    S: BackoffStrategy,
    F: BackoffStrategy,
    T: PartialEq,
{
    let mut boff = Backoff::<S, F>::new();
    while load() != value {
        boff.spin();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

    static SPINS: AtomicUsize = AtomicUsize::new(0);
    static FALLBACKS: AtomicUsize = AtomicUsize::new(0);

    struct CountSpin;
    struct CountFallback;

    impl BackoffStrategy for CountSpin {
        fn backoff() {
            SPINS.fetch_add(1, Relaxed);
        }
    }

    impl BackoffStrategy for CountFallback {
        fn backoff() {
            FALLBACKS.fetch_add(1, Relaxed);
        }
    }

    #[test]
    fn exponential_then_fallback() {
        let mut boff = Backoff::<CountSpin, CountFallback>::with_max_exponent(3);
        // 1 + 2 + 4 + 8 spins before the exponent passes the max.
        for _ in 0..4 {
            boff.spin();
        }
        assert_eq!(SPINS.load(Relaxed), 15);
        assert_eq!(FALLBACKS.load(Relaxed), 0);
        assert!(boff.is_exhausted());

        boff.spin();
        boff.spin();
        assert_eq!(SPINS.load(Relaxed), 15);
        assert_eq!(FALLBACKS.load(Relaxed), 2);

        assert!(!boff.bounded_pause());
        boff.reset();
        assert!(boff.bounded_pause());
        assert_eq!(SPINS.load(Relaxed), 16);
    }

    #[test]
    fn while_helpers() {
        let n = AtomicUsize::new(0);
        backoff_while::<NoOp, NoOp>(|| n.fetch_add(1, Relaxed) < 10);
        assert_eq!(n.load(Relaxed), 11);

        let n = AtomicUsize::new(0);
        let first = backoff_while_eq::<Pause, NoOp, _>(|| n.fetch_add(1, Relaxed) / 3, 0);
        assert_eq!(first, 1);

        let n = AtomicUsize::new(0);
        backoff_while_ne::<Pause, Yield, _>(|| n.fetch_add(1, Relaxed), 5);
        assert_eq!(n.load(Relaxed), 6);
    }
}
