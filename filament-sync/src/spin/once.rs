//! A flag which runs an initializer exactly once.
use crate::{
    backoff::{Backoff, BackoffStrategy, Pause, Yield},
    loom::sync::atomic::{
        AtomicU8,
        Ordering::{AcqRel, Acquire},
    },
};
use core::fmt;

/// Runs an initializer exactly once across all callers.
///
/// Unlike [`std::sync::Once`], an `AtomicDoOnce` does not block the thread
/// on an OS primitive: callers that arrive while another caller is running
/// the initializer spin with a [`Backoff`] until it finishes.
///
/// The initializer may also report failure, through
/// [`try_run_initializer`](Self::try_run_initializer), in which case the
/// flag is reset so that a later call can retry.
///
/// # Examples
///
/// ```
/// use filament_sync::spin::AtomicDoOnce;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// static ONCE: AtomicDoOnce = AtomicDoOnce::new();
/// static COUNT: AtomicUsize = AtomicUsize::new(0);
///
/// for _ in 0..3 {
///     ONCE.run_initializer(|| {
///         COUNT.fetch_add(1, Ordering::Relaxed);
///     });
/// }
/// assert_eq!(COUNT.load(Ordering::Relaxed), 1);
/// assert!(ONCE.is_executed());
/// ```
pub struct AtomicDoOnce {
    state: AtomicU8,
}

const UNINITIALIZED: u8 = 0;
const PENDING: u8 = 1;
const EXECUTED: u8 = 2;

// === impl AtomicDoOnce ===

impl AtomicDoOnce {
    loom_const_fn! {
        /// Returns a new `AtomicDoOnce` that has not yet run.
        #[must_use]
        pub fn new() -> Self {
            Self {
                state: AtomicU8::new(UNINITIALIZED),
            }
        }
    }

    /// Runs `init` if no caller has run an initializer on this flag yet.
    ///
    /// If another caller is currently running its initializer, this spins
    /// until that initializer has finished. When this returns, an
    /// initializer has completed, and its effects are visible to the caller.
    #[cfg_attr(test, track_caller)]
    pub fn run_initializer(&self, init: impl FnOnce()) {
        let _ = self.try_run_initializer_with::<Pause, Yield>(|| {
            init();
            true
        });
    }

    /// Runs `init` if no caller has successfully run an initializer on this
    /// flag yet.
    ///
    /// If `init` returns `false`, the flag goes back to the uninitialized
    /// state and a later call may try again. Callers that were waiting for
    /// the failed initializer race to run their own.
    ///
    /// Returns `true` if an initializer (this one or another caller's)
    /// completed successfully, or `false` if this caller's initializer
    /// failed.
    #[cfg_attr(test, track_caller)]
    pub fn try_run_initializer(&self, init: impl FnOnce() -> bool) -> bool {
        self.try_run_initializer_with::<Pause, Yield>(init)
    }

    /// Like [`try_run_initializer`](Self::try_run_initializer), but waits
    /// for a concurrent initializer using a `Backoff<S, F>`.
    #[cfg_attr(test, track_caller)]
    pub fn try_run_initializer_with<S, F>(&self, init: impl FnOnce() -> bool) -> bool
    where
        S: BackoffStrategy,
        F: BackoffStrategy,
    {
        let mut boff = Backoff::<S, F>::new();
        loop {
            match test_dbg!(self
                .state
                .compare_exchange(UNINITIALIZED, PENDING, AcqRel, Acquire))
            {
                Ok(_) => {
                    let ok = init();
                    let next = if ok { EXECUTED } else { UNINITIALIZED };
                    let _prev = test_dbg!(self.state.swap(next, AcqRel));
                    debug_assert_eq!(
                        _prev, PENDING,
                        "AtomicDoOnce: state changed while locked. This is a bug!"
                    );
                    return ok;
                }
                Err(EXECUTED) => return true,
                Err(PENDING) => {
                    while test_dbg!(self.state.load(Acquire)) == PENDING {
                        boff.spin();
                    }
                }
                Err(_state) => unsafe {
                    unreachable_unchecked!("AtomicDoOnce: unexpected state {}!", _state)
                },
            }
        }
    }

    /// Returns `true` if an initializer has completed successfully.
    #[inline]
    #[must_use]
    pub fn is_executed(&self) -> bool {
        self.state.load(Acquire) == EXECUTED
    }
}

impl Default for AtomicDoOnce {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AtomicDoOnce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Acquire) {
            UNINITIALIZED => "uninitialized",
            PENDING => "pending",
            EXECUTED => "executed",
            _ => "<invalid>",
        };
        f.debug_struct("AtomicDoOnce").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{
        self,
        sync::{
            atomic::{AtomicUsize, Ordering::Relaxed},
            Arc,
        },
        thread,
    };

    #[test]
    fn runs_once() {
        const THREADS: usize = if cfg!(loom) { 2 } else { 8 };

        loom::model(|| {
            let once = Arc::new(AtomicDoOnce::new());
            let count = Arc::new(AtomicUsize::new(0));
            let threads = (0..THREADS)
                .map(|_| {
                    let once = once.clone();
                    let count = count.clone();
                    thread::spawn(move || {
                        once.run_initializer(|| {
                            count.fetch_add(1, Relaxed);
                        });
                        // the initializer's effects are visible once we return.
                        assert_eq!(count.load(Relaxed), 1);
                    })
                })
                .collect::<Vec<_>>();

            for thread in threads {
                thread.join().expect("thread mustn't panic");
            }
            assert_eq!(count.load(Relaxed), 1);
            assert!(once.is_executed());
        });
    }

    #[test]
    fn failure_allows_retry() {
        loom::model(|| {
            let once = AtomicDoOnce::new();
            assert!(!once.try_run_initializer(|| false));
            assert!(!once.is_executed());

            let mut ran = false;
            assert!(once.try_run_initializer(|| {
                ran = true;
                true
            }));
            assert!(ran);
            assert!(once.is_executed());

            // already executed, so this one never runs.
            assert!(once.try_run_initializer(|| unreachable!()));
        });
    }

    #[test]
    fn concurrent_failure_then_success() {
        loom::model(|| {
            let once = Arc::new(AtomicDoOnce::new());
            let attempts = Arc::new(AtomicUsize::new(0));
            let failing = {
                let once = once.clone();
                let attempts = attempts.clone();
                thread::spawn(move || {
                    once.try_run_initializer(|| {
                        attempts.fetch_add(1, Relaxed);
                        false
                    })
                })
            };

            let ok = once.try_run_initializer(|| {
                attempts.fetch_add(1, Relaxed);
                true
            });
            assert!(ok);

            let failed_ok = failing.join().expect("thread mustn't panic");
            // the failing initializer either ran first and failed, or found
            // the flag already executed.
            assert_eq!(attempts.load(Relaxed), if failed_ok { 1 } else { 2 });
            assert!(once.is_executed());
        });
    }
}
