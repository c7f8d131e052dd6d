//! A blocking event, built on a mutex and a condition variable.
//!
//! An [`Event`] is the one primitive in this crate that puts the calling
//! thread to sleep instead of spinning. Scheduler workers block on one when
//! there is no runnable work, which bounds CPU usage under low load.
use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// A signal that threads can block on until it is set.
///
/// An event is either *signaled* or *non-signaled*. [`set(true)`] signals
/// it and wakes waiters, [`set(false)`] resets it, and
/// [`wait_timeout`] blocks until it becomes signaled or the timeout
/// elapses.
///
/// Events are created in one of two modes:
///
/// - **auto-reset** ([`Event::new`]): a successful wait consumes the signal,
///   so each `set(true)` releases at most one waiter.
/// - **manual-reset** ([`Event::manual_reset`]): the event stays signaled
///   until it is explicitly reset, releasing every waiter.
///
/// [`set(true)`]: Event::set
/// [`set(false)`]: Event::set
/// [`wait_timeout`]: Event::wait_timeout
#[derive(Debug)]
pub struct Event {
    state: Mutex<State>,
    condvar: Condvar,
    auto_reset: bool,
}

/// The outcome of waiting on an [`Event`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum WaitResult {
    /// The wait could not be performed, because the event's lock was
    /// poisoned by a thread that panicked while holding it.
    Failed,
    /// The event was signaled.
    Signaled,
    /// The timeout elapsed after the event was signaled at least once during
    /// the wait, but every signal was consumed by another waiter first.
    StillNonSignaled,
    /// The timeout elapsed without the event being signaled.
    TimedOut,
}

#[derive(Debug)]
struct State {
    signaled: bool,
    /// Incremented by every `set(true)`, so a waiter can tell a stolen
    /// wakeup from a plain timeout.
    sets: u64,
}

// === impl Event ===

impl Event {
    /// Returns a new auto-reset event, signaled if `initial` is `true`.
    #[must_use]
    pub fn new(initial: bool) -> Self {
        Self::with_mode(initial, true)
    }

    /// Returns a new manual-reset event, signaled if `initial` is `true`.
    #[must_use]
    pub fn manual_reset(initial: bool) -> Self {
        Self::with_mode(initial, false)
    }

    fn with_mode(initial: bool, auto_reset: bool) -> Self {
        Self {
            state: Mutex::new(State {
                signaled: initial,
                sets: 0,
            }),
            condvar: Condvar::new(),
            auto_reset,
        }
    }

    /// Signals the event if `value` is `true`, or resets it if `value` is
    /// `false`.
    ///
    /// Signaling an auto-reset event wakes one waiter. Signaling a
    /// manual-reset event wakes all of them.
    pub fn set(&self, value: bool) {
        // The guarded state is two plain values that are never left
        // half-updated, so a poisoned lock can still be used to signal.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.signaled = value;
        test_trace!(value, sets = state.sets, auto_reset = self.auto_reset, "Event::set");
        if !value {
            return;
        }

        state.sets = state.sets.wrapping_add(1);
        drop(state);
        if self.auto_reset {
            self.condvar.notify_one();
        } else {
            self.condvar.notify_all();
        }
    }

    /// Returns `true` if the event is currently signaled, without waiting
    /// and without consuming the signal.
    #[must_use]
    pub fn peek(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .signaled
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) -> WaitResult {
        self.wait_until(None)
    }

    /// Blocks until the event is signaled, or until `timeout` has elapsed.
    ///
    /// Spurious wakeups are absorbed: the signaled flag is re-checked after
    /// every wake, and the wait resumes with whatever time remains.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        self.wait_until(Instant::now().checked_add(timeout))
    }

    fn wait_until(&self, deadline: Option<Instant>) -> WaitResult {
        let result = self.wait_inner(deadline);
        test_trace!(?result, ?deadline, "Event::wait");
        result
    }

    fn wait_inner(&self, deadline: Option<Instant>) -> WaitResult {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return WaitResult::Failed,
        };
        let sets_at_start = state.sets;

        loop {
            if state.signaled {
                if self.auto_reset {
                    state.signaled = false;
                }
                return WaitResult::Signaled;
            }

            state = match deadline {
                None => match self.condvar.wait(state) {
                    Ok(state) => state,
                    Err(_) => return WaitResult::Failed,
                },
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Self::timed_out(&state, sets_at_start);
                    }
                    match self.condvar.wait_timeout(state, deadline - now) {
                        Ok((state, _)) => state,
                        Err(_) => return WaitResult::Failed,
                    }
                }
            };
        }
    }

    fn timed_out(state: &MutexGuard<'_, State>, sets_at_start: u64) -> WaitResult {
        if state.sets != sets_at_start {
            WaitResult::StillNonSignaled
        } else {
            WaitResult::TimedOut
        }
    }
}

impl Default for Event {
    /// Returns a new, non-signaled, auto-reset event.
    fn default() -> Self {
        Self::new(false)
    }
}

// === impl WaitResult ===

impl WaitResult {
    /// Returns `true` if this is [`WaitResult::Signaled`].
    #[inline]
    #[must_use]
    pub fn is_signaled(self) -> bool {
        matches!(self, Self::Signaled)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn times_out_without_signal() {
        let _trace = crate::util::test::trace_init();
        let event = Event::new(false);
        let timeout = Duration::from_millis(50);
        let start = Instant::now();
        assert_eq!(event.wait_timeout(timeout), WaitResult::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout, "returned early after {elapsed:?}");
        assert!(elapsed < timeout * 20, "took far too long: {elapsed:?}");
    }

    #[test]
    fn set_then_wait_is_immediate() {
        let event = Event::new(false);
        event.set(true);
        assert!(event.peek());
        let start = Instant::now();
        assert_eq!(event.wait_timeout(Duration::from_secs(10)), WaitResult::Signaled);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn auto_reset_consumes_signal() {
        let event = Event::new(true);
        assert_eq!(event.wait_timeout(Duration::ZERO), WaitResult::Signaled);
        assert!(!event.peek());
        assert_eq!(event.wait_timeout(Duration::ZERO), WaitResult::TimedOut);
    }

    #[test]
    fn manual_reset_stays_signaled() {
        let event = Event::manual_reset(false);
        event.set(true);
        assert_eq!(event.wait(), WaitResult::Signaled);
        assert_eq!(event.wait_timeout(Duration::ZERO), WaitResult::Signaled);
        event.set(false);
        assert!(!event.peek());
        assert_eq!(event.wait_timeout(Duration::ZERO), WaitResult::TimedOut);
    }

    #[test]
    fn wakes_waiter_on_other_thread() {
        let _trace = crate::util::test::trace_init();
        let event = Arc::new(Event::new(false));
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait_timeout(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        event.set(true);
        assert_eq!(waiter.join().unwrap(), WaitResult::Signaled);
    }

    #[test]
    fn one_signal_releases_one_auto_reset_waiter() {
        let _trace = crate::util::test::trace_init();
        let event = Arc::new(Event::new(false));
        let waiters = (0..2)
            .map(|_| {
                let event = event.clone();
                thread::spawn(move || event.wait_timeout(Duration::from_millis(300)))
            })
            .collect::<Vec<_>>();
        thread::sleep(Duration::from_millis(50));
        event.set(true);

        let results = waiters
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect::<Vec<_>>();
        let signaled = results.iter().filter(|r| r.is_signaled()).count();
        assert_eq!(signaled, 1, "results: {results:?}");
        assert!(results
            .iter()
            .any(|r| matches!(r, WaitResult::StillNonSignaled | WaitResult::TimedOut)));
    }

    #[test]
    fn set_and_wait_are_traced() {
        use tracing_subscriber::{
            layer::{Context, SubscriberExt},
            Layer, Registry,
        };

        struct Targets(Arc<Mutex<Vec<String>>>);

        impl<S: tracing::Subscriber> Layer<S> for Targets {
            fn on_event(&self, event: &tracing::Event<'_>, _: Context<'_, S>) {
                let target = event.metadata().target().to_owned();
                self.0.lock().unwrap().push(target);
            }
        }

        let targets = Arc::new(Mutex::new(Vec::new()));
        let subscriber = Registry::default().with(Targets(targets.clone()));
        tracing::subscriber::with_default(subscriber, || {
            let event = Event::new(false);
            event.set(true);
            assert_eq!(event.wait_timeout(Duration::ZERO), WaitResult::Signaled);
            assert_eq!(event.wait_timeout(Duration::ZERO), WaitResult::TimedOut);
        });

        let targets = targets.lock().unwrap();
        let traced = targets
            .iter()
            .filter(|target| target.as_str() == module_path!().trim_end_matches("::tests"))
            .count();
        assert_eq!(traced, 3, "targets: {targets:?}");
    }

    #[test]
    fn poisoned_lock_fails_wait() {
        let event = Event::new(false);
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = event.state.lock().unwrap();
            panic!("poison the event");
        }));
        assert_eq!(event.wait_timeout(Duration::ZERO), WaitResult::Failed);

        // signaling still works.
        event.set(true);
        assert!(event.peek());
    }
}
