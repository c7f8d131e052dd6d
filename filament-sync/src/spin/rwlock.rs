use super::{ExclusiveGuard, RwSpinWait, SharedGuard};
use crate::loom::cell::UnsafeCell;
use core::{
    fmt,
    ops::{Deref, DerefMut},
};

/// A fair, ticket-ordered [readers-writer lock] protecting a value.
///
/// This is a [`RwSpinWait`] coupled with the data it protects. Any number
/// of readers may hold the lock at once, or at most one writer. Acquirers
/// are served in the order they arrived, regardless of whether they are
/// readers or writers.
///
/// # Loom-specific behavior
///
/// When `cfg(loom)` is enabled, this lock will use Loom's simulated atomics,
/// checked `UnsafeCell`, and simulated spin loop hints.
///
/// [readers-writer lock]: https://en.wikipedia.org/wiki/Readers%E2%80%93writer_lock
pub struct TicketRwLock<T> {
    lock: RwSpinWait,
    data: UnsafeCell<T>,
}

/// An RAII implementation of a "scoped read lock" of a [`TicketRwLock`].
///
/// This structure is created by the [`read`] and [`try_read`] methods on
/// [`TicketRwLock`].
///
/// [`read`]: TicketRwLock::read
/// [`try_read`]: TicketRwLock::try_read
#[must_use = "if unused, the `TicketRwLock` will immediately unlock"]
pub struct RwLockReadGuard<'lock, T> {
    data: &'lock UnsafeCell<T>,
    _guard: SharedGuard<'lock>,
}

/// An RAII implementation of a "scoped write lock" of a [`TicketRwLock`].
///
/// This structure is created by the [`write`] and [`try_write`] methods on
/// [`TicketRwLock`].
///
/// [`write`]: TicketRwLock::write
/// [`try_write`]: TicketRwLock::try_write
#[must_use = "if unused, the `TicketRwLock` will immediately unlock"]
pub struct RwLockWriteGuard<'lock, T> {
    data: &'lock UnsafeCell<T>,
    _guard: ExclusiveGuard<'lock>,
}

impl<T> TicketRwLock<T> {
    loom_const_fn! {
        /// Creates a new, unlocked `TicketRwLock<T>` protecting the provided
        /// `data`.
        #[must_use]
        pub fn new(data: T) -> Self {
            Self {
                lock: RwSpinWait::new(),
                data: UnsafeCell::new(data),
            }
        }
    }

    /// Locks this `TicketRwLock` for shared read access, spinning until it
    /// can be acquired.
    #[cfg_attr(test, track_caller)]
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        RwLockReadGuard {
            data: &self.data,
            _guard: self.lock.read(),
        }
    }

    /// Attempts to acquire this `TicketRwLock` for shared read access,
    /// without spinning.
    #[cfg_attr(test, track_caller)]
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        Some(RwLockReadGuard {
            data: &self.data,
            _guard: self.lock.try_read()?,
        })
    }

    /// Locks this `TicketRwLock` for exclusive write access, spinning until
    /// it can be acquired.
    #[cfg_attr(test, track_caller)]
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        RwLockWriteGuard {
            data: &self.data,
            _guard: self.lock.write(),
        }
    }

    /// Attempts to acquire this `TicketRwLock` for exclusive write access,
    /// without spinning.
    ///
    /// This fails if any other thread holds the lock *or is waiting for it*.
    #[cfg_attr(test, track_caller)]
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        Some(RwLockWriteGuard {
            data: &self.data,
            _guard: self.lock.try_write()?,
        })
    }

    /// Returns `true` if the lock is held or contended.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `TicketRwLock` mutably, no actual locking
    /// needs to take place.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe {
            // Safety: we have exclusive access to the lock.
            self.data.with_mut(|data| &mut *data)
        }
    }

    /// Consumes this `TicketRwLock`, returning the guarded data.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for TicketRwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("TicketRwLock");
        s.field("lock", &self.lock);
        match self.try_read() {
            Some(guard) => s.field("data", &&*guard),
            None => s.field("data", &format_args!("<locked>")),
        };
        s.finish()
    }
}

impl<T: Default> Default for TicketRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

unsafe impl<T: Send> Send for TicketRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for TicketRwLock<T> {}

// === impl RwLockReadGuard ===

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe {
            // Safety: we are holding a read lock, so it is okay to dereference
            // the const pointer immutably.
            self.data.with(|data| &*data)
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

unsafe impl<T: Sync> Send for RwLockReadGuard<'_, T> {}
unsafe impl<T: Sync> Sync for RwLockReadGuard<'_, T> {}

// === impl RwLockWriteGuard ===

impl<T> RwLockWriteGuard<'_, T> {
    /// Returns the ticket this writer was served under.
    #[inline]
    #[must_use]
    pub fn ticket(&self) -> u16 {
        self._guard.ticket()
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe {
            // Safety: we are holding the write lock.
            self.data.with(|data| &*data)
        }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            // Safety: we are holding the write lock, so it is okay to
            // dereference the mut pointer mutably.
            self.data.with_mut(|data| &mut *data)
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

unsafe impl<T: Send + Sync> Send for RwLockWriteGuard<'_, T> {}
unsafe impl<T: Send + Sync> Sync for RwLockWriteGuard<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};

    #[test]
    fn write() {
        const WRITERS: usize = 2;

        loom::model(|| {
            let lock = Arc::new(TicketRwLock::<usize>::new(0));
            let threads = (0..WRITERS)
                .map(|_| {
                    let lock = lock.clone();
                    thread::spawn(writer(lock))
                })
                .collect::<Vec<_>>();

            for thread in threads {
                thread.join().expect("writer thread mustn't panic");
            }

            let guard = lock.read();
            assert_eq!(*guard, WRITERS, "final state must equal number of writers");
        });
    }

    #[test]
    fn read_write() {
        // this hits loom's preemption bound with 2 writer threads.
        const WRITERS: usize = if cfg!(loom) { 1 } else { 2 };

        loom::model(|| {
            let lock = Arc::new(TicketRwLock::<usize>::new(0));
            let w_threads = (0..WRITERS)
                .map(|_| {
                    let lock = lock.clone();
                    thread::spawn(writer(lock))
                })
                .collect::<Vec<_>>();

            {
                let guard = lock.read();
                assert!(*guard == 0 || *guard == 1 || *guard == 2);
            }

            for thread in w_threads {
                thread.join().expect("writer thread mustn't panic")
            }

            let guard = lock.read();
            assert_eq!(*guard, WRITERS, "final state must equal number of writers");
        });
    }

    #[test]
    #[cfg(not(loom))]
    fn try_write_fails_while_read() {
        let lock = TicketRwLock::new(String::from("hello"));
        let read = lock.read();
        assert!(lock.try_write().is_none());
        assert_eq!(lock.try_read().as_deref().map(String::as_str), Some("hello"));
        drop(read);

        lock.write().push_str(", world");
        assert_eq!(lock.into_inner(), "hello, world");
    }

    fn writer(lock: Arc<TicketRwLock<usize>>) -> impl FnOnce() {
        move || {
            tracing::debug!("trying to acquire write lock...");
            let mut guard = lock.write();
            tracing::debug!(ticket = guard.ticket(), "got write lock!");
            *guard += 1;
        }
    }
}
