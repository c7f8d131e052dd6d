use core::fmt;

/// A unique identifier for a spawned task.
///
/// `TaskId`s are never reused, even though the records that back tasks
/// are. A `TaskId` is returned by [`Scheduler::spawn`] and
/// [`ExecutionContext::spawn`], and can be read from inside a task with
/// [`ExecutionContext::task_id`].
///
/// [`Scheduler::spawn`]: crate::Scheduler::spawn
/// [`ExecutionContext::spawn`]: crate::ExecutionContext::spawn
/// [`ExecutionContext::task_id`]: crate::ExecutionContext::task_id
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        // Don't use loom atomics, since this has to go in a static.
        use portable_atomic::{AtomicU64, Ordering::Relaxed};

        // ID 0 marks an unused task record.
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Relaxed);

        debug_assert!(id > 0, "64-bit task ID counter should not overflow!");
        Self(id)
    }

    #[must_use]
    #[inline]
    pub(crate) const fn unused() -> Self {
        Self(0)
    }

    /// Returns the ID as a `u64`.
    #[must_use]
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskId(")?;
        fmt::Debug::fmt(&self.0, f)?;
        f.write_str(")")
    }
}

impl fmt::Display for TaskId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
