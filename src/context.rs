//! The capability handed to every running task.
use crate::{
    error::{GroupError, SpawnError},
    fiber::{FiberId, FiberInput, FiberSignal},
    scheduler::Shared,
    task::{TaskDesc, TaskGroup, TaskId},
};
use core::{cell::Cell, fmt};
use corosensei::Yielder;
use filament_slab::SlotId;
use std::time::{Duration, Instant};

/// The scheduler, as seen from inside a running task.
///
/// Every task body is called with a reference to an `ExecutionContext`.
/// Through it, the task can spawn more tasks, create and release groups,
/// and suspend itself, either until a group drains
/// ([`wait_for_group`](Self::wait_for_group)) or for a while
/// ([`yield_for`](Self::yield_for)).
///
/// Suspending switches off the task's fiber and back to the worker
/// thread's scheduling loop, without blocking the thread. The task's stack
/// is preserved exactly as it was, and the task continues from the same
/// point when it is resumed, possibly on a different worker thread. Task
/// bodies should therefore not hold on to thread-local state across a
/// suspension.
pub struct ExecutionContext<'fiber> {
    shared: &'fiber Shared,
    yielder: &'fiber Yielder<FiberInput, FiberSignal>,
    fiber: FiberId,
    task: SlotId,
    id: TaskId,
    /// The worker currently running this task. Changes if the task is
    /// resumed on a different worker.
    worker: Cell<usize>,
}

impl<'fiber> ExecutionContext<'fiber> {
    /// The longest a single [`yield_for`](Self::yield_for) will suspend for.
    pub const MAX_YIELD: Duration = Duration::from_secs(24 * 60 * 60);

    pub(crate) fn new(
        shared: &'fiber Shared,
        yielder: &'fiber Yielder<FiberInput, FiberSignal>,
        fiber: FiberId,
        task: SlotId,
        id: TaskId,
        worker: usize,
    ) -> Self {
        Self {
            shared,
            yielder,
            fiber,
            task,
            id,
            worker: Cell::new(worker),
        }
    }

    /// Spawns a task into `group`.
    ///
    /// The task is queued on the current worker. Idle workers steal from
    /// busy ones, so it may run anywhere.
    pub fn spawn(&self, desc: TaskDesc, group: TaskGroup) -> Result<TaskId, SpawnError> {
        self.shared
            .spawn(desc, group, Some((self.worker.get(), self.fiber)))
    }

    /// Suspends the current task until `group` has no outstanding tasks.
    ///
    /// Every task spawned into `group` before this call has completed when
    /// it returns, and its effects are visible to the caller. Tasks spawned
    /// into the group while this task waits extend the wait.
    ///
    /// Only one task waits on a group at a time. If another task is
    /// already waiting on `group`, this one polls the group instead, which
    /// is correct but slower.
    ///
    /// # Errors
    ///
    /// [`GroupError::StaleGroup`] if `group` has been released.
    pub fn wait_for_group(&self, group: TaskGroup) -> Result<(), GroupError> {
        let record = self.shared.group(group).ok_or(GroupError::StaleGroup)?;
        let mut suspensions = 0usize;
        while record.outstanding() != 0 {
            self.suspend(FiberSignal::AwaitGroup(group));
            suspensions += 1;
        }
        tracing::trace!(?group, suspensions, "group drained");
        Ok(())
    }

    /// Suspends the current task for at least `timeout`, letting the
    /// worker run other tasks in the meantime.
    ///
    /// This is for polling something outside the scheduler without
    /// busy-waiting. Timeouts longer than [`Self::MAX_YIELD`] are clamped.
    pub fn yield_for(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout.min(Self::MAX_YIELD);
        self.suspend(FiberSignal::Yielded(deadline));
    }

    /// Suspends the current task and requeues it behind the work that is
    /// already queued.
    pub fn yield_now(&self) {
        self.yield_for(Duration::ZERO);
    }

    /// Takes a new, empty task group from the scheduler's group pool.
    pub fn create_group(&self) -> Result<TaskGroup, GroupError> {
        self.shared.create_group()
    }

    /// Returns a drained task group to the scheduler's group pool.
    pub fn release_group(&self, group: TaskGroup) -> Result<(), GroupError> {
        self.shared.release_group(group)
    }

    /// Returns the ID of the running task.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// Returns the index of the worker thread currently running this task.
    #[must_use]
    pub fn worker_index(&self) -> usize {
        self.worker.get()
    }

    /// Returns the number of tasks in `group` that have not yet completed,
    /// or `None` if `group` has been released.
    #[must_use]
    pub fn outstanding(&self, group: TaskGroup) -> Option<usize> {
        self.shared.group(group).map(|record| record.outstanding())
    }

    fn suspend(&self, signal: FiberSignal) {
        tracing::trace!(?signal, "suspending task");
        let input = self.yielder.suspend(signal);
        debug_assert_eq!(input.task, self.task, "fiber resumed for a different task");
        self.worker.set(input.worker);
    }
}

impl fmt::Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("task", &self.id)
            .field("fiber", &self.fiber)
            .field("worker", &self.worker.get())
            .finish_non_exhaustive()
    }
}
