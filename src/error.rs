//! Errors returned by the scheduler.
use crate::task::StackClass;
use std::io;
use thiserror::Error;

/// Errors returned when spawning a task.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SpawnError {
    /// Every task record is in use.
    #[error("all {capacity} task records are in use")]
    TasksExhausted {
        /// The number of task records the scheduler was built with.
        capacity: usize,
    },
    /// The target worker's run queue for the task's priority class is full.
    #[error("run queue of worker {worker} is full")]
    QueueFull {
        /// The index of the worker whose queue was full.
        worker: usize,
    },
    /// The task group handle refers to a group that has been released.
    #[error("task group has been released")]
    StaleGroup,
    /// The scheduler has no fibers that could run a task of this stack
    /// class: its pool and every larger pool were configured empty.
    #[error("no fiber pool can host a {stack:?} task")]
    NoFibers {
        /// The stack class the task asked for.
        stack: StackClass,
    },
    /// The scheduler is shutting down and accepts no new tasks.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Errors returned by task group operations.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum GroupError {
    /// Every group record is in use.
    #[error("all {capacity} task groups are in use")]
    GroupsExhausted {
        /// The number of group records the scheduler was built with.
        capacity: usize,
    },
    /// The task group handle refers to a group that has been released.
    #[error("task group has been released")]
    StaleGroup,
    /// The default group cannot be released.
    #[error("the default task group cannot be released")]
    DefaultGroup,
    /// The group still has outstanding tasks, so it cannot be released.
    #[error("task group still has {outstanding} outstanding tasks")]
    Busy {
        /// The number of tasks still outstanding in the group.
        outstanding: usize,
    },
}

/// Errors returned by [`Builder::build`](crate::scheduler::Builder::build).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The scheduler was configured with zero worker threads.
    #[error("a scheduler needs at least one worker thread")]
    NoWorkers,
    /// The scheduler was configured with more workers than it supports.
    #[error("{requested} workers requested, but at most {max} are supported")]
    TooManyWorkers {
        /// The number of workers requested.
        requested: usize,
        /// The maximum number of workers.
        max: usize,
    },
    /// Every fiber pool was configured to be empty.
    #[error("at least one fiber pool must have a fiber in it")]
    NoFibers,
    /// A fiber pool's stacks are too small to run a task on.
    #[error("{class:?} fiber stacks of {size} bytes are smaller than the minimum of {min} bytes")]
    StackTooSmall {
        /// The stack class that was misconfigured.
        class: StackClass,
        /// The configured stack size.
        size: usize,
        /// The smallest stack size supported.
        min: usize,
    },
    /// A record pool was configured with zero capacity.
    #[error("the {pool} pool must not be empty")]
    ZeroCapacity {
        /// The name of the empty pool.
        pool: &'static str,
    },
    /// The run queues cannot hold every task record at once.
    #[error(
        "run queues of {queue_capacity} entries on {workers} workers cannot hold {max_tasks} tasks"
    )]
    QueueTooSmall {
        /// The configured per-priority queue capacity.
        queue_capacity: usize,
        /// The configured number of workers.
        workers: usize,
        /// The configured number of task records.
        max_tasks: usize,
    },
    /// Allocating a fiber stack failed.
    #[error("failed to allocate a {class:?} fiber stack")]
    AllocateStack {
        /// The stack class being allocated.
        class: StackClass,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Spawning a worker thread failed.
    #[error("failed to spawn worker thread {worker}")]
    SpawnWorker {
        /// The index of the worker that could not be spawned.
        worker: usize,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },
}
