use super::Scheduler;
use crate::{error::BuildError, fiber::MIN_STACK_SIZE, task::StackClass};
use std::{thread, time::Duration};

/// Configures and builds a [`Scheduler`].
///
/// Every setting has a default, so `Builder::new().build()` gives a
/// working scheduler:
///
/// | setting | default |
/// | --- | --- |
/// | [workers](Self::with_workers) | available parallelism − 1, clamped to 1..=64 |
/// | [small fibers](Self::with_fibers) | 128 × 64 KiB |
/// | [normal fibers](Self::with_fibers) | 256 × 256 KiB |
/// | [large fibers](Self::with_fibers) | 8 × 1 MiB |
/// | [max in-flight tasks](Self::with_max_tasks) | 4096 |
/// | [max groups](Self::with_max_groups) | 256 |
/// | [per-priority queue capacity](Self::with_queue_capacity) | 4096 |
/// | [idle timeout](Self::with_idle_timeout) | 20 ms |
/// | [thread name prefix](Self::with_thread_name) | `filament-worker` |
/// | [help while waiting](Self::with_help_while_waiting) | `true` |
#[derive(Debug, Clone)]
#[must_use]
pub struct Builder {
    workers: Option<usize>,
    fibers: [FiberConfig; 3],
    max_tasks: usize,
    max_groups: usize,
    queue_capacity: usize,
    idle_timeout: Duration,
    thread_name: String,
    help_while_waiting: bool,
}

/// The size of one [`StackClass`]'s fiber pool.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FiberConfig {
    /// The number of fibers in the pool.
    pub count: usize,
    /// The size of each fiber's stack, in bytes.
    pub stack_size: usize,
}

/// A validated scheduler configuration, produced by a [`Builder`].
#[derive(Debug, Clone)]
pub struct Config {
    /// The number of worker threads.
    pub workers: usize,
    /// The fiber pool for each [`StackClass`], indexed smallest first.
    pub fibers: [FiberConfig; 3],
    /// The maximum number of spawned tasks that have not yet completed.
    pub max_tasks: usize,
    /// The maximum number of live task groups, including the default group.
    pub max_groups: usize,
    /// The capacity of each worker's run queue, per priority class.
    pub queue_capacity: usize,
    /// How long an idle worker sleeps before looking for work to steal.
    pub idle_timeout: Duration,
    /// The prefix of worker thread names.
    pub thread_name: String,
    /// Whether threads blocked in [`Scheduler::wait_group`],
    /// [`Scheduler::wait_all`] or [`Scheduler::run`] run queued tasks
    /// while they wait.
    pub help_while_waiting: bool,
}

const MAX_WORKERS: usize = 64;
const KIB: usize = 1024;

// === impl Builder ===

impl Builder {
    /// Returns a new builder with the default settings.
    pub fn new() -> Self {
        Self {
            workers: None,
            fibers: [
                FiberConfig::new(128, 64 * KIB),
                FiberConfig::new(256, 256 * KIB),
                FiberConfig::new(8, 1024 * KIB),
            ],
            max_tasks: 4096,
            max_groups: 256,
            queue_capacity: 4096,
            idle_timeout: Duration::from_millis(20),
            thread_name: String::from("filament-worker"),
            help_while_waiting: true,
        }
    }

    /// Sets the number of worker threads.
    pub fn with_workers(self, workers: usize) -> Self {
        Self {
            workers: Some(workers),
            ..self
        }
    }

    /// Sets the size of the fiber pool for `class`.
    ///
    /// A pool may be empty, as long as some pool is not: tasks that ask for
    /// an empty class borrow fibers from a larger one. Spawning a task whose
    /// class and every larger class are empty fails with
    /// [`SpawnError::NoFibers`](crate::error::SpawnError::NoFibers).
    pub fn with_fibers(mut self, class: StackClass, fibers: FiberConfig) -> Self {
        self.fibers[class.index()] = fibers;
        self
    }

    /// Sets the maximum number of spawned tasks that have not yet
    /// completed. Spawning beyond this fails with
    /// [`SpawnError::TasksExhausted`](crate::error::SpawnError::TasksExhausted).
    pub fn with_max_tasks(self, max_tasks: usize) -> Self {
        Self { max_tasks, ..self }
    }

    /// Sets the maximum number of live task groups, including the default
    /// group.
    pub fn with_max_groups(self, max_groups: usize) -> Self {
        Self { max_groups, ..self }
    }

    /// Sets the capacity of each worker's run queue, per priority class.
    pub fn with_queue_capacity(self, queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            ..self
        }
    }

    /// Sets how long an idle worker sleeps before looking for work to
    /// steal.
    pub fn with_idle_timeout(self, idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            ..self
        }
    }

    /// Sets the prefix of worker thread names. Worker `n` is named
    /// `{prefix}-{n}`.
    pub fn with_thread_name(self, prefix: impl Into<String>) -> Self {
        Self {
            thread_name: prefix.into(),
            ..self
        }
    }

    /// Sets whether a thread blocked waiting on the scheduler from outside
    /// steals and runs queued tasks until its wait is over, rather than
    /// only spinning.
    ///
    /// Helping threads run tasks exactly as workers do, but tasks they run
    /// report the index of the worker they were stolen from.
    pub fn with_help_while_waiting(self, help_while_waiting: bool) -> Self {
        Self {
            help_while_waiting,
            ..self
        }
    }

    /// Validates the configuration without building a scheduler.
    pub fn config(&self) -> Result<Config, BuildError> {
        let workers = match self.workers {
            Some(0) => return Err(BuildError::NoWorkers),
            Some(requested) if requested > MAX_WORKERS => {
                return Err(BuildError::TooManyWorkers {
                    requested,
                    max: MAX_WORKERS,
                })
            }
            Some(workers) => workers,
            None => thread::available_parallelism()
                .map_or(1, |n| n.get().saturating_sub(1))
                .clamp(1, MAX_WORKERS),
        };

        if self.fibers.iter().all(|pool| pool.count == 0) {
            return Err(BuildError::NoFibers);
        }
        for (class, pool) in StackClass::ALL.into_iter().zip(self.fibers) {
            if pool.count > 0 && pool.stack_size < MIN_STACK_SIZE {
                return Err(BuildError::StackTooSmall {
                    class,
                    size: pool.stack_size,
                    min: MIN_STACK_SIZE,
                });
            }
        }

        if self.max_tasks == 0 {
            return Err(BuildError::ZeroCapacity { pool: "task" });
        }
        if self.max_groups == 0 {
            return Err(BuildError::ZeroCapacity { pool: "group" });
        }
        // A task sits in at most one queue at a time, so this guarantees a
        // requeued task always finds room somewhere.
        if self.queue_capacity.saturating_mul(workers) < self.max_tasks {
            return Err(BuildError::QueueTooSmall {
                queue_capacity: self.queue_capacity,
                workers,
                max_tasks: self.max_tasks,
            });
        }

        Ok(Config {
            workers,
            fibers: self.fibers,
            max_tasks: self.max_tasks,
            max_groups: self.max_groups,
            queue_capacity: self.queue_capacity,
            idle_timeout: self.idle_timeout,
            thread_name: self.thread_name.clone(),
            help_while_waiting: self.help_while_waiting,
        })
    }

    /// Allocates the scheduler's pools and starts its worker threads.
    pub fn build(self) -> Result<Scheduler, BuildError> {
        Scheduler::start(self.config()?)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

// === impl FiberConfig ===

impl FiberConfig {
    /// Returns a pool of `count` fibers with `stack_size`-byte stacks.
    #[must_use]
    pub const fn new(count: usize, stack_size: usize) -> Self {
        Self { count, stack_size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Builder::new().config().expect("defaults are valid");
        assert!((1..=MAX_WORKERS).contains(&config.workers));
        assert_eq!(config.fibers[StackClass::Small.index()], FiberConfig::new(128, 64 * KIB));
        assert_eq!(config.fibers[StackClass::Normal.index()], FiberConfig::new(256, 256 * KIB));
        assert_eq!(config.fibers[StackClass::Large.index()], FiberConfig::new(8, 1024 * KIB));
        assert_eq!(config.max_tasks, 4096);
        assert_eq!(config.max_groups, 256);
        assert_eq!(config.queue_capacity, 4096);
        assert_eq!(config.idle_timeout, Duration::from_millis(20));
        assert_eq!(config.thread_name, "filament-worker");
        assert!(config.help_while_waiting);
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(matches!(
            Builder::new().with_workers(0).config(),
            Err(BuildError::NoWorkers)
        ));
        assert!(matches!(
            Builder::new().with_workers(65).config(),
            Err(BuildError::TooManyWorkers { requested: 65, max: 64 })
        ));

        let empty = FiberConfig::new(0, 64 * KIB);
        let no_fibers = Builder::new()
            .with_fibers(StackClass::Small, empty)
            .with_fibers(StackClass::Normal, empty)
            .with_fibers(StackClass::Large, empty);
        assert!(matches!(no_fibers.config(), Err(BuildError::NoFibers)));

        assert!(matches!(
            Builder::new()
                .with_fibers(StackClass::Large, FiberConfig::new(1, 1024))
                .config(),
            Err(BuildError::StackTooSmall { class: StackClass::Large, size: 1024, .. })
        ));
        assert!(matches!(
            Builder::new().with_max_tasks(0).config(),
            Err(BuildError::ZeroCapacity { pool: "task" })
        ));
        assert!(matches!(
            Builder::new().with_max_groups(0).config(),
            Err(BuildError::ZeroCapacity { pool: "group" })
        ));
        assert!(matches!(
            Builder::new()
                .with_workers(2)
                .with_max_tasks(100)
                .with_queue_capacity(10)
                .config(),
            Err(BuildError::QueueTooSmall { .. })
        ));
    }

    #[test]
    fn empty_pool_may_have_any_stack_size() {
        let config = Builder::new()
            .with_fibers(StackClass::Large, FiberConfig::new(0, 0))
            .config()
            .expect("an empty pool's stack size is irrelevant");
        assert_eq!(config.fibers[StackClass::Large.index()].count, 0);
    }
}
