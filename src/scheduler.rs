//! The scheduler: worker threads, run queues and the task, group and fiber
//! pools they share.
//!
//! A [`Scheduler`] is built by a [`Builder`], which allocates every pool
//! up front and starts one OS thread per worker. Each worker loops over its
//! own [run queue](queue), running queued tasks on fibers, stealing from
//! its siblings when it runs dry, and sleeping on an [`Event`] when there
//! is nothing to do at all.
use crate::{
    error::{BuildError, GroupError, SpawnError},
    fiber::{FiberId, FiberPool, FiberState},
    loom::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering::*},
            Arc,
        },
        thread::{self, JoinHandle},
    },
    task::{GroupSlot, GroupedTask, Priority, TaskDesc, TaskGroup, TaskId},
};
use core::fmt;
use filament_slab::{SlotAllocator, SlotId};
use filament_sync::{
    backoff::{Pause, Yield},
    util::CachePadded,
    AtomicDoOnce, Backoff, Event,
};
use std::time::{Duration, Instant};

mod builder;
mod queue;
mod worker;


pub use self::builder::{Builder, Config, FiberConfig};
pub(crate) use self::queue::{RunQueue, TryStealError};
use self::worker::Worker;

/// A pool of worker threads running tasks on fibers.
///
/// See the [crate-level documentation](crate) for an overview.
///
/// Dropping a `Scheduler` shuts it down, like [`Scheduler::shutdown`].
pub struct Scheduler {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

/// State shared by the scheduler handle and every worker.
pub(crate) struct Shared {
    // Dropped first: unwinding suspended fibers may still touch the other
    // pools.
    pub(crate) fibers: FiberPool,
    pub(crate) tasks: SlotAllocator<GroupedTask>,
    pub(crate) groups: SlotAllocator<GroupSlot>,
    pub(crate) workers: Box<[CachePadded<WorkerShared>]>,
    running: AtomicBool,
    stopped: AtomicDoOnce,
    next_worker: AtomicUsize,
    pub(crate) config: Config,
}

/// The parts of a worker that other threads touch.
pub(crate) struct WorkerShared {
    pub(crate) queue: RunQueue,
    /// Set whenever work is pushed to this worker, or it should stop.
    pub(crate) event: Event,
}

// === impl Scheduler ===

impl Scheduler {
    /// Returns a new [`Builder`] for configuring a scheduler.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Builds a scheduler with the default configuration.
    pub fn new() -> Result<Self, BuildError> {
        Builder::new().build()
    }

    pub(crate) fn start(config: Config) -> Result<Self, BuildError> {
        let workers = config.workers;
        let shared = Arc::new(Shared::new(config)?);
        let mut scheduler = Self {
            shared,
            threads: Vec::with_capacity(workers),
        };

        for id in 0..workers {
            let shared = scheduler.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{id}", scheduler.shared.config.thread_name))
                .spawn(move || Worker::new(id, &shared).run())
                // dropping the scheduler stops the workers started so far.
                .map_err(|source| BuildError::SpawnWorker { worker: id, source })?;
            scheduler.threads.push(handle);
        }

        tracing::info!(
            workers,
            max_tasks = scheduler.shared.config.max_tasks,
            max_groups = scheduler.shared.config.max_groups,
            "scheduler started"
        );
        Ok(scheduler)
    }

    /// Spawns a task into `group` from outside the scheduler.
    ///
    /// Tasks spawned from outside are distributed across the workers
    /// round-robin. To spawn from inside a task, use
    /// [`ExecutionContext::spawn`](crate::ExecutionContext::spawn).
    pub fn spawn(&self, desc: TaskDesc, group: TaskGroup) -> Result<TaskId, SpawnError> {
        self.shared.spawn(desc, group, None)
    }

    /// Takes a new, empty task group from the scheduler's group pool.
    pub fn create_group(&self) -> Result<TaskGroup, GroupError> {
        self.shared.create_group()
    }

    /// Returns a drained task group to the scheduler's group pool.
    ///
    /// Every existing handle to `group` becomes stale.
    pub fn release_group(&self, group: TaskGroup) -> Result<(), GroupError> {
        self.shared.release_group(group)
    }

    /// Blocks the calling thread until `group` has no outstanding tasks, or
    /// until `timeout` elapses.
    ///
    /// Returns `true` if the group drained, or if `group` is stale (and so
    /// was drained when it was released). Unless the scheduler was built
    /// with [`Builder::with_help_while_waiting`]`(false)`, the calling
    /// thread steals and runs queued tasks while it waits. Otherwise it
    /// spins and yields.
    ///
    /// This must not be called from inside a task: tasks use
    /// [`ExecutionContext::wait_for_group`] instead.
    ///
    /// [`ExecutionContext::wait_for_group`]: crate::ExecutionContext::wait_for_group
    pub fn wait_group(&self, group: TaskGroup, timeout: Duration) -> bool {
        self.shared
            .wait_group(group, Instant::now().checked_add(timeout))
    }

    /// Blocks the calling thread until no task is outstanding in any
    /// group, or until `timeout` elapses.
    ///
    /// Returns `true` if every task completed.
    pub fn wait_all(&self, timeout: Duration) -> bool {
        self.shared
            .wait_until(Instant::now().checked_add(timeout), || {
                self.shared.outstanding() == 0
            })
    }

    /// Spawns `desc` as a root task and blocks the calling thread until it,
    /// and every task it spawns into its group, has completed.
    ///
    /// The root task runs in a group of its own if one is available, and in
    /// [`TaskGroup::DEFAULT`] otherwise.
    pub fn run(&self, desc: TaskDesc) -> Result<(), SpawnError> {
        let group = self.create_group().unwrap_or(TaskGroup::DEFAULT);
        let _span = tracing::debug_span!("run", ?group).entered();

        let spawned = self.spawn(desc, group);
        if spawned.is_ok() {
            self.shared.wait_group(group, None);
        }
        if !group.is_default() {
            if let Err(error) = self.release_group(group) {
                tracing::warn!(%error, ?group, "failed to release root task group");
            }
        }
        spawned.map(|_| ())
    }

    /// Returns `true` if every task record and fiber is free and every
    /// group but the default group has been released.
    ///
    /// This is a diagnostic for tests and tooling.
    #[must_use]
    pub fn check_all_free(&self) -> bool {
        self.shared.check_all_free()
    }

    /// Returns the number of spawned tasks that have not yet completed,
    /// across all groups.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding()
    }

    /// Returns the number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.shared.workers.len()
    }

    /// Returns the scheduler's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Stops every worker and waits for their threads to exit.
    ///
    /// Workers finish the task they are running, but queued tasks are not
    /// run, and tasks suspended in the middle of their body are unwound
    /// once the last worker exits.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shared.stop();
        for (id, thread) in self.threads.drain(..).enumerate() {
            if thread.join().is_err() {
                tracing::error!(worker = id, "worker thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("shared", &self.shared)
            .field("threads", &self.threads.len())
            .finish()
    }
}

// === impl Shared ===

impl Shared {
    /// How long a task whose group already has a waiter sleeps before it
    /// checks the group again.
    const CONTENDED_WAIT: Duration = Duration::from_micros(100);

    fn new(config: Config) -> Result<Self, BuildError> {
        let fibers = FiberPool::new(&config)?;
        let tasks = SlotAllocator::new(config.max_tasks);
        let groups = SlotAllocator::new(config.max_groups);
        let _default = groups.take_available();
        debug_assert_eq!(_default, Some(TaskGroup::DEFAULT.slot()));

        let workers = (0..config.workers)
            .map(|_| {
                CachePadded::new(WorkerShared {
                    queue: RunQueue::new(config.queue_capacity),
                    event: Event::new(false),
                })
            })
            .collect();

        Ok(Self {
            fibers,
            tasks,
            groups,
            workers,
            running: AtomicBool::new(true),
            stopped: AtomicDoOnce::new(),
            next_worker: AtomicUsize::new(0),
            config,
        })
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Acquire)
    }

    fn stop(&self) {
        self.stopped.run_initializer(|| {
            self.running.store(false, Release);
            for worker in self.workers.iter() {
                worker.event.set(true);
            }
            tracing::info!(
                outstanding = self.outstanding(),
                "stopping scheduler workers"
            );
        });
    }

    /// Spawns a task. `parent` is the spawning worker and fiber, if the
    /// task is spawned from inside another task.
    pub(crate) fn spawn(
        &self,
        desc: TaskDesc,
        group: TaskGroup,
        parent: Option<(usize, FiberId)>,
    ) -> Result<TaskId, SpawnError> {
        if !self.is_running() {
            return Err(SpawnError::ShuttingDown);
        }
        let group_slot = self.group(group).ok_or(SpawnError::StaleGroup)?;
        if !self.fibers.can_host(desc.stack) {
            return Err(SpawnError::NoFibers { stack: desc.stack });
        }
        let slot = self
            .tasks
            .take_available()
            .ok_or(SpawnError::TasksExhausted {
                capacity: self.tasks.capacity(),
            })?;

        let priority = desc.priority;
        let name = desc.name;
        // Safety: we just took the slot, so we own the record.
        let id = unsafe {
            self.tasks
                .get(slot)
                .init(desc, group, parent.map(|(_, fiber)| fiber))
        };
        // The group must account for the task before any worker can see it.
        // This fails if the group was released since it was looked up.
        if !group_slot.try_add(group) {
            // Safety: we still own the record.
            unsafe { self.tasks.get(slot).reset() };
            self.tasks.put_back(slot);
            return Err(SpawnError::StaleGroup);
        }

        let worker = match parent {
            Some((worker, _)) => worker,
            None => self.next_worker.fetch_add(1, Relaxed) % self.workers.len(),
        };
        let target = &self.workers[worker];
        if let Err(slot) = target.queue.push(priority, slot) {
            if let Some(waiter) = self.retire_task(slot, worker) {
                self.requeue_waiter(waiter, worker);
            }
            return Err(SpawnError::QueueFull { worker });
        }

        tracing::trace!(task.id = %id, task.name = name, ?group, worker, "spawned task");
        target.event.set(true);
        // The spawning worker is busy running the parent, so nudge a
        // sibling to come and steal.
        if parent.is_some() && target.queue.len() > 1 {
            let sibling = (worker + 1) % self.workers.len();
            if sibling != worker {
                self.workers[sibling].event.set(true);
            }
        }
        Ok(id)
    }

    /// Frees a task's record and accounts for its completion in its group.
    ///
    /// If this was the group's last task and its waiter is the fiber that
    /// spawned this task, the waiter is returned so the completing worker
    /// can resume it directly, while the child's data is still hot in its
    /// cache. Any other waiter is requeued.
    #[must_use]
    pub(crate) fn retire_task(&self, slot: SlotId, worker: usize) -> Option<SlotId> {
        let record = self.tasks.get(slot);
        // Safety: the caller owns the slot, and gives it up here.
        let (group, parent) = unsafe {
            let parent = record.with(|task| task.parent_fiber);
            (record.reset(), parent)
        };
        // Freed before the group is decremented, so that a waiter that
        // observes the drained group also observes the freed record.
        self.tasks.put_back(slot);
        let waiter = self.groups.get(group.slot()).complete()?;

        // Safety: the group handed the waiter's record to us.
        let fiber = unsafe { self.tasks.get(waiter).with(|task| task.awaiting_fiber) };
        if let Some(fiber) = fiber {
            self.fibers
                .get(fiber)
                .transition(FiberState::Suspended, FiberState::Runnable);
            if Some(fiber) == parent {
                tracing::trace!(?fiber, worker, "group drained; resuming parent");
                return Some(waiter);
            }
        }
        self.requeue_waiter(waiter, worker);
        None
    }

    /// Requeues a task that was registered as a group's waiter, after that
    /// group drained.
    fn requeue_waiter(&self, waiter: SlotId, worker: usize) {
        // Safety: the group handed the waiter's record to us.
        let (priority, id) = unsafe {
            self.tasks
                .get(waiter)
                .with(|task| (task.priority, task.id))
        };
        tracing::trace!(task.id = %id, worker, "group drained; waking waiter");
        self.requeue(waiter, priority, worker);
    }

    /// Queues a task that was already accounted for in its group, on
    /// `preferred` if it has room or on the first worker that does.
    pub(crate) fn requeue(&self, task: SlotId, priority: Priority, preferred: usize) {
        let workers = self.workers.len();
        let mut boff = Backoff::<Pause, Yield>::new();
        loop {
            for i in 0..workers {
                let worker = (preferred + i) % workers;
                if self.workers[worker].queue.push(priority, task).is_ok() {
                    if worker != preferred {
                        self.workers[worker].event.set(true);
                    }
                    return;
                }
            }
            // Every queue is full for now, but the queues have room for
            // every task record, so some worker is about to dequeue one.
            boff.spin();
        }
    }

    /// Returns the record for `group`, if the handle is still current.
    pub(crate) fn group(&self, group: TaskGroup) -> Option<&GroupSlot> {
        let slot = group.slot();
        if slot.index() >= self.groups.capacity() || !self.groups.is_taken(slot) {
            return None;
        }
        let record = self.groups.get(slot);
        record.is_current(group).then_some(record)
    }

    pub(crate) fn create_group(&self) -> Result<TaskGroup, GroupError> {
        let slot = self
            .groups
            .take_available()
            .ok_or(GroupError::GroupsExhausted {
                capacity: self.groups.capacity(),
            })?;
        let group = TaskGroup::new(slot, self.groups.get(slot).generation());
        tracing::trace!(?group, "created group");
        Ok(group)
    }

    pub(crate) fn release_group(&self, group: TaskGroup) -> Result<(), GroupError> {
        if group.is_default() {
            return Err(GroupError::DefaultGroup);
        }
        let record = self.group(group).ok_or(GroupError::StaleGroup)?;
        record.retire(group)?;
        self.groups.put_back(group.slot());
        tracing::trace!(?group, "released group");
        Ok(())
    }

    /// Waits for `group` from a thread that is not a worker.
    pub(crate) fn wait_group(&self, group: TaskGroup, deadline: Option<Instant>) -> bool {
        let Some(record) = self.group(group) else {
            return true;
        };
        self.wait_until(deadline, || record.outstanding() == 0)
    }

    /// Waits until `done` returns `true` or `deadline` passes, running
    /// queued tasks in the meantime if the scheduler is configured to.
    fn wait_until(&self, deadline: Option<Instant>, mut done: impl FnMut() -> bool) -> bool {
        let mut helper = self
            .config
            .help_while_waiting
            .then(|| Worker::helper(self));
        let mut boff = Backoff::<Pause, Yield>::new();
        loop {
            if done() {
                return true;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return false;
            }
            let helped = match helper.as_mut() {
                Some(helper) if self.is_running() => helper.help(),
                _ => false,
            };
            if helped {
                boff.reset();
            } else {
                boff.spin();
            }
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.groups
            .iter()
            .map(|(_, group)| group.outstanding())
            .sum()
    }

    fn check_all_free(&self) -> bool {
        let tasks = self.tasks.check_all_free();
        let fibers = self.fibers.check_all_free();
        // only the default group is still taken.
        let groups = self.groups.taken() == 1;
        let outstanding = self.outstanding();
        tracing::debug!(tasks, fibers, groups, outstanding, "Scheduler::check_all_free");
        tasks && fibers && groups && outstanding == 0
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("running", &self.is_running())
            .field("tasks", &self.tasks)
            .field("groups", &self.groups)
            .field("fibers", &self.fibers)
            .field("outstanding", &self.outstanding())
            .field(
                "queues",
                &self.workers.iter().map(|w| &w.queue).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}
