use super::{Shared, TryStealError};
use crate::{
    fiber::{FiberInput, FiberSignal, FiberState},
    loom::sync::atomic::Ordering::Relaxed,
    task::Register,
};
use filament_slab::SlotId;
use std::time::Instant;

/// One worker thread's scheduling loop.
///
/// A thread waiting on the scheduler from outside may also run a `Worker`
/// as a *helper*. A helper has no queue of its own: it steals from the
/// workers, and runs what it steals on behalf of the worker it stole from.
pub(super) struct Worker<'shared> {
    /// For a helper, the worker it is currently standing in for.
    id: usize,
    shared: &'shared Shared,
    /// Tasks popped this tick that can't run yet. They are requeued when
    /// the tick ends, so a tick never pops the same task twice.
    deferred: Vec<SlotId>,
    helper: bool,
}

/// Metrics recorded during a single scheduler tick.
#[derive(Debug, Default)]
#[non_exhaustive]
pub(super) struct Tick {
    /// The number of tasks run (started or resumed) on this tick.
    pub(super) ran: usize,
    /// The number of tasks that ran to completion on this tick.
    ///
    /// This is always <= `self.ran`.
    pub(super) completed: usize,
    /// The number of tasks that suspended on this tick.
    pub(super) suspended: usize,
    /// The number of tasks stolen from other workers.
    pub(super) stolen: usize,
    /// The number of tasks popped whose yield deadline had not passed.
    pub(super) deferred: usize,
    /// The number of tasks that could not start because every eligible
    /// fiber pool was exhausted.
    pub(super) starved: usize,
    /// The number of waiting parents resumed directly by the worker that
    /// completed their last child.
    pub(super) handoffs: usize,
    /// The earliest deadline among deferred tasks.
    pub(super) next_deadline: Option<Instant>,
}

impl<'shared> Worker<'shared> {
    /// How many tasks are run per tick, at most.
    ///
    /// Chosen by fair dice roll, guaranteed to be random.
    const TICK_SIZE: usize = 256;

    pub(super) fn new(id: usize, shared: &'shared Shared) -> Self {
        Self {
            id,
            shared,
            deferred: Vec::new(),
            helper: false,
        }
    }

    /// Returns a helper for a thread that is waiting on the scheduler.
    pub(super) fn helper(shared: &'shared Shared) -> Self {
        Self {
            helper: true,
            ..Self::new(0, shared)
        }
    }

    /// Runs this worker until the scheduler stops.
    pub(super) fn run(mut self) {
        let _span = tracing::info_span!("worker", id = self.id).entered();
        tracing::info!("started worker loop");

        while self.shared.is_running() {
            let tick = self.tick();
            if tick.ran == 0 {
                self.idle(tick.next_deadline);
            }
        }

        tracing::info!("stop signal received, shutting down");
    }

    /// Runs one tick: up to [`Self::TICK_SIZE`] tasks from the local queue,
    /// stealing from siblings once it is empty.
    fn tick(&mut self) -> Tick {
        let mut tick = Tick::default();

        while tick.ran < Self::TICK_SIZE && self.shared.is_running() {
            let task = match self.shared.workers[self.id].queue.pop_oldest() {
                Some(task) => task,
                None => match self.steal() {
                    Some(task) => {
                        tick.stolen += 1;
                        task
                    }
                    None => break,
                },
            };
            self.run_chain(task, &mut tick);
        }

        self.requeue_deferred();

        if tick.ran > 0 || tick.stolen > 0 {
            tracing::trace!(
                worker = self.id,
                tick.ran,
                tick.completed,
                tick.suspended,
                tick.stolen,
                tick.deferred,
                tick.starved,
                tick.handoffs,
            );
        }

        tick
    }

    /// Steals one task and runs it, on behalf of the worker it was stolen
    /// from. Returns `true` if a task actually ran.
    ///
    /// Only helpers call this.
    pub(super) fn help(&mut self) -> bool {
        debug_assert!(self.helper, "only helpers help");
        let workers = self.shared.workers.len();
        let start = self.shared.next_worker.fetch_add(1, Relaxed) % workers;
        let stolen = (0..workers).find_map(|i| {
            let victim = (start + i) % workers;
            let task = self.shared.workers[victim].queue.steal_newest().ok()?;
            Some((victim, task))
        });

        let mut tick = Tick::default();
        if let Some((victim, task)) = stolen {
            self.id = victim;
            tick.stolen += 1;
            let _span = tracing::debug_span!("help", victim).entered();
            self.run_chain(task, &mut tick);
        }
        self.requeue_deferred();
        tick.ran > 0
    }

    /// Runs `task`, then any waiting parent it hands off to, and so on.
    fn run_chain(&mut self, task: SlotId, tick: &mut Tick) {
        let mut next = Some(task);
        while let Some(task) = next {
            next = self.execute(task, tick);
            if next.is_some() {
                tick.handoffs += 1;
            }
        }
    }

    /// Requeues the tasks deferred during this tick.
    fn requeue_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        for task in self.deferred.drain(..) {
            // Safety: deferred tasks are still owned by this worker.
            let priority = unsafe { self.shared.tasks.get(task).with(|task| task.priority) };
            self.shared.requeue(task, priority, self.id);
        }
        if self.helper {
            // the worker we stood in for doesn't know about these.
            self.shared.workers[self.id].event.set(true);
        }
    }

    /// Takes one task from the first sibling with any to spare.
    fn steal(&self) -> Option<SlotId> {
        let workers = self.shared.workers.len();
        (1..workers).find_map(|i| {
            let victim = (self.id + i) % workers;
            match self.shared.workers[victim].queue.steal_newest() {
                Ok(task) => {
                    tracing::trace!(victim, "stole task");
                    Some(task)
                }
                Err(TryStealError::Busy | TryStealError::Empty) => None,
            }
        })
    }

    /// Binds `slot`'s task to a fiber and runs it until it completes or
    /// suspends.
    ///
    /// Returns the task's parent, if the task was the last one its parent
    /// was waiting for. The parent should run next, on this worker.
    #[must_use]
    fn execute(&mut self, slot: SlotId, tick: &mut Tick) -> Option<SlotId> {
        let shared = self.shared;
        let record = shared.tasks.get(slot);
        // Safety: this worker dequeued the slot, so it owns the record.
        let (id, name, stack, suspended_on, resume_after, parent) = unsafe {
            record.with(|task| {
                (
                    task.id,
                    task.name,
                    task.stack,
                    task.awaiting_fiber,
                    task.resume_after,
                    task.parent_fiber,
                )
            })
        };

        if let Some(deadline) = resume_after {
            if Instant::now() < deadline {
                tick.deferred += 1;
                tick.next_deadline = Some(match tick.next_deadline {
                    Some(next) => next.min(deadline),
                    None => deadline,
                });
                self.deferred.push(slot);
                return None;
            }
        }

        let fiber = match suspended_on {
            Some(fiber) => {
                let cx = shared.fibers.get(fiber);
                if cx.state() == FiberState::Suspended {
                    // a yield whose deadline has now passed.
                    cx.transition(FiberState::Suspended, FiberState::Runnable);
                }
                cx.transition(FiberState::Runnable, FiberState::Running);
                tracing::debug!(task.id = %id, task.name = name, ?fiber, "resuming task");
                fiber
            }
            None => match shared.fibers.acquire(stack) {
                Some(fiber) => fiber,
                None => {
                    tracing::trace!(task.id = %id, ?stack, "no fiber available; retrying later");
                    tick.starved += 1;
                    self.deferred.push(slot);
                    return None;
                }
            },
        };

        // Safety: we still own the record.
        unsafe {
            record.with(|task| {
                task.awaiting_fiber = None;
                task.resume_after = None;
            })
        };

        let span = tracing::debug_span!(
            "task",
            task.id = %id,
            task.name = name,
            ?fiber,
            parent = ?parent,
            worker = self.id,
        );
        let _enter = span.enter();
        tick.ran += 1;

        let input = FiberInput {
            shared: shared as *const Shared,
            worker: self.id,
            task: slot,
        };
        // Safety: the fiber is `Running` and bound to a task we own.
        let signal = unsafe { shared.fibers.get(fiber).resume(input) };
        let cx = shared.fibers.get(fiber);

        match signal {
            FiberSignal::Finished => {
                tick.completed += 1;
                shared.fibers.release(fiber);
                let parent = shared.retire_task(slot, self.id);
                tracing::trace!("task completed");
                return parent;
            }
            FiberSignal::Yielded(deadline) => {
                tick.suspended += 1;
                cx.transition(FiberState::Running, FiberState::Suspended);
                // Safety: the task suspended, so we own its record again.
                unsafe {
                    record.with(|task| {
                        task.awaiting_fiber = Some(fiber);
                        task.resume_after = Some(deadline);
                    })
                };
                self.deferred.push(slot);
                tracing::debug!(?deadline, "task yielded");
            }
            FiberSignal::AwaitGroup(group) => {
                tick.suspended += 1;
                cx.transition(FiberState::Running, FiberState::Suspended);
                // Safety: the task suspended, so we own its record again.
                unsafe { record.with(|task| task.awaiting_fiber = Some(fiber)) };

                let registered = match shared.group(group) {
                    Some(record) => record.register(slot),
                    // a released group has drained by definition.
                    None => Register::Drained,
                };
                match registered {
                    // From here on, the group's last completer owns the
                    // record, so it must not be touched.
                    Register::Registered => {
                        tracing::debug!(?group, "task waiting for group")
                    }
                    Register::Drained => {
                        cx.transition(FiberState::Suspended, FiberState::Runnable);
                        self.deferred.push(slot);
                    }
                    Register::Contended => {
                        let retry_at = Instant::now() + Shared::CONTENDED_WAIT;
                        // Safety: registration failed, so we still own it.
                        unsafe { record.with(|task| task.resume_after = Some(retry_at)) };
                        self.deferred.push(slot);
                        tracing::debug!(?group, "group already has a waiter; polling it");
                    }
                }
            }
        }
        None
    }

    /// Sleeps until work is pushed to this worker, the next deferred task
    /// is due, or the idle timeout passes.
    fn idle(&self, next_deadline: Option<Instant>) {
        let mut timeout = self.shared.config.idle_timeout;
        if let Some(deadline) = next_deadline {
            timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
        }

        tracing::trace!(?timeout, "idle start");
        let _result = self.shared.workers[self.id].event.wait_timeout(timeout);
        tracing::trace!(result = ?_result, "idle finish");
    }
}
