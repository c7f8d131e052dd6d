//! Fibers: pooled, stack-switchable execution contexts that tasks run on.
//!
//! Every fiber owns a pre-allocated stack and a [`Coroutine`] running on
//! it. The coroutine is started once, when the fiber first runs a task, and
//! then loops forever: it receives the task to run, runs it to completion
//! (suspending back to the worker whenever the task waits or yields), and
//! then suspends with [`FiberSignal::Finished`] until it is handed its next
//! task. Fibers are never torn down while the scheduler runs; they go back
//! to their [`FiberPool`] instead.
use crate::{
    context::ExecutionContext,
    error::BuildError,
    loom::sync::{
        atomic::{AtomicBool, AtomicU8, Ordering::*},
        Arc,
    },
    scheduler::{Config, Shared},
    task::{StackClass, TaskGroup},
    util::panic_message,
};
use core::{cell::UnsafeCell, convert::Infallible, fmt};
use corosensei::{stack::DefaultStack, Coroutine, CoroutineResult, Yielder};
use filament_slab::{SlotAllocator, SlotId};
use mycelium_bitfield::{enum_from_bits, FromBits};
use std::{
    panic::{self, AssertUnwindSafe},
    time::Instant,
};

/// Identifies one fiber: its stack class and its slot in that class's pool.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) struct FiberId {
    class: StackClass,
    slot: SlotId,
}

/// A pool of fibers, partitioned by [`StackClass`].
pub(crate) struct FiberPool {
    classes: [SlotAllocator<FiberContext>; 3],
    /// Set when the pool is dropped, so that suspended task bodies being
    /// unwound do not swallow the unwind.
    teardown: Arc<AtomicBool>,
}

/// An execution unit with its own stack.
pub(crate) struct FiberContext {
    id: FiberId,
    state: AtomicU8,
    coroutine: UnsafeCell<Coroutine<FiberInput, FiberSignal, Infallible, DefaultStack>>,
}

/// What a worker passes to a fiber when it resumes it.
pub(crate) struct FiberInput {
    pub(crate) shared: *const Shared,
    pub(crate) worker: usize,
    pub(crate) task: SlotId,
}

/// Why a fiber returned control to its worker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum FiberSignal {
    /// The task body returned (or panicked). The fiber is ready for
    /// another task.
    Finished,
    /// The task is waiting for a group to drain.
    AwaitGroup(TaskGroup),
    /// The task yielded, and may be resumed once the deadline has passed.
    Yielded(Instant),
}

enum_from_bits! {
    /// The lifecycle state of a fiber.
    #[derive(Debug, Eq, PartialEq)]
    pub(crate) enum FiberState<u8> {
        /// In the pool, with no task assigned.
        Idle = 0b00,
        /// Bound to a task and executing on a worker.
        Running = 0b01,
        /// The task is waiting or has yielded; its stack is preserved.
        Suspended = 0b10,
        /// Eligible to be resumed by any worker.
        Runnable = 0b11,
    }
}

/// The smallest stack a fiber may be configured with.
pub(crate) const MIN_STACK_SIZE: usize = 16 * 1024;

// === impl FiberId ===

impl FiberId {
    #[inline]
    pub(crate) fn class(self) -> StackClass {
        self.class
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{}", self.class, self.slot)
    }
}

// === impl FiberPool ===

impl FiberPool {
    /// Allocates every fiber stack the scheduler will ever use.
    pub(crate) fn new(config: &Config) -> Result<Self, BuildError> {
        let teardown = Arc::new(AtomicBool::new(false));
        let mut build = |class: StackClass| {
            let pool = config.fibers[class.index()];
            let fibers = SlotAllocator::try_construct_all_with(pool.count, |slot| {
                let stack = DefaultStack::new(pool.stack_size)
                    .map_err(|source| BuildError::AllocateStack { class, source })?;
                let id = FiberId { class, slot };
                test_trace!(fiber = ?id, pool.stack_size, "created fiber");
                Ok(FiberContext::new(id, stack, teardown.clone()))
            })?;
            tracing::debug!(?class, pool.count, pool.stack_size, "allocated fiber pool");
            Ok::<_, BuildError>(fibers)
        };

        Ok(Self {
            classes: [
                build(StackClass::Small)?,
                build(StackClass::Normal)?,
                build(StackClass::Large)?,
            ],
            teardown,
        })
    }

    /// Takes an idle fiber of `class` or, if that class is exhausted, of
    /// the smallest larger class that isn't.
    ///
    /// The returned fiber is `Running`, and owned by the caller until it
    /// is [released](Self::release).
    pub(crate) fn acquire(&self, class: StackClass) -> Option<FiberId> {
        class.and_larger().iter().find_map(|&class| {
            let slot = self.classes[class.index()].take_available()?;
            let id = FiberId { class, slot };
            self.get(id).transition(FiberState::Idle, FiberState::Running);
            Some(id)
        })
    }

    /// Returns `true` if some pool that `class` may run on has any fibers
    /// at all, busy or not.
    pub(crate) fn can_host(&self, class: StackClass) -> bool {
        class
            .and_larger()
            .iter()
            .any(|class| self.classes[class.index()].capacity() > 0)
    }

    #[inline]
    pub(crate) fn get(&self, id: FiberId) -> &FiberContext {
        self.classes[id.class.index()].get(id.slot)
    }

    /// Returns a fiber whose task has finished to the pool.
    pub(crate) fn release(&self, id: FiberId) {
        self.get(id).transition(FiberState::Running, FiberState::Idle);
        self.classes[id.class.index()].put_back(id.slot);
    }

    /// Returns `true` if every fiber is idle.
    pub(crate) fn check_all_free(&self) -> bool {
        self.classes.iter().all(SlotAllocator::check_all_free)
    }

    /// Returns the number of fibers bound to a task.
    pub(crate) fn in_use(&self) -> usize {
        self.classes.iter().map(SlotAllocator::taken).sum()
    }
}

impl Drop for FiberPool {
    fn drop(&mut self) {
        // Dropping a suspended coroutine unwinds its stack.
        self.teardown.store(true, Release);
        let in_use = self.in_use();
        if in_use > 0 {
            tracing::debug!(in_use, "unwinding suspended fibers");
        }
    }
}

impl fmt::Debug for FiberPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [small, normal, large] = &self.classes;
        f.debug_struct("FiberPool")
            .field("small", small)
            .field("normal", normal)
            .field("large", large)
            .finish()
    }
}

// === impl FiberContext ===

impl FiberContext {
    fn new(id: FiberId, stack: DefaultStack, teardown: Arc<AtomicBool>) -> Self {
        let coroutine = Coroutine::with_stack(
            stack,
            move |yielder: &Yielder<FiberInput, FiberSignal>, mut input: FiberInput| -> Infallible {
                loop {
                    input = run_task(id, yielder, input, &teardown);
                }
            },
        );
        Self {
            id,
            state: AtomicU8::new(FiberState::Idle.into_bits()),
            coroutine: UnsafeCell::new(coroutine),
        }
    }

    /// Switches onto this fiber's stack, running its task until it
    /// finishes or suspends.
    ///
    /// # Safety
    ///
    /// The caller must own this fiber, which must be `Running`.
    pub(crate) unsafe fn resume(&self, input: FiberInput) -> FiberSignal {
        debug_assert_eq!(self.state(), FiberState::Running);
        match (*self.coroutine.get()).resume(input) {
            CoroutineResult::Yield(signal) => signal,
            CoroutineResult::Return(never) => match never {},
        }
    }

    pub(crate) fn state(&self) -> FiberState {
        let bits = self.state.load(Acquire);
        match FiberState::try_from_bits(bits) {
            Ok(state) => state,
            Err(_) => unsafe { unreachable_unchecked!("invalid fiber state {:#04b}", bits) },
        }
    }

    /// Moves this fiber from `from` to `to`.
    ///
    /// Fibers have exactly one owner at a time, so a transition from any
    /// state other than `from` is a scheduler bug.
    #[cfg_attr(test, track_caller)]
    pub(crate) fn transition(&self, from: FiberState, to: FiberState) {
        let _res = test_dbg!(self.state.compare_exchange(
            from.into_bits(),
            to.into_bits(),
            AcqRel,
            Acquire
        ));
        debug_assert!(
            _res.is_ok(),
            "{:?}: expected {from:?} -> {to:?}, but the fiber was {:?}",
            self.id,
            self.state(),
        );
    }
}

// Safety: the coroutine is only resumed by the fiber's current owner, and
// ownership moves between threads through the scheduler's queues and the
// fiber pool, both of which synchronize. Task bodies must be `Send`.
unsafe impl Send for FiberContext {}
unsafe impl Sync for FiberContext {}

impl fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Runs one task on the current fiber, returning the input for the next
/// one.
fn run_task(
    fiber: FiberId,
    yielder: &Yielder<FiberInput, FiberSignal>,
    input: FiberInput,
    teardown: &AtomicBool,
) -> FiberInput {
    // Safety: the scheduler's shared state outlives its fiber pool.
    let shared = unsafe { &*input.shared };
    let record = shared.tasks.get(input.task);
    // Safety: the worker resuming this fiber owns the task record.
    let (body, task_id, name) = unsafe { record.with(|task| (task.body.take(), task.id, task.name)) };

    match body {
        Some(body) => {
            let cx = ExecutionContext::new(shared, yielder, fiber, input.task, task_id, input.worker);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body(&cx))) {
                if teardown.load(Acquire) {
                    panic::resume_unwind(payload);
                }
                tracing::error!(
                    task.id = %task_id,
                    task.name = name,
                    fiber = ?fiber,
                    panic = panic_message(&*payload),
                    "task panicked; counting it as completed",
                );
            }
        }
        None => debug_assert!(false, "{fiber:?}: task {task_id} has no body to run"),
    }

    yielder.suspend(FiberSignal::Finished)
}
