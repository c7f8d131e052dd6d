use crate::{
    error::GroupError,
    loom::sync::atomic::{AtomicU32, AtomicU64, Ordering::*},
};
use core::fmt;
use filament_slab::SlotId;

/// A handle to a cohort of tasks whose completion can be awaited jointly.
///
/// Groups are created with [`Scheduler::create_group`] or
/// [`ExecutionContext::create_group`], and returned to the scheduler's pool
/// with `release_group` once they are no longer needed. Every group has an
/// *outstanding count* of spawned tasks that have not yet completed;
/// waiting on a group returns once that count reaches zero.
///
/// A `TaskGroup` is a plain index plus a generation counter. Releasing a
/// group bumps the generation of its record, so a stale handle to a
/// released group is detected rather than aliasing whatever group reuses
/// the record.
///
/// [`TaskGroup::DEFAULT`] always exists and is never released.
///
/// [`Scheduler::create_group`]: crate::Scheduler::create_group
/// [`ExecutionContext::create_group`]: crate::ExecutionContext::create_group
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct TaskGroup {
    index: u32,
    generation: u32,
}

/// The shared record behind a [`TaskGroup`].
pub(crate) struct GroupSlot {
    /// The record's generation and outstanding count, packed so that
    /// checking a handle and counting a task are one atomic step.
    state: AtomicU64,
    /// The task record slot of the task waiting for this group, or `NONE`.
    awaiting: AtomicU32,
}

mycelium_bitfield::bitfield! {
    /// A group record's packed state.
    #[derive(PartialEq, Eq)]
    struct State<u64> {
        /// Spawned tasks that have not yet completed. These are the low
        /// bits, so a completion is a plain `fetch_sub(1)`.
        const OUTSTANDING: u32;
        /// Bumped every time the record is released.
        const GENERATION: u32;
    }
}

/// The outcome of registering a waiter on a [`GroupSlot`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Register {
    /// The waiter was recorded. Whoever completes the group's last task
    /// must requeue it.
    Registered,
    /// The group drained before the waiter could be recorded. The waiter
    /// must be requeued by its registrant.
    Drained,
    /// Another task is already waiting on this group.
    Contended,
}

const NONE: u32 = u32::MAX;

// === impl TaskGroup ===

impl TaskGroup {
    /// The default group, which always exists.
    pub const DEFAULT: Self = Self {
        index: 0,
        generation: 0,
    };

    pub(crate) fn new(slot: SlotId, generation: u32) -> Self {
        Self {
            index: slot.as_u32(),
            generation,
        }
    }

    #[inline]
    pub(crate) fn slot(self) -> SlotId {
        SlotId::from_u32(self.index)
    }

    #[inline]
    pub(crate) fn generation(self) -> u32 {
        self.generation
    }

    /// Returns `true` if this is [`TaskGroup::DEFAULT`].
    #[inline]
    #[must_use]
    pub fn is_default(self) -> bool {
        self.index == Self::DEFAULT.index
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskGroup({}v{})", self.index, self.generation)
    }
}

// === impl GroupSlot ===

impl GroupSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            awaiting: AtomicU32::new(NONE),
        }
    }

    #[inline]
    fn load(&self) -> State {
        State::from_bits(self.state.load(SeqCst))
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.load().get(State::GENERATION)
    }

    /// Returns `true` if `group` still names this record.
    #[inline]
    pub(crate) fn is_current(&self, group: TaskGroup) -> bool {
        self.generation() == group.generation()
    }

    /// Invalidates every handle to this record, if `group` still names it
    /// and none of its tasks are outstanding.
    ///
    /// A task counted by [`try_add`](Self::try_add) and a release can never
    /// both succeed against the same generation, and exactly one of several
    /// racing releases succeeds.
    pub(crate) fn retire(&self, group: TaskGroup) -> Result<(), GroupError> {
        let mut state = self.load();
        loop {
            if state.get(State::GENERATION) != group.generation() {
                return Err(GroupError::StaleGroup);
            }
            let outstanding = state.get(State::OUTSTANDING);
            if outstanding != 0 {
                return Err(GroupError::Busy {
                    outstanding: outstanding as usize,
                });
            }
            let next = State::new().with(
                State::GENERATION,
                group.generation().wrapping_add(1),
            );
            match test_dbg!(self
                .state
                .compare_exchange_weak(state.0, next.0, SeqCst, SeqCst))
            {
                Ok(_) => return Ok(()),
                Err(actual) => state = State::from_bits(actual),
            }
        }
    }

    /// Accounts for one newly spawned task, if `group` still names this
    /// record.
    ///
    /// This must happen before the task is visible to any worker. Returns
    /// `false`, counting nothing, if the group has been released.
    pub(crate) fn try_add(&self, group: TaskGroup) -> bool {
        let mut state = self.load();
        loop {
            if state.get(State::GENERATION) != group.generation() {
                return false;
            }
            let outstanding = state.get(State::OUTSTANDING);
            debug_assert_ne!(outstanding, u32::MAX, "group outstanding count overflowed");
            let next = state.with(State::OUTSTANDING, outstanding + 1);
            match test_dbg!(self
                .state
                .compare_exchange_weak(state.0, next.0, SeqCst, SeqCst))
            {
                Ok(_) => return true,
                Err(actual) => state = State::from_bits(actual),
            }
        }
    }

    /// Accounts for one completed task.
    ///
    /// If this was the last outstanding task and a waiter is registered,
    /// the waiter is taken out of the group and returned. The caller is
    /// then responsible for requeueing it.
    #[must_use]
    pub(crate) fn complete(&self) -> Option<SlotId> {
        // The count is non-zero while this task is outstanding, so this
        // never borrows from the generation.
        let prev = State::from_bits(test_dbg!(self.state.fetch_sub(1, SeqCst)));
        let prev = prev.get(State::OUTSTANDING);
        debug_assert_ne!(prev, 0, "group outstanding count went negative");
        if prev != 1 {
            return None;
        }

        match test_dbg!(self.awaiting.swap(NONE, SeqCst)) {
            NONE => None,
            waiter => Some(SlotId::from_u32(waiter)),
        }
    }

    /// Records `waiter` as the task waiting for this group to drain.
    ///
    /// The waiting task's fiber must already be suspended: once this
    /// returns [`Register::Registered`], the task may be requeued at any
    /// time by whoever completes the group.
    pub(crate) fn register(&self, waiter: SlotId) -> Register {
        let waiter = waiter.as_u32();
        if test_dbg!(self
            .awaiting
            .compare_exchange(NONE, waiter, SeqCst, SeqCst))
        .is_err()
        {
            return Register::Contended;
        }

        // If the group drained before we were recorded, no completer will
        // see us. If it drains after this load, the completer's swap will.
        if test_dbg!(self.outstanding()) != 0 {
            return Register::Registered;
        }

        // Drained. Take ourselves back out, unless a completer that
        // decremented after we registered got there first.
        match test_dbg!(self
            .awaiting
            .compare_exchange(waiter, NONE, SeqCst, SeqCst))
        {
            Ok(_) => Register::Drained,
            Err(_) => Register::Registered,
        }
    }

    /// Returns the number of tasks spawned into the group that have not
    /// yet completed.
    #[inline]
    pub(crate) fn outstanding(&self) -> usize {
        self.load().get(State::OUTSTANDING) as usize
    }
}

impl Default for GroupSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GroupSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let awaiting = self.awaiting.load(Relaxed);
        let state = State::from_bits(self.state.load(Relaxed));
        f.debug_struct("GroupSlot")
            .field("generation", &state.get(State::GENERATION))
            .field("outstanding", &state.get(State::OUTSTANDING))
            .field(
                "awaiting",
                &(awaiting != NONE).then(|| SlotId::from_u32(awaiting)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};

    fn handle(group: &GroupSlot) -> TaskGroup {
        TaskGroup::new(SlotId::from_u32(1), group.generation())
    }

    #[test]
    fn packing_specs_valid() {
        State::assert_valid();
        // completions decrement the low bits.
        assert_eq!(State::from_bits(1).get(State::OUTSTANDING), 1);
        assert_eq!(State::from_bits(1).get(State::GENERATION), 0);
    }

    #[test]
    #[cfg(not(loom))]
    fn register_on_drained_group() {
        let group = GroupSlot::new();
        let waiter = SlotId::from_u32(7);
        assert_eq!(group.register(waiter), Register::Drained);
        // the waiter took itself back out.
        assert!(group.try_add(handle(&group)));
        assert_eq!(group.complete(), None);
    }

    #[test]
    #[cfg(not(loom))]
    fn last_completion_takes_waiter() {
        let group = GroupSlot::new();
        let waiter = SlotId::from_u32(3);
        assert!(group.try_add(handle(&group)));
        assert!(group.try_add(handle(&group)));
        assert_eq!(group.register(waiter), Register::Registered);
        assert_eq!(group.register(SlotId::from_u32(4)), Register::Contended);
        assert_eq!(group.complete(), None);
        assert_eq!(group.complete(), Some(waiter));
        assert_eq!(group.outstanding(), 0);
    }

    #[test]
    #[cfg(not(loom))]
    fn retire_bumps_generation() {
        let group = GroupSlot::new();
        let old = handle(&group);
        assert!(group.is_current(old));
        assert_eq!(group.retire(old), Ok(()));
        assert!(!group.is_current(old));
        assert_eq!(
            group.retire(old),
            Err(GroupError::StaleGroup),
            "a stale handle can't retire the group again"
        );
        assert_eq!(group.generation(), 1);
        assert!(!old.is_default());
        assert!(TaskGroup::DEFAULT.is_default());
    }

    #[test]
    #[cfg(not(loom))]
    fn stale_handles_count_nothing() {
        let group = GroupSlot::new();
        let old = handle(&group);
        assert!(group.try_add(old));
        assert_eq!(group.retire(old), Err(GroupError::Busy { outstanding: 1 }));
        assert_eq!(group.complete(), None);
        assert_eq!(group.retire(old), Ok(()));

        let new = handle(&group);
        assert!(!group.try_add(old), "a released handle counted a task");
        assert_eq!(group.outstanding(), 0);
        assert!(group.try_add(new));
        assert_eq!(group.outstanding(), 1);
        assert_eq!(group.generation(), 1);
    }

    #[test]
    fn spawn_and_release_never_both_succeed() {
        loom::model(|| {
            let group = Arc::new(GroupSlot::new());
            let old = handle(&group);

            let releaser = {
                let group = group.clone();
                thread::spawn(move || group.retire(old))
            };

            let added = group.try_add(old);
            let released = releaser.join().expect("releaser mustn't panic");

            match (added, released) {
                (true, Err(GroupError::Busy { outstanding: 1 })) => {
                    assert!(group.is_current(old));
                    assert_eq!(group.complete(), None);
                }
                (false, Ok(())) => {
                    assert!(!group.is_current(old));
                    assert_eq!(group.outstanding(), 0);
                }
                (true, Ok(())) => panic!("a released group counted a task"),
                other => panic!("unexpected outcome {other:?}"),
            }
        });
    }

    #[test]
    fn waiter_is_woken_exactly_once() {
        loom::model(|| {
            let group = Arc::new(GroupSlot::new());
            let waiter = SlotId::from_u32(1);
            assert!(group.try_add(handle(&group)));

            let completer = {
                let group = group.clone();
                thread::spawn(move || group.complete())
            };

            let registered = group.register(waiter);
            let taken = completer.join().expect("completer mustn't panic");

            // exactly one side is responsible for requeueing the waiter.
            match registered {
                Register::Registered => assert_eq!(taken, Some(waiter)),
                Register::Drained => assert_eq!(taken, None),
                Register::Contended => panic!("there is only one waiter"),
            }
            assert_eq!(group.outstanding(), 0);
        });
    }

    #[test]
    fn respawn_extends_the_wait() {
        loom::model(|| {
            let group = Arc::new(GroupSlot::new());
            let waiter = SlotId::from_u32(2);
            let current = handle(&group);
            assert!(group.try_add(current));

            // a task that spawns a sibling into the group before finishing.
            let worker = {
                let group = group.clone();
                thread::spawn(move || {
                    assert!(group.try_add(current));
                    let first = group.complete();
                    let second = group.complete();
                    assert!(first.is_none(), "count can't hit zero with the sibling pending");
                    second
                })
            };

            let registered = group.register(waiter);
            let taken = worker.join().expect("worker mustn't panic");
            match registered {
                Register::Registered => assert_eq!(taken, Some(waiter)),
                Register::Drained => assert_eq!(taken, None),
                Register::Contended => panic!("there is only one waiter"),
            }
        });
    }
}
