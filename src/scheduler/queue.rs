use crate::{
    loom::sync::atomic::{AtomicUsize, Ordering::*},
    task::Priority,
};
use core::fmt;
use filament_slab::SlotId;
use filament_sync::TicketRwLock;
use std::collections::VecDeque;

/// A worker's run queue: one bounded ring of task record slots per
/// [`Priority`] class.
///
/// The owning worker pops the *oldest* entry of the highest non-empty
/// class. Other workers steal the *newest* entry, and only ever with
/// [`TicketRwLock::try_write`], so a thief never waits behind the owner or
/// another thief.
pub(crate) struct RunQueue {
    levels: [TicketRwLock<VecDeque<SlotId>>; 3],
    capacity: usize,
    /// The total number of queued entries, so empty queues can be skipped
    /// without taking a lock.
    len: AtomicUsize,
}

/// Errors returned by [`RunQueue::steal_newest`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum TryStealError {
    /// The queue had entries, but another thread held its lock.
    Busy,
    /// No entries were available to steal.
    Empty,
}

impl RunQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let level = || TicketRwLock::new(VecDeque::with_capacity(capacity));
        Self {
            levels: [level(), level(), level()],
            capacity,
            len: AtomicUsize::new(0),
        }
    }

    /// Queues `task` at the back of its priority class.
    ///
    /// If that class is already full, `task` is handed back.
    pub(crate) fn push(&self, priority: Priority, task: SlotId) -> Result<(), SlotId> {
        let mut level = self.levels[priority.index()].write();
        if level.len() >= self.capacity {
            return Err(task);
        }
        level.push_back(task);
        self.len.fetch_add(1, Release);
        Ok(())
    }

    /// Takes the oldest entry of the highest-priority non-empty class.
    pub(crate) fn pop_oldest(&self) -> Option<SlotId> {
        if self.len.load(Acquire) == 0 {
            return None;
        }

        self.levels.iter().find_map(|level| {
            let task = level.write().pop_front()?;
            self.len.fetch_sub(1, Release);
            Some(task)
        })
    }

    /// Takes the newest entry of the highest-priority non-empty class,
    /// without waiting for the queue's locks.
    pub(crate) fn steal_newest(&self) -> Result<SlotId, TryStealError> {
        if self.len.load(Acquire) == 0 {
            return Err(TryStealError::Empty);
        }

        let mut busy = false;
        for level in &self.levels {
            let Some(mut level) = level.try_write() else {
                busy = true;
                continue;
            };
            if let Some(task) = level.pop_back() {
                self.len.fetch_sub(1, Release);
                return Ok(task);
            }
        }

        Err(if busy {
            TryStealError::Busy
        } else {
            TryStealError::Empty
        })
    }

    /// Returns the number of queued entries.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Relaxed)
    }
}

impl fmt::Debug for RunQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RunQueue");
        for (priority, level) in Priority::ALL.iter().zip(&self.levels) {
            let name = match priority {
                Priority::High => "high",
                Priority::Normal => "normal",
                Priority::Low => "low",
            };
            match level.try_read() {
                Some(level) => s.field(name, &level.len()),
                None => s.field(name, &format_args!("<locked>")),
            };
        }
        s.field("capacity", &self.capacity).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};

    fn slot(id: u32) -> SlotId {
        SlotId::from_u32(id)
    }

    #[test]
    #[cfg(not(loom))]
    fn pops_by_priority_then_age() {
        let queue = RunQueue::new(8);
        queue.push(Priority::Low, slot(1)).unwrap();
        queue.push(Priority::Normal, slot(2)).unwrap();
        queue.push(Priority::High, slot(3)).unwrap();
        queue.push(Priority::Normal, slot(4)).unwrap();
        assert_eq!(queue.len(), 4);

        let order = core::iter::from_fn(|| queue.pop_oldest()).collect::<Vec<_>>();
        assert_eq!(order, [slot(3), slot(2), slot(4), slot(1)]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    #[cfg(not(loom))]
    fn steals_newest() {
        let queue = RunQueue::new(8);
        assert_eq!(queue.steal_newest(), Err(TryStealError::Empty));
        queue.push(Priority::Normal, slot(1)).unwrap();
        queue.push(Priority::Normal, slot(2)).unwrap();
        queue.push(Priority::Low, slot(3)).unwrap();

        assert_eq!(queue.steal_newest(), Ok(slot(2)));
        assert_eq!(queue.pop_oldest(), Some(slot(1)));
        assert_eq!(queue.steal_newest(), Ok(slot(3)));
        assert_eq!(queue.steal_newest(), Err(TryStealError::Empty));
    }

    #[test]
    #[cfg(not(loom))]
    fn steal_is_busy_while_locked() {
        let queue = RunQueue::new(8);
        queue.push(Priority::High, slot(1)).unwrap();
        let _held = queue.levels[Priority::High.index()].read();
        assert_eq!(queue.steal_newest(), Err(TryStealError::Busy));
    }

    #[test]
    #[cfg(not(loom))]
    fn full_class_rejects_push() {
        let queue = RunQueue::new(2);
        queue.push(Priority::Normal, slot(1)).unwrap();
        queue.push(Priority::Normal, slot(2)).unwrap();
        assert_eq!(queue.push(Priority::Normal, slot(3)), Err(slot(3)));
        // other classes have their own capacity.
        queue.push(Priority::High, slot(3)).unwrap();
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn owner_and_thief_never_share_an_entry() {
        const TASKS: u32 = if cfg!(loom) { 2 } else { 1_000 };

        loom::model(|| {
            let queue = Arc::new(RunQueue::new(TASKS as usize));
            for id in 0..TASKS {
                queue.push(Priority::Normal, slot(id)).unwrap();
            }

            let thief = {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut stolen = Vec::new();
                    loop {
                        match queue.steal_newest() {
                            Ok(task) => stolen.push(task),
                            Err(TryStealError::Busy) => thread::yield_now(),
                            Err(TryStealError::Empty) => return stolen,
                        }
                    }
                })
            };

            let mut popped = core::iter::from_fn(|| queue.pop_oldest()).collect::<Vec<_>>();
            popped.extend(thief.join().expect("thief mustn't panic"));
            popped.sort();
            assert_eq!(popped, (0..TASKS).map(slot).collect::<Vec<_>>());
        });
    }

    #[cfg(not(loom))]
    mod prop {
        use super::*;
        use proptest::{collection::vec, num::u8::ANY};

        const CAPACITY: usize = 4;

        #[derive(Debug)]
        enum Op {
            Push(Priority),
            Pop,
            Steal,
        }

        fn op(byte: u8) -> Op {
            match byte % 5 {
                0 => Op::Push(Priority::High),
                1 => Op::Push(Priority::Normal),
                2 => Op::Push(Priority::Low),
                3 => Op::Pop,
                _ => Op::Steal,
            }
        }

        proptest::proptest! {
            #[test]
            fn matches_a_deque_per_class(ops in vec(ANY, 0..200)) {
                let _trace = crate::util::test::trace_init();
                run_model(ops.into_iter().map(op).collect());
            }
        }

        fn run_model(ops: Vec<Op>) {
            let queue = RunQueue::new(CAPACITY);
            let mut model: [VecDeque<SlotId>; 3] = Default::default();
            let mut next = 0;

            for op in ops {
                tracing::debug!(?op);
                match op {
                    Op::Push(priority) => {
                        let task = slot(next);
                        next += 1;
                        let level = &mut model[priority.index()];
                        if level.len() < CAPACITY {
                            assert_eq!(queue.push(priority, task), Ok(()));
                            level.push_back(task);
                        } else {
                            assert_eq!(queue.push(priority, task), Err(task));
                        }
                    }
                    Op::Pop => {
                        let expected = model.iter_mut().find_map(VecDeque::pop_front);
                        assert_eq!(queue.pop_oldest(), expected);
                    }
                    Op::Steal => {
                        let expected = model
                            .iter_mut()
                            .find_map(VecDeque::pop_back)
                            .ok_or(TryStealError::Empty);
                        assert_eq!(queue.steal_newest(), expected);
                    }
                }
                let len: usize = model.iter().map(VecDeque::len).sum();
                assert_eq!(queue.len(), len);
            }
        }
    }
}
