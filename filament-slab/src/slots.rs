//! A fixed-capacity slot allocator.
//!
//! See the documentation for [`SlotAllocator`] for details.
use crate::loom::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering::*};
use core::fmt;
use filament_sync::{
    backoff::{Pause, Yield},
    util::CachePadded,
    Backoff,
};

/// A fixed-capacity pool of `T` records, handed out and reclaimed without
/// allocating.
///
/// All `N` records are constructed when the allocator is created, and live
/// as long as the allocator does. [`take_available`] claims an unused slot
/// and returns its [`SlotId`], and [`put_back`] returns it to the pool. The
/// record inside a slot is *not* dropped or reset when the slot is put back:
/// slots are recycled as-is, and callers reset whatever state they need to.
///
/// Free slots form a singly-linked free list threaded through the slots
/// themselves: each free slot stores the index of the next free slot. The
/// head of the list is a single atomic word packing the index of the first
/// free slot with a modification tag, which is bumped on every update so
/// that a compare-and-swap against a stale head (the [ABA problem]) fails.
/// Both [`take_available`] and [`put_back`] are *O*(1) and lock-free.
///
/// Records are accessed through [`get`](Self::get), which returns a shared
/// reference. Records that need to be mutated by the slot's current owner
/// must provide their own interior mutability.
///
/// [`take_available`]: Self::take_available
/// [`put_back`]: Self::put_back
/// [ABA problem]: https://en.wikipedia.org/wiki/ABA_problem
pub struct SlotAllocator<T> {
    head: CachePadded<AtomicU64>,
    taken: AtomicUsize,
    slots: Box<[Slot<T>]>,
}

/// A handle naming one slot in a [`SlotAllocator`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u32);

struct Slot<T> {
    /// The index of the next free slot, if this slot is free.
    next: AtomicU32,
    taken: AtomicBool,
    value: T,
}

mycelium_bitfield::bitfield! {
    /// The head of the free list.
    #[derive(PartialEq, Eq)]
    struct Head<u64> {
        /// Index of the first free slot, or `NIL` if every slot is taken.
        const INDEX: u32;
        /// Incremented on every update of the head.
        const TAG: u32;
    }
}

const NIL: u32 = u32::MAX;

// === impl SlotAllocator ===

impl<T: Default> SlotAllocator<T> {
    /// Returns a new allocator with `capacity` slots, each holding
    /// `T::default()`.
    ///
    /// # Panics
    ///
    /// If `capacity` is greater than [`SlotAllocator::MAX_CAPACITY`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::construct_all_with(capacity, |_| T::default())
    }
}

impl<T> SlotAllocator<T> {
    /// The largest number of slots an allocator may have.
    pub const MAX_CAPACITY: usize = NIL as usize - 1;

    /// Returns a new allocator with `capacity` slots, constructing each
    /// slot's record by calling `f` with that slot's [`SlotId`].
    ///
    /// This is the only point at which the allocator allocates memory.
    /// Initially every slot is free, and slots are handed out in index
    /// order.
    ///
    /// # Panics
    ///
    /// If `capacity` is greater than [`SlotAllocator::MAX_CAPACITY`].
    #[must_use]
    pub fn construct_all_with(capacity: usize, mut f: impl FnMut(SlotId) -> T) -> Self {
        match Self::try_construct_all_with(capacity, |id| {
            Ok::<_, core::convert::Infallible>(f(id))
        }) {
            Ok(this) => this,
            Err(never) => match never {},
        }
    }

    /// Like [`construct_all_with`](Self::construct_all_with), but `f` may
    /// fail, in which case the first error is returned and every record
    /// constructed so far is dropped.
    ///
    /// # Panics
    ///
    /// If `capacity` is greater than [`SlotAllocator::MAX_CAPACITY`].
    pub fn try_construct_all_with<E>(
        capacity: usize,
        mut f: impl FnMut(SlotId) -> Result<T, E>,
    ) -> Result<Self, E> {
        assert!(
            capacity <= Self::MAX_CAPACITY,
            "a SlotAllocator may have at most {} slots (requested {capacity})",
            Self::MAX_CAPACITY,
        );

        let slots = (0..capacity as u32)
            .map(|i| {
                let next = if i as usize + 1 == capacity { NIL } else { i + 1 };
                Ok(Slot {
                    next: AtomicU32::new(next),
                    taken: AtomicBool::new(false),
                    value: f(SlotId(i))?,
                })
            })
            .collect::<Result<Box<[_]>, E>>()?;
        let first = if capacity == 0 { NIL } else { 0 };
        let head = Head::new().with(Head::INDEX, first);

        Ok(Self {
            head: CachePadded::new(AtomicU64::new(head.0)),
            taken: AtomicUsize::new(0),
            slots,
        })
    }

    /// Claims an unused slot, returning its [`SlotId`], or `None` if every
    /// slot is currently taken.
    ///
    /// Exhaustion is an expected condition: callers should back off and
    /// retry, or size the allocator more generously.
    #[must_use]
    pub fn take_available(&self) -> Option<SlotId> {
        let mut boff = Backoff::<Pause, Yield>::new();
        let mut head = Head::from_bits(self.head.load(Acquire));
        loop {
            let index = head.get(Head::INDEX);
            if index == NIL {
                test_trace!(taken = self.taken(), "SlotAllocator::take_available -> exhausted");
                return None;
            }

            // If another thread takes this slot first, `next` may be stale,
            // but then the tag has moved on and the CAS below fails.
            let next = self.slots[index as usize].next.load(Relaxed);
            let new_head = head
                .with(Head::INDEX, next)
                .with(Head::TAG, head.get(Head::TAG).wrapping_add(1));
            match self
                .head
                .compare_exchange_weak(head.0, new_head.0, AcqRel, Acquire)
            {
                Ok(_) => {
                    let _was_taken = self.slots[index as usize].taken.swap(true, Acquire);
                    debug_assert!(!_was_taken, "slot {index} handed out twice");
                    self.taken.fetch_add(1, Relaxed);
                    return Some(test_dbg!(SlotId(index)));
                }
                Err(actual) => {
                    head = Head::from_bits(actual);
                    boff.spin();
                }
            }
        }
    }

    /// Returns a taken slot to the pool, so it may be handed out again.
    ///
    /// The slot's record is left as-is.
    ///
    /// # Panics
    ///
    /// In debug builds, if the slot is not currently taken.
    pub fn put_back(&self, id: SlotId) {
        let slot = &self.slots[id.index()];
        let _was_taken = slot.taken.swap(false, Release);
        debug_assert!(_was_taken, "{id:?} was put back, but it is not taken");

        let mut boff = Backoff::<Pause, Yield>::new();
        let mut head = Head::from_bits(self.head.load(Relaxed));
        loop {
            slot.next.store(head.get(Head::INDEX), Relaxed);
            let new_head = head
                .with(Head::INDEX, id.0)
                .with(Head::TAG, head.get(Head::TAG).wrapping_add(1));
            match self
                .head
                .compare_exchange_weak(head.0, new_head.0, AcqRel, Relaxed)
            {
                Ok(_) => break,
                Err(actual) => {
                    head = Head::from_bits(actual);
                    boff.spin();
                }
            }
        }

        // Only decremented once the slot is back on the free list, so that
        // `check_all_free` never reports a slot free before it can be taken.
        self.taken.fetch_sub(1, Release);
        test_trace!(?id, "SlotAllocator::put_back");
    }

    /// Returns a reference to the record in slot `id`.
    ///
    /// # Panics
    ///
    /// If `id` does not name a slot in this allocator.
    #[inline]
    #[must_use]
    pub fn get(&self, id: SlotId) -> &T {
        &self.slots[id.index()].value
    }

    /// Returns `true` if slot `id` is currently taken.
    #[inline]
    #[must_use]
    pub fn is_taken(&self, id: SlotId) -> bool {
        self.slots[id.index()].taken.load(Acquire)
    }

    /// Returns `true` if every slot is free.
    ///
    /// This is a diagnostic for tests and tooling. Under concurrent use the
    /// answer may be stale by the time it is returned.
    #[must_use]
    pub fn check_all_free(&self) -> bool {
        self.taken.load(Acquire) == 0
    }

    /// Returns the number of slots currently taken.
    #[inline]
    #[must_use]
    pub fn taken(&self) -> usize {
        self.taken.load(Relaxed)
    }

    /// Returns the total number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns an iterator over every slot's [`SlotId`] and record, taken
    /// or not.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (SlotId(i as u32), &slot.value))
    }

    /// Counts the free list by walking it.
    ///
    /// Only meaningful while no other thread is using the allocator.
    #[cfg(test)]
    fn walk_free_list(&self) -> usize {
        let mut index = Head::from_bits(self.head.load(Acquire)).get(Head::INDEX);
        core::iter::from_fn(|| {
            if index == NIL {
                return None;
            }
            let current = index;
            index = self.slots[index as usize].next.load(Relaxed);
            Some(current)
        })
        .count()
    }
}

impl<T> Drop for SlotAllocator<T> {
    fn drop(&mut self) {
        let taken = self.taken.load(Acquire);
        if taken != 0 {
            tracing::warn!(
                taken,
                capacity = self.slots.len(),
                "SlotAllocator dropped while slots were still taken"
            );
        }
    }
}

impl<T> fmt::Debug for SlotAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = Head::from_bits(self.head.load(Relaxed));
        f.debug_struct("SlotAllocator")
            .field("capacity", &self.slots.len())
            .field("taken", &self.taken())
            .field("head", &head.get(Head::INDEX))
            .field("tag", &head.get(Head::TAG))
            .field("type", &core::any::type_name::<T>())
            .finish()
    }
}

// === impl SlotId ===

impl SlotId {
    /// Returns the slot's index in its allocator.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the slot ID as a `u32`, for packing into an atomic word.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns a slot ID from a value returned by [`SlotId::as_u32`].
    #[inline]
    #[must_use]
    pub const fn from_u32(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};
    use core::iter;

    #[test]
    #[cfg(not(loom))]
    fn packing_specs_valid() {
        Head::assert_valid();
    }

    #[test]
    #[cfg(not(loom))]
    fn exhaust_and_refill() {
        let _trace = crate::util::trace_init();
        let slots = SlotAllocator::<usize>::construct_all_with(4, |id| id.index() * 10);
        assert!(slots.check_all_free());
        assert_eq!(slots.walk_free_list(), 4);

        let taken = iter::from_fn(|| slots.take_available()).collect::<Vec<_>>();
        assert_eq!(taken.len(), 4);
        assert_eq!(slots.taken(), 4);
        assert!(slots.take_available().is_none());
        assert!(!slots.check_all_free());
        assert_eq!(slots.walk_free_list(), 0);

        for &id in &taken {
            assert!(slots.is_taken(id));
            assert_eq!(*slots.get(id), id.index() * 10);
        }

        slots.put_back(taken[2]);
        assert_eq!(slots.take_available(), Some(taken[2]), "LIFO reuse");
        for id in taken {
            slots.put_back(id);
        }
        assert!(slots.check_all_free());
        assert_eq!(slots.walk_free_list(), 4);
    }

    #[test]
    #[cfg(not(loom))]
    fn try_construct_stops_at_first_error() {
        let mut built = 0;
        let res = SlotAllocator::<u32>::try_construct_all_with(8, |id| {
            if id.index() == 3 {
                return Err("no more");
            }
            built += 1;
            Ok(id.as_u32())
        });
        assert_eq!(res.err(), Some("no more"));
        assert_eq!(built, 3);
    }

    #[test]
    #[cfg(not(loom))]
    fn zero_capacity() {
        let slots = SlotAllocator::<()>::new(0);
        assert!(slots.take_available().is_none());
        assert!(slots.check_all_free());
    }

    #[test]
    #[cfg(not(loom))]
    #[should_panic]
    #[cfg_attr(not(debug_assertions), ignore)]
    fn double_put_back_panics() {
        let slots = SlotAllocator::<()>::new(2);
        let id = slots.take_available().unwrap();
        slots.put_back(id);
        slots.put_back(id);
    }

    #[test]
    fn concurrent_take_put() {
        const THREADS: usize = if cfg!(loom) { 2 } else { 8 };
        const ROUNDS: usize = if cfg!(loom) { 2 } else { 1_000 };

        loom::model(|| {
            // each slot holds a flag that its current owner sets, so a slot
            // handed out twice at once is detected.
            let slots = Arc::new(SlotAllocator::construct_all_with(THREADS - 1, |_| {
                AtomicBool::new(false)
            }));
            let threads = (0..THREADS)
                .map(|_| {
                    let slots = slots.clone();
                    thread::spawn(move || {
                        for _ in 0..ROUNDS {
                            let Some(id) = slots.take_available() else {
                                thread::yield_now();
                                continue;
                            };
                            let owned = slots.get(id).swap(true, AcqRel);
                            assert!(!owned, "{id:?} handed out to two owners");
                            slots.get(id).store(false, Release);
                            slots.put_back(id);
                        }
                    })
                })
                .collect::<Vec<_>>();

            for thread in threads {
                thread.join().expect("thread mustn't panic");
            }
            assert!(slots.check_all_free());
        });
    }

    #[cfg(not(loom))]
    mod prop {
        use super::*;
        use proptest::{collection::vec, num::usize::ANY};
        use std::collections::HashSet;

        #[derive(Debug)]
        enum Op {
            Take,
            PutBack(usize),
        }

        const CAPACITY: usize = 8;

        proptest::proptest! {
            #[test]
            fn fuzz_take_put(ops in vec(ANY, 0..200)) {
                let ops = ops
                    .iter()
                    .map(|i| if i % 2 == 0 { Op::Take } else { Op::PutBack(i / 2) })
                    .collect::<Vec<_>>();

                let _trace = crate::util::trace_init();
                let _span = tracing::info_span!("fuzz").entered();
                run_fuzz(ops);
            }
        }

        fn run_fuzz(ops: Vec<Op>) {
            let slots = SlotAllocator::<()>::new(CAPACITY);
            let mut held = Vec::new();
            let mut unique = HashSet::new();

            for op in ops {
                tracing::debug!(?op);
                match op {
                    Op::Take => match slots.take_available() {
                        Some(id) => {
                            assert!(unique.insert(id), "{id:?} handed out twice");
                            held.push(id);
                        }
                        None => assert_eq!(held.len(), CAPACITY, "exhausted early"),
                    },
                    Op::PutBack(n) => {
                        if held.is_empty() {
                            continue;
                        }
                        let id = held.swap_remove(n % held.len());
                        unique.remove(&id);
                        slots.put_back(id);
                    }
                }

                assert_eq!(slots.taken(), held.len());
                assert_eq!(slots.check_all_free(), held.is_empty());
                assert_eq!(slots.walk_free_list(), CAPACITY - held.len());
            }
        }
    }
}
