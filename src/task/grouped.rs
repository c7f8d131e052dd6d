use super::{Priority, StackClass, TaskBody, TaskDesc, TaskGroup, TaskId};
use crate::fiber::FiberId;
use core::{cell::UnsafeCell, fmt};
use std::time::Instant;

/// A task record: a [`TaskDesc`] bound to the [`TaskGroup`] it was spawned
/// into, plus its fiber back-references.
///
/// Records live in the scheduler's task [`SlotAllocator`], and are owned by
/// whoever holds their slot: the spawner until the task is queued, then the
/// worker that dequeued it, then (while the task waits on a group) the
/// group's last completer. Ownership moves through the run queues and
/// through the group's waiter handshake, both of which synchronize, so only
/// one thread ever touches a record's contents at a time.
///
/// [`SlotAllocator`]: filament_slab::SlotAllocator
pub(crate) struct GroupedTask {
    inner: UnsafeCell<Inner>,
}

pub(crate) struct Inner {
    pub(crate) id: TaskId,
    /// Taken by the fiber when the task first runs.
    pub(crate) body: Option<TaskBody>,
    pub(crate) group: TaskGroup,
    pub(crate) stack: StackClass,
    pub(crate) priority: Priority,
    pub(crate) name: Option<&'static str>,
    pub(crate) color: u32,
    /// The fiber that spawned this task, if it was spawned by a task.
    pub(crate) parent_fiber: Option<FiberId>,
    /// The suspended fiber this task's execution lives on, if it has
    /// started running.
    pub(crate) awaiting_fiber: Option<FiberId>,
    /// If set, the task yielded and must not be resumed before this.
    pub(crate) resume_after: Option<Instant>,
}

// Safety: a record is only ever accessed by the single owner of its slot,
// and ownership transfers synchronize.
unsafe impl Sync for GroupedTask {}

impl GroupedTask {
    pub(crate) fn new() -> Self {
        Self {
            inner: UnsafeCell::new(Inner {
                id: TaskId::unused(),
                body: None,
                group: TaskGroup::DEFAULT,
                stack: StackClass::default(),
                priority: Priority::default(),
                name: None,
                color: 0,
                parent_fiber: None,
                awaiting_fiber: None,
                resume_after: None,
            }),
        }
    }

    /// Accesses the record's contents.
    ///
    /// # Safety
    ///
    /// The caller must own this record's slot, and must not call `with`
    /// reentrantly.
    #[inline]
    pub(crate) unsafe fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut *self.inner.get())
    }

    /// Fills in a freshly taken record for a newly spawned task.
    ///
    /// # Safety
    ///
    /// The caller must own this record's slot.
    pub(crate) unsafe fn init(
        &self,
        desc: TaskDesc,
        group: TaskGroup,
        parent_fiber: Option<FiberId>,
    ) -> TaskId {
        self.with(|task| {
            debug_assert!(task.body.is_none(), "task record reused before it was reset");
            let TaskDesc {
                body,
                stack,
                priority,
                name,
                color,
            } = desc;
            *task = Inner {
                id: TaskId::next(),
                body: Some(body),
                group,
                stack,
                priority,
                name,
                color,
                parent_fiber,
                awaiting_fiber: None,
                resume_after: None,
            };
            task.id
        })
    }

    /// Clears a record that is about to be put back, returning the group
    /// its task belonged to.
    ///
    /// Dropping a body that never ran happens here too.
    ///
    /// # Safety
    ///
    /// The caller must own this record's slot.
    pub(crate) unsafe fn reset(&self) -> TaskGroup {
        self.with(|task| {
            let group = task.group;
            *task = Inner {
                id: TaskId::unused(),
                body: None,
                group: TaskGroup::DEFAULT,
                stack: StackClass::default(),
                priority: Priority::default(),
                name: None,
                color: 0,
                parent_fiber: None,
                awaiting_fiber: None,
                resume_after: None,
            };
            group
        })
    }
}

impl Default for GroupedTask {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GroupedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The contents can't be read without owning the slot.
        f.debug_struct("GroupedTask").finish_non_exhaustive()
    }
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupedTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("group", &self.group)
            .field("stack", &self.stack)
            .field("priority", &self.priority)
            .field("started", &self.body.is_none())
            .field("parent_fiber", &self.parent_fiber)
            .field("awaiting_fiber", &self.awaiting_fiber)
            .field("resume_after", &self.resume_after)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_slab::SlotId;

    #[test]
    fn init_and_reset() {
        let record = GroupedTask::new();
        let group = TaskGroup::new(SlotId::from_u32(5), 2);
        let desc = TaskDesc::new(|_| {})
            .name("init_and_reset")
            .priority(Priority::High)
            .stack(StackClass::Small);

        let id = unsafe { record.init(desc, group, None) };
        assert_ne!(id, TaskId::unused());
        unsafe {
            record.with(|task| {
                assert_eq!(task.id, id);
                assert!(task.body.is_some());
                assert_eq!(task.group, group);
                assert_eq!(task.priority, Priority::High);
                assert_eq!(task.stack, StackClass::Small);
                assert_eq!(task.name, Some("init_and_reset"));
            });
        }

        assert_eq!(unsafe { record.reset() }, group);
        unsafe {
            record.with(|task| {
                assert_eq!(task.id, TaskId::unused());
                assert!(task.body.is_none());
                assert_eq!(task.group, TaskGroup::DEFAULT);
            });
        }
    }

    #[test]
    fn ids_are_unique() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }
}
