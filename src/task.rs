//! Task descriptors, task groups and the records that back them.
//!
//! A [`TaskDesc`] describes one unit of work: the closure to run, the
//! [`StackClass`] of fiber it needs, its [`Priority`] class and a name and
//! color for diagnostics. Descriptors are submitted to a
//! [`Scheduler`](crate::Scheduler) or an [`ExecutionContext`] together with
//! a [`TaskGroup`], a cohort of tasks whose completion can be awaited
//! jointly.
use crate::context::ExecutionContext;
use core::fmt;

mod group;
mod grouped;
mod id;

pub use self::group::TaskGroup;
pub(crate) use self::group::{GroupSlot, Register};
pub(crate) use self::grouped::GroupedTask;
pub use self::id::TaskId;

/// The body of a task.
pub(crate) type TaskBody = Box<dyn FnOnce(&ExecutionContext<'_>) + Send + 'static>;

/// Describes one unit of work.
///
/// A `TaskDesc` is built from the closure to run, and optionally configured
/// with a stack size class, a priority class and a name and color for
/// diagnostics. It is read-only once it has been spawned.
///
/// # Examples
///
/// ```
/// use filament::task::{Priority, StackClass, TaskDesc};
///
/// let desc = TaskDesc::new(|_cx| println!("hello from a fiber"))
///     .name("hello")
///     .priority(Priority::High)
///     .stack(StackClass::Small);
/// ```
#[must_use]
pub struct TaskDesc {
    pub(crate) body: TaskBody,
    pub(crate) stack: StackClass,
    pub(crate) priority: Priority,
    pub(crate) name: Option<&'static str>,
    pub(crate) color: u32,
}

/// The size class of the fiber stack a task runs on.
///
/// Each class has its own pool of fibers, configured on the scheduler's
/// [`Builder`](crate::scheduler::Builder). A task whose class is exhausted
/// may borrow a fiber from a larger class.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum StackClass {
    /// A small stack, for leaf tasks that do not recurse deeply.
    Small,
    /// A normal-sized stack.
    #[default]
    Normal,
    /// A large stack, for tasks with deep call chains or large locals.
    Large,
}

/// The priority class of a task.
///
/// Workers always run queued tasks of a higher class before those of a
/// lower one. Within a class, tasks run in the order they were queued.
/// Priorities are not inherited and carry no deadline guarantee.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    /// Run before anything else.
    High,
    /// The default priority.
    #[default]
    Normal,
    /// Run only once no higher-priority work is queued.
    Low,
}

// === impl TaskDesc ===

impl TaskDesc {
    /// Returns a new task descriptor that will run `body`, with a
    /// [`Normal`](StackClass::Normal) stack and [`Normal`](Priority::Normal)
    /// priority.
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&ExecutionContext<'_>) + Send + 'static,
    {
        Self {
            body: Box::new(body),
            stack: StackClass::default(),
            priority: Priority::default(),
            name: None,
            color: 0,
        }
    }

    /// Sets the stack size class this task needs.
    pub fn stack(self, stack: StackClass) -> Self {
        Self { stack, ..self }
    }

    /// Sets this task's priority class.
    pub fn priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    /// Names this task.
    ///
    /// The name is recorded as the `task.name` field of the task's
    /// `tracing` spans. By default, tasks are unnamed.
    pub fn name(self, name: &'static str) -> Self {
        Self {
            name: Some(name),
            ..self
        }
    }

    /// Sets an RGB color for profilers and other tooling to display this
    /// task with.
    pub fn color(self, color: u32) -> Self {
        Self { color, ..self }
    }
}

impl fmt::Debug for TaskDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDesc")
            .field("name", &self.name)
            .field("stack", &self.stack)
            .field("priority", &self.priority)
            .field("color", &format_args!("{:#08x}", self.color))
            .finish_non_exhaustive()
    }
}

// === impl StackClass ===

impl StackClass {
    /// Every stack class, from smallest to largest.
    pub const ALL: [Self; 3] = [Self::Small, Self::Normal, Self::Large];

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    /// Returns this class and every larger class, smallest first.
    pub(crate) fn and_larger(self) -> &'static [Self] {
        &Self::ALL[self.index()..]
    }
}

// === impl Priority ===

impl Priority {
    /// Every priority class, from highest to lowest.
    pub const ALL: [Self; 3] = [Self::High, Self::Normal, Self::Low];

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_builder() {
        let desc = TaskDesc::new(|_| {})
            .name("render")
            .priority(Priority::Low)
            .stack(StackClass::Large)
            .color(0x00ff_8800);
        assert_eq!(desc.name, Some("render"));
        assert_eq!(desc.priority, Priority::Low);
        assert_eq!(desc.stack, StackClass::Large);
        let debug = format!("{desc:?}");
        assert!(debug.contains("render"), "{debug}");
        assert!(debug.contains("0xff8800"), "{debug}");
    }

    #[test]
    fn larger_classes() {
        assert_eq!(StackClass::Small.and_larger(), &StackClass::ALL[..]);
        assert_eq!(StackClass::Normal.and_larger(), &[StackClass::Normal, StackClass::Large]);
        assert_eq!(StackClass::Large.and_larger(), &[StackClass::Large]);
    }

    #[test]
    fn priority_order() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::ALL.map(Priority::index), [0, 1, 2]);
    }
}
