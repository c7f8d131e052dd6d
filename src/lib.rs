#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

pub(crate) mod loom;

#[macro_use]
pub(crate) mod util;

pub mod context;
pub mod error;
pub(crate) mod fiber;
pub mod scheduler;
pub mod task;

#[doc(inline)]
pub use self::context::ExecutionContext;
#[doc(inline)]
pub use self::error::{BuildError, GroupError, SpawnError};
#[doc(inline)]
pub use self::scheduler::{Builder, Scheduler};
#[doc(inline)]
pub use self::task::{Priority, StackClass, TaskDesc, TaskGroup, TaskId};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_types_are_send_sync() {
        crate::util::test::assert_send_sync::<Scheduler>();
        crate::util::test::assert_send_sync::<TaskGroup>();
        crate::util::test::assert_send_sync::<TaskId>();
        crate::util::test::assert_send_sync::<SpawnError>();
        crate::util::test::assert_send_sync::<BuildError>();
    }
}
