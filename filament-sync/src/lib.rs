#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(docsrs, loom)))]
#![warn(missing_docs, missing_debug_implementations)]

pub(crate) mod loom;

#[macro_use]
pub mod util;

pub mod backoff;
pub mod event;
pub mod spin;

#[doc(inline)]
pub use self::backoff::{Backoff, BackoffStrategy};
#[doc(inline)]
pub use self::event::{Event, WaitResult};
#[doc(inline)]
pub use self::spin::{AtomicDoOnce, RwSpinWait, TicketRwLock};
