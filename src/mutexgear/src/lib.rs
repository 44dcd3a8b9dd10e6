//! Synchronization primitives built purely on blocking OS mutexes and
//! atomics — no condition variables, no polling loops, no futex intrinsics.
//!
//! # Why mutex-only
//!
//! A thread blocked acquiring a mutex participates in the operating system's
//! priority-inheritance machinery: the holder inherits the waiter's
//! scheduling priority for as long as the wait lasts. A thread blocked on a
//! condition variable typically does not. Every primitive in this crate
//! therefore encodes "wait for an event" as "acquire a mutex currently held
//! by the signaler", inheriting OS-level priority boosting for free on every
//! wait.
//!
//! # The primitives
//!
//! - [`Toggle`] — a two-mutex ring for coordinated single-client event
//!   signaling.
//! - [`Wheel`] — a three-mutex ring adding independent client
//!   grip/turn/release waiting.
//! - The [completion framework](completion) — a queue of in-flight items
//!   plus per-thread [worker](CompletionWorker) and
//!   [waiter](CompletionWaiter) objects, providing "block until this item
//!   leaves the queue".
//! - [`RwLock`] / [`TrdlRwLock`] — a writer-priority read-write lock over
//!   completion queues, with a lock-free express path for uncontended
//!   readers, multi-channel writer waiting, and (in the `Trdl` variant)
//!   try-read support.
//! - [`MaintLock`] — a quiesce-and-drain lock: readers register without
//!   blocking, a maintainer flips maintenance mode and waits the current
//!   readership out.
//!
//! The lock primitives come in two layers: explicit operations taking
//! caller-pinned [`CompletionItem`]s (`unsafe`, mirroring the intrusive
//! design), and safe closure-scoped methods over a per-thread [`LockGear`].
//!
//! ```
//! use mutexgear::{LockGear, RwLock};
//!
//! let lock = RwLock::new(None)?;
//! let mut gear = LockGear::new(None)?;
//!
//! let value = lock.read(&mut gear, || 21)?;
//! let doubled = lock.write(&mut gear, || value * 2)?;
//! assert_eq!(doubled, 42);
//! # Ok::<(), mutexgear::Error>(())
//! ```
//!
//! # Blocking and failure model
//!
//! All blocking happens in OS mutex acquisitions; there are no cancellable
//! or time-bounded waits — cancellation mid-wait would break the
//! priority-inheritance chain, so every wait completes when its causal
//! predecessor releases its mutex. Recoverable failures surface as
//! [`Error`]; failures that would corrupt a primitive's internal invariants
//! record a diagnostic in [`failed_check_status`] and abort.
//!
//! Objects accept optional creation [attributes](attrs): process scope,
//! priority protocol (inheritance, ceiling), and — for the read-write locks
//! — the writer wait-channel count.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod attrs;
pub mod completion;
mod dlist;
mod errors;
pub mod maintlock;
pub mod rwlock;
mod sysmutex;
pub mod toggle;
mod utils;
pub mod wheel;

pub use attrs::{LockAttr, LockProtocol, ProcessShared, RwLockAttr, MAX_WRITE_CHANNELS};
pub use completion::{
    CompletionDrain, CompletionDrainableQueue, CompletionItem, CompletionQueue,
    CompletionQueueGuard, CompletionWaiter, CompletionWorker, DrainIdx, MAX_ITEM_WAITERS,
};
pub use errors::{Error, Result};
pub use maintlock::{MaintLock, RdLockToken};
pub use rwlock::{LockGear, RwLock, TrdlRwLock};
pub use toggle::Toggle;
pub use utils::failed_check_status;
pub use wheel::Wheel;
