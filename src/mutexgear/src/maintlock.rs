//! The maintenance lock: a quiesce-and-drain primitive.
//!
//! Readers register through a non-blocking [`try_rdlock`] that fails once
//! *maintenance mode* is set. A maintainer sets the mode, waits for every
//! previously admitted reader to leave with [`wait_rd_unlock`], performs its
//! work in isolation, and clears the mode to re-open admission.
//!
//! `wait_rd_unlock` also works without maintenance mode: it then waits out
//! exactly the readers admitted before the call, unaffected by readers
//! coming and going while it runs — useful when the protected resource was
//! swapped atomically and only the stragglers on the old instance matter.
//!
//! [`try_rdlock`]: MaintLock::try_rdlock
//! [`wait_rd_unlock`]: MaintLock::wait_rd_unlock

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::attrs::LockAttr;
use crate::completion::{
    CompletionDrainableQueue, CompletionItem, CompletionQueue, CompletionWaiter, CompletionWorker,
    DrainIdx,
};
use crate::rwlock::LockGear;
use crate::utils::{fatal_check, fatal_unwrap};
use crate::{Error, Result};

bitflags! {
    /// The lock's atomic mode word.
    struct ModeFlags: usize {
        /// Maintenance requested; new `try_rdlock` calls are refused.
        const MAINTENANCE = 1 << 0;
    }
}

/// The opaque token a successful [`MaintLock::try_rdlock`] hands back, to be
/// returned with the matching [`MaintLock::rd_unlock`].
///
/// The token is the admission-time drain generation and is informational: a
/// post-mortem observer can tell from it which maintenance drains an item
/// predates.
pub type RdLockToken = DrainIdx;

/// A drainable read-registration lock. See the [module docs](self).
pub struct MaintLock {
    mode_flags: AtomicUsize,
    acquired_reads: CompletionDrainableQueue,
    awaited_reads: CompletionQueue,
    /// Guards the single-maintainer contract of `wait_rd_unlock`.
    draining: AtomicBool,
}

impl MaintLock {
    /// Create a maintenance lock with admission open.
    pub fn new(attr: Option<&LockAttr>) -> Result<Self> {
        Ok(Self {
            mode_flags: AtomicUsize::new(ModeFlags::empty().bits()),
            acquired_reads: CompletionDrainableQueue::new(attr)?,
            awaited_reads: CompletionQueue::new(attr)?,
            draining: AtomicBool::new(false),
        })
    }

    /// Switch to maintenance mode, refusing subsequent admissions.
    ///
    /// Not counting: a second call before [`clear_maintenance`] fails with
    /// [`Error::Busy`]. The store is relaxed and deliberately not a
    /// synchronization point — a reader that has not yet observed it may
    /// still be admitted briefly; [`wait_rd_unlock`] is what separates the
    /// generations.
    ///
    /// [`clear_maintenance`]: Self::clear_maintenance
    /// [`wait_rd_unlock`]: Self::wait_rd_unlock
    pub fn set_maintenance(&self) -> Result {
        let old = self
            .mode_flags
            .fetch_or(ModeFlags::MAINTENANCE.bits(), Ordering::Relaxed);
        if ModeFlags::from_bits_truncate(old).contains(ModeFlags::MAINTENANCE) {
            Err(Error::Busy)
        } else {
            log::debug!("maintenance mode set");
            Ok(())
        }
    }

    /// Leave maintenance mode, re-opening admission. A no-op if maintenance
    /// was not set.
    pub fn clear_maintenance(&self) -> Result {
        self.mode_flags
            .fetch_and(!ModeFlags::MAINTENANCE.bits(), Ordering::Relaxed);
        log::debug!("maintenance mode cleared");
        Ok(())
    }

    /// Whether maintenance mode is currently set. Intended for assertions
    /// and logging.
    pub fn test_maintenance(&self) -> bool {
        ModeFlags::from_bits_truncate(self.mode_flags.load(Ordering::Relaxed))
            .contains(ModeFlags::MAINTENANCE)
    }

    /// Register a read lock unless maintenance mode is set.
    ///
    /// Never blocks beyond brief internal serialization. On success the
    /// returned token accompanies the matching [`rd_unlock`](Self::rd_unlock).
    ///
    /// # Safety
    ///
    /// `worker` must be locked; `worker` and `item` must stay at stable
    /// addresses, unused for anything else, until the matching `rd_unlock`
    /// from this same thread. `item` must be unlinked and uncharged.
    pub unsafe fn try_rdlock(
        &self,
        worker: &CompletionWorker,
        item: &CompletionItem,
    ) -> Result<RdLockToken> {
        if self.test_maintenance() {
            return Err(Error::Busy);
        }
        worker.charge_item(item)?;
        let guard = match self.acquired_reads.queue().lock() {
            Ok(guard) => guard,
            Err(e) => {
                worker.discharge_item(item, 0);
                return Err(e);
            }
        };
        let token = self.acquired_reads.upcoming_drain();
        unsafe { guard.link_back(item) };
        Ok(token)
    }

    /// Release a read lock registered with the same `worker` and `item`.
    ///
    /// # Safety
    ///
    /// As for [`try_rdlock`](Self::try_rdlock).
    pub unsafe fn rd_unlock(
        &self,
        worker: &CompletionWorker,
        item: &CompletionItem,
        _token: RdLockToken,
    ) -> Result {
        // The drain stamp is stable under the source queue's access mutex
        // and tells which ring currently hosts the item.
        let guard = self.acquired_reads.queue().lock()?;
        if !item.drain_generation().is_valid() {
            let claims = unsafe { guard.unlink(item) };
            drop(guard);
            worker.discharge_item(item, claims);
            return Ok(());
        }
        drop(guard);

        let guard = self.awaited_reads.lock()?;
        let claims = unsafe { guard.unlink(item) };
        drop(guard);
        worker.discharge_item(item, claims);
        Ok(())
    }

    /// Wait until every read lock admitted before this call is released.
    ///
    /// With maintenance mode set, no new readers can be admitted, so on
    /// return the object is fully quiesced. Without it, only the readers
    /// admitted before the call entry are awaited; later admissions do not
    /// extend the wait.
    ///
    /// One maintainer at a time: a new call is allowed only after the
    /// previous one returns.
    pub fn wait_rd_unlock(&self, waiter: &CompletionWaiter) -> Result {
        fatal_check!(
            0,
            !self.draining.swap(true, Ordering::Acquire),
            "concurrent maintenance waits"
        );
        let result = self.wait_rd_unlock_inner(waiter);
        self.draining.store(false, Ordering::Release);
        result
    }

    fn wait_rd_unlock_inner(&self, waiter: &CompletionWaiter) -> Result {
        // Slice off the current readership in one step.
        {
            let source = self.acquired_reads.queue().lock()?;
            let target = fatal_unwrap(
                self.awaited_reads.lock(),
                "locking the awaited-reader queue for a drain",
            );
            let idx =
                unsafe { self.acquired_reads.drain_locked(&source, target.sentinel()) };
            log::trace!("maintenance drain {idx:?} started");
        }

        // Wait the batch out; each reader unlinks itself on release.
        loop {
            let guard = fatal_unwrap(
                self.awaited_reads.lock(),
                "re-locking the awaited-reader queue",
            );
            let Some(first) = guard.first_link() else {
                log::trace!("maintenance drain complete");
                return Ok(());
            };
            // Safety: every member of `awaited_reads` is the link of a live
            // `CompletionItem` charged by its reader.
            let item = unsafe { CompletionItem::from_link(first) };
            fatal_unwrap(
                unsafe { guard.wait_for(waiter, item.as_ref()) },
                "waiting out a drained reader",
            );
        }
    }

    /// Run `f` under a registered read lock using `gear`'s thread-local
    /// objects; `Ok(None)` if maintenance mode refused the admission.
    pub fn try_read<R>(&self, gear: &mut LockGear, f: impl FnOnce() -> R) -> Result<Option<R>> {
        let token = match unsafe { self.try_rdlock(&gear.worker, &gear.item) } {
            Ok(token) => token,
            Err(Error::Busy) => return Ok(None),
            Err(e) => return Err(e),
        };
        let unlock = MaintUnlockOnDrop {
            lock: self,
            gear,
            token,
        };
        let value = f();
        drop(unlock);
        Ok(Some(value))
    }
}

struct MaintUnlockOnDrop<'a> {
    lock: &'a MaintLock,
    gear: &'a LockGear,
    token: RdLockToken,
}

impl Drop for MaintUnlockOnDrop<'_> {
    fn drop(&mut self) {
        fatal_unwrap(
            // Safety: the read lock is held with exactly these objects.
            unsafe {
                self.lock
                    .rd_unlock(&self.gear.worker, &self.gear.item, self.token)
            },
            "releasing a scoped maintenance read lock",
        );
    }
}
