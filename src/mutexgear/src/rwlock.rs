//! A writer-priority read-write lock built on the completion framework.
//!
//! The write lock is the held access mutex of the `acquired_reads` queue; a
//! writer that finds readers registered queues its intent, parks on one of a
//! small set of *push-lock channels*, and waits the readers out one by one
//! through completion waits — every one of which is an OS mutex acquisition
//! donating the writer's priority to the reader it is waiting for. Once a
//! writer claims *writer priority*, new readers divert into a staging queue
//! and chain behind one another (leader waits for the writers, followers for
//! their predecessor), preserving priority inheritance along the whole
//! chain.
//!
//! Readers have an *express path*: a bounded number of CAS attempts to push
//! their item onto a lock-free stack, folded into the registered-reader
//! queue by the next thread that holds the access mutex. An uncontended
//! read lock therefore takes no mutex at all.
//!
//! Two lock types are provided. [`RwLock`] supports `rd`/`wr`/`try_wr`
//! operations; [`TrdlRwLock`] additionally supports `try_rd` at the price of
//! an extra mutex, an extra queue-separator node, and one more lock/unlock
//! pair in the write-lock paths.
//!
//! The item-passing operations are `unsafe` because the lock links
//! caller-owned nodes; [`LockGear`] plus the closure-scoped `read`/`write`
//! methods wrap them in a safe surface where every node lives in a stack
//! frame that provably outlives its linkage.

use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::attrs::{LockAttr, RwLockAttr};
use crate::completion::{
    CompletionDrain, CompletionDrainableQueue, CompletionItem, CompletionQueue,
    CompletionQueueGuard, CompletionWaiter, CompletionWorker,
};
use crate::dlist::{self, RawLink};
use crate::sysmutex::SysMutex;
use crate::utils::{fatal_check, fatal_unwrap};
use crate::{Error, Result};

/// CAS attempts on the express reader path before falling back to the
/// access mutex. Must be positive and finite.
const EXPRESS_PUSH_TRIES: usize = 8;

/// Address granularity when spreading waiters over the write channels.
const CHANNEL_SELECTOR_SHIFT: u32 = 4;

/// The state shared by both lock variants.
struct RwCore {
    // Fields modified by readers.
    waiting_reads: CompletionDrainableQueue,
    /// Top of the express stack: the address of a pushed item's link, or 0.
    express_reads: AtomicUsize,
    /// Fold-generation counter; release-bumped by every non-empty fold,
    /// acquire-read by express probes.
    express_commits: AtomicUsize,
    // Rarely modified fields.
    waiting_writes: CompletionQueue,
    read_wait_drain: CompletionDrain,
    // Fields modified by writers.
    /// Writers between entry and unlock. Gates the express reader path: a
    /// reader confirms this is zero *after* publishing its push, so in the
    /// seqcst order either the push precedes the writer's fold (which then
    /// registers the reader) or the reader sees the writer and confirms
    /// under the access mutex instead.
    wr_pendings: AtomicUsize,
    /// Active writer-priority claims. Non-zero diverts new readers into
    /// `waiting_reads`.
    wr_priority: AtomicUsize,
    reader_push_locks: Vec<SysMutex>,
    // Fields modified by both sides.
    acquired_reads: CompletionQueue,
    /// For the try-read variant: a permanent node inside `acquired_reads`
    /// separating normal readers (before it) from try-readers (after it).
    separator: Option<Box<RawLink>>,
}

impl RwCore {
    fn new(attr: Option<&RwLockAttr>, with_separator: bool) -> Result<Self> {
        let lock_attr = attr.map(RwLockAttr::lock_attr);
        let channels = attr.map_or(1, RwLockAttr::effective_write_channels);
        let mut reader_push_locks = Vec::with_capacity(channels);
        for _ in 0..channels {
            reader_push_locks.push(SysMutex::new(lock_attr)?);
        }

        let core = Self {
            waiting_reads: CompletionDrainableQueue::new(lock_attr)?,
            express_reads: AtomicUsize::new(0),
            express_commits: AtomicUsize::new(0),
            waiting_writes: CompletionQueue::new(lock_attr)?,
            read_wait_drain: CompletionDrain::new(),
            wr_pendings: AtomicUsize::new(0),
            wr_priority: AtomicUsize::new(0),
            reader_push_locks,
            acquired_reads: CompletionQueue::new(lock_attr)?,
            separator: with_separator.then(|| Box::new(RawLink::new())),
        };
        if let Some(separator) = &core.separator {
            // Safety: the queue is empty and not yet shared.
            unsafe {
                dlist::link_before(
                    NonNull::from(&**separator),
                    core.acquired_reads.sentinel_link(),
                )
            };
        }
        Ok(core)
    }

    fn separator_link(&self) -> Option<NonNull<RawLink>> {
        self.separator.as_deref().map(NonNull::from)
    }

    /// Where normal readers are inserted: before the separator, or at the
    /// ring tail when there is none.
    fn normal_insert_point(&self, guard: &CompletionQueueGuard<'_>) -> NonNull<RawLink> {
        self.separator_link().unwrap_or_else(|| guard.sentinel())
    }

    /// Whether no reader is registered (the separator does not count).
    fn reader_free(&self, guard: &CompletionQueueGuard<'_>) -> bool {
        match self.separator_link() {
            None => guard.is_empty(),
            Some(sep) => {
                guard.first_link() == Some(sep) && guard.last_link() == Some(sep)
            }
        }
    }

    /// The hindmost registered reader, skipping the separator.
    fn last_reader(&self, guard: &CompletionQueueGuard<'_>) -> Option<NonNull<CompletionItem>> {
        let last = guard.last_link()?;
        let link = match self.separator_link() {
            Some(sep) if last == sep => {
                // Safety: the separator is linked for the lock's lifetime.
                let prev = unsafe { last.as_ref().prev(Ordering::Relaxed) };
                if prev == guard.sentinel() {
                    return None;
                }
                prev
            }
            _ => last,
        };
        // Safety: every non-separator member of `acquired_reads` is the
        // link of a `CompletionItem`.
        Some(unsafe { CompletionItem::from_link(link) })
    }

    /// Lock-free hint that at least one reader is registered.
    fn occupied_reader_probe(&self) -> bool {
        let sentinel = self.acquired_reads.sentinel_link();
        match self.separator_link() {
            None => !self.acquired_reads.is_empty_probe(),
            Some(sep) => {
                let (sentinel, sep) = unsafe { (sentinel.as_ref(), sep.as_ref()) };
                // A normal reader precedes the separator, or a try-reader
                // trails it.
                sep.prev_probe_addr() != sentinel.addr()
                    || sentinel.prev_probe_addr() != sep.addr()
            }
        }
    }

    /// Lock-free hint that no reader is registered anywhere, including the
    /// express stack.
    fn reader_free_probe(&self) -> bool {
        !self.occupied_reader_probe() && self.express_reads.load(Ordering::SeqCst) == 0
    }

    /// Try to publish `item` on the express stack.
    fn express_try_push(&self, item: &CompletionItem) -> bool {
        let link = item.link_ref();
        let addr = link.addr();
        for _ in 0..EXPRESS_PUSH_TRIES {
            let head = self.express_reads.load(Ordering::Relaxed);
            link.stack_set_next(NonNull::new(head as *mut RawLink));
            if self
                .express_reads
                .compare_exchange(head, addr, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
        // Leave the node unlinked for the fallback path.
        link.stack_set_next(None);
        false
    }

    /// Fold every express-stack item into `acquired_reads` (normal zone).
    /// Requires the access mutex, which `guard` proves.
    fn fold_express_locked(&self, guard: &CompletionQueueGuard<'_>) {
        let mut cursor = self.express_reads.swap(0, Ordering::SeqCst);
        if cursor == 0 {
            return;
        }
        let before = self.normal_insert_point(guard);
        let mut folded = 0usize;
        while cursor != 0 {
            // Safety: the stack holds links of live, charged items; their
            // owners may not reuse them before passing through this mutex.
            let link = unsafe { NonNull::new_unchecked(cursor as *mut RawLink) };
            let next = unsafe { link.as_ref().stack_next() };
            // Clear the stack linkage so the node rejoins the ring as
            // unlinked.
            unsafe { link.as_ref() }.stack_set_next(None);
            unsafe { dlist::link_before(link, before) };
            cursor = next.map_or(0, |n| n.as_ptr() as usize);
            folded += 1;
        }
        self.express_commits.fetch_add(1, Ordering::Release);
        log::trace!("folded {folded} express readers");
    }

    fn channel_of(&self, waiter: &CompletionWaiter) -> usize {
        let addr = waiter as *const CompletionWaiter as usize;
        (addr >> CHANNEL_SELECTOR_SHIFT) % self.reader_push_locks.len()
    }

    /// The read-lock slow path and its staging loop. `item` is charged on
    /// entry and registered in `acquired_reads` on success.
    unsafe fn rd_lock_contended(
        &self,
        worker: &CompletionWorker,
        waiter: &CompletionWaiter,
        item: &CompletionItem,
    ) -> Result {
        loop {
            let guard = match self.acquired_reads.lock() {
                Ok(guard) => guard,
                Err(e) => {
                    worker.discharge_item(item, 0);
                    return Err(e);
                }
            };
            self.fold_express_locked(&guard);
            if self.wr_priority.load(Ordering::Acquire) == 0 {
                // Safety: `item` is charged; the caller pins it.
                unsafe { dlist::link_before(item.raw_link(), self.normal_insert_point(&guard)) };
                return Ok(());
            }
            drop(guard);

            // Writer priority is claimed: stage behind the writers.
            let staging = match self.waiting_reads.queue().lock() {
                Ok(staging) => staging,
                Err(e) => {
                    worker.discharge_item(item, 0);
                    return Err(e);
                }
            };
            let predecessor = staging.last_link();
            // Safety: as above.
            unsafe { staging.link_back(item) };
            match predecessor {
                None => {
                    // The staging leader waits for the writers to drain.
                    drop(staging);
                    log::trace!("reader parked behind writers");
                    let writers = fatal_unwrap(
                        self.waiting_writes.lock(),
                        "locking the writer queue for a staged reader",
                    );
                    if let Some(tail) = writers.last_link() {
                        let tail = unsafe { CompletionItem::from_link(tail) };
                        fatal_unwrap(
                            unsafe { writers.wait_for(waiter, tail.as_ref()) },
                            "waiting out a queued writer",
                        );
                    }
                    // Release the whole staging generation and ourselves
                    // with it; followers chain-wake behind us.
                    let staging = fatal_unwrap(
                        self.waiting_reads.queue().lock(),
                        "re-locking the staging queue",
                    );
                    unsafe {
                        self.waiting_reads
                            .drain_locked(&staging, self.read_wait_drain.sentinel())
                    };
                    let claims = unsafe { staging.unlink(item) };
                    drop(staging);
                    worker.discharge_item(item, claims);
                }
                Some(predecessor) => {
                    // Follow the preceding staged reader; the wait chain
                    // carries priority inheritance reader to reader.
                    let predecessor = unsafe { CompletionItem::from_link(predecessor) };
                    fatal_unwrap(
                        unsafe { staging.wait_for(waiter, predecessor.as_ref()) },
                        "following the staged-reader chain",
                    );
                    let staging = fatal_unwrap(
                        self.waiting_reads.queue().lock(),
                        "re-locking the staging queue",
                    );
                    let claims = unsafe { staging.unlink(item) };
                    drop(staging);
                    worker.discharge_item(item, claims);
                }
            }
            worker.charge_item(item)?;
        }
    }

    unsafe fn rd_lock(
        &self,
        worker: &CompletionWorker,
        waiter: &CompletionWaiter,
        item: &CompletionItem,
    ) -> Result {
        worker.charge_item(item)?;

        if self.wr_pendings.load(Ordering::SeqCst) == 0
            && self.wr_priority.load(Ordering::Relaxed) == 0
            && self.express_try_push(item)
        {
            if self.wr_pendings.load(Ordering::SeqCst) == 0 {
                let _ = self.express_commits.load(Ordering::Acquire);
                if self.occupied_reader_probe() {
                    // Lock-free admission: a registered reader anchors the
                    // lock and any writer entering later folds us in before
                    // judging the queue empty.
                    return Ok(());
                }
            }
            // Confirm under the access mutex. The push cannot be retracted,
            // so a failure to lock here is unrecoverable.
            let guard = fatal_unwrap(
                self.acquired_reads.lock(),
                "confirming an express read lock",
            );
            self.fold_express_locked(&guard);
            if self.wr_priority.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            // A writer claimed priority in the meantime; withdraw and queue
            // up like any other late reader. The withdrawal is a full
            // discharge: the claiming writer may already be waiting on this
            // item and must be woken, or it would wait on a reader that is
            // about to park behind it.
            let claims = unsafe { guard.unlink(item) };
            drop(guard);
            worker.discharge_item(item, claims);
            worker.charge_item(item)?;
            unsafe { self.rd_lock_contended(worker, waiter, item) }
        } else {
            unsafe { self.rd_lock_contended(worker, waiter, item) }
        }
    }

    unsafe fn rd_unlock(&self, worker: &CompletionWorker, item: &CompletionItem) -> Result {
        let guard = self.acquired_reads.lock()?;
        // Materialize the item if it never left the express stack, then the
        // removal is uniform.
        self.fold_express_locked(&guard);
        let claims = unsafe { guard.unlink(item) };
        drop(guard);
        worker.discharge_item(item, claims);
        Ok(())
    }

    unsafe fn wr_lock_cwp(
        &self,
        worker: &CompletionWorker,
        waiter: &CompletionWaiter,
        item: &CompletionItem,
        readers_till_wp: i32,
        tryread_gate: Option<&SysMutex>,
    ) -> Result {
        let prior = self.wr_pendings.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = tryread_gate {
            if prior == 0 {
                // Memory-ordering pulse: a try-reader that judged the gate
                // clear has finished its insertion once this pair returns.
                if let Err(e) = gate.lock() {
                    self.wr_pendings.fetch_sub(1, Ordering::SeqCst);
                    return Err(e);
                }
                gate.unlock();
            }
        }

        let guard = match self.acquired_reads.lock() {
            Ok(guard) => guard,
            Err(e) => {
                self.wr_pendings.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.fold_express_locked(&guard);
        if self.reader_free(&guard) {
            // The write lock is the held access mutex.
            mem::forget(guard);
            return Ok(());
        }
        drop(guard);

        // Queue the intent so new readers can divert, then wait the
        // registered readers out from a push-lock channel.
        if let Err(e) = unsafe { self.waiting_writes.enqueue(worker, item) } {
            self.wr_pendings.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }
        let channel = self.channel_of(waiter);
        if let Err(e) = self.reader_push_locks[channel].lock() {
            fatal_unwrap(
                unsafe { self.waiting_writes.dequeue(worker, item) },
                "withdrawing a queued writer",
            );
            self.wr_pendings.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }
        log::trace!("writer parked on push channel {channel}");

        let mut readers_till_wp = readers_till_wp;
        let mut claimed = false;
        if readers_till_wp == 0 {
            self.wr_priority.fetch_add(1, Ordering::Release);
            claimed = true;
        }

        loop {
            let guard = fatal_unwrap(
                self.acquired_reads.lock(),
                "re-locking the reader queue for a waiting writer",
            );
            self.fold_express_locked(&guard);
            let Some(tail) = self.last_reader(&guard) else {
                // All readers drained. Keep the access mutex: that is the
                // write lock. Withdrawing from `waiting_writes` wakes the
                // staging leader, which will then block on the access
                // mutex until `wr_unlock`.
                self.reader_push_locks[channel].unlock();
                if claimed {
                    self.wr_priority.fetch_sub(1, Ordering::Release);
                }
                fatal_unwrap(
                    unsafe { self.waiting_writes.dequeue(worker, item) },
                    "completing a writer's queue entry",
                );
                mem::forget(guard);
                return Ok(());
            };
            fatal_unwrap(
                unsafe { guard.wait_for(waiter, tail.as_ref()) },
                "waiting out a registered reader",
            );
            if !claimed && readers_till_wp > 0 {
                readers_till_wp -= 1;
                if readers_till_wp == 0 {
                    self.wr_priority.fetch_add(1, Ordering::Release);
                    claimed = true;
                }
            }
        }
    }

    fn wr_unlock(&self) -> Result {
        self.wr_pendings.fetch_sub(1, Ordering::SeqCst);
        self.acquired_reads.unlock_raw();
        Ok(())
    }

    fn try_wr_lock(&self, tryread_gate: Option<&SysMutex>) -> Result {
        let prior = self.wr_pendings.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = tryread_gate {
            if prior == 0 {
                if let Err(e) = gate.lock() {
                    self.wr_pendings.fetch_sub(1, Ordering::SeqCst);
                    return Err(e);
                }
                gate.unlock();
            }
        }
        let outcome = (|| {
            if !self.reader_free_probe() {
                return Err(Error::Busy);
            }
            let Some(guard) = self.acquired_reads.try_lock()? else {
                return Err(Error::Busy);
            };
            self.fold_express_locked(&guard);
            if self.reader_free(&guard) {
                mem::forget(guard);
                Ok(())
            } else {
                Err(Error::Busy)
            }
        })();
        if outcome.is_err() {
            self.wr_pendings.fetch_sub(1, Ordering::SeqCst);
        }
        outcome
    }

}

impl Drop for RwCore {
    fn drop(&mut self) {
        fatal_check!(
            0,
            self.express_reads.load(Ordering::Relaxed) == 0,
            "dropping a read-write lock with express readers pending"
        );
        fatal_check!(
            0,
            self.wr_pendings.load(Ordering::Relaxed) == 0,
            "dropping a locked read-write lock"
        );
        if let Some(separator) = self.separator_link() {
            // Safety: dropping grants exclusive access; the separator is
            // the last remaining member, after which the queue's own
            // emptiness check runs.
            unsafe { dlist::unlink(separator) };
        }
    }
}

/// A writer-priority read-write lock. See the [module docs](self).
pub struct RwLock {
    core: RwCore,
}

impl RwLock {
    /// Create a lock.
    pub fn new(attr: Option<&RwLockAttr>) -> Result<Self> {
        Ok(Self {
            core: RwCore::new(attr, false)?,
        })
    }

    /// Acquire the write (exclusive) lock, claiming writer priority
    /// immediately if readers hold the lock.
    ///
    /// Equivalent to [`wr_lock_cwp`](Self::wr_lock_cwp) with
    /// `readers_till_wp == 0`.
    ///
    /// # Safety
    ///
    /// `worker` must be locked and, together with `waiter` and `item`, stay
    /// at stable addresses until this call returns; `item` must be unlinked
    /// and uncharged. The lock itself must not move until the matching
    /// [`wr_unlock`](Self::wr_unlock), which must come from this thread.
    /// Write locking is not reentrant.
    pub unsafe fn wr_lock(
        &self,
        worker: &CompletionWorker,
        waiter: &CompletionWaiter,
        item: &CompletionItem,
    ) -> Result {
        unsafe { self.core.wr_lock_cwp(worker, waiter, item, 0, None) }
    }

    /// Acquire the write lock with a custom writer-priority threshold.
    ///
    /// While `readers_till_wp` is positive, that many reader releases are
    /// witnessed before writer priority is claimed and new readers may keep
    /// admitting themselves ahead. Zero claims priority immediately;
    /// negative never claims it (reader-friendly mode). With several
    /// writers competing on distinct channels each counts releases
    /// independently, so a positive value bounds admissions per channel
    /// rather than globally.
    ///
    /// # Safety
    ///
    /// As for [`wr_lock`](Self::wr_lock).
    pub unsafe fn wr_lock_cwp(
        &self,
        worker: &CompletionWorker,
        waiter: &CompletionWaiter,
        item: &CompletionItem,
        readers_till_wp: i32,
    ) -> Result {
        unsafe {
            self.core
                .wr_lock_cwp(worker, waiter, item, readers_till_wp, None)
        }
    }

    /// Acquire the write lock without blocking, failing with
    /// [`Error::Busy`] if any reader or writer holds it.
    pub fn try_wr_lock(&self) -> Result {
        self.core.try_wr_lock(None)
    }

    /// Release the write lock. Must be called by the locking thread.
    pub fn wr_unlock(&self) -> Result {
        self.core.wr_unlock()
    }

    /// Acquire a read (shared) lock.
    ///
    /// # Safety
    ///
    /// `worker` must be locked; `worker` and `item` must stay at stable
    /// addresses, unused for anything else, until the matching
    /// [`rd_unlock`](Self::rd_unlock) from this same thread. `item` must be
    /// unlinked and uncharged. The lock must not move while any read lock
    /// is held. `waiter` is only borrowed for the call. Read locking is not
    /// reentrant per item.
    pub unsafe fn rd_lock(
        &self,
        worker: &CompletionWorker,
        waiter: &CompletionWaiter,
        item: &CompletionItem,
    ) -> Result {
        unsafe { self.core.rd_lock(worker, waiter, item) }
    }

    /// Release a read lock taken with the same `worker` and `item`.
    ///
    /// # Safety
    ///
    /// As for [`rd_lock`](Self::rd_lock).
    pub unsafe fn rd_unlock(&self, worker: &CompletionWorker, item: &CompletionItem) -> Result {
        unsafe { self.core.rd_unlock(worker, item) }
    }

    /// Run `f` under a read lock using `gear`'s thread-local objects.
    pub fn read<R>(&self, gear: &mut LockGear, f: impl FnOnce() -> R) -> Result<R> {
        unsafe { self.core.rd_lock(&gear.worker, &gear.waiter, &gear.item) }?;
        let unlock = RdUnlockOnDrop {
            core: &self.core,
            gear,
        };
        let value = f();
        drop(unlock);
        Ok(value)
    }

    /// Run `f` under the write lock using `gear`'s thread-local objects.
    pub fn write<R>(&self, gear: &mut LockGear, f: impl FnOnce() -> R) -> Result<R> {
        self.write_cwp(gear, 0, f)
    }

    /// [`write`](Self::write) with a custom `readers_till_wp` threshold.
    pub fn write_cwp<R>(
        &self,
        gear: &mut LockGear,
        readers_till_wp: i32,
        f: impl FnOnce() -> R,
    ) -> Result<R> {
        unsafe {
            self.core
                .wr_lock_cwp(&gear.worker, &gear.waiter, &gear.item, readers_till_wp, None)
        }?;
        let unlock = WrUnlockOnDrop { core: &self.core };
        let value = f();
        drop(unlock);
        Ok(value)
    }

    /// Run `f` under the write lock if it can be taken without blocking;
    /// `Ok(None)` if the lock was busy.
    pub fn try_write<R>(&self, f: impl FnOnce() -> R) -> Result<Option<R>> {
        match self.core.try_wr_lock(None) {
            Ok(()) => {}
            Err(Error::Busy) => return Ok(None),
            Err(e) => return Err(e),
        }
        let unlock = WrUnlockOnDrop { core: &self.core };
        let value = f();
        drop(unlock);
        Ok(Some(value))
    }
}

/// A read-write lock with try-read support. See the [module docs](self).
pub struct TrdlRwLock {
    core: RwCore,
    /// Serializes try-read admissions against writer arrival.
    tryread_queue_lock: SysMutex,
}

impl TrdlRwLock {
    /// Create a lock.
    pub fn new(attr: Option<&RwLockAttr>) -> Result<Self> {
        Ok(Self {
            core: RwCore::new(attr, true)?,
            tryread_queue_lock: SysMutex::new(attr.map(RwLockAttr::lock_attr))?,
        })
    }

    /// See [`RwLock::wr_lock`].
    ///
    /// # Safety
    ///
    /// As for [`RwLock::wr_lock`].
    pub unsafe fn wr_lock(
        &self,
        worker: &CompletionWorker,
        waiter: &CompletionWaiter,
        item: &CompletionItem,
    ) -> Result {
        unsafe {
            self.core
                .wr_lock_cwp(worker, waiter, item, 0, Some(&self.tryread_queue_lock))
        }
    }

    /// See [`RwLock::wr_lock_cwp`].
    ///
    /// # Safety
    ///
    /// As for [`RwLock::wr_lock`].
    pub unsafe fn wr_lock_cwp(
        &self,
        worker: &CompletionWorker,
        waiter: &CompletionWaiter,
        item: &CompletionItem,
        readers_till_wp: i32,
    ) -> Result {
        unsafe {
            self.core.wr_lock_cwp(
                worker,
                waiter,
                item,
                readers_till_wp,
                Some(&self.tryread_queue_lock),
            )
        }
    }

    /// See [`RwLock::try_wr_lock`].
    pub fn try_wr_lock(&self) -> Result {
        self.core.try_wr_lock(Some(&self.tryread_queue_lock))
    }

    /// See [`RwLock::wr_unlock`].
    pub fn wr_unlock(&self) -> Result {
        self.core.wr_unlock()
    }

    /// See [`RwLock::rd_lock`].
    ///
    /// # Safety
    ///
    /// As for [`RwLock::rd_lock`].
    pub unsafe fn rd_lock(
        &self,
        worker: &CompletionWorker,
        waiter: &CompletionWaiter,
        item: &CompletionItem,
    ) -> Result {
        unsafe { self.core.rd_lock(worker, waiter, item) }
    }

    /// Acquire a read lock without blocking.
    ///
    /// Obeys writer priority: fails with [`Error::Busy`] whenever writers
    /// are present, and may fail speculatively against a concurrent
    /// [`try_wr_lock`](Self::try_wr_lock) that itself ends up failing.
    ///
    /// # Safety
    ///
    /// As for [`RwLock::rd_lock`]; no waiter is needed.
    pub unsafe fn try_rd_lock(&self, worker: &CompletionWorker, item: &CompletionItem) -> Result {
        if self.core.wr_pendings.load(Ordering::SeqCst) != 0 {
            return Err(Error::Busy);
        }
        self.tryread_queue_lock.lock()?;
        let outcome = (|| {
            if self.core.wr_pendings.load(Ordering::SeqCst) != 0 {
                return Err(Error::Busy);
            }
            worker.charge_item(item)?;
            match self.core.acquired_reads.lock() {
                Ok(guard) => {
                    // The try-read zone is the ring tail, after the
                    // separator.
                    unsafe { guard.link_back(item) };
                    Ok(())
                }
                Err(e) => {
                    worker.discharge_item(item, 0);
                    Err(e)
                }
            }
        })();
        self.tryread_queue_lock.unlock();
        outcome
    }

    /// See [`RwLock::rd_unlock`]. Releases both normal and try-read locks.
    ///
    /// # Safety
    ///
    /// As for [`RwLock::rd_lock`].
    pub unsafe fn rd_unlock(&self, worker: &CompletionWorker, item: &CompletionItem) -> Result {
        unsafe { self.core.rd_unlock(worker, item) }
    }

    /// Run `f` under a read lock using `gear`'s thread-local objects.
    pub fn read<R>(&self, gear: &mut LockGear, f: impl FnOnce() -> R) -> Result<R> {
        unsafe { self.core.rd_lock(&gear.worker, &gear.waiter, &gear.item) }?;
        let unlock = RdUnlockOnDrop {
            core: &self.core,
            gear,
        };
        let value = f();
        drop(unlock);
        Ok(value)
    }

    /// Run `f` under a read lock if one can be taken without blocking;
    /// `Ok(None)` if writers were present.
    pub fn try_read<R>(&self, gear: &mut LockGear, f: impl FnOnce() -> R) -> Result<Option<R>> {
        match unsafe { self.try_rd_lock(&gear.worker, &gear.item) } {
            Ok(()) => {}
            Err(Error::Busy) => return Ok(None),
            Err(e) => return Err(e),
        }
        let unlock = RdUnlockOnDrop {
            core: &self.core,
            gear,
        };
        let value = f();
        drop(unlock);
        Ok(Some(value))
    }

    /// Run `f` under the write lock using `gear`'s thread-local objects.
    pub fn write<R>(&self, gear: &mut LockGear, f: impl FnOnce() -> R) -> Result<R> {
        self.write_cwp(gear, 0, f)
    }

    /// [`write`](Self::write) with a custom `readers_till_wp` threshold.
    pub fn write_cwp<R>(
        &self,
        gear: &mut LockGear,
        readers_till_wp: i32,
        f: impl FnOnce() -> R,
    ) -> Result<R> {
        unsafe {
            self.core.wr_lock_cwp(
                &gear.worker,
                &gear.waiter,
                &gear.item,
                readers_till_wp,
                Some(&self.tryread_queue_lock),
            )
        }?;
        let unlock = WrUnlockOnDrop { core: &self.core };
        let value = f();
        drop(unlock);
        Ok(value)
    }

    /// Run `f` under the write lock if it can be taken without blocking;
    /// `Ok(None)` if the lock was busy.
    pub fn try_write<R>(&self, f: impl FnOnce() -> R) -> Result<Option<R>> {
        match self.try_wr_lock() {
            Ok(()) => {}
            Err(Error::Busy) => return Ok(None),
            Err(e) => return Err(e),
        }
        let unlock = WrUnlockOnDrop { core: &self.core };
        let value = f();
        drop(unlock);
        Ok(Some(value))
    }
}

/// The per-thread bundle backing the safe closure-scoped lock methods: a
/// locked worker, a waiter, and one reusable item.
///
/// One gear supports one lock acquisition at a time; nested acquisitions of
/// different locks take one gear each (the exclusive borrow enforces this).
/// The gear is tied to its creating thread.
pub struct LockGear {
    pub(crate) worker: CompletionWorker,
    pub(crate) waiter: CompletionWaiter,
    pub(crate) item: CompletionItem,
    /// The worker's lock must be released on the creating thread.
    _not_send: core::marker::PhantomData<*const ()>,
}

impl LockGear {
    /// Create a gear for the calling thread.
    pub fn new(attr: Option<&LockAttr>) -> Result<Self> {
        let worker = CompletionWorker::new(attr)?;
        let waiter = CompletionWaiter::new(attr)?;
        let item = CompletionItem::new(attr)?;
        worker.lock()?;
        Ok(Self {
            worker,
            waiter,
            item,
            _not_send: core::marker::PhantomData,
        })
    }
}

impl Drop for LockGear {
    fn drop(&mut self) {
        fatal_unwrap(self.worker.unlock(), "dropping a lock gear still in use");
    }
}

struct RdUnlockOnDrop<'a> {
    core: &'a RwCore,
    gear: &'a LockGear,
}

impl Drop for RdUnlockOnDrop<'_> {
    fn drop(&mut self) {
        fatal_unwrap(
            // Safety: the read lock is held with exactly these objects.
            unsafe { self.core.rd_unlock(&self.gear.worker, &self.gear.item) },
            "releasing a scoped read lock",
        );
    }
}

struct WrUnlockOnDrop<'a> {
    core: &'a RwCore,
}

impl Drop for WrUnlockOnDrop<'_> {
    fn drop(&mut self) {
        fatal_unwrap(self.core.wr_unlock(), "releasing a scoped write lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_read_and_write() {
        let lock = RwLock::new(None).unwrap();
        let mut gear = LockGear::new(None).unwrap();

        assert_eq!(lock.read(&mut gear, || 7).unwrap(), 7);
        assert_eq!(lock.write(&mut gear, || 8).unwrap(), 8);
        assert_eq!(lock.try_write(|| 9).unwrap(), Some(9));
    }

    #[test]
    fn try_write_sees_reader() {
        let lock = RwLock::new(None).unwrap();
        let mut gear = LockGear::new(None).unwrap();

        lock.read(&mut gear, || {
            assert_eq!(lock.try_write(|| ()).unwrap(), None);
        })
        .unwrap();
        assert_eq!(lock.try_write(|| ()).unwrap(), Some(()));
    }

    #[test]
    fn trdl_try_read_vs_writers() {
        let lock = TrdlRwLock::new(None).unwrap();
        let mut gear = LockGear::new(None).unwrap();
        let mut gear2 = LockGear::new(None).unwrap();

        // Try-read coexists with a normal reader.
        lock.read(&mut gear, || {
            assert!(lock.try_read(&mut gear2, || ()).unwrap().is_some());
        })
        .unwrap();

        // Try-read is refused while the write lock is held.
        lock.write(&mut gear, || {
            assert!(lock.try_read(&mut gear2, || ()).unwrap().is_none());
        })
        .unwrap();
    }

    #[test]
    fn express_path_folds_on_unlock() {
        let lock = RwLock::new(None).unwrap();
        let mut outer = LockGear::new(None).unwrap();
        let mut inner = LockGear::new(None).unwrap();

        lock.read(&mut outer, || {
            // The inner reader is admitted over the express stack (a
            // registered reader anchors the lock) and folded in no later
            // than its own unlock.
            lock.read(&mut inner, || ()).unwrap();
        })
        .unwrap();
        assert_eq!(lock.try_write(|| ()).unwrap(), Some(()));
    }
}
