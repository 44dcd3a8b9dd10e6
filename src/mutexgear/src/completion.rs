//! The completion framework: a queue of in-flight items and the per-thread
//! objects used to wait for a specific item to leave it.
//!
//! A thread that submits work — a *worker* — charges an item (locks the
//! item's embedded mutex) and links it into a queue. A thread that needs to
//! observe the item's completion — through a *waiter* — blocks acquiring
//! that same mutex, which the worker releases only after unlinking the item.
//! The blocked acquisition is an ordinary OS mutex wait, so the waiter's
//! scheduling priority is donated to the worker for as long as the wait
//! lasts.
//!
//! Items, workers, and waiters are caller-owned: a queue holds references to
//! items only between `enqueue` and `dequeue`, and the `unsafe` operations
//! spell out the address-stability contract this requires.

use core::mem::offset_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::attrs::LockAttr;
use crate::dlist::{self, RawLink, RawList};
use crate::sysmutex::SysMutex;
use crate::utils::{fatal_check, fatal_unwrap};
use crate::{Error, Result};

/// The largest number of threads that may simultaneously wait for one queued
/// item. The read-write lock bounds its concurrent writer waits by its
/// wait-channel cap, which this constant matches.
pub const MAX_ITEM_WAITERS: usize = 4;

/// A monotone identifier issued by a drainable queue on each drain.
///
/// Items carried out by a drain are stamped with the index of that drain, so
/// a later observer can tell which drain generation an item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DrainIdx(u64);

impl DrainIdx {
    /// The reserved "never drained" value.
    pub const INVALID: Self = Self(0);

    /// Whether this index identifies an actual drain generation.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// The per-thread submission agent.
///
/// A worker owns a mutex that brackets the thread's submission lifetime: it
/// is acquired by [`lock`](Self::lock) before the first item is charged and
/// released by [`unlock`](Self::unlock) once no charged items remain. Items
/// are charged and discharged through the worker, which tracks them so that
/// a premature `unlock` fails with [`Error::Busy`] instead of abandoning
/// queued items.
///
/// All operations on one worker must be performed by the thread it serves.
pub struct CompletionWorker {
    lock: SysMutex,
    engaged: AtomicBool,
    charged_items: AtomicUsize,
}

impl CompletionWorker {
    /// Create a worker.
    pub fn new(attr: Option<&LockAttr>) -> Result<Self> {
        Ok(Self {
            lock: SysMutex::new(attr)?,
            engaged: AtomicBool::new(false),
            charged_items: AtomicUsize::new(0),
        })
    }

    /// Engage the worker for use by the calling thread.
    pub fn lock(&self) -> Result {
        fatal_check!(0, !self.engaged.load(Ordering::Relaxed), "worker locked twice");
        self.lock.lock()?;
        self.engaged.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Release the worker. Fails with [`Error::Busy`] while any item charged
    /// through this worker is still queued.
    pub fn unlock(&self) -> Result {
        if self.charged_items.load(Ordering::Relaxed) != 0 {
            return Err(Error::Busy);
        }
        fatal_check!(0, self.engaged.load(Ordering::Relaxed), "worker not locked");
        self.engaged.store(false, Ordering::Relaxed);
        self.lock.unlock();
        Ok(())
    }

    pub(crate) fn charge_item(&self, item: &CompletionItem) -> Result {
        fatal_check!(
            0,
            self.engaged.load(Ordering::Relaxed),
            "charging an item through an unlocked worker"
        );
        item.charge()?;
        self.charged_items.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn discharge_item(&self, item: &CompletionItem, claims: u32) {
        item.discharge(claims);
        self.charged_items.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for CompletionWorker {
    fn drop(&mut self) {
        fatal_check!(
            0,
            !self.engaged.load(Ordering::Relaxed),
            "dropping a locked worker"
        );
    }
}

/// The per-thread wait helper.
///
/// A waiter owns one transient mutex, held for the duration of each wait it
/// performs, serializing the waits issued through it. A waiter is reusable
/// across independent waits (including waits on different queues) and may be
/// disposed as soon as its current wait returns — no other thread ever
/// touches it.
pub struct CompletionWaiter {
    lock: SysMutex,
}

impl CompletionWaiter {
    /// Create a waiter.
    pub fn new(attr: Option<&LockAttr>) -> Result<Self> {
        Ok(Self {
            lock: SysMutex::new(attr)?,
        })
    }
}

/// An in-flight work item: an intrusive ring node with an embedded mutex.
///
/// While the item resides in a queue, the embedded mutex is held by the
/// worker thread that submitted it; waiting for the item is acquiring that
/// mutex. The item additionally carries one *wait gate* per possible
/// concurrent waiter; a departing waiter releases its gate last, and the
/// next charge re-walks the gates, which makes item reuse race-free without
/// any polling.
///
/// Items are created per thread and are freely reusable once dequeued.
pub struct CompletionItem {
    link: RawLink,
    lock: SysMutex,
    wait_gates: [SysMutex; MAX_ITEM_WAITERS],
    /// Waiter claims of the current residency. Grows only under the host
    /// queue's access mutex; frozen once the item is unlinked.
    wait_claims: AtomicU32,
    /// Claims of the finished residency, drained at the next charge.
    parked_claims: AtomicU32,
    charged: AtomicBool,
    drain_gen: AtomicU64,
}

impl CompletionItem {
    /// Create an item.
    pub fn new(attr: Option<&LockAttr>) -> Result<Self> {
        Ok(Self {
            link: RawLink::new(),
            lock: SysMutex::new(attr)?,
            wait_gates: [
                SysMutex::new(attr)?,
                SysMutex::new(attr)?,
                SysMutex::new(attr)?,
                SysMutex::new(attr)?,
            ],
            wait_claims: AtomicU32::new(0),
            parked_claims: AtomicU32::new(0),
            charged: AtomicBool::new(false),
            drain_gen: AtomicU64::new(0),
        })
    }

    /// Whether the item currently resides in a queue (cross-thread probe).
    pub fn is_linked(&self) -> bool {
        self.link.is_linked_probe()
    }

    /// The drain generation that carried this item out of its queue, if any.
    pub fn drain_generation(&self) -> DrainIdx {
        DrainIdx(self.drain_gen.load(Ordering::Relaxed))
    }

    pub(crate) fn raw_link(&self) -> NonNull<RawLink> {
        NonNull::from(&self.link)
    }

    pub(crate) fn link_ref(&self) -> &RawLink {
        &self.link
    }

    pub(crate) fn is_charged(&self) -> bool {
        self.charged.load(Ordering::Relaxed)
    }

    /// Recover the item from its embedded link.
    ///
    /// # Safety
    ///
    /// `link` must be the `link` field of a live `CompletionItem`.
    pub(crate) unsafe fn from_link(link: NonNull<RawLink>) -> NonNull<CompletionItem> {
        let ptr = link.as_ptr().cast::<u8>();
        unsafe {
            NonNull::new_unchecked(ptr.sub(offset_of!(CompletionItem, link)).cast::<CompletionItem>())
        }
    }

    /// Lock the embedded mutex on the submitting thread, first waiting out
    /// any waiter of the previous residency that has not yet left.
    fn charge(&self) -> Result {
        let parked = self.parked_claims.swap(0, Ordering::Relaxed);
        for gate in &self.wait_gates[..(parked as usize).min(MAX_ITEM_WAITERS)] {
            if let Err(e) = gate.lock() {
                // Re-drain everything on the next attempt.
                self.parked_claims.store(parked, Ordering::Relaxed);
                return Err(e);
            }
            gate.unlock();
        }
        fatal_check!(
            0,
            !self.charged.swap(true, Ordering::Relaxed),
            "charging an already charged item"
        );
        if let Err(e) = self.lock.lock() {
            self.charged.store(false, Ordering::Relaxed);
            return Err(e);
        }
        self.wait_claims.store(0, Ordering::Relaxed);
        self.drain_gen.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Release the embedded mutex, waking every waiter of the finished
    /// residency, and park the residency's claim count for the next charge.
    fn discharge(&self, claims: u32) {
        self.parked_claims.store(claims, Ordering::Relaxed);
        fatal_check!(
            0,
            self.charged.swap(false, Ordering::Relaxed),
            "discharging an uncharged item"
        );
        self.lock.unlock();
    }

    pub(crate) fn stamp_drain(&self, idx: DrainIdx) {
        self.drain_gen.store(idx.0, Ordering::Relaxed);
    }
}

impl Drop for CompletionItem {
    fn drop(&mut self) {
        fatal_check!(0, !self.is_charged(), "dropping a charged item");
        fatal_check!(0, !self.link.is_linked(), "dropping a queued item");
        // Wait out any straggler from the last residency before the gates
        // are torn down.
        let parked = self.parked_claims.load(Ordering::Relaxed);
        for gate in &self.wait_gates[..(parked as usize).min(MAX_ITEM_WAITERS)] {
            fatal_unwrap(gate.lock(), "draining wait gates of a dropped item");
            gate.unlock();
        }
    }
}

/// An intrusive FIFO of in-flight completion items.
///
/// Structural changes are guarded by a single *access mutex*, exposed
/// through [`CompletionQueueGuard`]; the guard is also the capability to
/// start a wait without racing the item's departure.
pub struct CompletionQueue {
    access: SysMutex,
    list: RawList,
}

/// Proof that a queue's access mutex is held. Dropping the guard releases
/// the mutex.
pub struct CompletionQueueGuard<'a> {
    queue: &'a CompletionQueue,
}

impl CompletionQueue {
    /// Create a queue.
    pub fn new(attr: Option<&LockAttr>) -> Result<Self> {
        Ok(Self {
            access: SysMutex::new(attr)?,
            list: RawList::new(),
        })
    }

    /// Acquire the access mutex.
    pub fn lock(&self) -> Result<CompletionQueueGuard<'_>> {
        self.access.lock()?;
        Ok(CompletionQueueGuard { queue: self })
    }

    /// Acquire the access mutex only if it is free.
    pub fn try_lock(&self) -> Result<Option<CompletionQueueGuard<'_>>> {
        Ok(if self.access.try_lock()? {
            Some(CompletionQueueGuard { queue: self })
        } else {
            None
        })
    }

    /// Cross-thread emptiness hint without the access mutex held.
    pub fn is_empty_probe(&self) -> bool {
        self.list.is_empty_probe()
    }

    /// The ring sentinel. Its address is stable for the queue's lifetime, so
    /// no guard is needed to take it.
    pub(crate) fn sentinel_link(&self) -> NonNull<RawLink> {
        self.list.sentinel()
    }

    /// Release the access mutex without a guard object.
    ///
    /// Counterpart of leaking a [`CompletionQueueGuard`] with `mem::forget`;
    /// used where an acquisition is held across calls (the write lock).
    /// Must be called on the thread that acquired the mutex.
    pub(crate) fn unlock_raw(&self) {
        self.access.unlock();
    }

    /// Charge `item` through `worker` and link it at the tail.
    ///
    /// # Safety
    ///
    /// `item` must stay at a stable address, and `item` and `worker` must
    /// outlive the matching [`dequeue`](Self::dequeue), which must be called
    /// on the same thread.
    pub unsafe fn enqueue(&self, worker: &CompletionWorker, item: &CompletionItem) -> Result {
        worker.charge_item(item)?;
        let guard = match self.lock() {
            Ok(guard) => guard,
            Err(e) => {
                let claims = item.wait_claims.load(Ordering::Relaxed);
                worker.discharge_item(item, claims);
                return Err(e);
            }
        };
        unsafe { guard.link_back(item) };
        Ok(())
    }

    /// Unlink `item` and release its embedded mutex, waking any waiters.
    ///
    /// Must be called by the thread that enqueued `item`. When this returns,
    /// `item` is immediately reusable.
    ///
    /// # Safety
    ///
    /// `item` must have been enqueued on this queue by `worker`.
    pub unsafe fn dequeue(&self, worker: &CompletionWorker, item: &CompletionItem) -> Result {
        let guard = self.lock()?;
        let claims = unsafe { guard.unlink(item) };
        drop(guard);
        worker.discharge_item(item, claims);
        Ok(())
    }
}

impl<'a> CompletionQueueGuard<'a> {
    /// Whether the queue has no items.
    pub fn is_empty(&self) -> bool {
        self.queue.list.is_empty()
    }

    pub(crate) fn sentinel(&self) -> NonNull<RawLink> {
        self.queue.list.sentinel()
    }

    pub(crate) fn first_link(&self) -> Option<NonNull<RawLink>> {
        self.queue.list.first()
    }

    pub(crate) fn last_link(&self) -> Option<NonNull<RawLink>> {
        self.queue.list.last()
    }

    /// Link a charged `item` at the tail. See [`CompletionQueue::enqueue`]
    /// for the contract.
    pub(crate) unsafe fn link_back(&self, item: &CompletionItem) {
        fatal_check!(0, item.is_charged(), "queueing an uncharged item");
        unsafe { self.queue.list.link_back(item.raw_link()) };
    }

    /// Unlink `item` and return its frozen waiter-claim count for the
    /// matching discharge.
    pub(crate) unsafe fn unlink(&self, item: &CompletionItem) -> u32 {
        fatal_check!(0, item.link_ref().is_linked(), "unlinking an unqueued item");
        unsafe { dlist::unlink(item.raw_link()) };
        item.wait_claims.load(Ordering::Relaxed)
    }

    /// Block until `item` leaves the queue it currently resides in.
    ///
    /// The guard is consumed: the access mutex is released once the wait is
    /// registered, and the calling thread then blocks on the item's embedded
    /// mutex. Returns no earlier than the completion of the dequeue that
    /// removes `item`.
    ///
    /// # Safety
    ///
    /// `item` must be linked in this guard's queue (or in a drain batch
    /// guarded by this guard's access mutex).
    pub unsafe fn wait_for(self, waiter: &CompletionWaiter, item: &CompletionItem) -> Result {
        let idx = item.wait_claims.fetch_add(1, Ordering::Relaxed) as usize;
        fatal_check!(
            idx,
            idx < MAX_ITEM_WAITERS,
            "too many concurrent waiters for one item"
        );
        if let Err(e) = waiter.lock.lock() {
            // Still under the access mutex; the claim can be retracted.
            item.wait_claims.fetch_sub(1, Ordering::Relaxed);
            return Err(e);
        }
        let gate = &item.wait_gates[idx];
        if let Err(e) = gate.lock() {
            item.wait_claims.fetch_sub(1, Ordering::Relaxed);
            waiter.lock.unlock();
            return Err(e);
        }

        drop(self);

        // The blocking edge. Priority inheritance flows to the worker
        // holding the item's mutex. No rollback is possible past this point.
        fatal_unwrap(item.lock.lock(), "acquiring an awaited item");
        item.lock.unlock();
        // The gate must go last among the item fields: the item owner's next
        // charge waits on it, which is what makes the unlocks above safe
        // against reuse.
        gate.unlock();
        waiter.lock.unlock();
        Ok(())
    }
}

impl Drop for CompletionQueueGuard<'_> {
    fn drop(&mut self) {
        self.queue.access.unlock();
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        fatal_check!(0, self.list.is_empty(), "dropping a non-empty queue");
    }
}

/// A [`CompletionQueue`] that can additionally be emptied wholesale into a
/// caller-provided [`CompletionDrain`], issuing a fresh [`DrainIdx`] per
/// drain.
pub struct CompletionDrainableQueue {
    queue: CompletionQueue,
    next_drain: AtomicU64,
}

impl CompletionDrainableQueue {
    /// Create a drainable queue.
    pub fn new(attr: Option<&LockAttr>) -> Result<Self> {
        Ok(Self {
            queue: CompletionQueue::new(attr)?,
            next_drain: AtomicU64::new(1),
        })
    }

    /// The plain-queue operations of this queue.
    pub fn queue(&self) -> &CompletionQueue {
        &self.queue
    }

    /// The index the next drain will be issued.
    pub(crate) fn upcoming_drain(&self) -> DrainIdx {
        DrainIdx(self.next_drain.load(Ordering::Relaxed))
    }

    /// Stamp every queued item with a fresh drain index and splice them all
    /// before `target_before`, leaving this queue empty.
    ///
    /// # Safety
    ///
    /// `guard` must guard this queue; `target_before` must be the sentinel
    /// (or a member) of a different ring whose guard the caller also holds.
    pub(crate) unsafe fn drain_locked(
        &self,
        guard: &CompletionQueueGuard<'_>,
        target_before: NonNull<RawLink>,
    ) -> DrainIdx {
        debug_assert!(core::ptr::eq(guard.queue, &self.queue));
        let idx = DrainIdx(self.next_drain.fetch_add(1, Ordering::Relaxed));

        let sentinel = guard.sentinel();
        let mut cursor = guard.first_link();
        while let Some(link) = cursor {
            let item = unsafe { CompletionItem::from_link(link).as_ref() };
            item.stamp_drain(idx);
            let next = unsafe { link.as_ref().next() };
            cursor = (next != sentinel).then_some(next);
        }

        unsafe { self.queue.list.splice_all_before(target_before) };
        idx
    }

    /// Splice all queued items into `drain` and issue the next drain index.
    ///
    /// Items in the drain are still charged by their workers; each will
    /// unlink itself (under this queue's access mutex) when released.
    ///
    /// # Safety
    ///
    /// As for [`CompletionQueue::enqueue`]; additionally `drain` must only
    /// ever be manipulated under this queue's access mutex.
    pub unsafe fn drain_into(&self, drain: &CompletionDrain) -> Result<DrainIdx> {
        let guard = self.queue.lock()?;
        Ok(unsafe { self.drain_locked(&guard, drain.list.sentinel()) })
    }

    /// Unlink `item` — whether it still sits in this queue or was carried
    /// into a drain — and release its embedded mutex.
    ///
    /// # Safety
    ///
    /// `item` must have been enqueued on this queue by `worker` and, if
    /// drained, spliced into a ring manipulated only under this queue's
    /// access mutex.
    pub unsafe fn dequeue(&self, worker: &CompletionWorker, item: &CompletionItem) -> Result {
        unsafe { self.queue.dequeue(worker, item) }
    }
}

/// An opaque batch of drained items.
///
/// The drain owns no items; drained items remain charged by their workers
/// and unlink themselves from the batch when released. All manipulation of
/// the batch happens under the access mutex of the queue it was drained
/// from.
pub struct CompletionDrain {
    list: RawList,
}

impl CompletionDrain {
    /// Create an empty drain.
    pub fn new() -> Self {
        Self {
            list: RawList::new(),
        }
    }

    /// Whether the batch currently holds any items. Only meaningful under
    /// the source queue's access mutex.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub(crate) fn sentinel(&self) -> NonNull<RawLink> {
        self.list.sentinel()
    }
}

impl Default for CompletionDrain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CompletionDrain {
    fn drop(&mut self) {
        fatal_check!(0, self.list.is_empty(), "dropping a non-empty drain");
    }
}
