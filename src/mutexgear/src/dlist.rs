//! Intrusive circular ring with a sentinel.
//!
//! Links are self-relative byte offsets stored in atomics. An offset of zero
//! designates the link itself, which doubles as the "unlinked" state for
//! member links and as the "empty" state for sentinels. Self-relative links
//! are position-independent, so a ring whose members all live in one shared
//! memory section resolves correctly at different mapping addresses in
//! different processes.
//!
//! `prev` is an atomic in the full sense: it is published with release
//! ordering and may be probed from other threads (acquire). `next` is only
//! ever written and read under the guard mutex of the structure hosting the
//! ring, so relaxed accesses suffice there.
//!
//! Members are never owned by the ring. Every function taking a `NonNull`
//! requires the pointee to outlive its linkage and to stay at a stable
//! address while linked.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicIsize, Ordering};

/// A link embedded in ring members and, as a sentinel, in ring heads.
pub(crate) struct RawLink {
    prev: AtomicIsize,
    next: AtomicIsize,
}

impl RawLink {
    pub const fn new() -> Self {
        Self {
            prev: AtomicIsize::new(0),
            next: AtomicIsize::new(0),
        }
    }

    #[inline]
    fn base(&self) -> isize {
        self as *const Self as isize
    }

    #[inline]
    fn offset_to(&self, other: NonNull<RawLink>) -> isize {
        (other.as_ptr() as isize).wrapping_sub(self.base())
    }

    #[inline]
    unsafe fn resolve(&self, offset: isize) -> NonNull<RawLink> {
        // Safety: the caller guarantees the offset was produced by
        // `offset_to` against a live link.
        unsafe { NonNull::new_unchecked(self.base().wrapping_add(offset) as *mut RawLink) }
    }

    /// Whether this link is a member of some ring.
    ///
    /// For a sentinel the same test reads as "is the ring non-empty".
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.prev.load(Ordering::Relaxed) != 0
    }

    /// Cross-thread probe of `is_linked` without the host guard held.
    #[inline]
    pub fn is_linked_probe(&self) -> bool {
        self.prev.load(Ordering::Acquire) != 0
    }

    /// Cross-thread probe of the predecessor's address without the host
    /// guard held. Yields this link's own address when unlinked (or, for a
    /// sentinel, when the ring is empty). The result is a possibly stale
    /// address for comparison only, never for dereferencing.
    #[inline]
    pub fn prev_probe_addr(&self) -> usize {
        self.base().wrapping_add(self.prev.load(Ordering::Acquire)) as usize
    }

    /// This link's address, for comparison against [`prev_probe_addr`].
    ///
    /// [`prev_probe_addr`]: Self::prev_probe_addr
    #[inline]
    pub fn addr(&self) -> usize {
        self.base() as usize
    }

    /// The successor link. Must be linked; host guard required.
    #[inline]
    pub unsafe fn next(&self) -> NonNull<RawLink> {
        unsafe { self.resolve(self.next.load(Ordering::Relaxed)) }
    }

    /// The predecessor link. Must be linked.
    #[inline]
    pub unsafe fn prev(&self, order: Ordering) -> NonNull<RawLink> {
        unsafe { self.resolve(self.prev.load(order)) }
    }

    #[inline]
    fn set_next(&self, next: NonNull<RawLink>) {
        self.next.store(self.offset_to(next), Ordering::Relaxed);
    }

    #[inline]
    fn set_prev(&self, prev: NonNull<RawLink>) {
        // Publication store: a cross-thread `prev` probe that observes this
        // value may dereference the predecessor.
        self.prev.store(self.offset_to(prev), Ordering::Release);
    }

    /// Reset to the unlinked state.
    #[inline]
    fn reset(&self) {
        self.prev.store(0, Ordering::Relaxed);
        self.next.store(0, Ordering::Relaxed);
    }

    // Raw `prev` access for the lock-free stack built over member links
    // (the express-reader path). The stored value is the self-relative
    // offset of the next stack member, or 0 at the stack bottom.

    #[inline]
    pub fn stack_set_next(&self, next: Option<NonNull<RawLink>>) {
        let offset = match next {
            Some(next) => self.offset_to(next),
            None => 0,
        };
        self.prev.store(offset, Ordering::Relaxed);
    }

    #[inline]
    pub unsafe fn stack_next(&self) -> Option<NonNull<RawLink>> {
        match self.prev.load(Ordering::Relaxed) {
            0 => None,
            offset => Some(unsafe { self.resolve(offset) }),
        }
    }
}

/// Insert `item` just before `before` in `before`'s ring.
///
/// # Safety
///
/// `item` must be unlinked; `before` must be a sentinel or a linked member.
/// The caller must hold the host's guard.
pub(crate) unsafe fn link_before(item: NonNull<RawLink>, before: NonNull<RawLink>) {
    let (item_ref, before_ref) = unsafe { (item.as_ref(), before.as_ref()) };
    debug_assert!(!item_ref.is_linked());
    let prev = if before_ref.is_linked() || before_ref.next.load(Ordering::Relaxed) != 0 {
        unsafe { before_ref.prev(Ordering::Relaxed) }
    } else {
        // `before` is an empty sentinel.
        before
    };
    unsafe { prev.as_ref() }.set_next(item);
    item_ref.set_next(before);
    item_ref.set_prev(prev);
    before_ref.set_prev(item);
}

/// Remove `item` from its ring and reset it to unlinked.
///
/// # Safety
///
/// `item` must be linked; the caller must hold the host's guard.
pub(crate) unsafe fn unlink(item: NonNull<RawLink>) {
    let item_ref = unsafe { item.as_ref() };
    debug_assert!(item_ref.is_linked());
    let prev = unsafe { item_ref.prev(Ordering::Relaxed) };
    let next = unsafe { item_ref.next() };
    unsafe { prev.as_ref() }.set_next(next);
    unsafe { next.as_ref() }.set_prev(prev);
    item_ref.reset();
}

/// Move the half-open range `[begin, end)` out of its host ring and insert
/// it just before `before` in `before`'s ring, in one logical step.
///
/// When `begin` is the host's first member and `end` its sentinel this
/// transplants the entire ring, leaving the host empty.
///
/// # Safety
///
/// `begin` must precede `end` in one ring, `begin != end`, and `before` must
/// belong to a different ring. The caller must hold both hosts' guards.
pub(crate) unsafe fn splice_before(
    before: NonNull<RawLink>,
    begin: NonNull<RawLink>,
    end: NonNull<RawLink>,
) {
    debug_assert_ne!(begin, end);
    let (begin_ref, end_ref, before_ref) =
        unsafe { (begin.as_ref(), end.as_ref(), before.as_ref()) };

    // Close the source ring around the removed range.
    let source_prev = unsafe { begin_ref.prev(Ordering::Relaxed) };
    let last = unsafe { end_ref.prev(Ordering::Relaxed) };
    unsafe { source_prev.as_ref() }.set_next(end);
    end_ref.set_prev(source_prev);

    // Insert the range before `before`.
    let dest_prev = if before_ref.is_linked() || before_ref.next.load(Ordering::Relaxed) != 0 {
        unsafe { before_ref.prev(Ordering::Relaxed) }
    } else {
        before
    };
    unsafe { dest_prev.as_ref() }.set_next(begin);
    begin_ref.set_prev(dest_prev);
    unsafe { last.as_ref() }.set_next(before);
    before_ref.set_prev(last);
}

/// A ring head. The sentinel is heap-pinned so the owning structure stays
/// movable even while caller-pinned members are linked.
pub(crate) struct RawList {
    head: Box<RawLink>,
}

impl RawList {
    pub fn new() -> Self {
        Self {
            head: Box::new(RawLink::new()),
        }
    }

    #[inline]
    pub fn sentinel(&self) -> NonNull<RawLink> {
        NonNull::from(&*self.head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.head.is_linked()
    }

    /// Cross-thread emptiness probe without the guard held. The answer may
    /// be stale by the time it is used; callers must only treat it as a
    /// hint.
    #[inline]
    pub fn is_empty_probe(&self) -> bool {
        !self.head.is_linked_probe()
    }

    /// The first member, front to back. Guard required.
    #[inline]
    pub fn first(&self) -> Option<NonNull<RawLink>> {
        if self.is_empty() {
            None
        } else {
            Some(unsafe { self.head.next() })
        }
    }

    /// The last member. Guard required.
    #[inline]
    pub fn last(&self) -> Option<NonNull<RawLink>> {
        if self.is_empty() {
            None
        } else {
            Some(unsafe { self.head.prev(Ordering::Relaxed) })
        }
    }

    /// Append `item` at the back. See [`link_before`] for the contract.
    #[inline]
    pub unsafe fn link_back(&self, item: NonNull<RawLink>) {
        unsafe { link_before(item, self.sentinel()) };
    }

    /// Transplant every member of `self` to the back of `target`'s ring,
    /// just before `target_before`. No-op on an empty ring. Guards of both
    /// hosts required.
    pub unsafe fn splice_all_before(&self, target_before: NonNull<RawLink>) {
        if let Some(first) = self.first() {
            unsafe { splice_before(target_before, first, self.sentinel()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;

    fn node() -> Box<RawLink> {
        Box::new(RawLink::new())
    }

    fn collect(list: &RawList) -> Vec<NonNull<RawLink>> {
        let mut out = Vec::new();
        let mut cur = list.first();
        while let Some(link) = cur {
            out.push(link);
            let next = unsafe { link.as_ref().next() };
            cur = (next != list.sentinel()).then_some(next);
        }
        out
    }

    #[test]
    fn link_unlink_round_trip() {
        let list = RawList::new();
        assert!(list.is_empty());

        let a = node();
        let b = node();
        let c = node();
        unsafe {
            list.link_back(NonNull::from(&*a));
            list.link_back(NonNull::from(&*b));
            // Insert `c` between `a` and `b`.
            link_before(NonNull::from(&*c), NonNull::from(&*b));
        }
        assert_eq!(
            collect(&list),
            vec![NonNull::from(&*a), NonNull::from(&*c), NonNull::from(&*b)]
        );
        assert!(a.is_linked() && b.is_linked() && c.is_linked());

        unsafe { unlink(NonNull::from(&*c)) };
        assert!(!c.is_linked());
        assert_eq!(collect(&list), vec![NonNull::from(&*a), NonNull::from(&*b)]);

        unsafe {
            unlink(NonNull::from(&*a));
            unlink(NonNull::from(&*b));
        }
        assert!(list.is_empty());
    }

    #[test]
    fn splice_whole_ring() {
        let src = RawList::new();
        let dst = RawList::new();
        let nodes: Vec<_> = (0..4).map(|_| node()).collect();
        let anchor = node();

        unsafe {
            dst.link_back(NonNull::from(&*anchor));
            for n in &nodes {
                src.link_back(NonNull::from(&**n));
            }
            src.splice_all_before(dst.sentinel());
        }

        assert!(src.is_empty());
        let expect: Vec<_> = std::iter::once(NonNull::from(&*anchor))
            .chain(nodes.iter().map(|n| NonNull::from(&**n)))
            .collect();
        assert_eq!(collect(&dst), expect);
    }

    #[test]
    fn splice_into_empty_ring() {
        let src = RawList::new();
        let dst = RawList::new();
        let a = node();
        unsafe {
            src.link_back(NonNull::from(&*a));
            src.splice_all_before(dst.sentinel());
        }
        assert!(src.is_empty());
        assert_eq!(collect(&dst), vec![NonNull::from(&*a)]);
        assert_eq!(dst.last(), Some(NonNull::from(&*a)));
    }

    /// Replay a random operation sequence against a `VecDeque` model.
    /// Each element of `ops` selects a node slot; linked slots get unlinked,
    /// unlinked slots get appended.
    #[quickcheck]
    fn matches_model(ops: Vec<u8>) -> bool {
        let list = RawList::new();
        let slots: Vec<_> = (0..8).map(|_| node()).collect();
        let mut model: VecDeque<usize> = VecDeque::new();

        for op in ops {
            let slot = (op % 8) as usize;
            let link = NonNull::from(&*slots[slot]);
            if slots[slot].is_linked() {
                unsafe { unlink(link) };
                model.retain(|&i| i != slot);
            } else {
                unsafe { list.link_back(link) };
                model.push_back(slot);
            }
        }

        let got = collect(&list);
        let expect: Vec<_> = model.iter().map(|&i| NonNull::from(&*slots[i])).collect();
        got == expect && list.is_empty() == model.is_empty()
    }
}
