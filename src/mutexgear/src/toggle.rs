//! The toggle: coordinated single-client event signaling over a two-mutex
//! ring.
//!
//! The signaler side keeps one of the two mutexes acquired (the *engaged*
//! state) and signals by flipping: acquiring the other mutex and releasing
//! the held one. The waiter side pushes on: it acquires and immediately
//! releases the mutex one step behind the signaler, which blocks exactly
//! until the matching flip has happened. The blocked acquisition donates the
//! waiter's priority to the signaler through the OS.
//!
//! The two sides must be coordinated externally so that the toggle is never
//! flipped twice in a row without a push-on in between, and only a single
//! waiter thread may operate the client side at a time.
//!
//! ```
//! # use mutexgear::Toggle;
//! # use std::sync::Arc;
//! let toggle = Arc::new(Toggle::new(None).unwrap());
//! toggle.engage().unwrap();
//!
//! let client = Arc::clone(&toggle);
//! let waiter = std::thread::spawn(move || {
//!     // Blocks until the flip below.
//!     client.push_on().unwrap();
//! });
//!
//! toggle.flip().unwrap();
//! waiter.join().unwrap();
//! toggle.disengage().unwrap();
//! ```

use core::sync::atomic::{AtomicI32, Ordering};

use crate::attrs::LockAttr;
use crate::sysmutex::SysMutex;
use crate::utils::fatal_check;
use crate::Result;

const ELEMENT_INVALID: i32 = -1;
const NUM_ELEMENTS: i32 = 2;

/// A two-mutex signaling ring. See the [module docs](self).
pub struct Toggle {
    locks: [SysMutex; NUM_ELEMENTS as usize],
    /// The signaler's position; `ELEMENT_INVALID` while disengaged. Only the
    /// signaler thread writes or reads it.
    thumb_position: AtomicI32,
    /// The waiter's position, kept one step behind the signaler. Only the
    /// waiter thread writes or reads it.
    push_position: AtomicI32,
}

impl Toggle {
    /// Create a toggle in the disengaged state.
    pub fn new(attr: Option<&LockAttr>) -> Result<Self> {
        Ok(Self {
            locks: [SysMutex::new(attr)?, SysMutex::new(attr)?],
            thumb_position: AtomicI32::new(ELEMENT_INVALID),
            push_position: AtomicI32::new(NUM_ELEMENTS - 1),
        })
    }

    /// Attach the signaler side, bringing the toggle into the engaged state.
    ///
    /// To be called by the signaler thread before any client accesses the
    /// toggle; typically at the host thread's start.
    pub fn engage(&self) -> Result {
        fatal_check!(
            0,
            self.thumb_position.load(Ordering::Relaxed) == ELEMENT_INVALID,
            "engaging an engaged toggle"
        );
        self.locks[0].lock()?;
        self.thumb_position.store(0, Ordering::Relaxed);
        // The client side restarts one step behind.
        self.push_position.store(NUM_ELEMENTS - 1, Ordering::Relaxed);
        log::trace!("toggle {:p} engaged", self);
        Ok(())
    }

    /// Signal the waiter: acquire the next ring mutex and release the held
    /// one. A waiter blocked in [`push_on`](Self::push_on) is released by
    /// the instant both mutexes are briefly held.
    pub fn flip(&self) -> Result {
        let thumb = self.thumb_position.load(Ordering::Relaxed);
        fatal_check!(thumb, thumb >= 0, "flipping a disengaged toggle");
        let next = (thumb + 1) % NUM_ELEMENTS;
        self.locks[next as usize].lock()?;
        self.locks[thumb as usize].unlock();
        self.thumb_position.store(next, Ordering::Relaxed);
        Ok(())
    }

    /// Detach the signaler side, releasing the held mutex.
    ///
    /// Requires externally ensuring no client is accessing the toggle. The
    /// toggle may be re-engaged afterwards.
    pub fn disengage(&self) -> Result {
        let thumb = self.thumb_position.load(Ordering::Relaxed);
        fatal_check!(thumb, thumb >= 0, "disengaging a disengaged toggle");
        self.locks[thumb as usize].unlock();
        self.thumb_position.store(ELEMENT_INVALID, Ordering::Relaxed);
        log::trace!("toggle {:p} disengaged", self);
        Ok(())
    }

    /// Wait for the next signal: acquire and release the ring mutex one step
    /// behind the signaler.
    ///
    /// Blocks exactly until the signaler performs the flip matching this
    /// push-on: the n-th `push_on` returns no earlier than the n-th
    /// [`flip`](Self::flip) completes. May only be called on an engaged
    /// toggle, by a single waiter thread at a time.
    pub fn push_on(&self) -> Result {
        let push = self.push_position.load(Ordering::Relaxed);
        let target = (push + 1) % NUM_ELEMENTS;
        self.locks[target as usize].lock()?;
        self.locks[target as usize].unlock();
        self.push_position.store(target, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for Toggle {
    fn drop(&mut self) {
        fatal_check!(
            0,
            self.thumb_position.load(Ordering::Relaxed) == ELEMENT_INVALID,
            "dropping an engaged toggle"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engage_disengage_cycle() {
        let toggle = Toggle::new(None).unwrap();
        toggle.engage().unwrap();
        toggle.flip().unwrap();
        toggle.flip().unwrap();
        toggle.disengage().unwrap();
        // Re-engaging after a disengage is allowed.
        toggle.engage().unwrap();
        toggle.disengage().unwrap();
    }

    #[test]
    fn push_on_blocks_until_flip() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let toggle = Arc::new(Toggle::new(None).unwrap());
        toggle.engage().unwrap();

        let flipped = Arc::new(AtomicBool::new(false));
        let (toggle2, flipped2) = (Arc::clone(&toggle), Arc::clone(&flipped));
        let waiter = std::thread::spawn(move || {
            toggle2.push_on().unwrap();
            assert!(flipped2.load(Ordering::Relaxed));
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        flipped.store(true, Ordering::Relaxed);
        toggle.flip().unwrap();
        waiter.join().unwrap();
        toggle.disengage().unwrap();
    }
}
