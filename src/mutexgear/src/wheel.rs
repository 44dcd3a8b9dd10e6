//! The wheel: independent event signaling over a three-mutex ring.
//!
//! Like the [toggle](crate::toggle), the wheel side keeps one ring mutex
//! acquired and signals by advancing to the next one. The third mutex is
//! what makes clients independent: a client may *grip on* (acquire the mutex
//! one slot behind the wheel side) at any moment, *turn* along the ring —
//! each turn blocking until the wheel has advanced past it — and *release*
//! when the condition it was waiting for has come true. The ring never has
//! more than two of its three mutexes held, so the wheel side can always
//! advance, but never gets more than one signal ahead of a gripped client.
//!
//! A client is optional and at most one may be gripped at a time; distinct
//! client threads must serialize their use of the client side externally.
//!
//! The typical client pattern is a condition re-check loop:
//!
//! ```no_run
//! # use mutexgear::Wheel;
//! # fn condition() -> bool { true }
//! # let wheel = Wheel::new(None).unwrap();
//! if !condition() {
//!     wheel.grip_on().unwrap();
//!     while !condition() {
//!         wheel.turn().unwrap();
//!     }
//!     wheel.release().unwrap();
//! }
//! ```
//!
//! A wheel not currently serving a gripped client can stand in for a toggle
//! through [`push_on`](Wheel::push_on).

use core::sync::atomic::{AtomicI32, Ordering};

use crate::attrs::LockAttr;
use crate::sysmutex::SysMutex;
use crate::utils::fatal_check;
use crate::Result;

const ELEMENT_INVALID: i32 = -1;
const NUM_ELEMENTS: i32 = 3;

/// A three-mutex signaling ring with independent client attachment. See the
/// [module docs](self).
pub struct Wheel {
    locks: [SysMutex; NUM_ELEMENTS as usize],
    /// The wheel side's position; `ELEMENT_INVALID` while disengaged.
    /// Written by the wheel thread, probed by clients gripping on.
    wheel_side: AtomicI32,
    /// The gripped client's position; `ELEMENT_INVALID` while no client is
    /// attached. Only the client side touches it.
    client_side: AtomicI32,
    /// The toggle-compatibility push position.
    compat_push: AtomicI32,
}

impl Wheel {
    /// Create a wheel in the disengaged state.
    pub fn new(attr: Option<&LockAttr>) -> Result<Self> {
        Ok(Self {
            locks: [
                SysMutex::new(attr)?,
                SysMutex::new(attr)?,
                SysMutex::new(attr)?,
            ],
            wheel_side: AtomicI32::new(ELEMENT_INVALID),
            client_side: AtomicI32::new(ELEMENT_INVALID),
            compat_push: AtomicI32::new(NUM_ELEMENTS - 1),
        })
    }

    /// Attach the wheel side, bringing the object into the engaged state.
    pub fn engage(&self) -> Result {
        fatal_check!(
            0,
            self.wheel_side.load(Ordering::Relaxed) == ELEMENT_INVALID,
            "engaging an engaged wheel"
        );
        self.locks[0].lock()?;
        self.wheel_side.store(0, Ordering::Release);
        self.compat_push.store(NUM_ELEMENTS - 1, Ordering::Relaxed);
        log::trace!("wheel {:p} engaged", self);
        Ok(())
    }

    /// Signal: acquire the next ring mutex and release the held one.
    ///
    /// Blocks briefly if a gripped client still holds the next slot, i.e.
    /// the client has not yet turned past the previous signal.
    pub fn advance(&self) -> Result {
        let side = self.wheel_side.load(Ordering::Relaxed);
        fatal_check!(side, side >= 0, "advancing a disengaged wheel");
        let next = (side + 1) % NUM_ELEMENTS;
        self.locks[next as usize].lock()?;
        self.locks[side as usize].unlock();
        self.wheel_side.store(next, Ordering::Release);
        Ok(())
    }

    /// Detach the wheel side. Requires externally ensuring no client is
    /// attached or about to attach.
    pub fn disengage(&self) -> Result {
        let side = self.wheel_side.load(Ordering::Relaxed);
        fatal_check!(side, side >= 0, "disengaging a disengaged wheel");
        fatal_check!(
            0,
            self.client_side.load(Ordering::Relaxed) == ELEMENT_INVALID,
            "disengaging a wheel with a gripped client"
        );
        self.locks[side as usize].unlock();
        self.wheel_side.store(ELEMENT_INVALID, Ordering::Relaxed);
        log::trace!("wheel {:p} disengaged", self);
        Ok(())
    }

    /// Attach the client side one slot behind the wheel side.
    ///
    /// Never blocks for long: the slot behind the wheel side is kept free by
    /// the ring invariant. After gripping, the client should check its
    /// condition of interest before the first [`turn`](Self::turn).
    pub fn grip_on(&self) -> Result {
        fatal_check!(
            0,
            self.client_side.load(Ordering::Relaxed) == ELEMENT_INVALID,
            "gripping a wheel twice"
        );
        let side = self.wheel_side.load(Ordering::Acquire);
        fatal_check!(side, side >= 0, "gripping a disengaged wheel");
        let target = (side + NUM_ELEMENTS - 1) % NUM_ELEMENTS;
        self.locks[target as usize].lock()?;
        self.client_side.store(target, Ordering::Relaxed);
        Ok(())
    }

    /// Follow the wheel by one step, blocking until the wheel side has
    /// advanced past the client's current slot.
    ///
    /// If the wheel is gripped and the wheel side then advances exactly
    /// once, exactly one `turn` returns without blocking.
    pub fn turn(&self) -> Result {
        let side = self.client_side.load(Ordering::Relaxed);
        fatal_check!(side, side >= 0, "turning a wheel that is not gripped");
        let next = (side + 1) % NUM_ELEMENTS;
        self.locks[next as usize].lock()?;
        self.locks[side as usize].unlock();
        self.client_side.store(next, Ordering::Relaxed);
        Ok(())
    }

    /// Detach the client side.
    pub fn release(&self) -> Result {
        let side = self.client_side.load(Ordering::Relaxed);
        fatal_check!(side, side >= 0, "releasing a wheel that is not gripped");
        self.locks[side as usize].unlock();
        self.client_side.store(ELEMENT_INVALID, Ordering::Relaxed);
        Ok(())
    }

    /// Toggle-compatibility wait: equivalent to a grip-on immediately
    /// followed by a single turn and a release.
    ///
    /// Usable only while no client is gripping the wheel, under the same
    /// external coordination a [`Toggle`](crate::Toggle) requires: the n-th
    /// `push_on` returns no earlier than the n-th [`advance`](Self::advance)
    /// completes.
    pub fn push_on(&self) -> Result {
        let push = self.compat_push.load(Ordering::Relaxed);
        let target = (push + 1) % NUM_ELEMENTS;
        self.locks[target as usize].lock()?;
        self.locks[target as usize].unlock();
        self.compat_push.store(target, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for Wheel {
    fn drop(&mut self) {
        fatal_check!(
            0,
            self.wheel_side.load(Ordering::Relaxed) == ELEMENT_INVALID,
            "dropping an engaged wheel"
        );
        fatal_check!(
            0,
            self.client_side.load(Ordering::Relaxed) == ELEMENT_INVALID,
            "dropping a gripped wheel"
        );
    }
}
