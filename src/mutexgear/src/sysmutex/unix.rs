//! POSIX implementation of the blocking-mutex layer.
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use crate::attrs::{LockAttr, LockProtocol, ProcessShared};
use crate::utils::fatal_check;
use crate::{Error, Result};

// Not exposed by the `libc` crate on this target, despite being part of
// glibc/POSIX; declared locally with the same signature glibc provides.
extern "C" {
    fn pthread_mutexattr_setprioceiling(
        attr: *mut libc::pthread_mutexattr_t,
        prioceiling: libc::c_int,
    ) -> libc::c_int;
}

fn chk(code: libc::c_int) -> Result {
    if code == 0 {
        Ok(())
    } else {
        Err(Error::from_raw_os(code))
    }
}

/// A pthread mutex.
///
/// The kernel object is heap-pinned so that the owning structure stays
/// movable; all of the `lock`/`unlock` pairs issued by this library happen on
/// the thread that performed the acquisition.
pub(crate) struct SysMutex {
    raw: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

// Safety: the pointee never moves, and pthread mutexes are designed for
// concurrent access from any thread.
unsafe impl Send for SysMutex {}
unsafe impl Sync for SysMutex {}

impl SysMutex {
    /// Create a mutex with the given attributes.
    pub fn new(attr: Option<&LockAttr>) -> Result<Self> {
        let mut raw_attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        chk(unsafe { libc::pthread_mutexattr_init(raw_attr.as_mut_ptr()) })?;

        let result = Self::new_with_raw_attr(attr, raw_attr.as_mut_ptr());
        unsafe { libc::pthread_mutexattr_destroy(raw_attr.as_mut_ptr()) };
        result
    }

    fn new_with_raw_attr(
        attr: Option<&LockAttr>,
        raw_attr: *mut libc::pthread_mutexattr_t,
    ) -> Result<Self> {
        if let Some(attr) = attr {
            if attr.pshared() == ProcessShared::Shared {
                chk(unsafe {
                    libc::pthread_mutexattr_setpshared(raw_attr, libc::PTHREAD_PROCESS_SHARED)
                })?;
            }
            match attr.protocol()? {
                LockProtocol::None => {}
                LockProtocol::Inherit => {
                    chk(unsafe {
                        libc::pthread_mutexattr_setprotocol(raw_attr, libc::PTHREAD_PRIO_INHERIT)
                    })?;
                }
                LockProtocol::Protect => {
                    chk(unsafe {
                        libc::pthread_mutexattr_setprotocol(raw_attr, libc::PTHREAD_PRIO_PROTECT)
                    })?;
                }
            }
            if let Some(prioceiling) = attr.prioceiling()? {
                chk(unsafe { pthread_mutexattr_setprioceiling(raw_attr, prioceiling) })?;
            }
        }

        let raw = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        chk(unsafe { libc::pthread_mutex_init(raw.get(), raw_attr) })?;
        Ok(Self { raw })
    }

    /// Block until the mutex is acquired.
    ///
    /// Fails only for OS-reported reasons (e.g. a priority-ceiling
    /// violation); the caller decides whether that is recoverable at its
    /// point in the protocol.
    pub fn lock(&self) -> Result {
        chk(unsafe { libc::pthread_mutex_lock(self.raw.get()) })
    }

    /// Acquire the mutex if it is free; `Ok(false)` if it is held elsewhere.
    pub fn try_lock(&self) -> Result<bool> {
        match unsafe { libc::pthread_mutex_trylock(self.raw.get()) } {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            code => Err(Error::from_raw_os(code)),
        }
    }

    /// Release the mutex.
    ///
    /// A failing release indicates the caller does not own the mutex or the
    /// object is corrupt; neither is recoverable mid-protocol, so the
    /// process is aborted with the code recorded.
    pub fn unlock(&self) {
        let code = unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
        fatal_check!(code, code == 0, "OS mutex release failed");
    }
}

impl Drop for SysMutex {
    fn drop(&mut self) {
        let code = unsafe { libc::pthread_mutex_destroy(self.raw.get()) };
        fatal_check!(code, code == 0, "destroying a busy OS mutex");
    }
}
