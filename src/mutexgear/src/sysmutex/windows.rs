//! Windows implementation of the blocking-mutex layer, backed by critical
//! sections.
//!
//! Critical sections are reentrant, but no protocol in this library ever
//! re-locks a mutex it already holds, so the distinction is unobservable.
//! Priority protocols and process sharing are not available on this target;
//! the attribute layer rejects them before they reach this module.
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use winapi::um::minwinbase::CRITICAL_SECTION;
use winapi::um::synchapi::{
    DeleteCriticalSection, EnterCriticalSection, InitializeCriticalSection, LeaveCriticalSection,
    TryEnterCriticalSection,
};

use crate::attrs::{LockAttr, ProcessShared};
use crate::{Error, Result};

pub(crate) struct SysMutex {
    raw: Box<UnsafeCell<CRITICAL_SECTION>>,
}

// Safety: the pointee never moves, and critical sections may be entered and
// left from any thread as long as enter/leave pairs stay on one thread,
// which every protocol in this library guarantees.
unsafe impl Send for SysMutex {}
unsafe impl Sync for SysMutex {}

impl SysMutex {
    pub fn new(attr: Option<&LockAttr>) -> Result<Self> {
        if let Some(attr) = attr {
            if attr.pshared() == ProcessShared::Shared {
                return Err(Error::NotSupported);
            }
        }
        let raw = Box::new(UnsafeCell::new(unsafe {
            MaybeUninit::<CRITICAL_SECTION>::zeroed().assume_init()
        }));
        unsafe { InitializeCriticalSection(raw.get()) };
        Ok(Self { raw })
    }

    pub fn lock(&self) -> Result {
        unsafe { EnterCriticalSection(self.raw.get()) };
        Ok(())
    }

    pub fn try_lock(&self) -> Result<bool> {
        Ok(unsafe { TryEnterCriticalSection(self.raw.get()) } != 0)
    }

    pub fn unlock(&self) {
        unsafe { LeaveCriticalSection(self.raw.get()) };
    }
}

impl Drop for SysMutex {
    fn drop(&mut self) {
        unsafe { DeleteCriticalSection(self.raw.get()) };
    }
}
