//! Creation attributes for the primitives in this crate.
//!
//! Every primitive accepts an optional [`LockAttr`] describing how its
//! underlying OS mutexes are to be created; the read-write lock additionally
//! accepts an [`RwLockAttr`] carrying the writer wait-channel count. The
//! attribute bundles are plain data — the platform objects are built from
//! them at primitive creation time.

use crate::Result;

/// Process scope of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessShared {
    /// The primitive is private to the creating process.
    #[default]
    Private,
    /// The primitive may be placed in a shared memory section and operated
    /// from several processes. All participating objects (items, workers,
    /// waiters) must reside in the same shared section.
    Shared,
}

/// Priority protocol applied to the underlying mutexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockProtocol {
    /// No priority adjustment (`PTHREAD_PRIO_NONE`).
    #[default]
    None,
    /// Priority inheritance (`PTHREAD_PRIO_INHERIT`). This is the protocol
    /// the library is designed around: a thread blocked in any of the waits
    /// implemented here donates its priority to the thread that will signal
    /// it.
    Inherit,
    /// Priority ceiling (`PTHREAD_PRIO_PROTECT`).
    Protect,
}

/// Attributes for creating mutex-backed primitives.
#[derive(Debug, Clone, Default)]
pub struct LockAttr {
    pshared: ProcessShared,
    protocol: LockProtocol,
    prioceiling: Option<i32>,
}

impl LockAttr {
    /// Create an attribute bundle with the platform defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the process scope.
    pub fn set_pshared(&mut self, pshared: ProcessShared) -> Result {
        #[cfg(windows)]
        if pshared == ProcessShared::Shared {
            return Err(crate::Error::NotSupported);
        }
        self.pshared = pshared;
        Ok(())
    }

    /// The configured process scope.
    pub fn pshared(&self) -> ProcessShared {
        self.pshared
    }

    /// Set the priority protocol.
    pub fn set_protocol(&mut self, protocol: LockProtocol) -> Result {
        #[cfg(windows)]
        if protocol != LockProtocol::None {
            return Err(crate::Error::NotSupported);
        }
        self.protocol = protocol;
        Ok(())
    }

    /// The configured priority protocol, or [`NotSupported`] where the
    /// platform has no notion of lock priority protocols.
    ///
    /// [`NotSupported`]: crate::Error::NotSupported
    pub fn protocol(&self) -> Result<LockProtocol> {
        #[cfg(windows)]
        return Err(crate::Error::NotSupported);
        #[cfg(not(windows))]
        Ok(self.protocol)
    }

    /// Set the priority ceiling used with [`LockProtocol::Protect`].
    ///
    /// The value is validated by the operating system when a primitive is
    /// created from this bundle; an out-of-range ceiling surfaces there as
    /// [`InvalidValue`].
    ///
    /// [`InvalidValue`]: crate::Error::InvalidValue
    pub fn set_prioceiling(&mut self, prioceiling: i32) -> Result {
        #[cfg(windows)]
        {
            let _ = prioceiling;
            return Err(crate::Error::NotSupported);
        }
        #[cfg(not(windows))]
        {
            self.prioceiling = Some(prioceiling);
            Ok(())
        }
    }

    /// The configured priority ceiling, if one was set.
    pub fn prioceiling(&self) -> Result<Option<i32>> {
        #[cfg(windows)]
        return Err(crate::Error::NotSupported);
        #[cfg(not(windows))]
        Ok(self.prioceiling)
    }
}

/// Attributes for creating [`RwLock`](crate::RwLock) and
/// [`TrdlRwLock`](crate::TrdlRwLock) objects.
#[derive(Debug, Clone, Default)]
pub struct RwLockAttr {
    lock: LockAttr,
    write_channels: u32,
}

/// The largest supported writer wait-channel count.
pub const MAX_WRITE_CHANNELS: u32 = 4;

impl RwLockAttr {
    /// Create an attribute bundle with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Access the embedded mutex attributes.
    pub fn lock_attr(&self) -> &LockAttr {
        &self.lock
    }

    /// Access the embedded mutex attributes for modification.
    pub fn lock_attr_mut(&mut self) -> &mut LockAttr {
        &mut self.lock
    }

    /// Set the number of independent channels blocked writers are spread
    /// over while they wait for readers to drain.
    ///
    /// `0` selects the default of a single channel. Other values round up to
    /// the next supported count (1, 2, or 4) and are capped at
    /// [`MAX_WRITE_CHANNELS`]. More channels let that many writers wait for
    /// readers on distinct mutexes, spreading the priority-inheritance load,
    /// at the cost of extra kernel objects.
    pub fn set_write_channels(&mut self, count: u32) -> Result {
        self.write_channels = count;
        Ok(())
    }

    /// The configured (raw) writer channel count.
    pub fn write_channels(&self) -> u32 {
        self.write_channels
    }

    /// The channel count a lock created from this bundle will actually use.
    pub(crate) fn effective_write_channels(&self) -> usize {
        match self.write_channels {
            0 | 1 => 1,
            2 => 2,
            _ => MAX_WRITE_CHANNELS as usize,
        }
    }
}
