//! Internal helpers: the fatal-check machinery.
use std::sync::atomic::{AtomicIsize, Ordering};

/// The diagnostic value recorded by the most recent failed fatal check.
///
/// When the library detects a condition it cannot recover from without
/// corrupting a primitive's internal state (for example, an OS mutex release
/// reporting an error in the middle of a signaling protocol), it stores a
/// diagnostic value here, logs the failure, and aborts the process. The
/// variable exists solely for post-mortem inspection from a debugger or a
/// crash handler; it is not a coordination channel.
static FAILED_CHECK_STATUS: AtomicIsize = AtomicIsize::new(0);

/// Read the diagnostic value stored by the most recent failed fatal check.
pub fn failed_check_status() -> isize {
    FAILED_CHECK_STATUS.load(Ordering::Relaxed)
}

/// Record `status`, log `what`, and abort.
#[cold]
pub(crate) fn fail_check(status: isize, what: &str) -> ! {
    FAILED_CHECK_STATUS.store(status, Ordering::Relaxed);
    log::error!("fatal check failed ({status}): {what}");
    std::process::abort();
}

/// Abort the process unless `$cond` holds, recording `$status` for
/// post-mortem inspection.
macro_rules! fatal_check {
    ($status:expr, $cond:expr, $what:expr) => {
        if !$cond {
            $crate::utils::fail_check(($status) as isize, $what);
        }
    };
}
pub(crate) use fatal_check;

/// Unwrap an OS-layer result that must not fail at this point of a protocol.
///
/// A failure here means an earlier acquisition succeeded but the matching
/// state transition cannot complete; rolling back is impossible, so the
/// process is aborted with the OS code recorded.
pub(crate) fn fatal_unwrap<T>(result: crate::Result<T>, what: &str) -> T {
    match result {
        Ok(x) => x,
        Err(e) => fail_check(e.to_raw_os_isize(), what),
    }
}

impl crate::Error {
    #[cfg(unix)]
    pub(crate) fn to_raw_os_isize(self) -> isize {
        self.to_raw_os() as isize
    }

    #[cfg(not(unix))]
    pub(crate) fn to_raw_os_isize(self) -> isize {
        match self {
            Self::Os(code) => code as isize,
            _ => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn status_starts_clear() {
        assert_eq!(super::failed_check_status(), 0);
    }
}
