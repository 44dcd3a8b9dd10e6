//! The OS blocking-mutex layer.
//!
//! Everything above this module blocks exclusively by acquiring one of these
//! mutexes, so a blocked thread is always attributable to the current holder
//! for the OS priority-inheritance machinery. No platform vocabulary escapes
//! this module.

#[cfg(unix)]
#[path = "unix.rs"]
mod imp;
#[cfg(windows)]
#[path = "windows.rs"]
mod imp;

pub(crate) use imp::SysMutex;

#[cfg(test)]
mod tests {
    use super::SysMutex;
    use crate::attrs::LockAttr;

    #[test]
    fn lock_cycle() {
        let m = SysMutex::new(None).unwrap();
        m.lock().unwrap();
        m.unlock();
        assert!(m.try_lock().unwrap());
        m.unlock();
    }

    #[test]
    fn try_lock_contended() {
        let m = std::sync::Arc::new(SysMutex::new(Some(&LockAttr::new())).unwrap());
        m.lock().unwrap();
        let m2 = std::sync::Arc::clone(&m);
        std::thread::spawn(move || {
            assert!(!m2.try_lock().unwrap());
        })
        .join()
        .unwrap();
        m.unlock();
    }

    #[cfg(unix)]
    #[test]
    fn priority_inheritance_attr() {
        use crate::attrs::LockProtocol;
        let mut attr = LockAttr::new();
        attr.set_protocol(LockProtocol::Inherit).unwrap();
        // Not every platform accepts the protocol; creation must either
        // succeed or report a clean error.
        if let Ok(m) = SysMutex::new(Some(&attr)) {
            m.lock().unwrap();
            m.unlock();
        }
    }
}
