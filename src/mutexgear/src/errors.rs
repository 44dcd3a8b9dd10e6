//! The error type shared by all fallible operations in this crate.
use core::fmt;

/// An error returned by a synchronization operation.
///
/// Recoverable failures map onto the conventional POSIX error-code taxonomy:
/// a try-operation that would block or a teardown of an in-use object is
/// [`Busy`](Self::Busy), a rejected attribute value is
/// [`InvalidValue`](Self::InvalidValue), a kernel-object allocation failure is
/// [`OutOfMemory`](Self::OutOfMemory), and anything else the operating system
/// reports is carried verbatim as [`Os`](Self::Os).
///
/// Failures that would leave a primitive's internal invariants broken (for
/// example, a mutex release reporting an error mid-protocol) are *not*
/// represented here; they abort the process through the fatal-check path (see
/// [`failed_check_status`](crate::failed_check_status)).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The operation would block, or the object is still in use (`EBUSY`).
    Busy,
    /// A parameter or attribute value is invalid (`EINVAL`).
    InvalidValue,
    /// A kernel object could not be allocated (`ENOMEM`).
    OutOfMemory,
    /// The platform does not support the requested feature.
    NotSupported,
    /// Any other error code reported by the operating system.
    Os(i32),
}

impl Error {
    /// Get the short name of the error.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Busy => "Busy",
            Self::InvalidValue => "InvalidValue",
            Self::OutOfMemory => "OutOfMemory",
            Self::NotSupported => "NotSupported",
            Self::Os(_) => "Os",
        }
    }

    /// Construct an `Error` from a raw OS error code, folding the codes with
    /// dedicated variants back onto them.
    #[cfg(unix)]
    pub fn from_raw_os(code: i32) -> Self {
        match code {
            libc::EBUSY => Self::Busy,
            libc::EINVAL => Self::InvalidValue,
            libc::ENOMEM | libc::EAGAIN => Self::OutOfMemory,
            code => Self::Os(code),
        }
    }

    #[cfg(not(unix))]
    pub fn from_raw_os(code: i32) -> Self {
        Self::Os(code)
    }

    /// The raw OS error code this error corresponds to.
    #[cfg(unix)]
    pub fn to_raw_os(self) -> i32 {
        match self {
            Self::Busy => libc::EBUSY,
            Self::InvalidValue => libc::EINVAL,
            Self::OutOfMemory => libc::ENOMEM,
            Self::NotSupported => libc::ENOTSUP,
            Self::Os(code) => code,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os(code) => f.debug_tuple("Os").field(code).finish(),
            other => f.write_str(other.as_str()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => f.write_str("object is busy or operation would block"),
            Self::InvalidValue => f.write_str("invalid parameter or attribute value"),
            Self::OutOfMemory => f.write_str("kernel object allocation failed"),
            Self::NotSupported => f.write_str("not supported on this platform"),
            Self::Os(code) => write!(f, "operating system error {code}"),
        }
    }
}

impl std::error::Error for Error {}

/// The result type of the fallible operations in this crate.
pub type Result<T = ()> = core::result::Result<T, Error>;
