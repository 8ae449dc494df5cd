//! Error model: an abstract kind plus an optional exact errno payload.
//!
//! Grounded in `status.h`/`status.cc`/`fuse.cc`'s `StatusCodeToErrno`. Every
//! syscall failure is wrapped with the errno it actually failed with (kept
//! as the `errno` payload) *and* classified into one of the kinds below via
//! the standard mapping, so a reply can always recover the original errno
//! even though kinds are coarser than errno.

use std::fmt;

/// Coarse-grained failure classification, isomorphic to the table in
/// spec section 4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Ok,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    OutOfRange,
    FailedPrecondition,
    ResourceExhausted,
    Cancelled,
    Aborted,
    Unimplemented,
    Unavailable,
    DataLoss,
    Internal,
    Unknown,
}

impl ErrorKind {
    /// The standard kind -> errno mapping (spec section 4.2).
    pub fn to_errno(self) -> i32 {
        match self {
            ErrorKind::Ok => 0,
            ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::DeadlineExceeded => libc::ETIMEDOUT,
            ErrorKind::NotFound => libc::ENOENT,
            ErrorKind::AlreadyExists => libc::EEXIST,
            ErrorKind::PermissionDenied => libc::EPERM,
            ErrorKind::OutOfRange => libc::ERANGE,
            ErrorKind::FailedPrecondition => libc::EBUSY,
            ErrorKind::ResourceExhausted => libc::ENOSPC,
            ErrorKind::Cancelled => libc::ECANCELED,
            ErrorKind::Aborted => libc::EDEADLK,
            ErrorKind::Unimplemented => libc::ENOSYS,
            ErrorKind::Unavailable => libc::EAGAIN,
            ErrorKind::DataLoss => libc::ENOTRECOVERABLE,
            ErrorKind::Internal => libc::ELIBBAD,
            ErrorKind::Unknown => libc::EPROTO,
        }
    }

    /// Best-effort reverse of [`to_errno`](Self::to_errno), used when
    /// classifying a raw syscall failure. Not bijective -- several errnos
    /// (e.g. `EACCES`) collapse onto the same kind as a more specific one.
    fn from_errno(errno: i32) -> ErrorKind {
        match errno {
            0 => ErrorKind::Ok,
            libc::EINVAL => ErrorKind::InvalidArgument,
            libc::ETIMEDOUT => ErrorKind::DeadlineExceeded,
            libc::ENOENT => ErrorKind::NotFound,
            libc::EEXIST => ErrorKind::AlreadyExists,
            libc::EPERM | libc::EACCES => ErrorKind::PermissionDenied,
            libc::ERANGE => ErrorKind::OutOfRange,
            libc::EBUSY => ErrorKind::FailedPrecondition,
            libc::ENOSPC => ErrorKind::ResourceExhausted,
            libc::ECANCELED => ErrorKind::Cancelled,
            libc::EDEADLK => ErrorKind::Aborted,
            libc::ENOSYS => ErrorKind::Unimplemented,
            libc::EAGAIN => ErrorKind::Unavailable,
            libc::ENOTRECOVERABLE => ErrorKind::DataLoss,
            libc::ELIBBAD => ErrorKind::Internal,
            _ => ErrorKind::Unknown,
        }
    }
}

/// An operation failure: a classification, the exact errno it originated
/// from (when known), and a context string naming the failing syscall.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    errno: Option<i32>,
    context: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            errno: None,
            context: context.into(),
        }
    }

    /// Wraps a syscall failure. `errno` is preserved exactly as the payload;
    /// `kind` is a best-effort classification of it.
    pub fn from_errno(errno: i32, context: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_errno(errno),
            errno: Some(errno),
            context: context.into(),
        }
    }

    /// Wraps the calling thread's current `errno`.
    pub fn last_os_error(context: impl Into<String>) -> Self {
        Self::from_errno(
            std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
            context,
        )
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The errno to reply to the kernel with: the exact originating errno
    /// if we have one, otherwise the kind's standard mapping.
    pub fn errno(&self) -> i32 {
        self.errno.unwrap_or_else(|| self.kind.to_errno())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errno {
            Some(errno) => write!(f, "{}: {} ({})", self.context, errno_name(errno), errno),
            None => write!(f, "{}: {:?}", self.context, self.kind),
        }
    }
}

impl std::error::Error for Error {}

/// Symbolic errno name, falling back to `UNKNOWN (<n>)` for anything not in
/// the table below. Grounded in `errno.cc`'s `ErrnoToErrorName`.
pub fn errno_name(errno: i32) -> String {
    if errno == 0 {
        return "OK".to_string();
    }
    match errno {
        libc::EINVAL => "EINVAL",
        libc::ENAMETOOLONG => "ENAMETOOLONG",
        libc::E2BIG => "E2BIG",
        libc::EDOM => "EDOM",
        libc::EFAULT => "EFAULT",
        libc::EILSEQ => "EILSEQ",
        libc::ENOPROTOOPT => "ENOPROTOOPT",
        libc::ENOTSOCK => "ENOTSOCK",
        libc::ENOTTY => "ENOTTY",
        libc::EPROTOTYPE => "EPROTOTYPE",
        libc::ESPIPE => "ESPIPE",
        libc::ETIMEDOUT => "ETIMEDOUT",
        libc::ETIME => "ETIME",
        libc::ENODEV => "ENODEV",
        libc::ENOENT => "ENOENT",
        libc::ENXIO => "ENXIO",
        libc::ESRCH => "ESRCH",
        libc::EEXIST => "EEXIST",
        libc::EADDRNOTAVAIL => "EADDRNOTAVAIL",
        libc::EALREADY => "EALREADY",
        libc::EPERM => "EPERM",
        libc::EACCES => "EACCES",
        libc::EROFS => "EROFS",
        libc::ENOTEMPTY => "ENOTEMPTY",
        libc::EISDIR => "EISDIR",
        libc::ENOTDIR => "ENOTDIR",
        libc::EADDRINUSE => "EADDRINUSE",
        libc::EBADF => "EBADF",
        libc::EBUSY => "EBUSY",
        libc::ECHILD => "ECHILD",
        libc::EISCONN => "EISCONN",
        libc::ENOTCONN => "ENOTCONN",
        libc::EPIPE => "EPIPE",
        libc::ETXTBSY => "ETXTBSY",
        libc::ENOSPC => "ENOSPC",
        libc::EMFILE => "EMFILE",
        libc::EMLINK => "EMLINK",
        libc::ENFILE => "ENFILE",
        libc::ENOBUFS => "ENOBUFS",
        libc::ENODATA => "ENODATA",
        libc::ENOMEM => "ENOMEM",
        libc::ENOSR => "ENOSR",
        libc::EFBIG => "EFBIG",
        libc::EOVERFLOW => "EOVERFLOW",
        libc::ERANGE => "ERANGE",
        libc::ENOSYS => "ENOSYS",
        libc::ENOTSUP => "ENOTSUP",
        libc::EAFNOSUPPORT => "EAFNOSUPPORT",
        libc::EPROTONOSUPPORT => "EPROTONOSUPPORT",
        libc::EXDEV => "EXDEV",
        libc::EAGAIN => "EAGAIN",
        libc::ECONNREFUSED => "ECONNREFUSED",
        libc::ECONNABORTED => "ECONNABORTED",
        libc::ECONNRESET => "ECONNRESET",
        libc::EINTR => "EINTR",
        libc::EHOSTUNREACH => "EHOSTUNREACH",
        libc::ENETDOWN => "ENETDOWN",
        libc::ENETRESET => "ENETRESET",
        libc::ENETUNREACH => "ENETUNREACH",
        libc::ENOLCK => "ENOLCK",
        libc::ENOLINK => "ENOLINK",
        libc::EDEADLK => "EDEADLK",
        libc::ESTALE => "ESTALE",
        libc::ECANCELED => "ECANCELED",
        libc::ENOTRECOVERABLE => "ENOTRECOVERABLE",
        libc::ELIBBAD => "ELIBBAD",
        libc::EPROTO => "EPROTO",
        libc::ECOMM => "ECOMM",
        _ => return format!("UNKNOWN ({errno})"),
    }
    .to_string()
}

/// Inverse of [`errno_name`].
pub fn errno_from_name(name: &str) -> Option<i32> {
    if name == "OK" {
        return Some(0);
    }
    if let Some(inner) = name.strip_prefix("UNKNOWN (").and_then(|s| s.strip_suffix(')')) {
        return inner.parse().ok();
    }
    // Round-trip by re-deriving from the forward table: cheap given its size,
    // and keeps a single source of truth instead of a second, driftable list.
    (1..200).find(|&errno| errno_name(errno) == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_errno_mapping_matches_table() {
        assert_eq!(ErrorKind::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(ErrorKind::FailedPrecondition.to_errno(), libc::EBUSY);
        assert_eq!(ErrorKind::Unknown.to_errno(), libc::EPROTO);
        assert_eq!(ErrorKind::Ok.to_errno(), 0);
    }

    #[test]
    fn errno_name_round_trips() {
        assert_eq!(errno_name(libc::ENOENT), "ENOENT");
        assert_eq!(errno_from_name("ENOENT"), Some(libc::ENOENT));
        assert_eq!(errno_name(0), "OK");
        assert_eq!(errno_from_name("OK"), Some(0));
    }

    #[test]
    fn unknown_errno_round_trips_via_placeholder() {
        let weird = 9999;
        let name = errno_name(weird);
        assert_eq!(name, "UNKNOWN (9999)");
        assert_eq!(errno_from_name(&name), Some(weird));
    }

    #[test]
    fn payload_errno_wins_over_kind_mapping() {
        // EACCES classifies as PermissionDenied, whose standard mapping is
        // EPERM -- but the exact originating errno must still come back.
        let err = Error::from_errno(libc::EACCES, "faccessat");
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(err.errno(), libc::EACCES);
    }
}
