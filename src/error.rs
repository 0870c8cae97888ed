//! Unified error taxonomy for job outcomes.
//!
//! Every failed job carries one [`Error`]: a kind drawn from a closed set, a
//! human-readable message, and an optional nested cause. Backends map their
//! native failure codes (errno for the local backend, SFTP status codes for
//! the sftp backend) onto the same set, so clients see uniform errors no
//! matter which transport served the request.

use std::error;
use std::fmt;
use std::io;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

/// The closed set of error kinds a job outcome can carry.
///
/// The discriminants are stable: they are written into reply frames as the
/// error code and must not be renumbered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum ErrorKind {
    /// Cooperative cancellation was observed.
    Cancelled = 1,
    /// A deadline expired (login, read).
    TimedOut = 2,
    /// Authentication failed, the user aborted, or the remote refused.
    PermissionDenied = 3,
    /// The operation is absent on the backend, or an argument names an
    /// unsupported mode (e.g. an unknown seek whence).
    NotSupported = 4,
    /// A required input was missing or malformed (mount-spec key, path).
    InvalidArgument = 5,
    /// Transport fault, unexpected EOF, or framing violation.
    Io = 6,
    /// The target does not exist.
    NotFound = 7,
    /// The target already exists.
    Exists = 8,
    /// The target is a directory where a file was expected.
    IsDirectory = 9,
    /// The target is not a directory where one was expected.
    NotDirectory = 10,
    /// The storage target is out of space.
    NoSpace = 11,
    /// Last-resort catch-all; the message must be informative.
    Failed = 0,
}

impl ErrorKind {
    /// Short identifier used in `Display` output and reply frames.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TimedOut => "timed-out",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::NotSupported => "not-supported",
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::Io => "io",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Exists => "exists",
            ErrorKind::IsDirectory => "is-directory",
            ErrorKind::NotDirectory => "not-directory",
            ErrorKind::NoSpace => "no-space",
            ErrorKind::Failed => "failed",
        }
    }
}

/// Error value carried by a failed job outcome.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    cause: Option<Box<dyn error::Error + Send + Sync>>,
}

impl Error {
    /// Create an error of the given kind with a message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach a nested cause.
    pub fn with_cause(
        mut self,
        cause: impl Into<Box<dyn error::Error + Send + Sync>>,
    ) -> Error {
        self.cause = Some(cause.into());
        self
    }

    /// The canonical cancellation error.
    pub fn cancelled() -> Error {
        Error::new(ErrorKind::Cancelled, "Operation was cancelled")
    }

    /// An operation the backend does not advertise.
    pub fn not_supported() -> Error {
        Error::new(ErrorKind::NotSupported, "Operation not supported by backend")
    }

    /// Map an OS errno to the unified taxonomy.
    ///
    /// EINTR never reaches this function; callers retry it locally.
    pub fn from_errno(errno: i32, context: &str) -> Error {
        let kind = match errno {
            libc::ENOENT => ErrorKind::NotFound,
            libc::EEXIST => ErrorKind::Exists,
            libc::EISDIR => ErrorKind::IsDirectory,
            libc::ENOTDIR => ErrorKind::NotDirectory,
            libc::ENOSPC => ErrorKind::NoSpace,
            libc::EACCES | libc::EPERM => ErrorKind::PermissionDenied,
            libc::EINVAL => ErrorKind::InvalidArgument,
            libc::ETIMEDOUT => ErrorKind::TimedOut,
            libc::ECANCELED => ErrorKind::Cancelled,
            libc::ENOTSUP => ErrorKind::NotSupported,
            _ => ErrorKind::Io,
        };
        let os = io::Error::from_raw_os_error(errno);
        Error::new(kind, format!("{context}: {os}"))
    }

    /// The error's kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The error's message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(errno) => Error::from_errno(errno, "I/O error"),
            None => Error::new(ErrorKind::Io, err.to_string()).with_cause(err),
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Error {
        Error::from_errno(errno as i32, "I/O error")
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(
            Error::from_errno(libc::ENOENT, "open").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            Error::from_errno(libc::EEXIST, "mkdir").kind(),
            ErrorKind::Exists
        );
        assert_eq!(
            Error::from_errno(libc::EBADF, "read").kind(),
            ErrorKind::Io
        );
        let err = Error::from_errno(libc::EBADF, "Error reading from file");
        assert!(err.message().starts_with("Error reading from file: "));
    }

    #[test]
    fn wire_codes_round_trip() {
        for kind in [
            ErrorKind::Cancelled,
            ErrorKind::TimedOut,
            ErrorKind::PermissionDenied,
            ErrorKind::NotSupported,
            ErrorKind::InvalidArgument,
            ErrorKind::Io,
            ErrorKind::NotFound,
            ErrorKind::Exists,
            ErrorKind::IsDirectory,
            ErrorKind::NotDirectory,
            ErrorKind::NoSpace,
            ErrorKind::Failed,
        ] {
            let code: i32 = kind.into();
            assert_eq!(ErrorKind::try_from(code).unwrap(), kind);
        }
    }
}
