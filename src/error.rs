use std::path::PathBuf;

use crate::hash::Hash;

/// error type for mirage operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("object not found: {0}")]
    ObjectNotFound(Hash),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt object: hash mismatch for {0}")]
    Corrupt(Hash),

    #[error("malformed object: {0}")]
    MalformedObject(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// translate a POSIX errno from a kernel-facing operation
    pub fn from_errno(errno: i32, context: &str) -> Self {
        match errno {
            errnos::EINVAL => Error::InvalidArgument(context.to_string()),
            errnos::EACCES | errnos::EROFS => Error::PermissionDenied(context.to_string()),
            errnos::ENOENT => Error::NotFound(context.to_string()),
            errnos::EEXIST => Error::AlreadyExists(context.to_string()),
            errnos::ERANGE => Error::OutOfRange(context.to_string()),
            _ => Error::Io {
                path: PathBuf::from(context),
                source: std::io::Error::from_raw_os_error(errno),
            },
        }
    }

    /// errno value to report back over kernel-facing surfaces
    pub fn as_errno(&self) -> i32 {
        match self {
            Error::NotFound(_) | Error::ObjectNotFound(_) => errnos::ENOENT,
            Error::AlreadyExists(_) => errnos::EEXIST,
            Error::InvalidArgument(_) | Error::MalformedObject(_) => errnos::EINVAL,
            Error::PermissionDenied(_) => errnos::EACCES,
            Error::OutOfRange(_) => errnos::ERANGE,
            Error::Cancelled => errnos::EINTR,
            Error::Unsupported(_) => errnos::ENOTSUP,
            Error::Io { source, .. } => source.raw_os_error().unwrap_or(errnos::EIO),
            Error::Corrupt(_) | Error::Internal(_) => errnos::EIO,
        }
    }
}

mod errnos {
    pub const EINVAL: i32 = 22;
    pub const EACCES: i32 = 13;
    pub const EROFS: i32 = 30;
    pub const ENOENT: i32 = 2;
    pub const EEXIST: i32 = 17;
    pub const ERANGE: i32 = 34;
    pub const EINTR: i32 = 4;
    pub const ENOTSUP: i32 = 95;
    pub const EIO: i32 = 5;
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
