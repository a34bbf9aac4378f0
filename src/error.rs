//! Crate-wide error taxonomy.
//!
//! Errors are kinds, not payload-rich types: callers on the filesystem side
//! ultimately need a POSIX errno, so every variant maps onto one via
//! [`FsError::errno`].

use thiserror::Error;

use crate::store::StoreError;

/// Result alias used throughout the filesystem layer.
pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file, directory, or bucket")]
    NotFound,

    #[error("entry already exists")]
    AlreadyExists,

    #[error("operation not permitted")]
    PermissionDenied,

    #[error("invalid argument")]
    InvalidArgument,

    /// Path depth would exceed [`crate::fs::handle::MAX_DEPTH`].
    #[error("path too deep")]
    PathTooDeep,

    /// Every LRU lane is at its watermark and nothing can be reclaimed.
    #[error("handle cache exhausted")]
    OutOfHandles,

    #[error("payload exceeds the maximum put size")]
    TooLarge,

    #[error("user account is suspended")]
    UserSuspended,

    /// A file operation was applied to a directory handle.
    #[error("handle is a directory")]
    IsDirectory,

    /// A directory operation was applied to a file handle.
    #[error("handle is not a directory")]
    NotDirectory,

    /// The session has no preallocated inode numbers left.
    #[error("inode preallocation pool is empty")]
    NoPrealloc,

    #[error("backend error: {0}")]
    Backend(#[from] StoreError),
}

impl FsError {
    /// POSIX errno for this error kind.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::AlreadyExists => libc::EEXIST,
            Self::PermissionDenied => libc::EPERM,
            Self::InvalidArgument => libc::EINVAL,
            Self::PathTooDeep => libc::ENAMETOOLONG,
            Self::OutOfHandles | Self::NoPrealloc => libc::ENOSPC,
            Self::TooLarge => libc::EFBIG,
            Self::UserSuspended => libc::EACCES,
            Self::IsDirectory => libc::EISDIR,
            Self::NotDirectory => libc::ENOTDIR,
            Self::Backend(StoreError::NotFound) => libc::ENOENT,
            Self::Backend(StoreError::AccessDenied) => libc::EACCES,
            Self::Backend(StoreError::NotEmpty) => libc::ENOTEMPTY,
            Self::Backend(_) => libc::EIO,
        }
    }
}

impl From<FsError> for i32 {
    fn from(e: FsError) -> Self {
        e.errno()
    }
}
