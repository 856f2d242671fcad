// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Error taxonomy for the VFS core.
//!
//! Every operation surfaces failures as a [`VfsError`]; the syscall layer maps
//! them onto the emulated kernel ABI with [`VfsError::errno`] and
//! [`VfsError::neg_errno`]. Backends may pass a raw [`Errno`] through with
//! [`VfsError::Errno`].

use nix::errno::Errno;
use thiserror::Error;

/// Result type returned by all VFS operations.
pub type Result<T> = std::result::Result<T, VfsError>;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("file exists: {0}")]
    AlreadyExists(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("cross-device rename from {old} to {new}")]
    CrossDevice { old: String, new: String },

    #[error("permission denied: {0}")]
    AccessDenied(String),

    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    /// The backend does not implement the named operation.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("no filesystem type named {0:?}")]
    NoSuchDevice(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("too many levels of symbolic links: {0}")]
    TooManyLinks(String),

    #[error("resource temporarily unavailable")]
    WouldBlock,

    /// Raw error reported by a backend.
    #[error("backend error: {0}")]
    Errno(Errno),
}

impl VfsError {
    /// The errno equivalent of this error, for the emulated syscall ABI.
    pub fn errno(&self) -> Errno {
        match self {
            VfsError::InvalidArgument(_) => Errno::EINVAL,
            VfsError::NotFound(_) => Errno::ENOENT,
            VfsError::AlreadyExists(_) => Errno::EEXIST,
            VfsError::IsDirectory(_) => Errno::EISDIR,
            VfsError::NotDirectory(_) => Errno::ENOTDIR,
            VfsError::NotEmpty(_) => Errno::ENOTEMPTY,
            VfsError::CrossDevice { .. } => Errno::EXDEV,
            VfsError::AccessDenied(_) => Errno::EACCES,
            VfsError::NotPermitted(_) => Errno::EPERM,
            VfsError::NotSupported(_) => Errno::ENOSYS,
            VfsError::NoSuchDevice(_) => Errno::ENODEV,
            VfsError::NameTooLong(_) => Errno::ENAMETOOLONG,
            VfsError::TooManyLinks(_) => Errno::ELOOP,
            VfsError::WouldBlock => Errno::EAGAIN,
            VfsError::Errno(e) => *e,
        }
    }

    /// Negated errno, the return convention of the emulated kernel ABI.
    pub fn neg_errno(&self) -> i32 {
        -(self.errno() as i32)
    }

    /// True if the error means "the backend has no such operation", which the
    /// mutation syscalls translate into their documented fallbacks.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, VfsError::NotSupported(_))
    }
}
