// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Open handles: the object stream I/O and the copy engine operate on.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::dcache::DentryId;
use crate::error::{Result, VfsError};
use crate::fs::{FsType, StreamCaps, StreamOps};

bitflags! {
    /// Status flags of an open handle, mirroring the open(2) flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const APPEND = libc::O_APPEND as u32;
        const NONBLOCK = libc::O_NONBLOCK as u32;
    }
}

/// An open handle onto a backend stream.
///
/// The handle owns backend-private state in `data`; backends downcast it with
/// [`VfsHandle::data_as`]. Flags sit behind their own lock so the copy engine
/// can flip blocking mode without exclusive access to the handle.
pub struct VfsHandle {
    fs: Arc<FsType>,
    dentry: Option<DentryId>,
    path: String,
    flags: Mutex<OpenFlags>,
    data: Box<dyn Any + Send + Sync>,
}

impl VfsHandle {
    pub fn new(
        fs: Arc<FsType>,
        dentry: Option<DentryId>,
        path: &str,
        flags: OpenFlags,
        data: Box<dyn Any + Send + Sync>,
    ) -> Self {
        VfsHandle {
            fs,
            dentry,
            path: path.to_string(),
            flags: Mutex::new(flags),
            data,
        }
    }

    pub fn fs(&self) -> &Arc<FsType> {
        &self.fs
    }

    pub fn dentry(&self) -> Option<DentryId> {
        self.dentry
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn flags(&self) -> OpenFlags {
        *self.flags.lock().unwrap()
    }

    /// Set and clear flag bits in one step, returning the previous flags.
    pub fn update_flags(&self, set: OpenFlags, clear: OpenFlags) -> OpenFlags {
        let mut guard = self.flags.lock().unwrap();
        let old = *guard;
        guard.remove(clear);
        guard.insert(set);
        old
    }

    /// Backend-private state, downcast to the backend's own type.
    pub fn data_as<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    /// The stream operation table, or `AccessDenied` when the filesystem has
    /// none.
    pub fn stream_ops(&self) -> Result<&Arc<dyn StreamOps>> {
        self.fs
            .fs_ops()
            .ok_or_else(|| VfsError::AccessDenied(self.path.clone()))
    }

    pub fn stream_caps(&self) -> StreamCaps {
        self.fs.stream_caps()
    }
}
