// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Per-process filesystem view: root, working directory, umask.

use std::sync::Mutex;

use crate::dcache::DentryId;

struct ProcessFsState {
    root: Option<DentryId>,
    cwd: Option<DentryId>,
    umask: u32,
}

/// The mutable filesystem context of the process, behind its own lock.
/// Acquired after the dentry cache lock when both are needed.
pub struct ProcessFs {
    inner: Mutex<ProcessFsState>,
}

impl Default for ProcessFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessFs {
    pub fn new() -> Self {
        ProcessFs {
            inner: Mutex::new(ProcessFsState {
                root: None,
                cwd: None,
                umask: 0o022,
            }),
        }
    }

    pub fn root(&self) -> Option<DentryId> {
        self.inner.lock().unwrap().root
    }

    pub fn cwd(&self) -> Option<DentryId> {
        self.inner.lock().unwrap().cwd
    }

    pub fn umask(&self) -> u32 {
        self.inner.lock().unwrap().umask
    }

    /// Replace the process root, returning the previous one so the caller
    /// can release its reference.
    pub fn set_root(&self, root: DentryId) -> Option<DentryId> {
        let mut state = self.inner.lock().unwrap();
        state.root.replace(root)
    }

    /// Replace the working directory, returning the previous one.
    pub fn set_cwd(&self, cwd: DentryId) -> Option<DentryId> {
        let mut state = self.inner.lock().unwrap();
        state.cwd.replace(cwd)
    }

    /// Set the file-creation mask to `mask & 0o777`, returning the old mask.
    pub fn set_umask(&self, mask: u32) -> u32 {
        let mut state = self.inner.lock().unwrap();
        let old = state.umask;
        state.umask = mask & 0o777;
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcache::Dcache;

    #[test]
    fn test_defaults() {
        let p = ProcessFs::new();
        assert!(p.root().is_none());
        assert!(p.cwd().is_none());
        assert_eq!(p.umask(), 0o022);
    }

    #[test]
    fn test_umask_is_masked_and_returned() {
        let p = ProcessFs::new();
        let old = p.set_umask(0o1777);
        assert_eq!(old, 0o022);
        assert_eq!(p.umask(), 0o777);
        assert_eq!(p.set_umask(0), 0o777);
        assert_eq!(p.umask(), 0);
    }

    #[test]
    fn test_root_and_cwd_replacement() {
        let cache = Dcache::new();
        let root = cache.lock().root();
        let p = ProcessFs::new();
        assert!(p.set_root(root).is_none());
        assert_eq!(p.set_root(root), Some(root));
        assert!(p.set_cwd(root).is_none());
        assert_eq!(p.cwd(), Some(root));
    }
}
