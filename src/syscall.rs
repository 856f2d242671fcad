// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Mutation syscalls over the dentry cache.
//!
//! Each entry point resolves its paths and applies the change under one
//! cache guard, so the dentry it mutates cannot be invalidated in between.
//! Backends that lack the relevant capability get the documented local
//! fallback: deletions and mode changes are remembered in the cache with
//! the `PERSIST` bit instead of failing.

use std::io::SeekFrom;

use crate::copy::handle_copy;
use crate::dcache::{DcacheState, DentryId, DentryState};
use crate::error::{Result, VfsError};
use crate::fs::{DirCaps, FileType, StreamCaps};
use crate::handle::{OpenFlags, VfsHandle};
use crate::namei::{self, AccessMask, LookupFlags};
use crate::Vfs;

/// Remove a file, or a directory with `AT_REMOVEDIR`.
pub fn do_unlinkat(vfs: &Vfs, start: Option<DentryId>, path: &str, flags: i32) -> Result<()> {
    if flags & !libc::AT_REMOVEDIR != 0 {
        return Err(VfsError::InvalidArgument(format!(
            "unlinkat flags {:#x}",
            flags
        )));
    }
    let remove_dir = flags & libc::AT_REMOVEDIR != 0;

    let mut st = vfs.dcache().lock();
    let dent = namei::path_lookupat_locked(vfs, &mut st, start, path, LookupFlags::empty())?;
    let res = unlink_dent(vfs, &mut st, dent, remove_dir);
    st.put(dent);
    res
}

pub fn do_unlink(vfs: &Vfs, path: &str) -> Result<()> {
    do_unlinkat(vfs, None, path, 0)
}

pub fn do_rmdir(vfs: &Vfs, path: &str) -> Result<()> {
    let mut st = vfs.dcache().lock();
    let dent = namei::path_lookupat_locked(vfs, &mut st, None, path, LookupFlags::DIRECTORY)?;
    let res = unlink_dent(vfs, &mut st, dent, true);
    st.put(dent);
    res
}

fn unlink_dent(vfs: &Vfs, st: &mut DcacheState, dent: DentryId, remove_dir: bool) -> Result<()> {
    let (parent, is_dir, fs, mount) = {
        let node = st.node(dent);
        (node.parent, node.is_directory(), node.fs.clone(), node.mount)
    };
    if parent.is_none() {
        return Err(VfsError::AccessDenied(st.abs_path(dent)));
    }
    if remove_dir {
        if !is_dir {
            return Err(VfsError::NotDirectory(st.abs_path(dent)));
        }
    } else if is_dir {
        return Err(VfsError::IsDirectory(st.abs_path(dent)));
    }

    let supported = fs
        .as_ref()
        .map_or(false, |f| f.dir_caps().contains(DirCaps::UNLINK));
    if supported {
        if let Some(ops) = fs.as_ref().and_then(|f| f.d_ops()) {
            let rel = st.rel_path(dent);
            let data = mount.and_then(|m| vfs.mounts().data_of(m));
            ops.unlink(data.as_ref(), &rel, remove_dir)?;
        }
    } else {
        debug!(
            vfs.logger(),
            "unlink recorded in cache only";
            "path" => st.abs_path(dent)
        );
        st.node_mut(dent).state.insert(DentryState::PERSIST);
    }

    let node = st.node_mut(dent);
    if remove_dir {
        node.state.remove(DentryState::ISDIRECTORY);
    }
    node.state.insert(DentryState::NEGATIVE);
    Ok(())
}

/// Create a directory. The file-creation mask is applied to `mode` before
/// the backend sees it.
pub fn do_mkdirat(vfs: &Vfs, start: Option<DentryId>, path: &str, mode: u32) -> Result<()> {
    let perm = mode & !vfs.process().umask() & 0o777;

    let mut st = vfs.dcache().lock();
    let dent = namei::path_lookupat_locked(
        vfs,
        &mut st,
        start,
        path,
        LookupFlags::CREATE | LookupFlags::DIRECTORY,
    )?;
    let res = mkdir_dent(vfs, &mut st, dent, path, perm);
    st.put(dent);
    res
}

pub fn do_mkdir(vfs: &Vfs, path: &str, mode: u32) -> Result<()> {
    do_mkdirat(vfs, None, path, mode)
}

fn mkdir_dent(
    vfs: &Vfs,
    st: &mut DcacheState,
    dent: DentryId,
    path: &str,
    perm: u32,
) -> Result<()> {
    if !st.node(dent).is_negative() {
        return Err(VfsError::AlreadyExists(path.to_string()));
    }
    let parent = match st.node(dent).parent {
        Some(p) => p,
        None => return Err(VfsError::InvalidArgument(path.to_string())),
    };
    namei::check_permissions(st, parent, AccessMask::WRITE | AccessMask::EXEC)?;

    let (fs, mount) = {
        let node = st.node(dent);
        (node.fs.clone(), node.mount)
    };
    let fs = match fs {
        Some(f) if f.dir_caps().contains(DirCaps::MKDIR) => f,
        _ => return Err(VfsError::InvalidArgument(path.to_string())),
    };
    if let Some(ops) = fs.d_ops() {
        let rel = st.rel_path(dent);
        let data = mount.and_then(|m| vfs.mounts().data_of(m));
        ops.mkdir(data.as_ref(), &rel, perm)?;
    }

    let node = st.node_mut(dent);
    node.state.remove(DentryState::NEGATIVE);
    node.state.insert(DentryState::ISDIRECTORY);
    node.file_type = Some(FileType::Directory);
    node.perm = perm;
    Ok(())
}

/// Set the file-creation mask, returning the previous one.
pub fn do_umask(vfs: &Vfs, mask: u32) -> u32 {
    vfs.process().set_umask(mask)
}

/// Change permission bits of a node named by path.
pub fn do_fchmodat(vfs: &Vfs, start: Option<DentryId>, path: &str, mode: u32) -> Result<()> {
    let mode = mode & 0o7777;
    let mut st = vfs.dcache().lock();
    let dent = namei::path_lookupat_locked(vfs, &mut st, start, path, LookupFlags::FOLLOW)?;
    let res = chmod_dent(vfs, &mut st, dent, mode);
    st.put(dent);
    res
}

pub fn do_chmod(vfs: &Vfs, path: &str, mode: u32) -> Result<()> {
    do_fchmodat(vfs, None, path, mode)
}

/// Change permission bits through an open handle.
pub fn do_fchmod(vfs: &Vfs, h: &VfsHandle, mode: u32) -> Result<()> {
    let mode = mode & 0o7777;
    let dent = h
        .dentry()
        .ok_or_else(|| VfsError::InvalidArgument(h.path().to_string()))?;
    let mut st = vfs.dcache().lock();
    chmod_dent(vfs, &mut st, dent, mode)
}

fn chmod_dent(vfs: &Vfs, st: &mut DcacheState, dent: DentryId, mode: u32) -> Result<()> {
    let (fs, mount) = {
        let node = st.node(dent);
        (node.fs.clone(), node.mount)
    };
    let supported = fs
        .as_ref()
        .map_or(false, |f| f.dir_caps().contains(DirCaps::CHMOD));
    if supported {
        if let Some(ops) = fs.as_ref().and_then(|f| f.d_ops()) {
            let rel = st.rel_path(dent);
            let data = mount.and_then(|m| vfs.mounts().data_of(m));
            // On backend failure the cached mode stays untouched.
            ops.chmod(data.as_ref(), &rel, mode)?;
        }
    } else {
        debug!(
            vfs.logger(),
            "chmod recorded in cache only";
            "path" => st.abs_path(dent)
        );
        st.node_mut(dent).state.insert(DentryState::PERSIST);
    }
    st.node_mut(dent).perm = mode;
    Ok(())
}

/// Ownership is not tracked; changing it resolves the path and succeeds
/// without effect.
pub fn do_fchownat(
    vfs: &Vfs,
    start: Option<DentryId>,
    path: &str,
    _uid: u32,
    _gid: u32,
    _flags: i32,
) -> Result<()> {
    let mut st = vfs.dcache().lock();
    let dent = namei::path_lookupat_locked(vfs, &mut st, start, path, LookupFlags::FOLLOW)?;
    st.put(dent);
    Ok(())
}

pub fn do_chown(vfs: &Vfs, path: &str, uid: u32, gid: u32) -> Result<()> {
    do_fchownat(vfs, None, path, uid, gid, 0)
}

pub fn do_fchown(_vfs: &Vfs, _h: &VfsHandle, _uid: u32, _gid: u32) -> Result<()> {
    Ok(())
}

/// Rename within one mount.
pub fn do_renameat(
    vfs: &Vfs,
    old_start: Option<DentryId>,
    old_path: &str,
    new_start: Option<DentryId>,
    new_path: &str,
) -> Result<()> {
    let mut st = vfs.dcache().lock();
    let old = namei::path_lookupat_locked(vfs, &mut st, old_start, old_path, LookupFlags::empty())?;
    let new = match namei::path_lookupat_locked(
        vfs,
        &mut st,
        new_start,
        new_path,
        LookupFlags::CREATE,
    ) {
        Ok(n) => n,
        Err(e) => {
            st.put(old);
            return Err(e);
        }
    };
    debug_assert!(st.node(old).ref_count >= 2);
    debug_assert!(st.node(new).ref_count >= 2);

    let res = rename_dent(vfs, &mut st, old, new);
    st.put(new);
    st.put(old);
    res
}

pub fn do_rename(vfs: &Vfs, old_path: &str, new_path: &str) -> Result<()> {
    do_renameat(vfs, None, old_path, None, new_path)
}

fn rename_dent(vfs: &Vfs, st: &mut DcacheState, old: DentryId, new: DentryId) -> Result<()> {
    let (old_mount, old_fs, old_is_dir) = {
        let node = st.node(old);
        (node.mount, node.fs.clone(), node.is_directory())
    };
    let (new_mount, new_negative, new_is_dir) = {
        let node = st.node(new);
        (node.mount, node.is_negative(), node.is_directory())
    };

    if old_mount != new_mount {
        return Err(VfsError::CrossDevice {
            old: st.abs_path(old),
            new: st.abs_path(new),
        });
    }
    let fs = match old_fs {
        Some(f) if f.dir_caps().contains(DirCaps::RENAME) => f,
        _ => return Err(VfsError::NotPermitted(st.abs_path(old))),
    };

    if old_is_dir {
        if !new_negative {
            if !new_is_dir {
                return Err(VfsError::NotDirectory(st.abs_path(new)));
            }
            if st.live_children(new) > 0 {
                return Err(VfsError::NotEmpty(st.abs_path(new)));
            }
        } else {
            st.node_mut(new).state.insert(DentryState::ISDIRECTORY);
        }
    } else if new_is_dir {
        return Err(VfsError::IsDirectory(st.abs_path(new)));
    }

    if st.is_ancestor(old, new) || st.is_ancestor(new, old) {
        return Err(VfsError::InvalidArgument(format!(
            "rename between {} and {}",
            st.abs_path(old),
            st.abs_path(new)
        )));
    }

    if let Some(ops) = fs.d_ops() {
        let old_rel = st.rel_path(old);
        let new_rel = st.rel_path(new);
        let data = old_mount.and_then(|m| vfs.mounts().data_of(m));
        ops.rename(data.as_ref(), &old_rel, &new_rel)?;
    }

    let (file_type, perm) = {
        let node = st.node(old);
        (node.file_type, node.perm)
    };
    st.node_mut(old).state.insert(DentryState::NEGATIVE);
    let node = st.node_mut(new);
    node.state.remove(DentryState::NEGATIVE);
    node.file_type = file_type;
    node.perm = perm;
    Ok(())
}

/// Re-root the process at `path`. The resolved reference becomes the pin on
/// the new root; the old root's pin is released.
pub fn do_chroot(vfs: &Vfs, path: &str) -> Result<()> {
    let mut st = vfs.dcache().lock();
    let dent = namei::path_lookupat_locked(
        vfs,
        &mut st,
        None,
        path,
        LookupFlags::FOLLOW | LookupFlags::DIRECTORY,
    )?;
    if let Some(old) = vfs.process().set_root(dent) {
        st.put(old);
    }
    Ok(())
}

/// Copy `count` bytes (or until end of input) from `inp` to `out`.
///
/// With `offset`, the input is read starting there, the input cursor is
/// restored afterwards, and the offset is advanced past the copied bytes.
pub fn do_sendfile(
    out: &VfsHandle,
    inp: &VfsHandle,
    offset: Option<&mut u64>,
    count: Option<u64>,
) -> Result<u64> {
    if out.flags().contains(OpenFlags::APPEND) {
        return Err(VfsError::InvalidArgument(
            "output handle is append-only".to_string(),
        ));
    }
    match offset {
        Some(off) => {
            if !inp.stream_caps().contains(StreamCaps::SEEK) {
                return Err(VfsError::AccessDenied(inp.path().to_string()));
            }
            let ops_in = inp.stream_ops()?.clone();
            let old = ops_in.seek(inp, SeekFrom::Current(0))?;
            let res = handle_copy(inp, Some(*off), out, count);
            // The input cursor goes back where it was even when the copy
            // failed partway.
            let _ = ops_in.seek(inp, SeekFrom::Start(old));
            let bytes = res?;
            *off += bytes;
            Ok(bytes)
        }
        None => handle_copy(inp, None, out, count),
    }
}
