// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Path resolution over the dentry cache.
//!
//! A walk holds the cache lock from the first component to the last, so a
//! resolved [`DentryId`] cannot be invalidated between lookup and use when
//! the caller keeps the same guard. Every returned entry carries a caller
//! reference; callers release it with [`DcacheState::put`] on all paths.

use crate::dcache::{DcacheState, DentryId, DentryState};
use crate::error::{Result, VfsError};
use crate::fs::{DirCaps, FileType};
use crate::Vfs;

/// Longest permitted name of a single path component.
pub const NAME_MAX: usize = 255;

/// Symbolic link nesting allowed before a walk fails with `TooManyLinks`.
pub const MAX_LINK_DEPTH: u32 = 8;

bitflags! {
    /// Resolution behavior. The empty set means "do not follow a final
    /// symlink".
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LookupFlags: u32 {
        /// Follow the final component if it is a symlink.
        const FOLLOW = 0x01;
        /// Allow the final component to be negative and return it anyway.
        const CREATE = 0x02;
        /// Require the final component to be a directory.
        const DIRECTORY = 0x04;
        /// Materialize missing intermediate components as synthetic
        /// directories instead of failing.
        const MAKE_SYNTHETIC = 0x08;
    }
}

bitflags! {
    /// Permission classes checked against the owner bits of an entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMask: u32 {
        const EXEC = 0x1;
        const WRITE = 0x2;
        const READ = 0x4;
    }
}

/// Check `mask` against the owner permission bits of `id`. The empty mask
/// only asks for existence.
pub fn check_permissions(st: &DcacheState, id: DentryId, mask: AccessMask) -> Result<()> {
    let node = st.node(id);
    if node.is_negative() {
        return Err(VfsError::NotFound(st.abs_path(id)));
    }
    if mask.is_empty() {
        return Ok(());
    }
    if (node.perm >> 6) & mask.bits() == mask.bits() {
        Ok(())
    } else {
        Err(VfsError::AccessDenied(st.abs_path(id)))
    }
}

/// Split a path into everything before its last component and the component
/// itself, ignoring trailing slashes. A path with no component left ("/",
/// "///") yields an empty last part.
pub fn find_last_component(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return (path, "");
    }
    match trimmed.rfind('/') {
        Some(i) => (&trimmed[..i + 1], &trimmed[i + 1..]),
        None => ("", trimmed),
    }
}

/// Resolve `path`, locking the cache for the duration of the walk.
pub fn path_lookupat(
    vfs: &Vfs,
    start: Option<DentryId>,
    path: &str,
    flags: LookupFlags,
) -> Result<DentryId> {
    let mut st = vfs.dcache().lock();
    path_lookupat_locked(vfs, &mut st, start, path, flags)
}

/// Resolve `path` under a cache guard the caller already holds.
///
/// Absolute paths start from the process root (or the cache root before one
/// is set); relative paths start from `start`, falling back to the process
/// working directory.
pub fn path_lookupat_locked(
    vfs: &Vfs,
    st: &mut DcacheState,
    start: Option<DentryId>,
    path: &str,
    flags: LookupFlags,
) -> Result<DentryId> {
    do_path_lookup(vfs, st, start, path, flags, 0)
}

fn do_path_lookup(
    vfs: &Vfs,
    st: &mut DcacheState,
    start: Option<DentryId>,
    path: &str,
    flags: LookupFlags,
    link_depth: u32,
) -> Result<DentryId> {
    if path.is_empty() {
        return Err(VfsError::NotFound(path.to_string()));
    }

    let bytes = path.as_bytes();
    let mut idx = 0;
    let mut dent;
    if bytes[0] == b'/' {
        dent = vfs.process().root().unwrap_or_else(|| st.root());
        while idx < bytes.len() && bytes[idx] == b'/' {
            idx += 1;
        }
    } else {
        dent = match start {
            Some(s) => s,
            None => vfs.process().cwd().unwrap_or_else(|| st.root()),
        };
    }
    st.get(dent);

    while idx < bytes.len() {
        let rest = &bytes[idx..];
        let name_end = rest.iter().position(|&b| b == b'/').unwrap_or(rest.len());
        let name = &path[idx..idx + name_end];
        let has_slash = name_end < rest.len();
        let mut next_idx = idx + name_end;
        while next_idx < bytes.len() && bytes[next_idx] == b'/' {
            next_idx += 1;
        }
        let is_final = next_idx == bytes.len();

        if name.len() > NAME_MAX {
            st.put(dent);
            return Err(VfsError::NameTooLong(path.to_string()));
        }

        let next = if name == "." {
            st.get(dent);
            dent
        } else if name == ".." {
            let up = st.node(dent).parent.unwrap_or(dent);
            st.get(up);
            up
        } else {
            match walk_component(
                vfs, st, dent, name, path, flags, link_depth, is_final, has_slash,
            ) {
                Ok(n) => n,
                Err(e) => {
                    st.put(dent);
                    return Err(e);
                }
            }
        };

        st.put(dent);
        dent = next;
        idx = next_idx;
    }

    Ok(dent)
}

/// Advance the walk by one real component: consult the cache or the backend,
/// follow a symlink if the position calls for it, then apply the negative
/// and directory rules. Returns the next entry with a reference, or an error
/// with every internal reference released.
#[allow(clippy::too_many_arguments)]
fn walk_component(
    vfs: &Vfs,
    st: &mut DcacheState,
    dent: DentryId,
    name: &str,
    path: &str,
    flags: LookupFlags,
    link_depth: u32,
    is_final: bool,
    has_slash: bool,
) -> Result<DentryId> {
    let mut next = lookup_dentry(vfs, st, dent, name)?;

    let follow = {
        let node = st.node(next);
        !node.is_negative()
            && node.is_link()
            && (!is_final || has_slash || flags.contains(LookupFlags::FOLLOW))
    };
    if follow {
        if link_depth >= MAX_LINK_DEPTH {
            st.put(next);
            return Err(VfsError::TooManyLinks(path.to_string()));
        }
        let mut sub_flags = flags;
        if !is_final || has_slash {
            sub_flags.insert(LookupFlags::FOLLOW | LookupFlags::DIRECTORY);
            sub_flags.remove(LookupFlags::CREATE);
        }

        let target = match read_link(vfs, st, next) {
            Ok(t) => t,
            Err(e) => {
                st.put(next);
                return Err(e);
            }
        };
        // The link target resolves from the directory holding the link.
        let resolved = do_path_lookup(vfs, st, Some(dent), &target, sub_flags, link_depth + 1);
        st.put(next);
        next = resolved?;
    }

    let node_state = st.node(next).state;
    if node_state.contains(DentryState::NEGATIVE) {
        if (!is_final || has_slash) && flags.contains(LookupFlags::MAKE_SYNTHETIC) {
            let node = st.node_mut(next);
            node.state.remove(DentryState::NEGATIVE);
            node.state
                .insert(DentryState::VALID | DentryState::SYNTHETIC | DentryState::ISDIRECTORY);
            node.file_type = Some(FileType::Directory);
            node.perm = 0o755;
        } else if !(is_final && flags.contains(LookupFlags::CREATE)) {
            st.put(next);
            return Err(VfsError::NotFound(path.to_string()));
        }
    } else if !node_state.contains(DentryState::ISDIRECTORY)
        && (!is_final || has_slash || flags.contains(LookupFlags::DIRECTORY))
    {
        st.put(next);
        return Err(VfsError::NotDirectory(path.to_string()));
    }

    Ok(next)
}

/// Find or create the cache entry for `name` under `dent`, validating it
/// against the backend on a miss. A backend `NotFound` becomes a negative
/// entry, which is a successful lookup.
pub fn lookup_dentry(
    vfs: &Vfs,
    st: &mut DcacheState,
    dent: DentryId,
    name: &str,
) -> Result<DentryId> {
    let next = match st.lookup_child(dent, name) {
        Some(id) => {
            st.get(id);
            id
        }
        None => {
            let (mount, fs) = {
                let parent = st.node(dent);
                (parent.mount, parent.fs.clone())
            };
            st.alloc_child(dent, name, mount, fs)
        }
    };

    if st.node(next).state.contains(DentryState::VALID) {
        return Ok(next);
    }

    let fs = st.node(next).fs.clone();
    let answered = match fs {
        Some(fs) if fs.dir_caps().contains(DirCaps::LOOKUP) => {
            let rel = st.rel_path(next);
            let data = st
                .node(next)
                .mount
                .and_then(|m| vfs.mounts().data_of(m));
            match fs.d_ops() {
                Some(ops) => Some(ops.lookup(data.as_ref(), &rel)),
                None => None,
            }
        }
        _ => None,
    };

    match answered {
        Some(Ok(info)) => {
            let node = st.node_mut(next);
            node.perm = info.perm;
            node.file_type = Some(info.file_type);
            node.state.insert(DentryState::VALID);
            match info.file_type {
                FileType::Directory => node.state.insert(DentryState::ISDIRECTORY),
                FileType::Symlink => node.state.insert(DentryState::ISLINK),
                _ => {}
            }
            Ok(next)
        }
        Some(Err(VfsError::NotFound(_))) | None => {
            // No node, or no backend to ask: cache the absence.
            st.node_mut(next)
                .state
                .insert(DentryState::VALID | DentryState::NEGATIVE);
            Ok(next)
        }
        Some(Err(e)) => {
            st.put(next);
            Err(e)
        }
    }
}

fn read_link(vfs: &Vfs, st: &DcacheState, id: DentryId) -> Result<String> {
    let node = st.node(id);
    let fs = node
        .fs
        .clone()
        .ok_or_else(|| VfsError::InvalidArgument(st.abs_path(id)))?;
    if !fs.dir_caps().contains(DirCaps::FOLLOW_LINK) {
        return Err(VfsError::InvalidArgument(st.abs_path(id)));
    }
    let ops = fs
        .d_ops()
        .ok_or_else(|| VfsError::InvalidArgument(st.abs_path(id)))?;
    let rel = st.rel_path(id);
    let data = node.mount.and_then(|m| vfs.mounts().data_of(m));
    ops.follow_link(data.as_ref(), &rel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsRegistry;

    fn test_vfs() -> Vfs {
        Vfs::new(FsRegistry::new(), &slog::Logger::root(slog::Discard, o!()))
    }

    fn mark_file(vfs: &Vfs, parent: DentryId, name: &str, perm: u32) -> DentryId {
        let mut st = vfs.dcache().lock();
        let id = st.alloc_child(parent, name, None, None);
        let node = st.node_mut(id);
        node.state.insert(DentryState::VALID);
        node.file_type = Some(FileType::Regular);
        node.perm = perm;
        st.put(id);
        id
    }

    fn mark_dir(vfs: &Vfs, parent: DentryId, name: &str) -> DentryId {
        let mut st = vfs.dcache().lock();
        let id = st.alloc_child(parent, name, None, None);
        let node = st.node_mut(id);
        node.state
            .insert(DentryState::VALID | DentryState::ISDIRECTORY);
        node.file_type = Some(FileType::Directory);
        node.perm = 0o755;
        st.put(id);
        id
    }

    #[test]
    fn test_empty_path_fails() {
        let vfs = test_vfs();
        let err = path_lookupat(&vfs, None, "", LookupFlags::empty()).unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));
    }

    #[test]
    fn test_root_resolution() {
        let vfs = test_vfs();
        let root = vfs.dcache().lock().root();
        let found = path_lookupat(&vfs, None, "/", LookupFlags::empty()).unwrap();
        assert_eq!(found, root);
        let found = path_lookupat(&vfs, None, "///", LookupFlags::empty()).unwrap();
        assert_eq!(found, root);
        vfs.dcache().lock().put(root);
        vfs.dcache().lock().put(root);
    }

    #[test]
    fn test_dot_and_dotdot() {
        let vfs = test_vfs();
        let root = vfs.dcache().lock().root();
        let a = mark_dir(&vfs, root, "a");

        let found = path_lookupat(&vfs, None, "/a/.", LookupFlags::empty()).unwrap();
        assert_eq!(found, a);
        let found = path_lookupat(&vfs, None, "/a/..", LookupFlags::empty()).unwrap();
        assert_eq!(found, root);
        // Dot-dot at the root stays at the root.
        let found = path_lookupat(&vfs, None, "/..", LookupFlags::empty()).unwrap();
        assert_eq!(found, root);
    }

    #[test]
    fn test_missing_component_is_cached_negative() {
        let vfs = test_vfs();
        let err = path_lookupat(&vfs, None, "/nope", LookupFlags::empty()).unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));

        let st = vfs.dcache().lock();
        let root = st.root();
        let id = st.lookup_child(root, "nope").unwrap();
        assert!(st.node(id).is_negative());
        assert!(st.node(id).state.contains(DentryState::VALID));
    }

    #[test]
    fn test_create_returns_negative_final() {
        let vfs = test_vfs();
        let found = path_lookupat(&vfs, None, "/newfile", LookupFlags::CREATE).unwrap();
        let mut st = vfs.dcache().lock();
        assert!(st.node(found).is_negative());
        st.put(found);
    }

    #[test]
    fn test_trailing_slash_requires_directory() {
        let vfs = test_vfs();
        let root = vfs.dcache().lock().root();
        mark_file(&vfs, root, "file", 0o644);

        let err = path_lookupat(&vfs, None, "/file/", LookupFlags::empty()).unwrap_err();
        assert!(matches!(err, VfsError::NotDirectory(_)));
        let err = path_lookupat(&vfs, None, "/file", LookupFlags::DIRECTORY).unwrap_err();
        assert!(matches!(err, VfsError::NotDirectory(_)));
        // Without the directory requirement the file resolves.
        let found = path_lookupat(&vfs, None, "/file", LookupFlags::empty()).unwrap();
        vfs.dcache().lock().put(found);
    }

    #[test]
    fn test_name_too_long() {
        let vfs = test_vfs();
        let long = "x".repeat(NAME_MAX + 1);
        let err =
            path_lookupat(&vfs, None, &format!("/{}", long), LookupFlags::empty()).unwrap_err();
        assert!(matches!(err, VfsError::NameTooLong(_)));
    }

    #[test]
    fn test_make_synthetic_materializes_intermediates() {
        let vfs = test_vfs();
        let found = path_lookupat(
            &vfs,
            None,
            "/x/y",
            LookupFlags::MAKE_SYNTHETIC | LookupFlags::CREATE,
        )
        .unwrap();

        let mut st = vfs.dcache().lock();
        let root = st.root();
        let x = st.lookup_child(root, "x").unwrap();
        let node = st.node(x);
        assert!(node.state.contains(DentryState::SYNTHETIC));
        assert!(node.is_directory());
        assert!(!node.is_negative());
        assert_eq!(node.perm, 0o755);
        // The final component stays negative, ready for creation.
        assert!(st.node(found).is_negative());
        st.put(found);
    }

    #[test]
    fn test_relative_walk_from_start() {
        let vfs = test_vfs();
        let root = vfs.dcache().lock().root();
        let a = mark_dir(&vfs, root, "a");
        let b = mark_dir(&vfs, a, "b");

        let mut st = vfs.dcache().lock();
        let found = path_lookupat_locked(&vfs, &mut st, Some(a), "b", LookupFlags::empty())
            .unwrap();
        assert_eq!(found, b);
        st.put(found);
    }

    #[test]
    fn test_check_permissions_owner_bits() {
        let vfs = test_vfs();
        let root = vfs.dcache().lock().root();
        let f = mark_file(&vfs, root, "data", 0o640);

        let st = vfs.dcache().lock();
        check_permissions(&st, f, AccessMask::READ | AccessMask::WRITE).unwrap();
        let err = check_permissions(&st, f, AccessMask::EXEC).unwrap_err();
        assert!(matches!(err, VfsError::AccessDenied(_)));
        // The empty mask is an existence probe.
        check_permissions(&st, f, AccessMask::empty()).unwrap();
    }

    #[test]
    fn test_check_permissions_negative_entry() {
        let vfs = test_vfs();
        let found = path_lookupat(&vfs, None, "/ghost", LookupFlags::CREATE).unwrap();
        let mut st = vfs.dcache().lock();
        let err = check_permissions(&st, found, AccessMask::empty()).unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));
        st.put(found);
    }

    #[test]
    fn test_find_last_component() {
        assert_eq!(find_last_component("/a/b"), ("/a/", "b"));
        assert_eq!(find_last_component("/a/b///"), ("/a/", "b"));
        assert_eq!(find_last_component("b"), ("", "b"));
        assert_eq!(find_last_component("/"), ("/", ""));
        assert_eq!(find_last_component("///"), ("///", ""));
    }

    #[test]
    fn test_lookup_reference_protocol() {
        let vfs = test_vfs();
        let root = vfs.dcache().lock().root();
        let a = mark_dir(&vfs, root, "a");
        let before = vfs.dcache().lock().node(a).ref_count;

        let found = path_lookupat(&vfs, None, "/a", LookupFlags::empty()).unwrap();
        assert_eq!(found, a);
        {
            let mut st = vfs.dcache().lock();
            assert_eq!(st.node(a).ref_count, before + 1);
            st.put(found);
        }
        assert_eq!(vfs.dcache().lock().node(a).ref_count, before);

        // A failed walk leaves counts untouched.
        let _ = path_lookupat(&vfs, None, "/a/missing/deep", LookupFlags::empty()).unwrap_err();
        assert_eq!(vfs.dcache().lock().node(a).ref_count, before);
    }
}
