// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Mount table and the attach protocol.
//!
//! A mount binds a filesystem instance to a dentry. There is no separate
//! in-mount root object: the mount-point dentry itself is re-pointed at the
//! new filesystem, and entries below it inherit the governing mount as they
//! are created. Mounts are appended to the table and never removed; a
//! [`MountId`] stays valid forever.
//!
//! Lock order is dentry cache first, then the mount table. `mount_fs` holds
//! the cache lock across the whole protocol, so table length cannot change
//! between reserving an id and pushing the entry.

use std::sync::{Arc, Mutex};

use crate::dcache::{DcacheState, DentryId, DentryState};
use crate::error::{Result, VfsError};
use crate::fs::{BackendData, DirCaps, FsType};
use crate::namei::{self, LookupFlags};
use crate::Vfs;

/// Stable index of a mount in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountId(usize);

impl MountId {
    pub(crate) fn new(index: usize) -> Self {
        MountId(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// One attached filesystem instance.
pub struct Mount {
    path: String,
    uri: String,
    fs: Arc<FsType>,
    data: Option<BackendData>,
    mount_point: DentryId,
}

impl Mount {
    pub(crate) fn new(
        path: &str,
        uri: &str,
        fs: Arc<FsType>,
        data: Option<BackendData>,
        mount_point: DentryId,
    ) -> Self {
        Mount {
            path: path.to_string(),
            uri: uri.to_string(),
            fs,
            data,
            mount_point,
        }
    }

    /// Absolute path the mount was attached at.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Backend URI, empty for backends that take none.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn fs(&self) -> &Arc<FsType> {
        &self.fs
    }

    pub fn data(&self) -> Option<&BackendData> {
        self.data.as_ref()
    }

    pub fn mount_point(&self) -> DentryId {
        self.mount_point
    }
}

/// Append-only list of mounts, in attach order.
#[derive(Default)]
pub struct MountTable {
    inner: Mutex<Vec<Arc<Mount>>>,
}

impl MountTable {
    pub fn new() -> Self {
        MountTable {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// The id the next push will take. Only meaningful while the caller
    /// serializes pushes by holding the cache lock.
    pub(crate) fn next_id(&self) -> MountId {
        MountId(self.inner.lock().unwrap().len())
    }

    pub(crate) fn push(&self, mount: Arc<Mount>) -> MountId {
        let mut list = self.inner.lock().unwrap();
        list.push(mount);
        MountId(list.len() - 1)
    }

    /// Back out a push whose mount never became visible as attached. Only
    /// legal for the most recent entry, under the same cache lock that
    /// covered the push.
    pub(crate) fn rollback(&self, id: MountId) {
        let mut list = self.inner.lock().unwrap();
        debug_assert_eq!(id.0, list.len() - 1);
        list.pop();
    }

    pub fn get(&self, id: MountId) -> Option<Arc<Mount>> {
        self.inner.lock().unwrap().get(id.0).cloned()
    }

    /// Per-mount backend state, cloned out so no table lock is held while
    /// the backend runs.
    pub fn data_of(&self, id: MountId) -> Option<BackendData> {
        self.get(id).and_then(|m| m.data().cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the table in attach order.
    pub fn snapshot(&self) -> Vec<(MountId, Arc<Mount>)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(i, m)| (MountId(i), m.clone()))
            .collect()
    }

    /// Find the mount whose URI is a prefix of `uri`, preferring the one
    /// with the longest mount path. Mounts without a URI never match.
    pub fn find_mount_from_uri(&self, uri: &str) -> Option<Arc<Mount>> {
        let list = self.inner.lock().unwrap();
        let mut found: Option<&Arc<Mount>> = None;
        for mount in list.iter() {
            if mount.uri().is_empty() {
                continue;
            }
            if !uri.as_bytes().starts_with(mount.uri().as_bytes()) {
                continue;
            }
            match found {
                Some(f) if f.path().len() >= mount.path().len() => {}
                _ => found = Some(mount),
            }
        }
        found.cloned()
    }
}

/// Attach a filesystem of type `fs_type` at `mount_path`.
///
/// `parent` short-circuits resolution of the parent directory when the
/// caller already holds it. With `make_ancestor`, missing intermediate
/// directories are fabricated as synthetic entries instead of failing the
/// walk.
///
/// The mount-point dentry is created governed by the new mount before the
/// path is re-walked, so the validation step asks the new backend whether
/// its root exists. On success the dentry is re-pointed at the new
/// filesystem and its old subtree is dropped from the cache.
pub fn mount_fs(
    vfs: &Vfs,
    fs_type: &str,
    uri: &str,
    mount_path: &str,
    parent: Option<DentryId>,
    make_ancestor: bool,
) -> Result<DentryId> {
    let logger = vfs.logger().new(o!("subsystem" => "mount"));
    info!(
        logger,
        "mounting {} filesystem: from {:?} to {:?}", fs_type, uri, mount_path
    );

    let fs = vfs
        .registry()
        .find(fs_type)
        .ok_or_else(|| VfsError::NoSuchDevice(fs_type.to_string()))?;
    if !fs.dir_caps().contains(DirCaps::MOUNT) {
        return Err(VfsError::NoSuchDevice(fs_type.to_string()));
    }
    if mount_path.is_empty() {
        return Err(VfsError::InvalidArgument("empty mount path".to_string()));
    }

    let lookup_flags = if make_ancestor {
        LookupFlags::MAKE_SYNTHETIC
    } else {
        LookupFlags::empty()
    };

    let mut st = vfs.dcache().lock();
    let (parent_path, last) = namei::find_last_component(mount_path);

    let mut parent_owned = false;
    let parent = match parent {
        Some(p) => Some(p),
        None if !last.is_empty() => {
            let root = st.root();
            let p =
                namei::path_lookupat_locked(vfs, &mut st, Some(root), parent_path, lookup_flags)?;
            parent_owned = true;
            Some(p)
        }
        None => None,
    };

    let data = {
        let ops = fs
            .d_ops()
            .ok_or_else(|| VfsError::NoSuchDevice(fs_type.to_string()))?;
        match ops.mount(uri) {
            Ok(d) => d,
            Err(e) => {
                if parent_owned {
                    if let Some(p) = parent {
                        st.put(p);
                    }
                }
                return Err(e);
            }
        }
    };

    let mount_id = vfs.mounts().next_id();
    let root = st.root();
    let dent = if last.is_empty() {
        st.get(root);
        root
    } else {
        // A non-empty last component implies a parent above.
        let parent = match parent {
            Some(p) => p,
            None => {
                return Err(VfsError::InvalidArgument(mount_path.to_string()));
            }
        };
        match st.lookup_child(parent, last) {
            Some(id) => {
                st.get(id);
                id
            }
            None => st.alloc_child(parent, last, Some(mount_id), Some(fs.clone())),
        }
    };

    if dent != root && st.node(dent).state.contains(DentryState::VALID) {
        st.put(dent);
        if parent_owned {
            if let Some(p) = parent {
                st.put(p);
            }
        }
        return Err(VfsError::AlreadyExists(mount_path.to_string()));
    }

    st.node_mut(dent).state.insert(DentryState::MOUNTPOINT);

    let mount = Arc::new(Mount::new(mount_path, uri, fs.clone(), data, dent));
    let pushed = vfs.mounts().push(mount.clone());
    debug_assert_eq!(pushed, mount_id);

    match namei::path_lookupat_locked(vfs, &mut st, Some(root), mount_path, lookup_flags) {
        Ok(dent2) => {
            debug_assert_eq!(dent2, dent);
            st.put(dent2);
        }
        Err(e) => {
            st.node_mut(dent).state.remove(DentryState::MOUNTPOINT);
            vfs.mounts().rollback(mount_id);
            st.put(dent);
            if parent_owned {
                if let Some(p) = parent {
                    st.put(p);
                }
            }
            return Err(e);
        }
    }

    attach_mount_locked(&mut st, dent, mount_id, &fs);

    st.put(dent);
    if parent_owned {
        if let Some(p) = parent {
            st.put(p);
        }
    }
    Ok(dent)
}

/// Wire an already-listed mount onto its mount-point dentry: drop whatever
/// the cache knew below it, mark the spine synthetic so the path stays
/// resolvable, and re-point the dentry at the mounted filesystem. Shared by
/// `mount_fs` and restore.
pub(crate) fn attach_mount_locked(
    st: &mut DcacheState,
    dent: DentryId,
    mount_id: MountId,
    fs: &Arc<FsType>,
) {
    // The mount pins its mount point.
    st.get(dent);
    st.node_mut(dent).mounted = Some(mount_id);
    st.detach_subtree(dent);

    let mut cur = Some(dent);
    while let Some(id) = cur {
        let node = st.node_mut(id);
        if node.state.contains(DentryState::SYNTHETIC) {
            break;
        }
        node.state.insert(DentryState::SYNTHETIC);
        cur = node.parent;
    }

    let node = st.node_mut(dent);
    node.state.remove(DentryState::NEGATIVE);
    node.state.insert(DentryState::MOUNTPOINT);
    node.mount = Some(mount_id);
    node.fs = Some(fs.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mem::{MemFs, MemTree};
    use crate::fs::FsRegistry;

    fn test_vfs() -> Vfs {
        let mut registry = FsRegistry::new();
        registry.register(MemFs::fs_type("chroot"));
        Vfs::new(registry, &slog::Logger::root(slog::Discard, o!()))
    }

    fn mem_tree(vfs: &Vfs, id: MountId) -> Arc<MemTree> {
        let data = vfs.mounts().data_of(id).unwrap();
        data.downcast::<MemTree>().unwrap()
    }

    #[test]
    fn test_mount_root() {
        let vfs = test_vfs();
        let dent = mount_fs(&vfs, "chroot", "file:", "/", None, false).unwrap();

        let st = vfs.dcache().lock();
        assert_eq!(dent, st.root());
        let node = st.node(dent);
        assert!(node.state.contains(DentryState::MOUNTPOINT));
        assert!(node.state.contains(DentryState::SYNTHETIC));
        assert_eq!(node.mounted, Some(MountId::new(0)));
        assert_eq!(node.mount, Some(MountId::new(0)));
        assert_eq!(node.fs.as_ref().unwrap().name(), "chroot");
        assert_eq!(vfs.mounts().len(), 1);
        assert_eq!(vfs.mounts().get(MountId::new(0)).unwrap().path(), "/");
    }

    #[test]
    fn test_mount_unknown_type() {
        let vfs = test_vfs();
        let err = mount_fs(&vfs, "nfs", "", "/", None, false).unwrap_err();
        assert!(matches!(err, VfsError::NoSuchDevice(_)));
    }

    #[test]
    fn test_mount_empty_path() {
        let vfs = test_vfs();
        let err = mount_fs(&vfs, "chroot", "file:", "", None, false).unwrap_err();
        assert!(matches!(err, VfsError::InvalidArgument(_)));
    }

    #[test]
    fn test_mount_point_validated_by_new_backend() {
        let vfs = test_vfs();
        mount_fs(&vfs, "chroot", "file:", "/", None, false).unwrap();

        // The outer tree has no "sub" entry; the new mount's own root
        // satisfies the validation walk.
        let dent = mount_fs(&vfs, "chroot", "file:sub", "/sub", None, false).unwrap();

        let st = vfs.dcache().lock();
        let node = st.node(dent);
        assert!(node.state.contains(DentryState::VALID));
        assert!(node.is_directory());
        assert!(node.state.contains(DentryState::MOUNTPOINT));
        assert_eq!(node.mount, Some(MountId::new(1)));
        assert_eq!(st.rel_path(dent), "");
        assert_eq!(vfs.mounts().len(), 2);
    }

    #[test]
    fn test_mount_over_cached_entry_fails() {
        let vfs = test_vfs();
        mount_fs(&vfs, "chroot", "file:", "/", None, false).unwrap();
        mem_tree(&vfs, MountId::new(0)).mkdir_p("etc", 0o755).unwrap();

        // Observe /etc so it is cached valid.
        let found = namei::path_lookupat(&vfs, None, "/etc", LookupFlags::empty()).unwrap();
        vfs.dcache().lock().put(found);

        let err = mount_fs(&vfs, "chroot", "file:etc", "/etc", None, false).unwrap_err();
        assert!(matches!(err, VfsError::AlreadyExists(_)));
        assert_eq!(vfs.mounts().len(), 1);
    }

    #[test]
    fn test_mount_missing_parent_without_make_ancestor() {
        let vfs = test_vfs();
        mount_fs(&vfs, "chroot", "file:", "/", None, false).unwrap();
        let err = mount_fs(&vfs, "chroot", "file:b", "/a/b", None, false).unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));
        assert_eq!(vfs.mounts().len(), 1);
    }

    #[test]
    fn test_mount_make_ancestor_builds_spine() {
        let vfs = test_vfs();
        mount_fs(&vfs, "chroot", "file:", "/", None, false).unwrap();
        let dent = mount_fs(&vfs, "chroot", "file:c", "/a/b/c", None, true).unwrap();

        let st = vfs.dcache().lock();
        let root = st.root();
        let a = st.lookup_child(root, "a").unwrap();
        let b = st.lookup_child(a, "b").unwrap();
        for id in [a, b] {
            let node = st.node(id);
            assert!(node.state.contains(DentryState::SYNTHETIC));
            assert!(node.is_directory());
            assert!(!node.is_negative());
        }
        assert_eq!(st.lookup_child(b, "c"), Some(dent));
        assert!(st.node(dent).state.contains(DentryState::MOUNTPOINT));
        assert_eq!(vfs.mounts().len(), 2);
    }

    #[test]
    fn test_remount_root_detaches_old_subtree() {
        let vfs = test_vfs();
        mount_fs(&vfs, "chroot", "file:", "/", None, false).unwrap();
        let tree = mem_tree(&vfs, MountId::new(0));
        tree.mkdir_p("old", 0o755).unwrap();
        tree.put_file("old/f", b"x", 0o644).unwrap();

        let found = namei::path_lookupat(&vfs, None, "/old/f", LookupFlags::empty()).unwrap();
        vfs.dcache().lock().put(found);

        // The root is exempt from the already-cached check.
        mount_fs(&vfs, "chroot", "file:new", "/", None, false).unwrap();

        let st = vfs.dcache().lock();
        let root = st.root();
        assert!(st.lookup_child(root, "old").is_none());
        assert!(!st.node(found).state.contains(DentryState::VALID));
        assert_eq!(st.node(root).mount, Some(MountId::new(1)));
        assert_eq!(vfs.mounts().len(), 2);
    }

    #[test]
    fn test_failed_mount_leaves_table_unchanged() {
        let vfs = test_vfs();
        mount_fs(&vfs, "chroot", "file:", "/", None, false).unwrap();
        let before = vfs.mounts().len();
        let _ = mount_fs(&vfs, "chroot", "file:b", "/missing/b", None, false).unwrap_err();
        assert_eq!(vfs.mounts().len(), before);
    }

    #[test]
    fn test_find_mount_from_uri_prefers_longest_path() {
        let vfs = test_vfs();
        mount_fs(&vfs, "chroot", "file:", "/", None, false).unwrap();
        mount_fs(&vfs, "chroot", "file:lib", "/lib", None, true).unwrap();
        mount_fs(&vfs, "chroot", "file:lib/x86", "/lib/x86_64-linux-gnu", None, true).unwrap();

        let m = vfs.mounts().find_mount_from_uri("file:lib/x86/libc.so").unwrap();
        assert_eq!(m.path(), "/lib/x86_64-linux-gnu");

        let m = vfs.mounts().find_mount_from_uri("file:etc/hosts").unwrap();
        assert_eq!(m.path(), "/");

        assert!(vfs.mounts().find_mount_from_uri("dev:tty").is_none());
    }

    #[test]
    fn test_mount_point_pinned() {
        let vfs = test_vfs();
        mount_fs(&vfs, "chroot", "file:", "/", None, false).unwrap();
        let dent = mount_fs(&vfs, "chroot", "file:sub", "/sub", None, false).unwrap();
        let st = vfs.dcache().lock();
        // Cache reference plus the mount's pin.
        assert!(st.node(dent).ref_count >= 2);
    }
}
