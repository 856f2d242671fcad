// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! The dentry cache: an in-memory tree of every path component the VFS has
//! seen, positive or negative.
//!
//! Entries live in an arena and are addressed by [`DentryId`]; once created
//! they are never freed, so an id stays valid for the lifetime of the cache.
//! Detaching a subtree (when a mount covers it) unlinks the entries from
//! their parent and drops their `VALID` bit, leaving unreachable husks in
//! the arena. The whole tree sits behind one lock, [`Dcache::lock`]; path
//! walks hold it end to end.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::fs::{FileType, FsType};
use crate::mount::MountId;

bitflags! {
    /// Lifecycle bits of a cache entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DentryState: u32 {
        /// The entry reflects a backend answer (including a negative one).
        const VALID = 0x0001;
        /// The node does not exist; kept to answer repeat lookups.
        const NEGATIVE = 0x0002;
        /// Deleted without backend support; kept negative locally.
        const PERSIST = 0x0008;
        /// A filesystem is attached here.
        const MOUNTPOINT = 0x0040;
        const ISLINK = 0x0080;
        const ISDIRECTORY = 0x0100;
        /// Fabricated by the VFS rather than reported by a backend.
        const SYNTHETIC = 0x4000;
    }
}

/// Stable arena index of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DentryId(usize);

/// One node of the cache tree.
pub struct Dentry {
    pub name: String,
    pub parent: Option<DentryId>,
    pub children: BTreeMap<String, DentryId>,
    pub state: DentryState,
    pub file_type: Option<FileType>,
    pub perm: u32,
    /// Filesystem governing this node.
    pub fs: Option<Arc<FsType>>,
    /// Mount this node belongs to.
    pub mount: Option<MountId>,
    /// Mount attached on top of this node, if it is a mount point.
    pub mounted: Option<MountId>,
    pub ref_count: usize,
}

impl Dentry {
    pub fn is_negative(&self) -> bool {
        self.state.contains(DentryState::NEGATIVE)
    }

    pub fn is_directory(&self) -> bool {
        self.state.contains(DentryState::ISDIRECTORY)
    }

    pub fn is_link(&self) -> bool {
        self.state.contains(DentryState::ISLINK)
    }
}

/// Cache contents, reachable only through [`Dcache::lock`].
pub struct DcacheState {
    nodes: Vec<Dentry>,
    root: DentryId,
}

pub struct Dcache {
    state: Mutex<DcacheState>,
}

impl Default for Dcache {
    fn default() -> Self {
        Self::new()
    }
}

impl Dcache {
    /// Create a cache holding only the root entry. The root starts valid and
    /// directory-typed so absolute walks have somewhere to stand before the
    /// first mount.
    pub fn new() -> Self {
        let root = Dentry {
            name: String::new(),
            parent: None,
            children: BTreeMap::new(),
            state: DentryState::VALID | DentryState::ISDIRECTORY,
            file_type: Some(FileType::Directory),
            perm: 0o755,
            fs: None,
            mount: None,
            mounted: None,
            ref_count: 1,
        };
        Dcache {
            state: Mutex::new(DcacheState {
                nodes: vec![root],
                root: DentryId(0),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, DcacheState> {
        self.state.lock().unwrap()
    }
}

impl DcacheState {
    pub fn root(&self) -> DentryId {
        self.root
    }

    pub fn node(&self, id: DentryId) -> &Dentry {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: DentryId) -> &mut Dentry {
        &mut self.nodes[id.0]
    }

    /// Take a reference on an entry.
    pub fn get(&mut self, id: DentryId) {
        self.nodes[id.0].ref_count += 1;
    }

    /// Drop a reference. Entries are never freed; the count exists to uphold
    /// the access protocol.
    pub fn put(&mut self, id: DentryId) {
        let node = &mut self.nodes[id.0];
        debug_assert!(node.ref_count > 0, "unbalanced put on {:?}", id);
        node.ref_count = node.ref_count.saturating_sub(1);
    }

    pub fn lookup_child(&self, dir: DentryId, name: &str) -> Option<DentryId> {
        self.node(dir).children.get(name).copied()
    }

    /// Create a fresh, not-yet-valid child under `parent`, governed by the
    /// given mount and filesystem. Returns it with one caller reference on
    /// top of the cache's own.
    pub fn alloc_child(
        &mut self,
        parent: DentryId,
        name: &str,
        mount: Option<MountId>,
        fs: Option<Arc<FsType>>,
    ) -> DentryId {
        let id = DentryId(self.nodes.len());
        self.nodes.push(Dentry {
            name: name.to_string(),
            parent: Some(parent),
            children: BTreeMap::new(),
            state: DentryState::empty(),
            file_type: None,
            perm: 0,
            fs,
            mount,
            mounted: None,
            ref_count: 2,
        });
        self.node_mut(parent).children.insert(name.to_string(), id);
        id
    }

    /// Number of children that currently exist (not negative).
    pub fn live_children(&self, dir: DentryId) -> usize {
        self.node(dir)
            .children
            .values()
            .filter(|&&c| !self.node(c).is_negative())
            .count()
    }

    /// Invalidate and unlink everything below `id`, leaving `id` itself in
    /// place. Used when a mount covers an existing subtree.
    pub fn detach_subtree(&mut self, id: DentryId) {
        let children: Vec<DentryId> = self.node(id).children.values().copied().collect();
        for child in children {
            self.detach_subtree(child);
            self.node_mut(child).state.remove(DentryState::VALID);
        }
        self.node_mut(id).children.clear();
    }

    /// Path of `id` relative to the root of its own mount, without a leading
    /// slash. The mount root itself maps to the empty string.
    ///
    /// The mount root is found structurally: walking up, the first entry
    /// whose parent belongs to a different mount (or has no parent) is where
    /// the filesystem is attached. This works before the mount is fully
    /// wired up, which is exactly when the attach-time validation lookup
    /// runs.
    pub fn rel_path(&self, id: DentryId) -> String {
        let mut parts: Vec<&str> = Vec::new();
        let mut cur = id;
        loop {
            let node = self.node(cur);
            let parent = match node.parent {
                Some(p) => p,
                None => break,
            };
            if self.node(parent).mount != node.mount {
                break;
            }
            parts.push(&node.name);
            cur = parent;
        }
        parts.reverse();
        parts.join("/")
    }

    /// Absolute path of `id` from the cache root.
    pub fn abs_path(&self, id: DentryId) -> String {
        if id == self.root {
            return "/".to_string();
        }
        let mut parts: Vec<&str> = Vec::new();
        let mut cur = id;
        loop {
            let node = self.node(cur);
            match node.parent {
                Some(p) => {
                    parts.push(&node.name);
                    cur = p;
                }
                None => break,
            }
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// True if `anc` is `dent` or an ancestor of `dent`.
    pub fn is_ancestor(&self, anc: DentryId, dent: DentryId) -> bool {
        let mut cur = Some(dent);
        while let Some(id) = cur {
            if id == anc {
                return true;
            }
            cur = self.node(id).parent;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_entry() {
        let cache = Dcache::new();
        let st = cache.lock();
        let root = st.node(st.root());
        assert!(root.state.contains(DentryState::VALID));
        assert!(root.is_directory());
        assert_eq!(root.ref_count, 1);
        assert_eq!(st.abs_path(st.root()), "/");
    }

    #[test]
    fn test_ids_stay_valid_across_growth() {
        let cache = Dcache::new();
        let mut st = cache.lock();
        let root = st.root();
        let first = st.alloc_child(root, "first", None, None);
        let mut last = first;
        for i in 0..512 {
            last = st.alloc_child(last, &format!("n{}", i), None, None);
        }
        assert_eq!(st.node(first).name, "first");
        assert_eq!(st.lookup_child(root, "first"), Some(first));
        assert!(st.is_ancestor(first, last));
        assert!(!st.is_ancestor(last, first));
    }

    #[test]
    fn test_ref_counting() {
        let cache = Dcache::new();
        let mut st = cache.lock();
        let root = st.root();
        let a = st.alloc_child(root, "a", None, None);
        assert_eq!(st.node(a).ref_count, 2);
        st.get(a);
        assert_eq!(st.node(a).ref_count, 3);
        st.put(a);
        st.put(a);
        assert_eq!(st.node(a).ref_count, 1);
    }

    #[test]
    fn test_detach_subtree_invalidates_children() {
        let cache = Dcache::new();
        let mut st = cache.lock();
        let root = st.root();
        let a = st.alloc_child(root, "a", None, None);
        st.node_mut(a).state.insert(DentryState::VALID);
        let b = st.alloc_child(a, "b", None, None);
        st.node_mut(b).state.insert(DentryState::VALID);

        st.detach_subtree(a);

        assert!(st.lookup_child(a, "b").is_none());
        assert!(!st.node(b).state.contains(DentryState::VALID));
        // The detached entry still answers by id.
        assert_eq!(st.node(b).name, "b");
        // The top of the subtree keeps its own state.
        assert!(st.node(a).state.contains(DentryState::VALID));
        assert_eq!(st.lookup_child(root, "a"), Some(a));
    }

    #[test]
    fn test_live_children_ignores_negative() {
        let cache = Dcache::new();
        let mut st = cache.lock();
        let root = st.root();
        let dir = st.alloc_child(root, "dir", None, None);
        let x = st.alloc_child(dir, "x", None, None);
        st.node_mut(x).state.insert(DentryState::VALID);
        let y = st.alloc_child(dir, "y", None, None);
        st.node_mut(y)
            .state
            .insert(DentryState::VALID | DentryState::NEGATIVE);
        assert_eq!(st.live_children(dir), 1);
    }

    #[test]
    fn test_rel_path_stops_at_mount_boundary() {
        let cache = Dcache::new();
        let mut st = cache.lock();
        let root = st.root();
        let outer = MountId::new(0);
        let inner = MountId::new(1);
        st.node_mut(root).mount = Some(outer);

        let dev = st.alloc_child(root, "dev", Some(outer), None);
        let shm = st.alloc_child(dev, "shm", Some(outer), None);
        let x = st.alloc_child(shm, "x", Some(outer), None);
        assert_eq!(st.rel_path(x), "dev/shm/x");

        // Re-pointing dev at its own mount moves the boundary.
        st.node_mut(dev).mount = Some(inner);
        let tty = st.alloc_child(dev, "tty", Some(inner), None);
        assert_eq!(st.rel_path(dev), "");
        assert_eq!(st.rel_path(tty), "tty");
        // Entries still on the outer mount are unaffected.
        assert_eq!(st.rel_path(st.root()), "");
    }

    #[test]
    fn test_abs_path_of_nested_entry() {
        let cache = Dcache::new();
        let mut st = cache.lock();
        let root = st.root();
        let a = st.alloc_child(root, "a", None, None);
        let b = st.alloc_child(a, "b", None, None);
        assert_eq!(st.abs_path(b), "/a/b");
    }
}
