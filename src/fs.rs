// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Filesystem types and the backend contract.
//!
//! A [`FsType`] bundles a name with two operation tables: [`DirOps`] for
//! namespace operations addressed by mount-relative paths, and [`StreamOps`]
//! for open-handle I/O. Backends advertise what they implement through
//! capability bitmaps; the core consults the bitmap before dispatching, so a
//! missing capability turns into the documented fallback of each caller
//! instead of a call that fails halfway through.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::sync::Arc;

use crate::error::{Result, VfsError};
use crate::handle::VfsHandle;

/// Private per-mount state handed out by [`DirOps::mount`] and threaded back
/// into every backend call for that mount.
pub type BackendData = Arc<dyn Any + Send + Sync>;

/// File type classification, kept in each dentry and in checkpoint images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    /// Anything else a backend reports, as raw `S_IFMT` bits.
    Other(u32),
}

impl FileType {
    /// Classify from a mode word, looking only at the `S_IFMT` bits.
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => FileType::Regular,
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            other => FileType::Other(other),
        }
    }

    /// The `S_IFMT` bits for this type.
    pub fn as_mode(&self) -> u32 {
        match self {
            FileType::Regular => libc::S_IFREG,
            FileType::Directory => libc::S_IFDIR,
            FileType::Symlink => libc::S_IFLNK,
            FileType::Other(bits) => *bits,
        }
    }
}

/// What a backend learned about a node during lookup.
#[derive(Debug, Clone, Copy)]
pub struct NodeInfo {
    pub file_type: FileType,
    /// Permission bits, already stripped of the `S_IFMT` part.
    pub perm: u32,
}

impl NodeInfo {
    pub fn from_mode(mode: u32) -> Self {
        NodeInfo {
            file_type: FileType::from_mode(mode),
            perm: mode & !libc::S_IFMT,
        }
    }
}

bitflags! {
    /// Namespace operations a [`DirOps`] implementation provides.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirCaps: u32 {
        const MOUNT = 0x001;
        const LOOKUP = 0x002;
        const FOLLOW_LINK = 0x004;
        const MKDIR = 0x008;
        const UNLINK = 0x010;
        const RENAME = 0x020;
        const CHMOD = 0x040;
    }
}

bitflags! {
    /// Handle operations a [`StreamOps`] implementation provides.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamCaps: u32 {
        const READ = 0x001;
        const WRITE = 0x002;
        const SEEK = 0x004;
        const MMAP = 0x008;
        const POLL = 0x010;
        const TRUNCATE = 0x020;
        const FLUSH = 0x040;
        const SET_BLOCKING = 0x080;
        const CHECKPOINT = 0x100;
        const MIGRATE = 0x200;
    }
}

/// Namespace operations of a filesystem backend.
///
/// All paths are relative to the mount root, with no leading slash; the mount
/// root itself is the empty string. Unimplemented methods must not be listed
/// in [`DirOps::caps`]; their default bodies fail with
/// [`VfsError::NotSupported`].
pub trait DirOps: Send + Sync {
    /// The operations this backend actually implements.
    fn caps(&self) -> DirCaps;

    /// Instantiate per-mount state for the given URI.
    fn mount(&self, _uri: &str) -> Result<Option<BackendData>> {
        Err(VfsError::NotSupported("mount"))
    }

    /// Report type and permissions of a node, or `NotFound` if it does not
    /// exist. `NotFound` is an answer, not a failure: the caller caches it
    /// as a negative entry.
    fn lookup(&self, _data: Option<&BackendData>, _rel_path: &str) -> Result<NodeInfo> {
        Err(VfsError::NotSupported("lookup"))
    }

    /// Read the target of a symbolic link.
    fn follow_link(&self, _data: Option<&BackendData>, _rel_path: &str) -> Result<String> {
        Err(VfsError::NotSupported("follow_link"))
    }

    fn mkdir(&self, _data: Option<&BackendData>, _rel_path: &str, _perm: u32) -> Result<()> {
        Err(VfsError::NotSupported("mkdir"))
    }

    /// Remove a node. `is_dir` tells the backend which flavor the caller
    /// checked for.
    fn unlink(&self, _data: Option<&BackendData>, _rel_path: &str, _is_dir: bool) -> Result<()> {
        Err(VfsError::NotSupported("unlink"))
    }

    /// Move a node within this mount. Both paths are mount-relative.
    fn rename(
        &self,
        _data: Option<&BackendData>,
        _old_rel: &str,
        _new_rel: &str,
    ) -> Result<()> {
        Err(VfsError::NotSupported("rename"))
    }

    fn chmod(&self, _data: Option<&BackendData>, _rel_path: &str, _perm: u32) -> Result<()> {
        Err(VfsError::NotSupported("chmod"))
    }
}

/// A memory window over part of a stream, returned by [`StreamOps::mmap`].
///
/// Writable regions propagate their content back to the stream when dropped.
pub trait MappedRegion: Send {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

impl fmt::Debug for dyn MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion").field("len", &self.len()).finish()
    }
}

/// Open-handle operations of a filesystem backend.
///
/// Per-handle state (cursor, device pointers) lives behind
/// [`VfsHandle::data`]; implementations downcast it to their own type.
pub trait StreamOps: Send + Sync {
    /// The operations this backend actually implements.
    fn caps(&self) -> StreamCaps;

    fn read(&self, _h: &VfsHandle, _buf: &mut [u8]) -> Result<usize> {
        Err(VfsError::NotSupported("read"))
    }

    fn write(&self, _h: &VfsHandle, _buf: &[u8]) -> Result<usize> {
        Err(VfsError::NotSupported("write"))
    }

    /// Reposition the handle cursor, returning the new absolute offset.
    fn seek(&self, _h: &VfsHandle, _pos: SeekFrom) -> Result<u64> {
        Err(VfsError::NotSupported("seek"))
    }

    /// Map `len` bytes starting at `offset`. Offset and length are already
    /// page-aligned by the caller.
    fn mmap(
        &self,
        _h: &VfsHandle,
        _offset: u64,
        _len: usize,
        _writable: bool,
    ) -> Result<Box<dyn MappedRegion>> {
        Err(VfsError::NotSupported("mmap"))
    }

    /// Report the total stream size.
    fn poll_size(&self, _h: &VfsHandle) -> Result<u64> {
        Err(VfsError::NotSupported("poll_size"))
    }

    fn truncate(&self, _h: &VfsHandle, _size: u64) -> Result<()> {
        Err(VfsError::NotSupported("truncate"))
    }

    fn flush(&self, _h: &VfsHandle) -> Result<()> {
        Err(VfsError::NotSupported("flush"))
    }

    /// Switch the underlying stream between blocking and non-blocking mode.
    fn set_blocking(&self, _h: &VfsHandle, _blocking: bool) -> Result<()> {
        Err(VfsError::NotSupported("set_blocking"))
    }

    /// Serialize per-mount state for a checkpoint image.
    fn checkpoint(&self, _data: Option<&BackendData>) -> Result<Vec<u8>> {
        Err(VfsError::NotSupported("checkpoint"))
    }

    /// Rebuild per-mount state from a checkpoint blob.
    fn migrate(&self, _blob: &[u8]) -> Result<Option<BackendData>> {
        Err(VfsError::NotSupported("migrate"))
    }
}

impl fmt::Debug for dyn StreamOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOps").field("caps", &self.caps()).finish()
    }
}

/// A named filesystem type: the unit the registry hands out and mounts refer
/// to.
pub struct FsType {
    name: String,
    d_ops: Option<Arc<dyn DirOps>>,
    fs_ops: Option<Arc<dyn StreamOps>>,
}

impl FsType {
    pub fn new(
        name: &str,
        d_ops: Option<Arc<dyn DirOps>>,
        fs_ops: Option<Arc<dyn StreamOps>>,
    ) -> Self {
        FsType {
            name: name.to_string(),
            d_ops,
            fs_ops,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn d_ops(&self) -> Option<&Arc<dyn DirOps>> {
        self.d_ops.as_ref()
    }

    pub fn fs_ops(&self) -> Option<&Arc<dyn StreamOps>> {
        self.fs_ops.as_ref()
    }

    /// Namespace capabilities, empty when there is no directory table.
    pub fn dir_caps(&self) -> DirCaps {
        self.d_ops.as_ref().map_or(DirCaps::empty(), |o| o.caps())
    }

    /// Stream capabilities, empty when there is no handle table.
    pub fn stream_caps(&self) -> StreamCaps {
        self.fs_ops.as_ref().map_or(StreamCaps::empty(), |o| o.caps())
    }
}

impl fmt::Debug for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsType")
            .field("name", &self.name)
            .field("dir_caps", &self.dir_caps())
            .field("stream_caps", &self.stream_caps())
            .finish()
    }
}

/// Filesystem type names wired up at startup.
pub const BUILTIN_FS_NAMES: &[&str] = &[
    "chroot", "proc", "dev", "sys", "tmp", "pipe", "fifo", "socket", "epoll", "eventfd",
];

/// Name-keyed registry of filesystem types.
///
/// Populated once at startup and then only read, including during restore,
/// where recorded names are resolved back to live types.
#[derive(Default)]
pub struct FsRegistry {
    types: HashMap<String, Arc<FsType>>,
}

impl FsRegistry {
    pub fn new() -> Self {
        FsRegistry {
            types: HashMap::new(),
        }
    }

    /// Register a type under its name. Re-registering a name replaces the
    /// previous entry.
    pub fn register(&mut self, fs: Arc<FsType>) {
        self.types.insert(fs.name().to_string(), fs);
    }

    pub fn find(&self, name: &str) -> Option<Arc<FsType>> {
        self.types.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }
}
