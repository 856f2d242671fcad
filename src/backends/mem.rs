// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! In-memory read-write filesystem.
//!
//! Each mount gets its own [`MemTree`]: a flat map from mount-relative path
//! to entry, where the empty path is the root directory and always exists.
//! The full directory and stream tables are implemented, including
//! checkpoint and migrate, so this backend exercises every capability the
//! core dispatches on.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, SeekFrom};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Result, VfsError};
use crate::fs::{
    BackendData, DirCaps, DirOps, FileType, FsType, MappedRegion, NodeInfo, StreamCaps, StreamOps,
};
use crate::handle::{OpenFlags, VfsHandle};
use crate::namei::{self, LookupFlags};
use crate::Vfs;

const TAG_DIR: u8 = 1;
const TAG_FILE: u8 = 2;
const TAG_LINK: u8 = 3;

/// Contents of one regular file. Handles and the tree share it, so data
/// outlives an unlink while a handle is still open.
pub struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl MemFile {
    fn new(bytes: &[u8]) -> Arc<MemFile> {
        Arc::new(MemFile {
            data: Mutex::new(bytes.to_vec()),
        })
    }
}

enum MemEntry {
    Dir { perm: u32 },
    File { perm: u32, file: Arc<MemFile> },
    Link { target: String },
}

/// One mount's worth of files, keyed by mount-relative path.
pub struct MemTree {
    entries: Mutex<BTreeMap<String, MemEntry>>,
}

impl Default for MemTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTree {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(String::new(), MemEntry::Dir { perm: 0o755 });
        MemTree {
            entries: Mutex::new(entries),
        }
    }

    /// Create every missing directory along `path`.
    pub fn mkdir_p(&self, path: &str, perm: u32) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let mut prefix = String::new();
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(comp);
            match entries.get(&prefix) {
                None => {
                    entries.insert(prefix.clone(), MemEntry::Dir { perm });
                }
                Some(MemEntry::Dir { .. }) => {}
                Some(_) => return Err(VfsError::NotDirectory(prefix)),
            }
        }
        Ok(())
    }

    /// Create or replace a regular file. The parent directory must exist.
    pub fn put_file(&self, path: &str, bytes: &[u8], perm: u32) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        ensure_parent(&entries, path)?;
        if let Some(MemEntry::Dir { .. }) = entries.get(path) {
            return Err(VfsError::IsDirectory(path.to_string()));
        }
        entries.insert(
            path.to_string(),
            MemEntry::File {
                perm,
                file: MemFile::new(bytes),
            },
        );
        Ok(())
    }

    /// Create or replace a symbolic link. The parent directory must exist.
    pub fn put_link(&self, path: &str, target: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        ensure_parent(&entries, path)?;
        if let Some(MemEntry::Dir { .. }) = entries.get(path) {
            return Err(VfsError::IsDirectory(path.to_string()));
        }
        entries.insert(
            path.to_string(),
            MemEntry::Link {
                target: target.to_string(),
            },
        );
        Ok(())
    }

    /// Type and permissions of an entry, if it exists.
    pub fn lookup_entry(&self, rel_path: &str) -> Option<(FileType, u32)> {
        let entries = self.entries.lock().unwrap();
        entries.get(rel_path).map(|e| match e {
            MemEntry::Dir { perm } => (FileType::Directory, *perm),
            MemEntry::File { perm, .. } => (FileType::Regular, *perm),
            MemEntry::Link { .. } => (FileType::Symlink, 0o777),
        })
    }

    pub fn read_file(&self, rel_path: &str) -> Result<Vec<u8>> {
        let file = self.open_file(rel_path)?;
        let data = file.data.lock().unwrap();
        Ok(data.clone())
    }

    /// The shared contents of a regular file.
    pub fn open_file(&self, rel_path: &str) -> Result<Arc<MemFile>> {
        let entries = self.entries.lock().unwrap();
        match entries.get(rel_path) {
            Some(MemEntry::File { file, .. }) => Ok(file.clone()),
            Some(MemEntry::Dir { .. }) => Err(VfsError::IsDirectory(rel_path.to_string())),
            Some(MemEntry::Link { .. }) => {
                Err(VfsError::InvalidArgument(rel_path.to_string()))
            }
            None => Err(VfsError::NotFound(rel_path.to_string())),
        }
    }

    fn checkpoint_bytes(&self) -> Vec<u8> {
        let entries = self.entries.lock().unwrap();
        let mut out = Vec::new();
        for (path, entry) in entries.iter() {
            let (tag, perm, payload): (u8, u32, Vec<u8>) = match entry {
                MemEntry::Dir { perm } => (TAG_DIR, *perm, Vec::new()),
                MemEntry::File { perm, file } => {
                    (TAG_FILE, *perm, file.data.lock().unwrap().clone())
                }
                MemEntry::Link { target } => (TAG_LINK, 0, target.as_bytes().to_vec()),
            };
            out.push(tag);
            out.extend_from_slice(&(path.len() as u32).to_le_bytes());
            out.extend_from_slice(path.as_bytes());
            out.extend_from_slice(&perm.to_le_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&payload);
        }
        out
    }

    fn from_blob(blob: &[u8]) -> Result<MemTree> {
        let mut entries = BTreeMap::new();
        let mut cursor = Cursor::new(blob);
        while (cursor.position() as usize) < blob.len() {
            let tag = cursor.read_u8().map_err(|_| truncated())?;
            let path = String::from_utf8(read_chunk(&mut cursor)?)
                .map_err(|_| VfsError::InvalidArgument("image path not utf-8".to_string()))?;
            let perm = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())?;
            let payload = read_chunk(&mut cursor)?;
            let entry = match tag {
                TAG_DIR => MemEntry::Dir { perm },
                TAG_FILE => MemEntry::File {
                    perm,
                    file: MemFile::new(&payload),
                },
                TAG_LINK => MemEntry::Link {
                    target: String::from_utf8(payload).map_err(|_| {
                        VfsError::InvalidArgument("image link target not utf-8".to_string())
                    })?,
                },
                other => {
                    return Err(VfsError::InvalidArgument(format!(
                        "unknown image entry tag {}",
                        other
                    )))
                }
            };
            entries.insert(path, entry);
        }
        entries
            .entry(String::new())
            .or_insert(MemEntry::Dir { perm: 0o755 });
        Ok(MemTree {
            entries: Mutex::new(entries),
        })
    }
}

fn parent_of(rel_path: &str) -> &str {
    rel_path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

fn ensure_parent(entries: &BTreeMap<String, MemEntry>, rel_path: &str) -> Result<()> {
    let parent = parent_of(rel_path);
    match entries.get(parent) {
        Some(MemEntry::Dir { .. }) => Ok(()),
        Some(_) => Err(VfsError::NotDirectory(parent.to_string())),
        None => Err(VfsError::NotFound(parent.to_string())),
    }
}

fn has_descendants(entries: &BTreeMap<String, MemEntry>, rel_path: &str) -> bool {
    let prefix = format!("{}/", rel_path);
    entries.range(prefix.clone()..).next().map_or(false, |(k, _)| k.starts_with(&prefix))
}

fn truncated() -> VfsError {
    VfsError::InvalidArgument("truncated filesystem image".to_string())
}

fn read_chunk(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).map_err(|_| truncated())?;
    Ok(buf)
}

fn tree_of(data: Option<&BackendData>) -> Result<&MemTree> {
    data.and_then(|d| d.downcast_ref::<MemTree>())
        .ok_or_else(|| VfsError::InvalidArgument("no backend state".to_string()))
}

/// The backend itself; one instance serves every mount of its type.
pub struct MemFs;

impl MemFs {
    pub fn fs_type(name: &str) -> Arc<FsType> {
        let ops = Arc::new(MemFs);
        Arc::new(FsType::new(name, Some(ops.clone()), Some(ops)))
    }
}

impl DirOps for MemFs {
    fn caps(&self) -> DirCaps {
        DirCaps::MOUNT
            | DirCaps::LOOKUP
            | DirCaps::FOLLOW_LINK
            | DirCaps::MKDIR
            | DirCaps::UNLINK
            | DirCaps::RENAME
            | DirCaps::CHMOD
    }

    fn mount(&self, _uri: &str) -> Result<Option<BackendData>> {
        Ok(Some(Arc::new(MemTree::new())))
    }

    fn lookup(&self, data: Option<&BackendData>, rel_path: &str) -> Result<NodeInfo> {
        let tree = tree_of(data)?;
        tree.lookup_entry(rel_path)
            .map(|(file_type, perm)| NodeInfo { file_type, perm })
            .ok_or_else(|| VfsError::NotFound(rel_path.to_string()))
    }

    fn follow_link(&self, data: Option<&BackendData>, rel_path: &str) -> Result<String> {
        let tree = tree_of(data)?;
        let entries = tree.entries.lock().unwrap();
        match entries.get(rel_path) {
            Some(MemEntry::Link { target }) => Ok(target.clone()),
            Some(_) => Err(VfsError::InvalidArgument(rel_path.to_string())),
            None => Err(VfsError::NotFound(rel_path.to_string())),
        }
    }

    fn mkdir(&self, data: Option<&BackendData>, rel_path: &str, perm: u32) -> Result<()> {
        let tree = tree_of(data)?;
        let mut entries = tree.entries.lock().unwrap();
        if entries.contains_key(rel_path) {
            return Err(VfsError::AlreadyExists(rel_path.to_string()));
        }
        ensure_parent(&entries, rel_path)?;
        entries.insert(rel_path.to_string(), MemEntry::Dir { perm });
        Ok(())
    }

    fn unlink(&self, data: Option<&BackendData>, rel_path: &str, is_dir: bool) -> Result<()> {
        if rel_path.is_empty() {
            return Err(VfsError::InvalidArgument("unlink of mount root".to_string()));
        }
        let tree = tree_of(data)?;
        let mut entries = tree.entries.lock().unwrap();
        match entries.get(rel_path) {
            Some(MemEntry::Dir { .. }) => {
                if !is_dir {
                    return Err(VfsError::IsDirectory(rel_path.to_string()));
                }
                if has_descendants(&entries, rel_path) {
                    return Err(VfsError::NotEmpty(rel_path.to_string()));
                }
            }
            Some(_) => {
                if is_dir {
                    return Err(VfsError::NotDirectory(rel_path.to_string()));
                }
            }
            None => return Err(VfsError::NotFound(rel_path.to_string())),
        }
        entries.remove(rel_path);
        Ok(())
    }

    fn rename(&self, data: Option<&BackendData>, old_rel: &str, new_rel: &str) -> Result<()> {
        if old_rel.is_empty() || new_rel.is_empty() {
            return Err(VfsError::InvalidArgument("rename of mount root".to_string()));
        }
        let tree = tree_of(data)?;
        let mut entries = tree.entries.lock().unwrap();
        if !entries.contains_key(old_rel) {
            return Err(VfsError::NotFound(old_rel.to_string()));
        }
        if let Some(MemEntry::Dir { .. }) = entries.get(new_rel) {
            if has_descendants(&entries, new_rel) {
                return Err(VfsError::NotEmpty(new_rel.to_string()));
            }
        }
        entries.remove(new_rel);

        let prefix = format!("{}/", old_rel);
        let moving: Vec<String> = entries
            .keys()
            .filter(|k| *k == old_rel || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moving {
            if let Some(entry) = entries.remove(&key) {
                let renamed = format!("{}{}", new_rel, &key[old_rel.len()..]);
                entries.insert(renamed, entry);
            }
        }
        Ok(())
    }

    fn chmod(&self, data: Option<&BackendData>, rel_path: &str, perm: u32) -> Result<()> {
        let tree = tree_of(data)?;
        let mut entries = tree.entries.lock().unwrap();
        match entries.get_mut(rel_path) {
            Some(MemEntry::Dir { perm: p }) => *p = perm,
            Some(MemEntry::File { perm: p, .. }) => *p = perm,
            Some(MemEntry::Link { .. }) => {}
            None => return Err(VfsError::NotFound(rel_path.to_string())),
        }
        Ok(())
    }
}

/// Per-handle state: the shared file plus a cursor.
pub struct MemHandle {
    file: Arc<MemFile>,
    pos: Mutex<u64>,
}

impl MemHandle {
    pub fn new(file: Arc<MemFile>) -> Self {
        MemHandle {
            file,
            pos: Mutex::new(0),
        }
    }
}

fn state_of(h: &VfsHandle) -> Result<&MemHandle> {
    h.data_as::<MemHandle>()
        .ok_or_else(|| VfsError::InvalidArgument(h.path().to_string()))
}

struct MemRegion {
    file: Arc<MemFile>,
    offset: u64,
    buf: Vec<u8>,
    writable: bool,
}

impl MappedRegion for MemRegion {
    fn len(&self) -> usize {
        self.buf.len()
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for MemRegion {
    fn drop(&mut self) {
        if !self.writable {
            return;
        }
        let mut data = self.file.data.lock().unwrap();
        let off = self.offset as usize;
        let end = off + self.buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[off..end].copy_from_slice(&self.buf);
    }
}

impl StreamOps for MemFs {
    fn caps(&self) -> StreamCaps {
        StreamCaps::READ
            | StreamCaps::WRITE
            | StreamCaps::SEEK
            | StreamCaps::MMAP
            | StreamCaps::POLL
            | StreamCaps::TRUNCATE
            | StreamCaps::FLUSH
            | StreamCaps::SET_BLOCKING
            | StreamCaps::CHECKPOINT
            | StreamCaps::MIGRATE
    }

    fn read(&self, h: &VfsHandle, buf: &mut [u8]) -> Result<usize> {
        let state = state_of(h)?;
        let mut pos = state.pos.lock().unwrap();
        let data = state.file.data.lock().unwrap();
        let start = *pos as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        *pos += n as u64;
        Ok(n)
    }

    fn write(&self, h: &VfsHandle, buf: &[u8]) -> Result<usize> {
        let state = state_of(h)?;
        let mut pos = state.pos.lock().unwrap();
        let mut data = state.file.data.lock().unwrap();
        if h.flags().contains(OpenFlags::APPEND) {
            *pos = data.len() as u64;
        }
        let start = *pos as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        *pos = end as u64;
        Ok(buf.len())
    }

    fn seek(&self, h: &VfsHandle, pos: SeekFrom) -> Result<u64> {
        let state = state_of(h)?;
        let mut cursor = state.pos.lock().unwrap();
        let base = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => *cursor as i64 + delta,
            SeekFrom::End(delta) => {
                let len = state.file.data.lock().unwrap().len();
                len as i64 + delta
            }
        };
        set_cursor(&mut cursor, base)
    }

    fn mmap(
        &self,
        h: &VfsHandle,
        offset: u64,
        len: usize,
        writable: bool,
    ) -> Result<Box<dyn MappedRegion>> {
        let state = state_of(h)?;
        let data = state.file.data.lock().unwrap();
        let size = data.len();
        if offset as usize >= size {
            return Err(VfsError::InvalidArgument(format!(
                "mmap at {} beyond end {}",
                offset, size
            )));
        }
        let start = offset as usize;
        let n = len.min(size - start);
        let buf = data[start..start + n].to_vec();
        drop(data);
        Ok(Box::new(MemRegion {
            file: state.file.clone(),
            offset,
            buf,
            writable,
        }))
    }

    fn poll_size(&self, h: &VfsHandle) -> Result<u64> {
        let state = state_of(h)?;
        let data = state.file.data.lock().unwrap();
        Ok(data.len() as u64)
    }

    fn truncate(&self, h: &VfsHandle, size: u64) -> Result<()> {
        let state = state_of(h)?;
        let mut data = state.file.data.lock().unwrap();
        data.resize(size as usize, 0);
        Ok(())
    }

    fn flush(&self, _h: &VfsHandle) -> Result<()> {
        Ok(())
    }

    fn set_blocking(&self, _h: &VfsHandle, _blocking: bool) -> Result<()> {
        // Memory never blocks; accepting the call keeps the copy engine's
        // demotion protocol uniform across backends.
        Ok(())
    }

    fn checkpoint(&self, data: Option<&BackendData>) -> Result<Vec<u8>> {
        Ok(tree_of(data)?.checkpoint_bytes())
    }

    fn migrate(&self, blob: &[u8]) -> Result<Option<BackendData>> {
        Ok(Some(Arc::new(MemTree::from_blob(blob)?)))
    }
}

fn set_cursor(cursor: &mut u64, target: i64) -> Result<u64> {
    if target < 0 {
        return Err(VfsError::InvalidArgument("seek before start".to_string()));
    }
    *cursor = target as u64;
    Ok(*cursor)
}

/// Resolve `path` and open the regular file behind it.
///
/// The lookup reference moves into the handle, so the dentry stays pinned
/// for the handle's lifetime.
pub fn open_path(vfs: &Vfs, path: &str, flags: OpenFlags) -> Result<VfsHandle> {
    let dent = namei::path_lookupat(vfs, None, path, LookupFlags::FOLLOW)?;

    let mut st = vfs.dcache().lock();
    let (fs, mount, rel) = {
        let node = st.node(dent);
        (node.fs.clone(), node.mount, st.rel_path(dent))
    };
    let fs = match fs {
        Some(f) => f,
        None => {
            st.put(dent);
            return Err(VfsError::InvalidArgument(path.to_string()));
        }
    };
    drop(st);

    let data = mount.and_then(|id| vfs.mounts().data_of(id));
    let file = match tree_of(data.as_ref()).and_then(|tree| tree.open_file(&rel)) {
        Ok(f) => f,
        Err(e) => {
            vfs.dcache().lock().put(dent);
            return Err(e);
        }
    };

    Ok(VfsHandle::new(
        fs,
        Some(dent),
        path,
        flags,
        Box::new(MemHandle::new(file)),
    ))
}
