// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Checkpoint and restore of the mount configuration.
//!
//! The image is a run of fixed-size little-endian records followed by a
//! payload region holding strings and backend blobs. Offsets inside records
//! are relative to the image base, so the reader only needs the byte slice.
//! A zero record terminates the run; reading it marks the process as
//! migrated, which disables the normal startup mounts.
//!
//! Restore does not replay dentries: each recorded mount is re-attached by
//! resolving its path with synthetic intermediates allowed, then the
//! recorded state of the mount-point entry is applied on top.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::dcache::DentryState;
use crate::error::{Result, VfsError};
use crate::fs::{FileType, StreamCaps};
use crate::mount::{attach_mount_locked, Mount};
use crate::namei::{self, LookupFlags};
use crate::Vfs;

const REC_MOUNT: u32 = 1;
const REC_END: u32 = 0;

/// Fields of one on-image record, all `u32`.
const REC_WORDS: usize = 12;
const REC_SIZE: usize = REC_WORDS * 4;

/// Serialize the mount table, in attach order, into a restorable image.
///
/// Backends with the `CHECKPOINT` capability contribute a private blob per
/// mount; filesystem types are recorded by name, deduplicated across
/// mounts.
pub fn checkpoint_mounts(vfs: &Vfs) -> Result<Vec<u8>> {
    let logger = vfs.logger().new(o!("subsystem" => "checkpoint"));
    let snapshot = vfs.mounts().snapshot();
    info!(logger, "checkpointing {} mounts", snapshot.len());

    let mut records: Vec<[u32; REC_WORDS]> = Vec::with_capacity(snapshot.len() + 1);
    let mut payload: Vec<u8> = Vec::new();
    let mut fs_names: HashMap<usize, (u32, u32)> = HashMap::new();

    let st = vfs.dcache().lock();
    for (_, mount) in &snapshot {
        let fs = mount.fs();
        let fs_key = Arc::as_ptr(fs) as *const () as usize;
        let (name_off, name_len) = match fs_names.get(&fs_key) {
            Some(entry) => *entry,
            None => {
                let entry = push_bytes(&mut payload, fs.name().as_bytes());
                fs_names.insert(fs_key, entry);
                entry
            }
        };

        let blob = if fs.stream_caps().contains(StreamCaps::CHECKPOINT) {
            match fs.fs_ops() {
                Some(ops) => ops.checkpoint(mount.data())?,
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let (path_off, path_len) = push_bytes(&mut payload, mount.path().as_bytes());
        let (uri_off, uri_len) = push_bytes(&mut payload, mount.uri().as_bytes());
        let (blob_off, blob_len) = push_bytes(&mut payload, &blob);

        let node = st.node(mount.mount_point());
        records.push([
            REC_MOUNT,
            name_off,
            name_len,
            path_off,
            path_len,
            uri_off,
            uri_len,
            blob_off,
            blob_len,
            node.state.bits(),
            node.file_type.map_or(0, |t| t.as_mode()),
            node.perm,
        ]);
    }
    drop(st);
    records.push([REC_END; REC_WORDS]);

    // Rebase payload offsets past the record region.
    let base = (records.len() * REC_SIZE) as u32;
    let mut image = Vec::with_capacity(base as usize + payload.len());
    for rec in &mut records {
        for field in [1, 3, 5, 7] {
            if rec[field + 1] > 0 {
                rec[field] += base;
            }
        }
        for word in rec.iter() {
            image.extend_from_slice(&word.to_le_bytes());
        }
    }
    image.extend_from_slice(&payload);
    Ok(image)
}

fn push_bytes(payload: &mut Vec<u8>, bytes: &[u8]) -> (u32, u32) {
    let off = payload.len() as u32;
    payload.extend_from_slice(bytes);
    (off, bytes.len() as u32)
}

/// Rebuild the mount table from `image`, returning how many mounts were
/// attached. On success the process is marked migrated.
pub fn restore_mounts(vfs: &Vfs, image: &[u8]) -> Result<usize> {
    let logger = vfs.logger().new(o!("subsystem" => "checkpoint"));
    let mut cursor = Cursor::new(image);
    let mut restored = 0;

    loop {
        let rec = read_record(&mut cursor)?;
        if rec[0] == REC_END {
            break;
        }
        if rec[0] != REC_MOUNT {
            return Err(VfsError::InvalidArgument(format!(
                "unknown checkpoint record tag {}",
                rec[0]
            )));
        }

        let name = str_at(image, rec[1], rec[2])?;
        let path = str_at(image, rec[3], rec[4])?;
        let uri = str_at(image, rec[5], rec[6])?;
        let blob = bytes_at(image, rec[7], rec[8])?;
        restore_one(vfs, name, path, uri, blob, rec[9], rec[10], rec[11])?;
        info!(logger, "restored {} mount on {:?}", name, path);
        restored += 1;
    }

    vfs.set_migrated(true);
    Ok(restored)
}

#[allow(clippy::too_many_arguments)]
fn restore_one(
    vfs: &Vfs,
    name: &str,
    path: &str,
    uri: &str,
    blob: &[u8],
    mp_state: u32,
    mp_type: u32,
    mp_perm: u32,
) -> Result<()> {
    let fs = vfs
        .registry()
        .find(name)
        .ok_or_else(|| VfsError::InvalidArgument(format!("no filesystem type {:?}", name)))?;

    let data = if !blob.is_empty() && fs.stream_caps().contains(StreamCaps::MIGRATE) {
        match fs.fs_ops() {
            Some(ops) => ops.migrate(blob)?,
            None => None,
        }
    } else {
        None
    };

    let mut st = vfs.dcache().lock();
    let root = st.root();
    let dent = if path.trim_matches('/').is_empty() {
        st.get(root);
        root
    } else {
        namei::path_lookupat_locked(
            vfs,
            &mut st,
            Some(root),
            path,
            LookupFlags::CREATE | LookupFlags::MAKE_SYNTHETIC,
        )?
    };

    let mount_id = vfs.mounts().next_id();
    let mount = Arc::new(Mount::new(path, uri, fs.clone(), data, dent));
    let pushed = vfs.mounts().push(mount);
    debug_assert_eq!(pushed, mount_id);
    attach_mount_locked(&mut st, dent, mount_id, &fs);

    let node = st.node_mut(dent);
    let mut recorded = DentryState::from_bits_truncate(mp_state);
    recorded.remove(DentryState::NEGATIVE);
    node.state.insert(recorded);
    if mp_type != 0 {
        node.file_type = Some(FileType::from_mode(mp_type));
    }
    node.perm = mp_perm;

    st.put(dent);
    Ok(())
}

fn read_record(cursor: &mut Cursor<&[u8]>) -> Result<[u32; REC_WORDS]> {
    let mut rec = [0u32; REC_WORDS];
    for word in rec.iter_mut() {
        *word = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| VfsError::InvalidArgument("truncated checkpoint image".to_string()))?;
    }
    Ok(rec)
}

fn bytes_at(image: &[u8], off: u32, len: u32) -> Result<&[u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    image
        .get(off as usize..off as usize + len as usize)
        .ok_or_else(|| VfsError::InvalidArgument("checkpoint offset out of range".to_string()))
}

fn str_at(image: &[u8], off: u32, len: u32) -> Result<&str> {
    std::str::from_utf8(bytes_at(image, off, len)?)
        .map_err(|_| VfsError::InvalidArgument("checkpoint string not utf-8".to_string()))
}
