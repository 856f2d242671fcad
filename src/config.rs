// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Manifest-driven startup: root filesystem, system pseudo-filesystems and
//! manifest mounts, plus initial process attributes.

use std::collections::BTreeMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VfsError};
use crate::mount::mount_fs;
use crate::namei::{self, LookupFlags};
use crate::Vfs;

/// Top level of the manifest. Only the `fs` table is interpreted here.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Manifest {
    #[serde(default)]
    pub fs: FsConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FsConfig {
    #[serde(default)]
    pub root: Option<RootConfig>,
    /// Keyed by an arbitrary label; order of application is by mount path
    /// length so parents attach before children.
    #[serde(default)]
    pub mount: BTreeMap<String, MountConfig>,
    #[serde(default)]
    pub start_dir: Option<String>,
    #[serde(default)]
    pub umask: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RootConfig {
    #[serde(rename = "type", default)]
    pub fs_type: String,
    #[serde(default)]
    pub uri: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MountConfig {
    #[serde(rename = "type", default)]
    pub fs_type: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub uri: String,
}

impl Manifest {
    pub fn from_str(input: &str) -> anyhow::Result<Manifest> {
        toml::from_str(input).context("failed to parse manifest")
    }
}

/// Full startup sequence: umask, root mount, system mounts, manifest
/// mounts and the starting directory.
pub fn init_fs(vfs: &Vfs, cfg: &FsConfig) -> Result<()> {
    let logger = vfs.logger().new(o!("subsystem" => "fs-init"));
    info!(logger, "initializing filesystems");

    if let Some(mask) = cfg.umask {
        vfs.process().set_umask(mask);
    }
    init_mount_root(vfs, cfg)?;
    init_mounts(vfs, cfg)?;
    Ok(())
}

/// Mount the root filesystem and the built-in system filesystems, then
/// point the process root and working directory at the cache root. Skipped
/// entirely after a migration, which restores the table instead.
pub fn init_mount_root(vfs: &Vfs, cfg: &FsConfig) -> Result<()> {
    if vfs.migrated() {
        return Ok(());
    }

    let (root_type, root_uri) = match &cfg.root {
        Some(r) if !r.fs_type.is_empty() && !r.uri.is_empty() => {
            (r.fs_type.as_str(), r.uri.as_str())
        }
        _ => ("chroot", "file:"),
    };
    let root = mount_fs(vfs, root_type, root_uri, "/", None, false)?;

    mount_fs(vfs, "proc", "", "/proc", Some(root), false)?;
    let dev = mount_fs(vfs, "dev", "", "/dev", Some(root), false)?;
    mount_fs(vfs, "chroot", "dev:tty", "/dev/tty", Some(dev), false)?;
    mount_fs(vfs, "sys", "", "/sys", Some(root), false)?;

    let mut st = vfs.dcache().lock();
    let r = st.root();
    if vfs.process().root().is_none() {
        st.get(r);
        vfs.process().set_root(r);
    }
    if vfs.process().cwd().is_none() {
        st.get(r);
        vfs.process().set_cwd(r);
    }
    Ok(())
}

/// Attach the manifest mounts, shortest path first, and move to
/// `start_dir` when one is configured. Skipped after a migration.
pub fn init_mounts(vfs: &Vfs, cfg: &FsConfig) -> Result<()> {
    if vfs.migrated() {
        return Ok(());
    }

    let mut entries: Vec<(&String, &MountConfig)> = cfg.mount.iter().collect();
    for (key, m) in &entries {
        if m.fs_type.is_empty() || m.path.is_empty() || m.uri.is_empty() {
            return Err(VfsError::InvalidArgument(format!(
                "mount {:?} needs type, path and uri",
                key
            )));
        }
        if m.path == "/" {
            return Err(VfsError::AlreadyExists(m.path.clone()));
        }
        if m.path == "." || m.path == ".." {
            return Err(VfsError::InvalidArgument(format!(
                "mount {:?} path must not be {:?}",
                key, m.path
            )));
        }
    }
    // Parents before children; ties stay in key order.
    entries.sort_by_key(|(_, m)| m.path.len());

    for (_, m) in entries {
        mount_fs(vfs, &m.fs_type, &m.uri, &m.path, None, true)?;
    }

    if let Some(dir) = &cfg.start_dir {
        let mut st = vfs.dcache().lock();
        let dent = namei::path_lookupat_locked(
            vfs,
            &mut st,
            None,
            dir,
            LookupFlags::FOLLOW | LookupFlags::DIRECTORY,
        )?;
        if let Some(old) = vfs.process().set_cwd(dent) {
            st.put(old);
        }
    }
    Ok(())
}
