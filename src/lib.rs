// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Virtual filesystem core for a library OS.
//!
//! The crate keeps a single namespace assembled from mounted filesystem
//! backends. Paths resolve through a dentry cache that remembers positive
//! and negative answers; mounts graft backend trees onto cache entries;
//! mutation syscalls update cache and backend together. The whole mount
//! configuration can be checkpointed to a byte image and restored in a new
//! process.
//!
//! [`Vfs`] owns the four pieces of global state and is the handle every
//! operation takes: the filesystem type registry, the dentry cache, the
//! mount table and the per-process view (root, working directory, umask).

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate scopeguard;
#[macro_use]
extern crate slog;

pub mod backends;
pub mod checkpoint;
pub mod config;
pub mod copy;
pub mod dcache;
pub mod error;
pub mod fs;
pub mod handle;
pub mod logging;
pub mod mount;
pub mod namei;
pub mod process;
pub mod syscall;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::dcache::Dcache;
use crate::fs::FsRegistry;
use crate::mount::MountTable;
use crate::process::ProcessFs;

pub use crate::error::{Result, VfsError};

/// Shared state of one filesystem namespace.
pub struct Vfs {
    logger: slog::Logger,
    registry: FsRegistry,
    dcache: Dcache,
    mounts: MountTable,
    process: ProcessFs,
    migrated: AtomicBool,
}

impl Vfs {
    /// Build an empty namespace over the given registry. Nothing is mounted
    /// until [`config::init_fs`] or [`checkpoint::restore_mounts`] runs.
    pub fn new(registry: FsRegistry, logger: &slog::Logger) -> Self {
        Vfs {
            logger: logger.new(o!("subsystem" => "vfs")),
            registry,
            dcache: Dcache::new(),
            mounts: MountTable::new(),
            process: ProcessFs::new(),
            migrated: AtomicBool::new(false),
        }
    }

    pub fn logger(&self) -> &slog::Logger {
        &self.logger
    }

    pub fn registry(&self) -> &FsRegistry {
        &self.registry
    }

    pub fn dcache(&self) -> &Dcache {
        &self.dcache
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    pub fn process(&self) -> &ProcessFs {
        &self.process
    }

    /// Whether this namespace was rebuilt from a checkpoint image. Startup
    /// mounting is skipped for migrated namespaces.
    pub fn migrated(&self) -> bool {
        self.migrated.load(Ordering::Acquire)
    }

    pub fn set_migrated(&self, migrated: bool) {
        self.migrated.store(migrated, Ordering::Release);
    }
}
