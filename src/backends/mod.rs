// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Built-in filesystem backends.
//!
//! `mem` is a complete read-write tree held in memory, used for `chroot`
//! and `tmp` mounts. `pseudo` serves an immutable tree of files, links and
//! directories described up front, used for `proc`, `dev` and `sys`. The
//! remaining built-in names are stream-only types with no directory
//! operations; they exist so handles can carry a filesystem identity, and
//! they cannot be mounted.

pub mod mem;
pub mod pseudo;

use std::sync::Arc;

use crate::fs::{FsRegistry, FsType};

use self::mem::MemFs;
use self::pseudo::{PseudoFs, PseudoNode};

/// Register every built-in filesystem type.
pub fn register_builtin_fs(registry: &mut FsRegistry) {
    registry.register(MemFs::fs_type("chroot"));
    registry.register(MemFs::fs_type("tmp"));

    registry.register(PseudoFs::fs_type("proc", proc_tree()));
    registry.register(PseudoFs::fs_type("dev", dev_tree()));
    registry.register(PseudoFs::fs_type("sys", sys_tree()));

    for name in ["pipe", "fifo", "socket", "epoll", "eventfd"] {
        registry.register(Arc::new(FsType::new(name, None, None)));
    }
}

fn proc_tree() -> PseudoNode {
    PseudoNode::dir(
        "",
        vec![
            PseudoNode::file("meminfo", 0o444),
            PseudoNode::file("cpuinfo", 0o444),
            PseudoNode::link("self", "1"),
            PseudoNode::dir(
                "1",
                vec![
                    PseudoNode::link("cwd", "/"),
                    PseudoNode::link("root", "/"),
                    PseudoNode::link("exe", "/"),
                ],
            ),
        ],
    )
}

fn dev_tree() -> PseudoNode {
    PseudoNode::dir(
        "",
        vec![
            PseudoNode::file("null", 0o666),
            PseudoNode::file("zero", 0o666),
            PseudoNode::file("random", 0o444),
            PseudoNode::file("urandom", 0o444),
        ],
    )
}

fn sys_tree() -> PseudoNode {
    PseudoNode::dir(
        "",
        vec![PseudoNode::dir(
            "devices",
            vec![PseudoNode::dir(
                "system",
                vec![
                    PseudoNode::dir("cpu", vec![PseudoNode::file("online", 0o444)]),
                    PseudoNode::dir("node", vec![PseudoNode::file("online", 0o444)]),
                ],
            )],
        )],
    )
}
