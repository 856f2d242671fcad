// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Read-only pseudo-filesystem backend.
//!
//! The whole tree is described up front as nested [`PseudoNode`] values and
//! never changes afterwards. Only lookup and link traversal are provided;
//! mutations fall back to the cache-local handling in the syscall layer.

use std::sync::Arc;

use crate::error::{Result, VfsError};
use crate::fs::{BackendData, DirCaps, DirOps, FileType, FsType, NodeInfo};

const DIR_PERM: u32 = 0o555;
const LINK_PERM: u32 = 0o777;

/// One node of a pseudo tree.
pub struct PseudoNode {
    name: String,
    kind: PseudoKind,
}

enum PseudoKind {
    Dir { children: Vec<PseudoNode> },
    File { perm: u32 },
    Link { target: String },
}

impl PseudoNode {
    pub fn dir(name: &str, children: Vec<PseudoNode>) -> Self {
        PseudoNode {
            name: name.to_string(),
            kind: PseudoKind::Dir { children },
        }
    }

    pub fn file(name: &str, perm: u32) -> Self {
        PseudoNode {
            name: name.to_string(),
            kind: PseudoKind::File { perm },
        }
    }

    pub fn link(name: &str, target: &str) -> Self {
        PseudoNode {
            name: name.to_string(),
            kind: PseudoKind::Link {
                target: target.to_string(),
            },
        }
    }
}

pub struct PseudoFs {
    root: PseudoNode,
}

impl PseudoFs {
    pub fn fs_type(name: &str, root: PseudoNode) -> Arc<FsType> {
        Arc::new(FsType::new(name, Some(Arc::new(PseudoFs { root })), None))
    }

    fn find(&self, rel_path: &str) -> Option<&PseudoNode> {
        let mut node = &self.root;
        for comp in rel_path.split('/').filter(|c| !c.is_empty()) {
            match &node.kind {
                PseudoKind::Dir { children } => {
                    node = children.iter().find(|c| c.name == comp)?;
                }
                _ => return None,
            }
        }
        Some(node)
    }
}

impl DirOps for PseudoFs {
    fn caps(&self) -> DirCaps {
        DirCaps::MOUNT | DirCaps::LOOKUP | DirCaps::FOLLOW_LINK
    }

    fn mount(&self, _uri: &str) -> Result<Option<BackendData>> {
        // The tree lives in the backend itself; mounts carry no state.
        Ok(None)
    }

    fn lookup(&self, _data: Option<&BackendData>, rel_path: &str) -> Result<NodeInfo> {
        match self.find(rel_path) {
            Some(node) => Ok(match &node.kind {
                PseudoKind::Dir { .. } => NodeInfo {
                    file_type: FileType::Directory,
                    perm: DIR_PERM,
                },
                PseudoKind::File { perm } => NodeInfo {
                    file_type: FileType::Regular,
                    perm: *perm,
                },
                PseudoKind::Link { .. } => NodeInfo {
                    file_type: FileType::Symlink,
                    perm: LINK_PERM,
                },
            }),
            None => Err(VfsError::NotFound(rel_path.to_string())),
        }
    }

    fn follow_link(&self, _data: Option<&BackendData>, rel_path: &str) -> Result<String> {
        match self.find(rel_path) {
            Some(PseudoNode {
                kind: PseudoKind::Link { target },
                ..
            }) => Ok(target.clone()),
            Some(_) => Err(VfsError::InvalidArgument(rel_path.to_string())),
            None => Err(VfsError::NotFound(rel_path.to_string())),
        }
    }
}
