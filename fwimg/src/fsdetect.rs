// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Filesystem detection and the FS-agnostic file handle.
//!
//! One 4 KiB header read is enough to tell the three containers apart -
//! the magics sit at different offsets, so there is no ambiguity. Sparse
//! images are expanded transparently and re-detected, which is how a
//! sparse EXT4 `system.img` ends up readable through the same handle as a
//! raw EROFS dump.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::erofs::{EROFS_MAGIC, ErofsReader};
use crate::ext4::{EXT4_MAGIC, Ext4Reader};
use crate::source::SharedSource;
use crate::sparse::{SPARSE_MAGIC, SparseReader};
use crate::{ParseError, Result};

/// Paths tried, in order, when no explicit path is given.
pub const BUILD_PROP_PATHS: [&str; 4] = [
    "/build.prop",
    "/system/build.prop",
    "/etc/build.prop",
    "/vendor/build.prop",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Sparse,
    Erofs,
    Ext4,
}

impl std::fmt::Debug for dyn FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<dyn FileSystem>")
    }
}

/// What a filesystem reader owes the orchestration layer.
pub trait FileSystem: Send + Sync {
    fn read_file(&self, path: &str) -> Option<Vec<u8>>;
    fn list_dir(&self, path: &str) -> Option<Vec<String>>;
    fn exists(&self, path: &str) -> bool;

    /// Read `build.prop`, retrying the well-known locations on a miss.
    fn read_build_prop(&self, path: Option<&str>) -> Option<Vec<u8>> {
        if let Some(p) = path
            && let Some(data) = self.read_file(p)
        {
            return Some(data);
        }
        BUILD_PROP_PATHS.iter().find_map(|p| self.read_file(p))
    }
}

/// Classify a 4 KiB header. `None` when nothing matches.
pub fn detect_fs_kind(header: &[u8]) -> Option<FsKind> {
    if header.len() >= 4 && LittleEndian::read_u32(&header[0..4]) == SPARSE_MAGIC {
        return Some(FsKind::Sparse);
    }
    if header.len() >= 1028 && LittleEndian::read_u32(&header[1024..1028]) == EROFS_MAGIC {
        return Some(FsKind::Erofs);
    }
    if header.len() >= 1082 && LittleEndian::read_u16(&header[1080..1082]) == EXT4_MAGIC {
        return Some(FsKind::Ext4);
    }
    None
}

/// Detect and open whatever filesystem `source` holds. Sparse containers
/// are expanded and the expansion re-detected (once - nested sparse is
/// not a thing).
pub fn open_filesystem(source: SharedSource) -> Result<Box<dyn FileSystem>> {
    open_inner(source, true)
}

fn open_inner(source: SharedSource, allow_sparse: bool) -> Result<Box<dyn FileSystem>> {
    let header = source.read_at(0, 4096).ok_or(ParseError::IoShort)?;

    match detect_fs_kind(&header) {
        Some(FsKind::Sparse) if allow_sparse => {
            let expanded: SharedSource = Arc::new(SparseReader::open(source)?);
            open_inner(expanded, false)
        }
        Some(FsKind::Erofs) => Ok(Box::new(ErofsReader::open(source)?)),
        Some(FsKind::Ext4) => Ok(Box::new(Ext4Reader::open(source)?)),
        _ => Err(ParseError::InvalidMagic),
    }
}
