// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Minimal read-only EXT4.
//!
//! Parses just enough of the superblock to locate inodes, then serves
//! file bytes through either an extent tree (depth 0) or the classic
//! 12-direct + 1/2/3-indirect block map. Plenty of EXT4 features are
//! ignored on purpose: this reader exists to pull `build.prop` and
//! friends out of partition dumps, not to mount anything.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::fsdetect::FileSystem;
use crate::source::SharedSource;
use crate::{ParseError, Result};

pub const EXT4_MAGIC: u16 = 0xEF53;
pub const EXT4_SUPERBLOCK_OFFSET: u64 = 1024;
const EXT4_MAGIC_OFFSET: usize = 1024 + 56;

const EXTENT_HEADER_MAGIC: u16 = 0xF30A;
const ROOT_INODE: u32 = 2;

/// Inode flag: the 60-byte block area holds an extent tree
const EXT4_EXTENTS_FL: u32 = 0x8_0000;

/// `ee_len` values above this denote uninitialised extents
const EXT_INIT_MAX_LEN: u16 = 32768;

/// Default clamp on a single materialised file
const DEFAULT_MAX_READ: usize = 4 << 20;

const S_IFMT: u16 = 0xF000;
const S_IFDIR: u16 = 0x4000;
const S_IFREG: u16 = 0x8000;

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct IncompatFeatures: u32 {
        const EXTENTS = 0x0040;
        const SIXTY_FOUR_BIT = 0x0080;
    }
}

#[derive(Debug, Clone)]
pub struct Ext4Inode {
    pub mode: u16,
    pub size: u64,
    pub flags: u32,
    block: [u8; 60],
}

impl Ext4Inode {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode: u32,
    pub file_type: u8,
    pub name: String,
}

pub struct Ext4Reader {
    source: SharedSource,
    block_size: u64,
    blocks_per_group: u32,
    inodes_per_group: u32,
    inode_size: u64,
    first_data_block: u32,
    features: IncompatFeatures,
    max_read: usize,
}

impl std::fmt::Debug for Ext4Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext4Reader").finish_non_exhaustive()
    }
}

impl Ext4Reader {
    pub fn open(source: SharedSource) -> Result<Self> {
        let sb = source
            .read_at(EXT4_SUPERBLOCK_OFFSET, 1024)
            .ok_or(ParseError::IoShort)?;
        if sb.len() < 104 {
            return Err(ParseError::Truncated);
        }
        if LittleEndian::read_u16(&sb[56..58]) != EXT4_MAGIC {
            return Err(ParseError::InvalidMagic);
        }

        let log_block_size = LittleEndian::read_u32(&sb[24..28]);
        if log_block_size > 6 {
            return Err(ParseError::UnsupportedLayout);
        }
        let inode_size = match LittleEndian::read_u16(&sb[88..90]) {
            0 => 128,
            n => n as u64,
        };

        Ok(Self {
            source,
            block_size: 1024u64 << log_block_size,
            blocks_per_group: LittleEndian::read_u32(&sb[32..36]),
            inodes_per_group: LittleEndian::read_u32(&sb[40..44]),
            inode_size,
            first_data_block: LittleEndian::read_u32(&sb[20..24]),
            features: IncompatFeatures::from_bits_truncate(LittleEndian::read_u32(&sb[96..100])),
            max_read: DEFAULT_MAX_READ,
        })
    }

    /// Raise (or lower) the clamp on materialised file size.
    pub fn with_max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read;
        self
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn read_block(&self, block: u64) -> Option<Vec<u8>> {
        self.source
            .read_at(block * self.block_size, self.block_size as usize)
    }

    fn desc_size(&self) -> u64 {
        if self.features.contains(IncompatFeatures::SIXTY_FOUR_BIT) {
            64
        } else {
            32
        }
    }

    /// Byte position of an inode, via its group's descriptor.
    fn inode_offset(&self, inode: u32) -> Option<u64> {
        if inode == 0 || self.inodes_per_group == 0 {
            return None;
        }
        let group = (inode - 1) as u64 / self.inodes_per_group as u64;
        let index = (inode - 1) as u64 % self.inodes_per_group as u64;

        let bgd_base = (self.first_data_block as u64 + 1) * self.block_size;
        let desc = self
            .source
            .read_at(bgd_base + group * self.desc_size(), self.desc_size() as usize)?;
        if desc.len() < 12 {
            return None;
        }
        let mut inode_table = LittleEndian::read_u32(&desc[8..12]) as u64;
        if self.desc_size() == 64 && desc.len() >= 44 {
            inode_table |= (LittleEndian::read_u32(&desc[40..44]) as u64) << 32;
        }

        Some(inode_table * self.block_size + index * self.inode_size)
    }

    pub fn read_inode(&self, inode: u32) -> Option<Ext4Inode> {
        let off = self.inode_offset(inode)?;
        let raw = self.source.read_at(off, 128)?;
        if raw.len() < 128 {
            return None;
        }
        let mut block = [0u8; 60];
        block.copy_from_slice(&raw[40..100]);
        Some(Ext4Inode {
            mode: LittleEndian::read_u16(&raw[0..2]),
            size: LittleEndian::read_u32(&raw[4..8]) as u64
                | (LittleEndian::read_u32(&raw[108..112]) as u64) << 32,
            flags: LittleEndian::read_u32(&raw[32..36]),
            block,
        })
    }

    fn append_blocks(&self, out: &mut Vec<u8>, start_block: u64, count: u64, want: usize) {
        for i in 0..count {
            if out.len() >= want {
                return;
            }
            let Some(data) = self.read_block(start_block + i) else {
                return;
            };
            let room = want - out.len();
            out.extend_from_slice(&data[..usize::min(room, data.len())]);
            if data.len() < self.block_size as usize {
                return;
            }
        }
    }

    /// Depth-0 extent tree in the inode's 60-byte block area. Each leaf
    /// places its run at the extent's logical block, so holes stay zero.
    fn read_extent_data(&self, inode: &Ext4Inode, want: usize) -> Vec<u8> {
        let area = &inode.block;
        let mut out = vec![0u8; want];

        if LittleEndian::read_u16(&area[0..2]) != EXTENT_HEADER_MAGIC {
            warn!("ext4: extent header magic missing");
            return Vec::new();
        }
        let entries = LittleEndian::read_u16(&area[2..4]) as usize;
        let depth = LittleEndian::read_u16(&area[6..8]);
        if depth != 0 {
            // Interior nodes not handled; files this large don't carry
            // the props we're after
            warn!("ext4: extent tree depth {depth} unsupported");
            return Vec::new();
        }

        for i in 0..usize::min(entries, 4) {
            let e = &area[12 + i * 12..24 + i * 12];
            let logical = LittleEndian::read_u32(&e[0..4]) as u64;
            let raw_len = LittleEndian::read_u16(&e[4..6]);
            // Uninitialised extents read as their truncated length
            let len = if raw_len > EXT_INIT_MAX_LEN {
                (raw_len - EXT_INIT_MAX_LEN) as u64
            } else {
                raw_len as u64
            };
            let start = LittleEndian::read_u32(&e[8..12]) as u64
                | (LittleEndian::read_u16(&e[6..8]) as u64) << 32;

            let dst = logical * self.block_size;
            if dst >= want as u64 {
                continue;
            }
            let mut run = Vec::new();
            self.append_blocks(&mut run, start, len, want - dst as usize);
            out[dst as usize..dst as usize + run.len()].copy_from_slice(&run);
        }
        out
    }

    /// Walk one level of an indirect-pointer block. Returns false once the
    /// target size is reached or a zero pointer ends the file.
    fn read_indirect(&self, out: &mut Vec<u8>, block: u64, level: u8, want: usize) -> bool {
        if block == 0 {
            return false;
        }
        let Some(table) = self.read_block(block) else {
            return false;
        };
        for ptr in table.chunks_exact(4).map(LittleEndian::read_u32) {
            if out.len() >= want {
                return false;
            }
            if ptr == 0 {
                return false;
            }
            if level == 0 {
                self.append_blocks(out, ptr as u64, 1, want);
            } else if !self.read_indirect(out, ptr as u64, level - 1, want) {
                return false;
            }
        }
        true
    }

    fn read_blockmap_data(&self, inode: &Ext4Inode, want: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(want);
        for i in 0..12 {
            if out.len() >= want {
                return out;
            }
            let ptr = LittleEndian::read_u32(&inode.block[i * 4..i * 4 + 4]);
            if ptr == 0 {
                return out;
            }
            self.append_blocks(&mut out, ptr as u64, 1, want);
        }
        for (slot, level) in [(12usize, 0u8), (13, 1), (14, 2)] {
            if out.len() >= want {
                break;
            }
            let ptr = LittleEndian::read_u32(&inode.block[slot * 4..slot * 4 + 4]);
            if !self.read_indirect(&mut out, ptr as u64, level, want) {
                break;
            }
        }
        out
    }

    /// Materialise an inode's data, clamped to the reader's size cap.
    pub fn read_inode_data(&self, inode: &Ext4Inode) -> Vec<u8> {
        let want = usize::min(inode.size as usize, self.max_read);
        if want == 0 {
            return Vec::new();
        }
        if inode.flags & EXT4_EXTENTS_FL != 0 {
            let mut data = self.read_extent_data(inode, want);
            data.truncate(want);
            data
        } else {
            self.read_blockmap_data(inode, want)
        }
    }

    /// Decode one directory's record stream.
    pub fn read_dir(&self, inode: &Ext4Inode) -> Vec<DirEntry> {
        let data = self.read_inode_data(inode);
        let mut entries = Vec::new();
        let mut pos = 0usize;

        while pos + 8 <= data.len() {
            let rec_inode = LittleEndian::read_u32(&data[pos..pos + 4]);
            let rec_len = LittleEndian::read_u16(&data[pos + 4..pos + 6]) as usize;
            let name_len = data[pos + 6] as usize;
            let file_type = data[pos + 7];

            if rec_len < 8 || pos + rec_len > data.len() || rec_inode == 0 {
                break;
            }
            if name_len > 0 && pos + 8 + name_len <= data.len() {
                entries.push(DirEntry {
                    inode: rec_inode,
                    file_type,
                    name: String::from_utf8_lossy(&data[pos + 8..pos + 8 + name_len]).into_owned(),
                });
            }
            pos += rec_len;
        }
        entries
    }

    /// Walk `path` from the root inode, matching case-insensitively.
    pub fn resolve_path(&self, path: &str) -> Option<u32> {
        let mut inode_no = ROOT_INODE;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let inode = self.read_inode(inode_no)?;
            if !inode.is_dir() {
                return None;
            }
            inode_no = self
                .read_dir(&inode)
                .iter()
                .find(|e| e.name.eq_ignore_ascii_case(component))?
                .inode;
        }
        Some(inode_no)
    }
}

impl FileSystem for Ext4Reader {
    fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        let inode = self.read_inode(self.resolve_path(path)?)?;
        if !inode.is_regular() {
            return None;
        }
        Some(self.read_inode_data(&inode))
    }

    fn list_dir(&self, path: &str) -> Option<Vec<String>> {
        let inode = self.read_inode(self.resolve_path(path)?)?;
        if !inode.is_dir() {
            return None;
        }
        Some(
            self.read_dir(&inode)
                .into_iter()
                .map(|e| e.name)
                .filter(|n| n != "." && n != "..")
                .collect(),
        )
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve_path(path).is_some()
    }
}
