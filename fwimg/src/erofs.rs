// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Read-only EROFS, as found on modern system/vendor partitions.
//!
//! Covers the flat, inline and chunk-based data layouts plus a
//! best-effort path for LZ4-compressed inodes. The compressed path does
//! not implement the full `z_erofs` cluster-index walk; it tries the
//! obvious candidate regions and keeps whatever decodes, which is good
//! enough for the small text files (`build.prop` and friends) this crate
//! is after.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::fsdetect::FileSystem;
use crate::lz4;
use crate::source::SharedSource;
use crate::{ParseError, Result};

pub const EROFS_MAGIC: u32 = 0xE0F5_E1E2;
pub const EROFS_SUPERBLOCK_OFFSET: u64 = 1024;

const EROFS_INODE_SLOT_SIZE: u64 = 32;

/// Data layouts, bits 1..3 of the inode format field
const LAYOUT_FLAT_PLAIN: u16 = 0;
const LAYOUT_COMPRESSED_FULL: u16 = 1;
const LAYOUT_FLAT_INLINE: u16 = 2;
const LAYOUT_COMPRESSED_COMPACT: u16 = 3;
const LAYOUT_CHUNK_BASED: u16 = 4;

/// Chunk index entry: a hole, nothing on the device backs it
const EROFS_NULL_ADDR: u32 = 0xFFFF_FFFF;

const S_IFMT: u16 = 0xF000;
const S_IFDIR: u16 = 0x4000;
const S_IFREG: u16 = 0x8000;

const DEFAULT_MAX_READ: usize = 4 << 20;

#[derive(Debug, Clone)]
pub struct ErofsInode {
    pub nid: u64,
    pub mode: u16,
    pub size: u64,
    layout: u16,
    /// Interpretation depends on the layout: raw block address,
    /// compressed block count, chunk format or device number
    info: u32,
    /// 32 (compact) or 64 (extended)
    inode_size: u64,
    xattr_icount: u16,
    byte_offset: u64,
}

impl ErofsInode {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// On-disk bytes consumed by the xattr area between inode and data
    fn xattr_size(&self) -> u64 {
        if self.xattr_icount == 0 {
            0
        } else {
            let raw = 12 + 4 * (self.xattr_icount as u64 - 1);
            raw.next_multiple_of(4)
        }
    }

    /// Where inline/chunk-index data starts
    fn meta_end(&self) -> u64 {
        self.byte_offset + self.inode_size + self.xattr_size()
    }
}

#[derive(Debug, Clone)]
pub struct ErofsDirent {
    pub nid: u64,
    pub file_type: u8,
    pub name: String,
}

pub struct ErofsReader {
    source: SharedSource,
    block_size: u64,
    meta_blkaddr: u64,
    root_nid: u64,
    pub volume_name: String,
    pub build_time: u64,
    max_read: usize,
}

impl std::fmt::Debug for ErofsReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErofsReader").finish_non_exhaustive()
    }
}

impl ErofsReader {
    pub fn open(source: SharedSource) -> Result<Self> {
        let sb = source
            .read_at(EROFS_SUPERBLOCK_OFFSET, 128)
            .ok_or(ParseError::IoShort)?;
        if sb.len() < 80 {
            return Err(ParseError::Truncated);
        }
        if LittleEndian::read_u32(&sb[0..4]) != EROFS_MAGIC {
            return Err(ParseError::InvalidMagic);
        }

        let blkszbits = sb[12];
        if !(9..=16).contains(&blkszbits) {
            return Err(ParseError::UnsupportedLayout);
        }
        let volume_name_len = sb[64..80].iter().position(|&b| b == 0).unwrap_or(16);

        Ok(Self {
            source,
            block_size: 1u64 << blkszbits,
            meta_blkaddr: LittleEndian::read_u32(&sb[40..44]) as u64,
            root_nid: LittleEndian::read_u16(&sb[14..16]) as u64,
            volume_name: String::from_utf8_lossy(&sb[64..64 + volume_name_len]).into_owned(),
            build_time: LittleEndian::read_u64(&sb[24..32]),
            max_read: DEFAULT_MAX_READ,
        })
    }

    pub fn with_max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read;
        self
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn root_nid(&self) -> u64 {
        self.root_nid
    }

    pub fn read_inode(&self, nid: u64) -> Option<ErofsInode> {
        let byte_offset = self.meta_blkaddr * self.block_size + nid * EROFS_INODE_SLOT_SIZE;
        let raw = self.source.read_at(byte_offset, 64)?;
        if raw.len() < 32 {
            return None;
        }

        let format = LittleEndian::read_u16(&raw[0..2]);
        let extended = format & 1 != 0;
        let layout = (format >> 1) & 0x7;

        if extended && raw.len() < 64 {
            return None;
        }
        let (size, inode_size) = if extended {
            (LittleEndian::read_u64(&raw[8..16]), 64)
        } else {
            (LittleEndian::read_u32(&raw[8..12]) as u64, 32)
        };

        Some(ErofsInode {
            nid,
            mode: LittleEndian::read_u16(&raw[4..6]),
            size,
            layout,
            info: LittleEndian::read_u32(&raw[16..20]),
            inode_size,
            xattr_icount: LittleEndian::read_u16(&raw[2..4]),
            byte_offset,
        })
    }

    fn read_exactish(&self, offset: u64, len: usize) -> Vec<u8> {
        self.source.read_at(offset, len).unwrap_or_default()
    }

    fn read_flat_plain(&self, inode: &ErofsInode, want: usize) -> Vec<u8> {
        self.read_exactish(inode.info as u64 * self.block_size, want)
    }

    fn read_flat_inline(&self, inode: &ErofsInode, want: usize) -> Vec<u8> {
        let start = inode.meta_end();
        let tail_capacity = self.block_size - (start % self.block_size);

        let mut out = self.read_exactish(start, usize::min(want, tail_capacity as usize));
        if want as u64 > tail_capacity {
            let rest = want - tail_capacity as usize;
            out.extend_from_slice(&self.read_exactish(
                inode.info as u64 * self.block_size,
                rest,
            ));
        }
        out
    }

    fn read_chunk_based(&self, inode: &ErofsInode, want: usize) -> Vec<u8> {
        // Low bits of the chunk format widen the chunk beyond a block
        let chunk_size = self.block_size << (inode.info & 0x1F);
        let num_chunks = (inode.size).div_ceil(chunk_size);

        let indexes = self.read_exactish(inode.meta_end(), num_chunks as usize * 8);
        let mut out = Vec::with_capacity(want);
        for idx in indexes.chunks_exact(8) {
            if out.len() >= want {
                break;
            }
            let blk_addr = LittleEndian::read_u32(&idx[0..4]);
            let n = usize::min(chunk_size as usize, want - out.len());
            if blk_addr == EROFS_NULL_ADDR {
                out.resize(out.len() + n, 0);
            } else {
                let data = self.read_exactish(blk_addr as u64 * self.block_size, n);
                let short = n - data.len();
                out.extend_from_slice(&data);
                out.resize(out.len() + short, 0);
            }
        }
        out
    }

    /// Best-effort LZ4 recovery for compressed inodes; see module docs.
    fn read_compressed(&self, inode: &ErofsInode, want: usize) -> Vec<u8> {
        let budget = usize::min(inode.size as usize, 4 * self.block_size as usize);

        let from_blocks = self.read_exactish(inode.info as u64 * self.block_size, budget);
        let attempt = lz4::decompress_block(&from_blocks, want);
        if attempt.len() >= want {
            return attempt;
        }

        let start = inode.meta_end();
        let tail_capacity = (self.block_size - (start % self.block_size)) as usize;
        let inline = self.read_exactish(start, usize::min(budget, tail_capacity));
        let fallback = lz4::decompress_block(&inline, want);

        debug!(
            "erofs: compressed nid {} recovered {}/{} (block) {}/{} (inline)",
            inode.nid,
            attempt.len(),
            want,
            fallback.len(),
            want
        );
        if fallback.len() > attempt.len() {
            fallback
        } else {
            attempt
        }
    }

    /// Materialise an inode's bytes, clamped to the reader's cap.
    pub fn read_inode_data(&self, inode: &ErofsInode) -> Vec<u8> {
        let want = usize::min(inode.size as usize, self.max_read);
        if want == 0 {
            return Vec::new();
        }
        let mut data = match inode.layout {
            LAYOUT_FLAT_PLAIN => self.read_flat_plain(inode, want),
            LAYOUT_FLAT_INLINE => self.read_flat_inline(inode, want),
            LAYOUT_CHUNK_BASED => self.read_chunk_based(inode, want),
            LAYOUT_COMPRESSED_FULL | LAYOUT_COMPRESSED_COMPACT => {
                self.read_compressed(inode, want)
            }
            other => {
                warn!("erofs: data layout {other} unsupported, skipping nid {}", inode.nid);
                Vec::new()
            }
        };
        data.truncate(want);
        data
    }

    /// Decode a directory inode's dirent blocks.
    pub fn read_dir(&self, inode: &ErofsInode) -> Vec<ErofsDirent> {
        let data = self.read_inode_data(inode);
        let mut entries = Vec::new();

        for block in data.chunks(self.block_size as usize) {
            if block.len() < 12 {
                continue;
            }
            // The first name offset doubles as the dirent-array size
            let first_off = LittleEndian::read_u16(&block[8..10]) as usize;
            if first_off < 12 || first_off > block.len() || first_off % 12 != 0 {
                break;
            }
            let count = first_off / 12;

            for i in 0..count {
                let d = &block[i * 12..i * 12 + 12];
                let nid = LittleEndian::read_u64(&d[0..8]);
                let name_start = LittleEndian::read_u16(&d[8..10]) as usize;
                let name_end = if i + 1 < count {
                    LittleEndian::read_u16(&block[(i + 1) * 12 + 8..(i + 1) * 12 + 10]) as usize
                } else {
                    block.len()
                };
                if name_start > name_end || name_end > block.len() {
                    break;
                }
                let raw_name = &block[name_start..name_end];
                let trimmed = match raw_name.iter().position(|&b| b == 0) {
                    Some(n) => &raw_name[..n],
                    None => raw_name,
                };
                if trimmed.is_empty() {
                    continue;
                }
                entries.push(ErofsDirent {
                    nid,
                    file_type: d[10],
                    name: String::from_utf8_lossy(trimmed).into_owned(),
                });
            }
        }
        entries
    }

    /// Walk `path` from the root NID, matching case-insensitively.
    pub fn resolve_path(&self, path: &str) -> Option<u64> {
        let mut nid = self.root_nid;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let inode = self.read_inode(nid)?;
            if !inode.is_dir() {
                return None;
            }
            nid = self
                .read_dir(&inode)
                .iter()
                .find(|e| e.name.eq_ignore_ascii_case(component))?
                .nid;
        }
        Some(nid)
    }
}

impl FileSystem for ErofsReader {
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

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::source::MemSource;

    pub(crate) const BLOCK: usize = 4096;
    const META_BLK: u64 = 1;

    /// One-block-of-inodes image: superblock at 1024, inode slots from
    /// block 1, file payload blocks from block 2 up.
    pub(crate) struct ErofsBuilder {
        img: Vec<u8>,
        next_slot: u64,
        next_block: u64,
        root_entries: Vec<(String, u64, u8)>,
    }

    impl ErofsBuilder {
        pub(crate) fn new() -> Self {
            let mut img = vec![0u8; 64 * 1024];
            let sb = &mut img[1024..];
            LittleEndian::write_u32(&mut sb[0..4], EROFS_MAGIC);
            sb[12] = 12; // 4 KiB blocks
            LittleEndian::write_u16(&mut sb[14..16], 0); // root nid
            LittleEndian::write_u64(&mut sb[24..32], 1_700_000_000); // build time
            LittleEndian::write_u32(&mut sb[40..44], META_BLK as u32);
            sb[64..68].copy_from_slice(b"QRD\0");
            Self {
                img,
                // Root inode + its inline dirents occupy the first slots
                next_slot: 8,
                next_block: 2,
                root_entries: vec![(".".into(), 0, 2), ("..".into(), 0, 2)],
            }
        }

        fn slot_offset(nid: u64) -> usize {
            (META_BLK * BLOCK as u64 + nid * EROFS_INODE_SLOT_SIZE) as usize
        }

        fn write_compact_inode(&mut self, nid: u64, mode: u16, size: u32, layout: u16, info: u32) {
            let off = Self::slot_offset(nid);
            let raw = &mut self.img[off..off + 32];
            LittleEndian::write_u16(&mut raw[0..2], layout << 1);
            LittleEndian::write_u16(&mut raw[4..6], mode);
            LittleEndian::write_u32(&mut raw[8..12], size);
            LittleEndian::write_u32(&mut raw[16..20], info);
        }

        fn write_extended_inode(&mut self, nid: u64, mode: u16, size: u64, layout: u16, info: u32) {
            let off = Self::slot_offset(nid);
            let raw = &mut self.img[off..off + 64];
            LittleEndian::write_u16(&mut raw[0..2], (layout << 1) | 1);
            LittleEndian::write_u16(&mut raw[4..6], mode);
            LittleEndian::write_u64(&mut raw[8..16], size);
            LittleEndian::write_u32(&mut raw[16..20], info);
        }

        fn alloc_block(&mut self) -> u64 {
            let b = self.next_block;
            self.next_block += 1;
            assert!((b as usize + 1) * BLOCK <= self.img.len());
            b
        }

        fn alloc_nid(&mut self, slots: u64) -> u64 {
            let nid = self.next_slot;
            self.next_slot += slots;
            nid
        }

        /// File with all bytes in whole blocks.
        pub(crate) fn add_plain_file(&mut self, name: &str, content: &[u8]) -> u64 {
            let nid = self.alloc_nid(1);
            let block = self.alloc_block();
            let off = block as usize * BLOCK;
            self.img[off..off + content.len()].copy_from_slice(content);
            self.write_compact_inode(nid, S_IFREG | 0o644, content.len() as u32, LAYOUT_FLAT_PLAIN, block as u32);
            self.root_entries.push((name.into(), nid, 1));
            nid
        }

        /// File with its bytes inline after the (compact) inode.
        pub(crate) fn add_inline_file(&mut self, name: &str, content: &[u8]) -> u64 {
            let slots = 1 + (content.len() as u64).div_ceil(EROFS_INODE_SLOT_SIZE);
            let nid = self.alloc_nid(slots);
            self.write_compact_inode(nid, S_IFREG | 0o644, content.len() as u32, LAYOUT_FLAT_INLINE, 0);
            let data_off = Self::slot_offset(nid) + 32;
            self.img[data_off..data_off + content.len()].copy_from_slice(content);
            self.root_entries.push((name.into(), nid, 1));
            nid
        }

        /// Extended-inode variant of an inline file.
        pub(crate) fn add_inline_file_extended(&mut self, name: &str, content: &[u8]) -> u64 {
            let slots = 2 + (content.len() as u64).div_ceil(EROFS_INODE_SLOT_SIZE);
            let nid = self.alloc_nid(slots);
            self.write_extended_inode(nid, S_IFREG | 0o644, content.len() as u64, LAYOUT_FLAT_INLINE, 0);
            let data_off = Self::slot_offset(nid) + 64;
            self.img[data_off..data_off + content.len()].copy_from_slice(content);
            self.root_entries.push((name.into(), nid, 1));
            nid
        }

        /// Two-chunk file: a data chunk then a hole.
        pub(crate) fn add_chunked_file(&mut self, name: &str, first_chunk: &[u8], total: u32) -> u64 {
            assert!(first_chunk.len() <= BLOCK);
            let nid = self.alloc_nid(2);
            let block = self.alloc_block();
            let off = block as usize * BLOCK;
            self.img[off..off + first_chunk.len()].copy_from_slice(first_chunk);

            self.write_compact_inode(nid, S_IFREG | 0o644, total, LAYOUT_CHUNK_BASED, 0);
            let idx_off = Self::slot_offset(nid) + 32;
            LittleEndian::write_u32(&mut self.img[idx_off..idx_off + 4], block as u32);
            LittleEndian::write_u32(&mut self.img[idx_off + 8..idx_off + 12], EROFS_NULL_ADDR);
            self.root_entries.push((name.into(), nid, 1));
            nid
        }

        /// LZ4-compressed file stored at a block boundary.
        pub(crate) fn add_compressed_file(&mut self, name: &str, lz4_block: &[u8], plain_len: u32) -> u64 {
            let nid = self.alloc_nid(1);
            let block = self.alloc_block();
            let off = block as usize * BLOCK;
            self.img[off..off + lz4_block.len()].copy_from_slice(lz4_block);
            self.write_compact_inode(nid, S_IFREG | 0o644, plain_len, LAYOUT_COMPRESSED_FULL, block as u32);
            self.root_entries.push((name.into(), nid, 1));
            nid
        }

        pub(crate) fn build(mut self) -> Vec<u8> {
            // Root directory: inline dirents in slot 0
            let mut dirents = vec![0u8; self.root_entries.len() * 12];
            let mut names = Vec::new();
            let base = dirents.len();
            for (i, (name, nid, ftype)) in self.root_entries.iter().enumerate() {
                let d = &mut dirents[i * 12..i * 12 + 12];
                LittleEndian::write_u64(&mut d[0..8], *nid);
                LittleEndian::write_u16(&mut d[8..10], (base + names.len()) as u16);
                d[10] = *ftype;
                names.extend_from_slice(name.as_bytes());
            }
            dirents.extend_from_slice(&names);

            self.write_compact_inode(0, S_IFDIR | 0o755, dirents.len() as u32, LAYOUT_FLAT_INLINE, 0);
            let off = Self::slot_offset(0) + 32;
            self.img[off..off + dirents.len()].copy_from_slice(&dirents);
            self.img
        }
    }

    fn open(img: Vec<u8>) -> ErofsReader {
        ErofsReader::open(MemSource::shared(img)).unwrap()
    }

    #[test]
    fn rejects_non_erofs() {
        let err = ErofsReader::open(MemSource::shared(vec![0u8; 4096])).unwrap_err();
        assert_eq!(err, ParseError::InvalidMagic);
    }

    #[test]
    fn superblock_fields() {
        let fs = open(ErofsBuilder::new().build());
        assert_eq!(fs.block_size(), 4096);
        assert_eq!(fs.volume_name, "QRD");
        assert_eq!(fs.build_time, 1_700_000_000);
    }

    #[test]
    fn inline_file_roundtrip() {
        let mut b = ErofsBuilder::new();
        b.add_inline_file("build.prop", b"ro.product.model=Foo\n");
        let fs = open(b.build());
        assert_eq!(
            fs.read_file("/build.prop").unwrap(),
            b"ro.product.model=Foo\n"
        );
    }

    #[test]
    fn extended_inode_inline_file() {
        let mut b = ErofsBuilder::new();
        b.add_inline_file_extended("default.prop", b"ro.secure=0\n");
        let fs = open(b.build());
        assert_eq!(fs.read_file("/default.prop").unwrap(), b"ro.secure=0\n");
    }

    #[test]
    fn plain_file_roundtrip() {
        let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        let mut b = ErofsBuilder::new();
        b.add_plain_file("blob.bin", &payload);
        let fs = open(b.build());
        assert_eq!(fs.read_file("/blob.bin").unwrap(), payload);
    }

    #[test]
    fn chunked_file_with_hole() {
        let first = vec![0x5Au8; BLOCK];
        let mut b = ErofsBuilder::new();
        b.add_chunked_file("chunky.bin", &first, (BLOCK + 100) as u32);
        let fs = open(b.build());
        let data = fs.read_file("/chunky.bin").unwrap();
        assert_eq!(data.len(), BLOCK + 100);
        assert_eq!(&data[..BLOCK], &first[..]);
        assert_eq!(&data[BLOCK..], &[0u8; 100]);
    }

    #[test]
    fn compressed_file_best_effort() {
        // "AB" + offset-2 match of 18 -> 20 bytes of "ABAB..."
        let lz4_block = [0x2F, b'A', b'B', 0x02, 0x00, 0x00];
        let mut b = ErofsBuilder::new();
        b.add_compressed_file("props.bin", &lz4_block, 20);
        let fs = open(b.build());
        let data = fs.read_file("/props.bin").unwrap();
        assert_eq!(data.len(), 20);
        assert!(data.chunks(2).all(|c| c == b"AB"));
    }

    #[test]
    fn case_insensitive_lookup() {
        let mut b = ErofsBuilder::new();
        b.add_inline_file("Build.Prop", b"ro.a=b\n");
        let fs = open(b.build());
        assert!(fs.exists("/BUILD.PROP"));
        assert!(fs.exists("/build.prop"));
        assert!(!fs.exists("/build.prop2"));
    }

    #[test]
    fn list_dir_names() {
        let mut b = ErofsBuilder::new();
        b.add_inline_file("build.prop", b"x");
        b.add_plain_file("vendor.img", b"y");
        let fs = open(b.build());
        let mut names = fs.list_dir("/").unwrap();
        names.sort();
        assert_eq!(names, vec!["build.prop", "vendor.img"]);
    }
}
