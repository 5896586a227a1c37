// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Transparent expansion of the Android Sparse (`simg`) container.
//!
//! The reader indexes the chunk stream once on open and then serves random
//! reads against the expanded view, so a filesystem reader can be stacked
//! directly on top of a sparse `system.img` without inflating it to disk.

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::source::{BlockSource, SharedSource};
use crate::{ParseError, Result};

pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;

pub const SPARSE_FILE_HEADER_SIZE: usize = 28;
pub const SPARSE_CHUNK_HEADER_SIZE: usize = 12;

const CHUNK_TYPE_RAW: u16 = 0xCAC1;
const CHUNK_TYPE_FILL: u16 = 0xCAC2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;
const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub file_hdr_size: u16,
    pub chunk_hdr_size: u16,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkKind {
    Raw,
    Fill,
    DontCare,
}

#[derive(Debug, Clone, Copy)]
struct Chunk {
    kind: ChunkKind,
    /// Logical offset in the expanded image
    out_offset: u64,
    out_size: u64,
    /// Physical offset of the payload in the container
    data_offset: u64,
    data_size: u64,
}

/// Seekable view of an expanded sparse stream.
pub struct SparseReader {
    source: SharedSource,
    header: SparseHeader,
    chunks: Vec<Chunk>,
}

impl std::fmt::Debug for SparseReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseReader").finish_non_exhaustive()
    }
}

impl SparseReader {
    /// Parse the file header and walk the chunk records once. A chunk that
    /// advertises more payload than the source holds truncates the index;
    /// whatever was indexed before it stays readable.
    pub fn open(source: SharedSource) -> Result<Self> {
        let hdr = source
            .read_at(0, SPARSE_FILE_HEADER_SIZE)
            .ok_or(ParseError::IoShort)?;
        if hdr.len() < SPARSE_FILE_HEADER_SIZE {
            return Err(ParseError::Truncated);
        }
        if LittleEndian::read_u32(&hdr[0..4]) != SPARSE_MAGIC {
            return Err(ParseError::InvalidMagic);
        }

        let header = SparseHeader {
            major_version: LittleEndian::read_u16(&hdr[4..6]),
            minor_version: LittleEndian::read_u16(&hdr[6..8]),
            file_hdr_size: LittleEndian::read_u16(&hdr[8..10]),
            chunk_hdr_size: LittleEndian::read_u16(&hdr[10..12]),
            block_size: LittleEndian::read_u32(&hdr[12..16]),
            total_blocks: LittleEndian::read_u32(&hdr[16..20]),
            total_chunks: LittleEndian::read_u32(&hdr[20..24]),
            image_checksum: LittleEndian::read_u32(&hdr[24..28]),
        };
        if header.block_size == 0 || header.chunk_hdr_size < SPARSE_CHUNK_HEADER_SIZE as u16 {
            return Err(ParseError::UnsupportedLayout);
        }

        let source_len = source.len();
        let mut chunks = Vec::with_capacity(header.total_chunks as usize);
        let mut pos = header.file_hdr_size as u64;
        let mut out_offset = 0u64;

        for i in 0..header.total_chunks {
            let Some(ch) = source.read_at(pos, header.chunk_hdr_size as usize) else {
                break;
            };
            if ch.len() < SPARSE_CHUNK_HEADER_SIZE {
                warn!("sparse: chunk {i} header truncated, stopping index");
                break;
            }

            let chunk_type = LittleEndian::read_u16(&ch[0..2]);
            let chunk_blocks = LittleEndian::read_u32(&ch[4..8]) as u64;
            let total_size = LittleEndian::read_u32(&ch[8..12]) as u64;
            if total_size < header.chunk_hdr_size as u64 {
                warn!("sparse: chunk {i} shorter than its own header, stopping index");
                break;
            }

            let data_offset = pos + header.chunk_hdr_size as u64;
            let data_size = total_size - header.chunk_hdr_size as u64;
            if let Some(len) = source_len
                && data_offset + data_size > len
            {
                warn!("sparse: chunk {i} extends past end of source, stopping index");
                break;
            }

            let out_size = chunk_blocks * header.block_size as u64;
            let kind = match chunk_type {
                CHUNK_TYPE_RAW => Some(ChunkKind::Raw),
                CHUNK_TYPE_FILL => Some(ChunkKind::Fill),
                CHUNK_TYPE_DONT_CARE => Some(ChunkKind::DontCare),
                // Side-band checksum, not part of the output mapping
                CHUNK_TYPE_CRC32 => None,
                other => {
                    warn!("sparse: unknown chunk type {other:#06x}, stopping index");
                    break;
                }
            };
            if let Some(kind) = kind {
                chunks.push(Chunk {
                    kind,
                    out_offset,
                    out_size,
                    data_offset,
                    data_size,
                });
                out_offset += out_size;
            }

            pos += total_size;
        }

        Ok(Self {
            source,
            header,
            chunks,
        })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    /// Size of the expanded image
    pub fn logical_len(&self) -> u64 {
        self.header.total_blocks as u64 * self.header.block_size as u64
    }

    /// Bytes of the expanded view at `offset`. Positions not covered by any
    /// chunk, and positions past the logical end, read as zeros (resp.
    /// nothing) - malformed-but-recoverable images stay readable.
    pub fn read(&self, offset: u64, length: usize) -> Vec<u8> {
        let end = self.logical_len();
        if offset >= end {
            return Vec::new();
        }
        let n = usize::min(length, (end - offset) as usize);
        let mut out = vec![0u8; n];

        // First chunk that ends after `offset`
        let first = self
            .chunks
            .partition_point(|c| c.out_offset + c.out_size <= offset);

        for chunk in &self.chunks[first..] {
            if chunk.out_offset >= offset + n as u64 {
                break;
            }
            let copy_start = u64::max(chunk.out_offset, offset);
            let copy_end = u64::min(chunk.out_offset + chunk.out_size, offset + n as u64);
            let in_chunk = copy_start - chunk.out_offset;
            let dst = (copy_start - offset) as usize;
            let len = (copy_end - copy_start) as usize;

            match chunk.kind {
                ChunkKind::Raw => {
                    let avail = chunk.data_size.saturating_sub(in_chunk);
                    let want = usize::min(len, avail as usize);
                    if want > 0
                        && let Some(data) = self.source.read_at(chunk.data_offset + in_chunk, want)
                    {
                        out[dst..dst + data.len()].copy_from_slice(&data);
                    }
                }
                ChunkKind::Fill => {
                    let Some(pattern) = self.source.read_at(chunk.data_offset, 4) else {
                        continue;
                    };
                    if pattern.len() < 4 {
                        continue;
                    }
                    for i in 0..len {
                        out[dst + i] = pattern[((in_chunk + i as u64) % 4) as usize];
                    }
                }
                ChunkKind::DontCare => {}
            }
        }

        out
    }

    /// Expanded-image ranges actually backed by data (RAW and FILL chunks,
    /// contiguous runs merged). Writeback planners use this to skip holes.
    pub fn data_ranges(&self) -> Vec<(u64, u64)> {
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for chunk in &self.chunks {
            if chunk.kind == ChunkKind::DontCare || chunk.out_size == 0 {
                continue;
            }
            match ranges.last_mut() {
                Some((start, size)) if *start + *size == chunk.out_offset => {
                    *size += chunk.out_size;
                }
                _ => ranges.push((chunk.out_offset, chunk.out_size)),
            }
        }
        ranges
    }
}

impl BlockSource for SparseReader {
    fn read_at(&self, offset: u64, length: usize) -> Option<Vec<u8>> {
        Some(self.read(offset, length))
    }

    fn len(&self) -> Option<u64> {
        Some(self.logical_len())
    }
}

/// Cheap magic probe for the dispatcher.
pub fn is_sparse(header: &[u8]) -> bool {
    header.len() >= 4 && LittleEndian::read_u32(&header[0..4]) == SPARSE_MAGIC
}
