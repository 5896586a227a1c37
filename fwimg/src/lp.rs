// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Android logical-partition ("super") metadata.
//!
//! The `super` partition opens with a geometry block followed by one or
//! more copies of an ALP0 header and four parallel tables (partitions,
//! extents, groups, block devices). Only partitions and extents matter
//! for locating sub-partition bytes; extent arithmetic is always in
//! 512-byte sectors no matter what the device sector size is.
//!
//! Super dumps get re-parsed a lot while a flash plan is being assembled,
//! so results are cached process-wide behind an MD5 of the metadata head.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use log::warn;
use md5::{Digest, Md5};

use crate::gpt::format_guid;
use crate::{ParseError, Result};

/// Little-endian form of the ALP0 header magic
pub const LP_MAGIC: &[u8; 4] = b"0PLA";

/// Header copies usually live at one of these offsets (past the geometry)
const LP_PROBE_OFFSETS: [usize; 4] = [4096, 8192, 12288, 16384];

/// Fallback scan window for the header magic
const LP_SCAN_LIMIT: usize = 64 * 1024;

const LP_TARGET_TYPE_LINEAR: u32 = 0;
const LP_TARGET_TYPE_ZERO: u32 = 1;

/// Extent sector math is fixed at 512 regardless of the device
pub const LP_SECTOR_SIZE: u64 = 512;

const CACHE_MAX_ENTRIES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpTargetType {
    Linear,
    Zero,
    Unknown(u32),
}

impl From<u32> for LpTargetType {
    fn from(v: u32) -> Self {
        match v {
            LP_TARGET_TYPE_LINEAR => LpTargetType::Linear,
            LP_TARGET_TYPE_ZERO => LpTargetType::Zero,
            other => LpTargetType::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LpExtent {
    /// In 512-byte units
    pub num_sectors: u64,
    pub target_type: LpTargetType,
    /// LINEAR: physical offset in 512-byte units
    pub target_data: u64,
    pub device_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LpPartition {
    pub name: String,
    pub guid: String,
    pub attributes: u32,
    pub extents: Vec<LpExtent>,
}

impl LpPartition {
    pub fn total_size(&self) -> u64 {
        self.extents
            .iter()
            .map(|e| e.num_sectors * LP_SECTOR_SIZE)
            .sum()
    }

    /// Where the partition's first byte lives on the backing device, in
    /// device-sector units.
    pub fn first_device_sector_offset(&self, device_sector_size: u32) -> Option<u64> {
        self.extents
            .iter()
            .find(|e| e.target_type == LpTargetType::Linear)
            .map(|e| e.target_data * LP_SECTOR_SIZE / device_sector_size as u64)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    head_md5: [u8; 16],
    total_len: usize,
}

static PARSE_CACHE: LazyLock<Mutex<HashMap<CacheKey, Vec<LpPartition>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Drop all cached parse results.
pub fn clear_cache() {
    if let Ok(mut cache) = PARSE_CACHE.lock() {
        cache.clear();
    }
}

fn cache_key(buf: &[u8]) -> CacheKey {
    let head = &buf[..usize::min(buf.len(), 4096)];
    CacheKey {
        head_md5: Md5::digest(head).into(),
        total_len: buf.len(),
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    let hit = |off: usize| off + 4 <= buf.len() && &buf[off..off + 4] == LP_MAGIC;

    for &off in &LP_PROBE_OFFSETS {
        if hit(off) {
            return Some(off);
        }
    }
    let window = &buf[..usize::min(buf.len(), LP_SCAN_LIMIT)];
    window.windows(4).position(|w| w == LP_MAGIC)
}

#[derive(Debug, Clone, Copy)]
struct TableDesc {
    offset: u32,
    num_entries: u32,
    entry_size: u32,
}

fn read_desc(buf: &[u8], off: usize) -> TableDesc {
    TableDesc {
        offset: LittleEndian::read_u32(&buf[off..off + 4]),
        num_entries: LittleEndian::read_u32(&buf[off + 4..off + 8]),
        entry_size: LittleEndian::read_u32(&buf[off + 8..off + 12]),
    }
}

fn parse_extent(buf: &[u8], desc: &TableDesc, tables_base: usize, index: u32) -> Option<LpExtent> {
    let entry_size = desc.entry_size as usize;
    if entry_size < 24 || index >= desc.num_entries {
        return None;
    }
    let off = tables_base + desc.offset as usize + index as usize * entry_size;
    if off + 24 > buf.len() {
        return None;
    }
    let e = &buf[off..];
    Some(LpExtent {
        num_sectors: LittleEndian::read_u64(&e[0..8]),
        target_type: LittleEndian::read_u32(&e[8..12]).into(),
        target_data: LittleEndian::read_u64(&e[12..20]),
        device_index: LittleEndian::read_u32(&e[20..24]),
    })
}

fn parse_uncached(buf: &[u8]) -> Result<Vec<LpPartition>> {
    let header_off = find_magic(buf).ok_or(ParseError::InvalidMagic)?;
    if header_off + 128 > buf.len() {
        return Err(ParseError::Truncated);
    }
    let h = &buf[header_off..];

    let header_size = LittleEndian::read_u32(&h[8..12]) as usize;
    // Checksums (sha256 over header/tables) are carried but not enforced;
    // factory dumps routinely fail them after slot patching
    let _header_checksum = &h[12..44];
    let _tables_checksum = &h[48..80];

    let part_desc = read_desc(h, 80);
    let extent_desc = read_desc(h, 92);
    let _group_desc = read_desc(h, 104);
    let _device_desc = read_desc(h, 116);

    let tables_base = header_off + header_size;
    let part_entry_size = part_desc.entry_size as usize;
    if part_entry_size < 52 {
        return Err(ParseError::UnsupportedLayout);
    }

    let mut partitions = Vec::new();
    for i in 0..part_desc.num_entries {
        let off = tables_base + part_desc.offset as usize + i as usize * part_entry_size;
        if off + part_entry_size > buf.len() {
            warn!("lp: partition table truncated at entry {i}");
            break;
        }
        let e = &buf[off..];

        let name_len = e[..36].iter().position(|&b| b == 0).unwrap_or(36);
        let name = String::from_utf8_lossy(&e[..name_len]).into_owned();
        let guid = format_guid(&e[36..52]);
        let attributes = LittleEndian::read_u32(&e[52..56]);
        let first_extent = LittleEndian::read_u32(&e[56..60]);
        let num_extents = LittleEndian::read_u32(&e[60..64]);

        let mut extents = Vec::with_capacity(num_extents as usize);
        for j in 0..num_extents {
            match parse_extent(buf, &extent_desc, tables_base, first_extent + j) {
                Some(ext) => extents.push(ext),
                None => {
                    warn!("lp: extent {j} of '{name}' out of range");
                    break;
                }
            }
        }

        partitions.push(LpPartition {
            name,
            guid,
            attributes,
            extents,
        });
    }

    Ok(partitions)
}

/// Parse the logical-partition table out of the head of a `super`
/// partition. Results are cached; the returned vector is always a deep
/// copy, never an aliased cache entry.
pub fn parse_lp_metadata(buf: &[u8]) -> Result<Vec<LpPartition>> {
    let key = cache_key(buf);
    if let Ok(cache) = PARSE_CACHE.lock()
        && let Some(hit) = cache.get(&key)
    {
        return Ok(hit.clone());
    }

    let partitions = parse_uncached(buf)?;

    if let Ok(mut cache) = PARSE_CACHE.lock() {
        if cache.len() >= CACHE_MAX_ENTRIES {
            cache.clear();
        }
        cache.insert(key, partitions.clone());
    }
    Ok(partitions)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// ALP0 header at 4096 with partition and extent tables right after.
    pub(crate) fn build_lp(parts: &[(&str, &[(u64, u64)])]) -> Vec<u8> {
        const HEADER_SIZE: usize = 128;
        const PART_ENTRY: usize = 68;
        const EXTENT_ENTRY: usize = 24;

        let total_extents: usize = parts.iter().map(|(_, e)| e.len()).sum();
        let part_table_size = parts.len() * PART_ENTRY;

        let mut buf = vec![0u8; 64 * 1024];

        // Fake geometry block; also keeps cache keys distinct per image
        buf[0..8].copy_from_slice(b"geometry");
        for (i, (name, _)) in parts.iter().enumerate() {
            let off = 16 + i * 40;
            buf[off..off + name.len()].copy_from_slice(name.as_bytes());
        }

        let header_off = 4096;
        {
            let h = &mut buf[header_off..];
            h[0..4].copy_from_slice(LP_MAGIC);
            LittleEndian::write_u16(&mut h[4..6], 10); // major
            LittleEndian::write_u32(&mut h[8..12], HEADER_SIZE as u32);
            // partitions
            LittleEndian::write_u32(&mut h[80..84], 0);
            LittleEndian::write_u32(&mut h[84..88], parts.len() as u32);
            LittleEndian::write_u32(&mut h[88..92], PART_ENTRY as u32);
            // extents
            LittleEndian::write_u32(&mut h[92..96], part_table_size as u32);
            LittleEndian::write_u32(&mut h[96..100], total_extents as u32);
            LittleEndian::write_u32(&mut h[100..104], EXTENT_ENTRY as u32);
        }

        let tables_base = header_off + HEADER_SIZE;
        let mut extent_index = 0u32;
        for (i, (name, extents)) in parts.iter().enumerate() {
            let off = tables_base + i * PART_ENTRY;
            buf[off..off + name.len()].copy_from_slice(name.as_bytes());
            buf[off + 36] = 0xAB; // guid
            LittleEndian::write_u32(&mut buf[off + 56..off + 60], extent_index);
            LittleEndian::write_u32(&mut buf[off + 60..off + 64], extents.len() as u32);

            for (sectors, target_data) in *extents {
                let eoff =
                    tables_base + part_table_size + extent_index as usize * EXTENT_ENTRY;
                LittleEndian::write_u64(&mut buf[eoff..eoff + 8], *sectors);
                LittleEndian::write_u32(&mut buf[eoff + 8..eoff + 12], LP_TARGET_TYPE_LINEAR);
                LittleEndian::write_u64(&mut buf[eoff + 12..eoff + 20], *target_data);
                extent_index += 1;
            }
        }
        buf
    }

    #[test]
    fn resolves_device_sector_offsets() {
        clear_cache();
        let buf = build_lp(&[
            ("system_a", &[(100_000, 2048)]),
            ("vendor_a", &[(40_000, 102_048)]),
        ]);
        let parts = parse_lp_metadata(&buf).unwrap();
        assert_eq!(parts.len(), 2);

        assert_eq!(parts[0].name, "system_a");
        assert_eq!(parts[0].total_size(), 100_000 * 512);
        assert_eq!(parts[0].first_device_sector_offset(4096), Some(256));
        assert_eq!(parts[1].first_device_sector_offset(4096), Some(12_756));
        // At 512-byte device sectors the extent offset is used verbatim
        assert_eq!(parts[1].first_device_sector_offset(512), Some(102_048));
    }

    #[test]
    fn zero_extents_are_not_device_backed() {
        clear_cache();
        let mut buf = build_lp(&[("cache", &[(512, 0)])]);
        // Flip the lone extent to TARGET_TYPE_ZERO
        let eoff = 4096 + 128 + 68 + 8;
        LittleEndian::write_u32(&mut buf[eoff..eoff + 4], LP_TARGET_TYPE_ZERO);
        let parts = parse_lp_metadata(&buf).unwrap();
        assert_eq!(parts[0].extents[0].target_type, LpTargetType::Zero);
        assert_eq!(parts[0].first_device_sector_offset(4096), None);
    }

    #[test]
    fn missing_magic_is_rejected() {
        assert_eq!(
            parse_lp_metadata(&vec![0u8; 32 * 1024]).unwrap_err(),
            ParseError::InvalidMagic
        );
    }

    #[test]
    fn magic_found_by_scan_at_odd_offset() {
        clear_cache();
        let reference = build_lp(&[("odm_a", &[(1024, 4096)])]);
        // Shift everything forward so the probes miss
        let mut buf = vec![0u8; 70 * 1024];
        buf[300..300 + 60 * 1024].copy_from_slice(&reference[4096..4096 + 60 * 1024]);
        let parts = parse_lp_metadata(&buf).unwrap();
        assert_eq!(parts[0].name, "odm_a");
    }

    #[test]
    fn cache_returns_equal_deep_copies() {
        clear_cache();
        let buf = build_lp(&[("product_a", &[(2048, 8192)])]);
        let first = parse_lp_metadata(&buf).unwrap();
        let mut second = parse_lp_metadata(&buf).unwrap();
        assert_eq!(first, second);
        // Mutating one copy must not leak into the cache
        second[0].name.push('!');
        let third = parse_lp_metadata(&buf).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn cache_is_bounded() {
        clear_cache();
        for i in 0..(CACHE_MAX_ENTRIES + 3) {
            let buf = build_lp(&[(&format!("p{i}"), &[(64, 1024)])]);
            parse_lp_metadata(&buf).unwrap();
        }
        let len = PARSE_CACHE.lock().unwrap().len();
        assert!(len <= CACHE_MAX_ENTRIES, "cache grew to {len}");
    }

    #[test]
    fn truncated_tables_yield_partial_result() {
        clear_cache();
        let buf = build_lp(&[("system_a", &[(100, 2048)]), ("vendor_a", &[(100, 4096)])]);
        // Cut the buffer inside the second partition entry
        let cut = 4096 + 128 + 68 + 20;
        let parts = parse_lp_metadata(&buf[..cut]).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name, "system_a");
    }
}
