// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! GUID Partition Table parsing, tolerant edition.
//!
//! Dumps coming back from devices in EDL are rarely textbook: 4K-sector
//! UFS puts the header at byte 4096, eMMC at 512, some tools strip the
//! protective MBR, and backup-GPT dumps start mid-disk. The header search
//! and the ladder of entry-array location strategies below deal with all
//! of that rather than assuming LBA 1.

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::crc::crc32;
use crate::source::{BlockSource, SharedSource, WindowSource};
use crate::{ParseError, Result};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_HEADER_SIZE: usize = 92;
pub const GPT_ENTRY_SIZE: usize = 128;

/// Byte offsets tried before falling back to a full 512-step scan.
const HEADER_PROBE_OFFSETS: [usize; 5] = [4096, 512, 0, 8192, 1024];

const MAX_ENTRIES: u64 = 1024;

#[derive(Debug, Clone)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: String,
    pub partition_entry_lba: u64,
    pub num_entries: u32,
    pub entry_size: u32,
    pub entries_crc32: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GptVariant {
    Primary,
    Backup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub lun: u32,
    pub start_lba: u64,
    pub num_sectors: u64,
    pub sector_size: u32,
    pub type_guid: String,
    pub unique_guid: String,
    pub attributes: u64,
    pub entry_index: u32,
}

impl Partition {
    pub fn byte_offset(&self) -> u64 {
        self.start_lba * self.sector_size as u64
    }

    pub fn byte_len(&self) -> u64 {
        self.num_sectors * self.sector_size as u64
    }

    /// Scope a whole-device source down to this partition.
    pub fn source(&self, base: &SharedSource) -> SharedSource {
        WindowSource::shared(base.clone(), self.byte_offset(), self.byte_len())
    }
}

#[derive(Debug, Clone)]
pub struct GptTable {
    pub header: GptHeader,
    pub variant: GptVariant,
    pub sector_size: u32,
    pub header_crc_ok: bool,
    pub partitions: Vec<Partition>,
}

impl GptTable {
    /// Read the head of `source` and parse. 1 MiB is enough for any
    /// primary GPT (the array ends well before `first_usable_lba`).
    pub fn read_from(source: &dyn BlockSource, lun: u32, default_sector_size: u32) -> Result<Self> {
        let buf = source.read_at(0, 1 << 20).ok_or(ParseError::IoShort)?;
        parse_gpt(&buf, lun, default_sector_size)
    }

    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// Render a GUID in its canonical mixed-endian form (first three groups
/// little-endian, last two big-endian).
pub fn format_guid(raw: &[u8]) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        LittleEndian::read_u32(&raw[0..4]),
        LittleEndian::read_u16(&raw[4..6]),
        LittleEndian::read_u16(&raw[6..8]),
        raw[8],
        raw[9],
        raw[10],
        raw[11],
        raw[12],
        raw[13],
        raw[14],
        raw[15],
    )
}

fn find_header(buf: &[u8]) -> Option<usize> {
    let hit = |off: usize| off + GPT_HEADER_SIZE <= buf.len() && &buf[off..off + 8] == GPT_SIGNATURE;

    for &off in &HEADER_PROBE_OFFSETS {
        if hit(off) {
            return Some(off);
        }
    }
    // Slow path for exotic sector sizes / shifted dumps
    (0..buf.len()).step_by(512).find(|&off| hit(off))
}

/// 128 bytes that plausibly hold a partition entry: non-zero type GUID,
/// sane LBA range, and a decodable UTF-16LE name field.
fn entry_is_valid(entry: &[u8]) -> bool {
    if entry.len() < GPT_ENTRY_SIZE {
        return false;
    }
    if entry[0..16].iter().all(|&b| b == 0) {
        return false;
    }
    let start_lba = LittleEndian::read_u64(&entry[32..40]);
    let end_lba = LittleEndian::read_u64(&entry[40..48]);
    if start_lba == 0 || end_lba == 0 || end_lba < start_lba {
        return false;
    }
    decode_entry_name(&entry[56..128]).is_some()
}

/// UTF-16LE, NUL-terminated. `None` on unpaired surrogates, `Some("")`
/// for a blank field.
fn decode_entry_name(field: &[u8]) -> Option<String> {
    let units: Vec<u16> = field
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .take_while(|&u| u != 0)
        .collect();
    char::decode_utf16(units).collect::<std::result::Result<String, _>>().ok()
}

/// Locate the entry array, trying progressively more desperate options.
fn find_entry_array(
    buf: &[u8],
    header_off: usize,
    header: &GptHeader,
    sector_size: u32,
    variant: GptVariant,
) -> Option<(usize, u32)> {
    let valid_at = |off: usize| off + GPT_ENTRY_SIZE <= buf.len() && entry_is_valid(&buf[off..off + GPT_ENTRY_SIZE]);

    // 1. Where the header says, at the inferred sector size
    let declared = header.partition_entry_lba.saturating_mul(sector_size as u64);
    if declared < buf.len() as u64 && valid_at(declared as usize) {
        return Some((declared as usize, sector_size));
    }

    // 2. Same LBA under the other common sector size
    let alt_ss = if sector_size == 512 { 4096 } else { 512 };
    let alt = header.partition_entry_lba.saturating_mul(alt_ss as u64);
    if alt < buf.len() as u64 && valid_at(alt as usize) {
        return Some((alt as usize, alt_ss));
    }

    // 3. LBA 2 under either sector size, back-inferring the size
    for (off, ss) in [(1024usize, 512u32), (8192, 4096)] {
        if valid_at(off) {
            return Some((off, ss));
        }
    }

    // 4. Forward scan right after the header, 128-byte steps, 32 KiB
    let scan_base = header_off + GPT_HEADER_SIZE;
    for step in 0..(32 * 1024 / GPT_ENTRY_SIZE) {
        let off = scan_base + step * GPT_ENTRY_SIZE;
        if valid_at(off) {
            return Some((off, sector_size));
        }
    }

    // 5. A backup GPT's array sits below its header; scan backward and
    //    then keep walking to the first entry of the run
    if variant == GptVariant::Backup {
        let mut off = header_off;
        while off >= GPT_ENTRY_SIZE {
            off -= GPT_ENTRY_SIZE;
            if valid_at(off) {
                while off >= GPT_ENTRY_SIZE && valid_at(off - GPT_ENTRY_SIZE) {
                    off -= GPT_ENTRY_SIZE;
                }
                return Some((off, sector_size));
            }
        }
    }

    None
}

fn parse_entry(entry: &[u8], index: u32, lun: u32, sector_size: u32) -> Option<Partition> {
    if entry[0..16].iter().all(|&b| b == 0) {
        // Empty slot
        return None;
    }
    let start_lba = LittleEndian::read_u64(&entry[32..40]);
    let end_lba = LittleEndian::read_u64(&entry[40..48]);
    if start_lba == 0 || end_lba < start_lba {
        return None;
    }

    let type_guid = format_guid(&entry[0..16]);
    let unique_guid = format_guid(&entry[16..32]);
    let name = match decode_entry_name(&entry[56..128]) {
        Some(n) if !n.is_empty() => n,
        _ => {
            let stem = if entry[16..32].iter().any(|&b| b != 0) {
                &unique_guid
            } else {
                &type_guid
            };
            format!("unnamed_{}", &stem[..8])
        }
    };

    Some(Partition {
        name,
        lun,
        start_lba,
        num_sectors: end_lba - start_lba + 1,
        sector_size,
        type_guid,
        unique_guid,
        attributes: LittleEndian::read_u64(&entry[48..56]),
        entry_index: index,
    })
}

/// Parse a GPT out of a raw buffer (device head, or a tail dump holding
/// the backup copy). `lun` is carried through to the partitions.
pub fn parse_gpt(buf: &[u8], lun: u32, default_sector_size: u32) -> Result<GptTable> {
    let header_off = find_header(buf).ok_or(ParseError::InvalidMagic)?;
    let h = &buf[header_off..];

    let header = GptHeader {
        revision: LittleEndian::read_u32(&h[8..12]),
        header_size: LittleEndian::read_u32(&h[12..16]),
        header_crc32: LittleEndian::read_u32(&h[16..20]),
        my_lba: LittleEndian::read_u64(&h[24..32]),
        alternate_lba: LittleEndian::read_u64(&h[32..40]),
        first_usable_lba: LittleEndian::read_u64(&h[40..48]),
        last_usable_lba: LittleEndian::read_u64(&h[48..56]),
        disk_guid: format_guid(&h[56..72]),
        partition_entry_lba: LittleEndian::read_u64(&h[72..80]),
        num_entries: LittleEndian::read_u32(&h[80..84]),
        entry_size: LittleEndian::read_u32(&h[84..88]),
        entries_crc32: LittleEndian::read_u32(&h[88..92]),
    };

    let variant = if header.alternate_lba != 0 && header.my_lba > header.alternate_lba {
        GptVariant::Backup
    } else {
        GptVariant::Primary
    };

    // A header found at byte N of the device sits at LBA my_lba, which
    // pins the sector size - when the division lands on a sane value.
    let sector_size = if header.my_lba > 0 {
        match (header_off as u64) / header.my_lba {
            512 => 512,
            4096 => 4096,
            _ => default_sector_size,
        }
    } else {
        default_sector_size
    };

    // CRC check over the declared header size with the CRC field zeroed.
    // A mismatch is worth reporting but plenty of shipped images have one,
    // so it does not invalidate the parse.
    let header_crc_ok = {
        let size = header.header_size as usize;
        if (GPT_HEADER_SIZE..=512).contains(&size) && header_off + size <= buf.len() {
            let mut copy = buf[header_off..header_off + size].to_vec();
            copy[16..20].fill(0);
            crc32(&copy) == header.header_crc32
        } else {
            false
        }
    };
    if !header_crc_ok {
        warn!("gpt: header CRC mismatch on lun {lun} (continuing)");
    }

    let Some((entries_off, sector_size)) =
        find_entry_array(buf, header_off, &header, sector_size, variant)
    else {
        // A header with no locatable array still carries layout info
        return Ok(GptTable {
            header,
            variant,
            sector_size,
            header_crc_ok,
            partitions: Vec::new(),
        });
    };

    let entry_size = if header.entry_size as usize >= GPT_ENTRY_SIZE {
        header.entry_size as u64
    } else {
        GPT_ENTRY_SIZE as u64
    };

    // How many slots to walk: what the buffer can hold (at least the
    // standard 128), bounded by what the header claims the array spans,
    // and a hard cap to stay sane on garbage.
    let capacity = (buf.len() as u64 - entries_off as u64) / entry_size;
    let span = header
        .first_usable_lba
        .saturating_sub(header.partition_entry_lba)
        .saturating_mul(sector_size as u64)
        / entry_size;
    let declared = u64::max(header.num_entries as u64, span);
    let count = u64::min(
        u64::min(u64::max(128, capacity), declared),
        MAX_ENTRIES,
    );

    let mut partitions = Vec::new();
    for i in 0..count {
        let off = entries_off + (i * entry_size) as usize;
        if off + GPT_ENTRY_SIZE > buf.len() {
            break;
        }
        if let Some(p) = parse_entry(&buf[off..off + GPT_ENTRY_SIZE], i as u32, lun, sector_size) {
            partitions.push(p);
        }
    }

    Ok(GptTable {
        header,
        variant,
        sector_size,
        header_crc_ok,
        partitions,
    })
}
