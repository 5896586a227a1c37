// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! End-to-end: a synthetic whole-device dump goes in, partition layout,
//! slot state, merged properties and a flash plan come out.

use fwimg::device::extract_device_info;
use fwimg::flashplan;
use fwimg::fsdetect::open_filesystem;
use fwimg::gpt::{GPT_ENTRY_SIZE, GPT_SIGNATURE, parse_gpt};
use fwimg::props::{BuildPropCollector, CancelToken, parse_build_prop};
use fwimg::slot::{SlotVerdict, detect_slot};
use fwimg::source::MemSource;
use fwimg::{lp, lz4, lzma, sparse};

const SECTOR: usize = 512;
const ACTIVE: u64 = 1 << 50;

fn le16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}
fn le32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn le64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Tiny EROFS: inline root directory, inline `build.prop`.
fn erofs_image(prop_content: &[u8]) -> Vec<u8> {
    let mut img = vec![0u8; 64 * 1024];

    // Superblock at 1024: 4 KiB blocks, meta at block 1, root nid 0
    le32(&mut img, 1024, 0xE0F5_E1E2);
    img[1024 + 12] = 12;
    le16(&mut img, 1024 + 14, 0);
    le32(&mut img, 1024 + 40, 1);

    let slot = |nid: usize| 4096 + nid * 32;

    // build.prop inode at nid 8, FLAT_INLINE (layout 2), compact
    let file = slot(8);
    le16(&mut img, file, 2 << 1);
    le16(&mut img, file + 4, 0o100644);
    le32(&mut img, file + 8, prop_content.len() as u32);
    img[file + 32..file + 32 + prop_content.len()].copy_from_slice(prop_content);

    // Root directory inode at nid 0, FLAT_INLINE, three dirents
    let names: &[(&str, u64, u8)] = &[(".", 0, 2), ("..", 0, 2), ("build.prop", 8, 1)];
    let mut dirents = vec![0u8; names.len() * 12];
    let mut blob = Vec::new();
    for (i, (name, nid, ftype)) in names.iter().enumerate() {
        le64(&mut dirents, i * 12, *nid);
        le16(&mut dirents, i * 12 + 8, (names.len() * 12 + blob.len()) as u16);
        dirents[i * 12 + 10] = *ftype;
        blob.extend_from_slice(name.as_bytes());
    }
    dirents.extend_from_slice(&blob);

    let root = slot(0);
    le16(&mut img, root, 2 << 1);
    le16(&mut img, root + 4, 0o040755);
    le32(&mut img, root + 8, dirents.len() as u32);
    img[root + 32..root + 32 + dirents.len()].copy_from_slice(&dirents);

    img
}

/// Wrap an image in a single-RAW-chunk sparse container.
fn sparsify(raw: &[u8], block_size: u32) -> Vec<u8> {
    assert_eq!(raw.len() % block_size as usize, 0);
    let mut img = Vec::with_capacity(28 + 12 + raw.len());
    img.extend_from_slice(&0xED26_FF3Au32.to_le_bytes());
    img.extend_from_slice(&1u16.to_le_bytes());
    img.extend_from_slice(&0u16.to_le_bytes());
    img.extend_from_slice(&28u16.to_le_bytes());
    img.extend_from_slice(&12u16.to_le_bytes());
    img.extend_from_slice(&block_size.to_le_bytes());
    img.extend_from_slice(&((raw.len() as u32) / block_size).to_le_bytes());
    img.extend_from_slice(&1u32.to_le_bytes());
    img.extend_from_slice(&0u32.to_le_bytes());
    img.extend_from_slice(&0xCAC1u16.to_le_bytes());
    img.extend_from_slice(&0u16.to_le_bytes());
    img.extend_from_slice(&((raw.len() as u32) / block_size).to_le_bytes());
    img.extend_from_slice(&(12 + raw.len() as u32).to_le_bytes());
    img.extend_from_slice(raw);
    img
}

struct PartSpec {
    name: &'static str,
    start_lba: u64,
    sectors: u64,
    attrs: u64,
    content: Vec<u8>,
}

/// Whole-device image: GPT at LBA 1/2, partition payloads at their LBAs.
fn device_image(parts: &[PartSpec]) -> Vec<u8> {
    let total = parts
        .iter()
        .map(|p| (p.start_lba + p.sectors) as usize * SECTOR)
        .max()
        .unwrap_or(0)
        .max(1 << 20);
    let mut dev = vec![0u8; total];

    for (i, p) in parts.iter().enumerate() {
        let off = 2 * SECTOR + i * GPT_ENTRY_SIZE;
        dev[off] = 0xA5;
        dev[off + 15] = i as u8 + 1;
        dev[off + 16] = 0x5A;
        le64(&mut dev, off + 32, p.start_lba);
        le64(&mut dev, off + 40, p.start_lba + p.sectors - 1);
        le64(&mut dev, off + 48, p.attrs);
        for (j, u) in p.name.encode_utf16().enumerate() {
            le16(&mut dev, off + 56 + j * 2, u);
        }

        let dst = p.start_lba as usize * SECTOR;
        dev[dst..dst + p.content.len()].copy_from_slice(&p.content);
    }

    let h = SECTOR;
    dev[h..h + 8].copy_from_slice(GPT_SIGNATURE);
    le32(&mut dev, h + 12, 92);
    le64(&mut dev, h + 24, 1);
    le64(&mut dev, h + 32, (total / SECTOR) as u64 - 1);
    le64(&mut dev, h + 40, 64); // first usable
    le64(&mut dev, h + 48, (total / SECTOR) as u64 - 64);
    le64(&mut dev, h + 72, 2);
    le32(&mut dev, h + 80, parts.len() as u32);
    le32(&mut dev, h + 84, GPT_ENTRY_SIZE as u32);

    dev
}

#[test]
fn device_dump_to_device_info() {
    let system = erofs_image(
        b"ro.product.model=QRD8550\nro.product.brand=acme\nro.build.version.release=14\n",
    );
    let vendor = sparsify(
        &erofs_image(b"ro.product.model=VendorSaysOtherwise\nro.vendor.build.security_patch=2024-03-05\n"),
        4096,
    );

    let dump = device_image(&[
        PartSpec {
            name: "system_a",
            start_lba: 64,
            sectors: 128,
            attrs: ACTIVE,
            content: system.clone(),
        },
        PartSpec {
            name: "system_b",
            start_lba: 192,
            sectors: 128,
            attrs: 0,
            content: Vec::new(),
        },
        PartSpec {
            name: "vendor_a",
            start_lba: 320,
            sectors: 160,
            attrs: ACTIVE,
            content: vendor,
        },
        PartSpec {
            name: "vendor_b",
            start_lba: 480,
            sectors: 160,
            attrs: 0,
            content: Vec::new(),
        },
    ]);

    // Layout
    let gpt = parse_gpt(&dump, 0, 512).unwrap();
    assert_eq!(gpt.partitions.len(), 4);
    assert_eq!(gpt.sector_size, 512);

    // Slot state
    let slot = detect_slot(&gpt.partitions);
    assert_eq!(slot.verdict, SlotVerdict::A);

    // Properties, vendor-priority merged (vendor beats system by default)
    let source = MemSource::shared(dump);
    let collector = BuildPropCollector::from_gpt(&source, &gpt);
    let merged = collector.collect(
        &["system", "vendor"],
        slot.suffix(),
        &CancelToken::new(),
    );
    assert_eq!(merged.get("ro.product.model"), Some("VendorSaysOtherwise"));
    assert_eq!(merged.get("ro.build.version.release"), Some("14"));

    // Descriptor projection
    let info = extract_device_info(&merged);
    assert_eq!(info.model, "VendorSaysOtherwise");
    assert_eq!(info.brand, "acme");
    assert_eq!(info.android_version, "14");
    assert_eq!(info.security_patch, "2024-03-05");

    // Flash plan round-trip sanity
    let raw = flashplan::rawprogram_xml(&gpt.partitions);
    assert!(raw.contains(r#"label="system_a""#));
    assert!(raw.contains(r#"start_sector="64""#));
    let patch = flashplan::patch_xml(&gpt.partitions);
    assert!(patch.contains(r#"byte_offset="16""#));
    assert!(patch.contains(r#"byte_offset="88""#));
}

#[test]
fn every_parser_survives_garbage() {
    let mut x = 0x2545_F491u32;
    let mut buf = vec![0u8; 128 * 1024];
    for b in buf.iter_mut() {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *b = x as u8;
    }

    for skew in [0usize, 1, 511, 4095] {
        let slice = buf[skew..].to_vec();

        let _ = parse_gpt(&slice, 0, 512);
        let _ = lp::parse_lp_metadata(&slice);
        let _ = open_filesystem(MemSource::shared(slice.clone()));
        let _ = sparse::SparseReader::open(MemSource::shared(slice.clone()));
        let _ = lz4::decompress_frame(&slice);
        let _ = lz4::decompress_block(&slice, 1 << 16);
        let _ = lzma::lzma_decompress(&slice, 1 << 16);
        let _ = lzma::lzma2_decompress(&slice, 1 << 16);
        let _ = parse_build_prop(&slice);
    }
}
