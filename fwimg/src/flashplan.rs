// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Flash-plan XML generation (`rawprogram.xml`, `patch.xml`,
//! `partition.xml`) from a parsed partition table.
//!
//! The attribute set and ordering match what stock Firehose tooling
//! emits, so the output can be fed straight back into a flasher.

use xmltree::{Element, XMLNode};

use crate::gpt::Partition;

fn child(name: &str, attrs: &[(&str, String)]) -> XMLNode {
    let mut e = Element::new(name);
    for (k, v) in attrs {
        e.attributes.insert((*k).to_owned(), v.clone());
    }
    XMLNode::Element(e)
}

fn render(root: Element) -> String {
    let mut out = Vec::new();
    if root.write(&mut out).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn by_lun_and_sector(partitions: &[Partition]) -> Vec<&Partition> {
    let mut sorted: Vec<&Partition> = partitions.iter().collect();
    sorted.sort_by_key(|p| (p.lun, p.start_lba));
    sorted
}

/// One `<program>` per partition, ordered by `(lun, start_sector)`.
pub fn rawprogram_xml(partitions: &[Partition]) -> String {
    let mut root = Element::new("data");
    for p in by_lun_and_sector(partitions) {
        root.children.push(child(
            "program",
            &[
                ("SECTOR_SIZE_IN_BYTES", p.sector_size.to_string()),
                ("file_sector_offset", "0".to_owned()),
                ("filename", format!("{}.img", p.name)),
                ("label", p.name.clone()),
                ("num_partition_sectors", p.num_sectors.to_string()),
                ("physical_partition_number", p.lun.to_string()),
                ("readbackverify", "false".to_owned()),
                ("size_in_KB", format!("{:.1}", p.byte_len() as f64 / 1024.0)),
                ("sparse", "false".to_owned()),
                ("start_byte_hex", format!("0x{:x}", p.byte_offset())),
                ("start_sector", p.start_lba.to_string()),
                ("partofsingleimage", "false".to_owned()),
            ],
        ));
    }
    render(root)
}

/// The minimal GPT-CRC-zeroing patch set: for every LUN, zero the header
/// CRC (byte 16 of LBA 1) and the partition-array CRC (byte 88 of LBA 1).
pub fn patch_xml(partitions: &[Partition]) -> String {
    let mut luns: Vec<(u32, u32)> = partitions.iter().map(|p| (p.lun, p.sector_size)).collect();
    luns.sort_unstable();
    luns.dedup();

    let mut root = Element::new("patches");
    for (lun, sector_size) in luns {
        for (byte_offset, what) in [(16u32, "header"), (88, "partition array")] {
            root.children.push(child(
                "patch",
                &[
                    ("SECTOR_SIZE_IN_BYTES", sector_size.to_string()),
                    ("byte_offset", byte_offset.to_string()),
                    ("filename", "DISK".to_owned()),
                    ("physical_partition_number", lun.to_string()),
                    ("size_in_bytes", "4".to_owned()),
                    ("start_sector", "1".to_owned()),
                    ("value", "0".to_owned()),
                    ("what", format!("Zero out GPT {what} CRC")),
                ],
            ));
        }
    }
    render(root)
}

/// Compact per-partition summary used by provisioning tools.
pub fn partition_xml(partitions: &[Partition]) -> String {
    let mut root = Element::new("partitions");
    for p in by_lun_and_sector(partitions) {
        root.children.push(child(
            "partition",
            &[
                ("label", p.name.clone()),
                ("size_in_kb", (p.byte_len() / 1024).to_string()),
                ("type", p.type_guid.clone()),
                ("bootable", "false".to_owned()),
                ("readonly", "true".to_owned()),
                ("filename", format!("{}.img", p.name)),
            ],
        ));
    }
    render(root)
}
