// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::{Context, Result};
use fwimg::gpt::GptTable;
use fwimg::source::{FileSource, SharedSource};
use itertools::Itertools;
use owo_colors::OwoColorize;
use std::path::Path;
use std::sync::Arc;

pub fn open_image(path: &str) -> Result<SharedSource> {
    let source = FileSource::open(Path::new(path))
        .with_context(|| format!("Couldn't open image {path}"))?;
    Ok(Arc::new(source))
}

pub fn print_partition_table(gpt: &GptTable) {
    println!(
        "GPT ({:?}, {}-byte sectors, header CRC {}):",
        gpt.variant,
        gpt.sector_size.bright_yellow(),
        if gpt.header_crc_ok {
            "ok".green().to_string()
        } else {
            "BAD".bright_red().to_string()
        },
    );
    for part in &gpt.partitions {
        println!(
            "{}] {}: start_sector = {}, {} bytes ({} kiB)",
            part.entry_index,
            part.name.bright_blue(),
            part.start_lba,
            part.byte_len(),
            part.byte_len() / 1024,
        );
    }
}

pub fn hexdump(base: u64, data: &[u8]) {
    for (i, row) in data.chunks(16).enumerate() {
        let ascii: String = row
            .iter()
            .map(|&b| {
                if (0x20..0x7F).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        let hex = row.iter().map(|b| format!("{b:02x}")).join(" ");
        println!("{:08x}  {hex:<47}  |{ascii}|", base + i as u64 * 16);
    }
}
