// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use fwimg::device::extract_device_info;
use fwimg::flashplan;
use fwimg::fsdetect::{detect_fs_kind, open_filesystem};
use fwimg::gpt::GptTable;
use fwimg::lp;
use fwimg::props::{BuildPropCollector, CancelToken, DEFAULT_PROP_PARTITIONS, parse_build_prop};
use fwimg::slot::detect_slot;
use fwimg::sparse::SparseReader;
use owo_colors::OwoColorize;

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use imgutil::{hexdump, open_image, print_partition_table};

mod imgutil;

#[derive(Debug, Subcommand, PartialEq)]
enum Command {
    /// Read a single build.prop out of a filesystem image
    BuildProp {
        #[arg()]
        image: String,

        /// Explicit in-image path (defaults to the well-known locations)
        #[arg(short, long)]
        path: Option<String>,
    },

    /// Print a file from a filesystem image
    Cat {
        #[arg()]
        image: String,

        #[arg()]
        path: String,
    },

    /// Generate rawprogram/patch/partition XML from a device dump
    GenXml {
        #[arg()]
        image: String,

        #[arg(short, default_value = "out/")]
        outdir: String,
    },

    /// Inspect a whole-device dump and print the device descriptor
    Info {
        #[arg()]
        image: String,
    },

    /// List the contents of a directory inside a filesystem image
    Ls {
        #[arg()]
        image: String,

        #[arg(default_value = "/")]
        path: String,
    },

    /// Print logical partitions from a super image
    Lp {
        #[arg()]
        image: String,

        #[arg(long, default_value = "4096")]
        device_sector_size: u32,
    },

    /// Hexdump a byte range of an image
    Peek {
        #[arg()]
        image: String,

        #[arg(value_parser=maybe_hex::<u64>)]
        base: u64,

        #[arg(default_value = "256", value_parser=maybe_hex::<u64>)]
        len: u64,
    },

    /// Print the GPT of a device dump
    PrintGpt {
        #[arg()]
        image: String,
    },

    /// Print the A/B slot verdict of a device dump
    Slot {
        #[arg()]
        image: String,
    },

    /// Expand an Android sparse image to a raw one
    Unsparse {
        #[arg()]
        image: String,

        #[arg()]
        out: String,
    },
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Assumed sector size when a dump doesn't pin one down
    #[arg(long, default_value = "512")]
    sector_size: u32,

    /// LUN index recorded in generated flash plans
    #[arg(short = 'L', long, default_value = "0")]
    phys_part_idx: u32,

    #[command(subcommand)]
    command: Command,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::BuildProp { image, path } => {
            let fs = open_filesystem(open_image(&image)?)?;
            let Some(content) = fs.read_build_prop(path.as_deref()) else {
                bail!("No build.prop found in {image}");
            };
            let props = parse_build_prop(&content);
            for (k, v) in props.iter() {
                println!("{}={}", k.bright_blue(), v);
            }
        }
        Command::Cat { image, path } => {
            let fs = open_filesystem(open_image(&image)?)?;
            let Some(content) = fs.read_file(&path) else {
                bail!("{path} not found in {image}");
            };
            std::io::stdout().write_all(&content)?;
        }
        Command::GenXml { image, outdir } => {
            let gpt = GptTable::read_from(
                &*open_image(&image)?,
                args.phys_part_idx,
                args.sector_size,
            )?;
            fs::create_dir_all(&outdir)?;
            let outpath = Path::new(&outdir);

            fs::write(
                outpath.join(format!("rawprogram{}.xml", args.phys_part_idx)),
                flashplan::rawprogram_xml(&gpt.partitions),
            )?;
            fs::write(
                outpath.join(format!("patch{}.xml", args.phys_part_idx)),
                flashplan::patch_xml(&gpt.partitions),
            )?;
            fs::write(
                outpath.join("partition.xml"),
                flashplan::partition_xml(&gpt.partitions),
            )?;
            println!(
                "Wrote flash plan for {} partitions to {}",
                gpt.partitions.len().bright_yellow(),
                outdir.green()
            );
        }
        Command::Info { image } => {
            let source = open_image(&image)?;
            let gpt = GptTable::read_from(&*source, args.phys_part_idx, args.sector_size)?;
            let slot = detect_slot(&gpt.partitions);
            println!(
                "{} {} ({})",
                "Current slot:".bright_black(),
                format!("{:?}", slot.verdict).bright_yellow(),
                slot.rule
            );

            let collector = BuildPropCollector::from_gpt(&source, &gpt);
            let merged = collector.collect(
                &DEFAULT_PROP_PARTITIONS,
                slot.suffix(),
                &CancelToken::new(),
            );
            if merged.is_empty() {
                bail!("No property partitions yielded anything");
            }

            let info = extract_device_info(&merged);
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Ls { image, path } => {
            let fs = open_filesystem(open_image(&image)?)?;
            let Some(mut names) = fs.list_dir(&path) else {
                bail!("{path} is not a directory in {image}");
            };
            names.sort();
            for name in names {
                println!("{name}");
            }
        }
        Command::Lp {
            image,
            device_sector_size,
        } => {
            let data = fs::read(&image)?;
            let parts = lp::parse_lp_metadata(&data)?;
            println!("{} logical partitions:", parts.len().bright_yellow());
            for p in parts {
                println!(
                    "{}: {} bytes ({} kiB), device sector offset = {}",
                    p.name.bright_blue(),
                    p.total_size(),
                    p.total_size() / 1024,
                    p.first_device_sector_offset(device_sector_size)
                        .map(|o| o.to_string())
                        .unwrap_or_else(|| "-".to_owned()),
                );
            }
        }
        Command::Peek { image, base, len } => {
            let source = open_image(&image)?;
            let Some(data) = source.read_at(base, len as usize) else {
                bail!("Read failed at {base:#x}");
            };
            hexdump(base, &data);
        }
        Command::PrintGpt { image } => {
            let gpt = GptTable::read_from(
                &*open_image(&image)?,
                args.phys_part_idx,
                args.sector_size,
            )?;
            print_partition_table(&gpt);
        }
        Command::Slot { image } => {
            let gpt = GptTable::read_from(
                &*open_image(&image)?,
                args.phys_part_idx,
                args.sector_size,
            )?;
            let slot = detect_slot(&gpt.partitions);
            println!(
                "Slot {} (decided by: {})",
                format!("{:?}", slot.verdict).bright_yellow(),
                slot.rule.bright_blue()
            );
            for (name, stats) in [("A", &slot.slot_a), ("B", &slot.slot_b)] {
                println!(
                    "  {}: {} partitions, {} active, {} successful, {} unbootable, avg priority {:.2}",
                    name.bright_blue(),
                    stats.partitions,
                    stats.active,
                    stats.successful,
                    stats.unbootable,
                    stats.avg_priority,
                );
            }
        }
        Command::Unsparse { image, out } => {
            let reader = SparseReader::open(open_image(&image)?)?;
            let total = reader.logical_len();
            println!(
                "Expanding {} chunks to {} bytes",
                reader.header().total_chunks.bright_yellow(),
                total.bright_yellow()
            );

            let mut outfile = File::create(&out)?;
            let mut progress = pbr::ProgressBar::new(total);
            progress.set_units(pbr::Units::Bytes);

            const CHUNK: u64 = 1 << 20;
            let mut pos = 0u64;
            while pos < total {
                let n = u64::min(CHUNK, total - pos);
                let data = reader.read(pos, n as usize);
                outfile.write_all(&data)?;
                pos += n;
                progress.set(pos);
            }
            progress.finish_println("done\n");

            if let Some(kind) = detect_fs_kind(&reader.read(0, 4096)) {
                println!("Expanded image contains {}", format!("{kind:?}").green());
            }
        }
    };

    Ok(())
}
