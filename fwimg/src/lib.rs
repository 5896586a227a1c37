// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Offline firmware-image inspection for EDL flashing tools.
//!
//! Everything in here is read-only: given raw byte access to a device
//! partition (or an image file on disk), the crate parses the stack of
//! formats Android firmware is built out of - GPT, LP (`super`) metadata,
//! EXT4, EROFS, the Android Sparse container and the LZ4/LZMA codecs the
//! filesystems lean on - and surfaces partition layout, slot state and
//! `build.prop` contents without ever touching the transport.

use thiserror::Error;

pub mod crc;
pub mod device;
pub mod erofs;
pub mod ext4;
pub mod flashplan;
pub mod fsdetect;
pub mod gpt;
pub mod lp;
pub mod lz4;
pub mod lzma;
pub mod props;
pub mod slot;
pub mod source;
pub mod sparse;

pub use source::{BlockSource, SharedSource};

/// Why a parser rejected its input outright.
///
/// Parsers only return an error when they produced nothing useful; a
/// truncated structure that still yielded data comes back as `Ok` with
/// whatever was recovered.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("magic/signature mismatch")]
    InvalidMagic,

    #[error("structure extends past the end of the data")]
    Truncated,

    #[error("unsupported on-disk layout or feature")]
    UnsupportedLayout,

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("short or failed read from the block source")]
    IoShort,
}

pub type Result<T> = std::result::Result<T, ParseError>;
