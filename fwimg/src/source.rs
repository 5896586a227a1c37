// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Random-access byte providers the parsing layers sit on top of.
//!
//! A [`BlockSource`] is the only seam between the format stack and the
//! outside world: a partition exposed through a Firehose read callback, an
//! image file on disk and a plain byte buffer all look the same from up
//! here. Sources never fail loudly - a read that straddles the end returns
//! a short buffer, and `None` means a transient failure that aborts only
//! the parse path that issued it.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Read-only, random-access byte provider.
///
/// Implementations must tolerate concurrent readers (the build.prop
/// collector fans out) and must not own or close the underlying transport.
pub trait BlockSource: Send + Sync {
    /// Read up to `length` bytes at `offset`. A short (or empty) buffer
    /// means end-of-source; `None` means a transient I/O failure.
    fn read_at(&self, offset: u64, length: usize) -> Option<Vec<u8>>;

    /// Total size in bytes, when the implementation knows it.
    fn len(&self) -> Option<u64> {
        None
    }
}

/// Shared handle to a source; readers borrow, never own.
pub type SharedSource = Arc<dyn BlockSource>;

/// In-memory source over an image held in a byte buffer.
pub struct MemSource {
    data: Vec<u8>,
}

impl MemSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn shared(data: Vec<u8>) -> SharedSource {
        Arc::new(Self::new(data))
    }
}

impl BlockSource for MemSource {
    fn read_at(&self, offset: u64, length: usize) -> Option<Vec<u8>> {
        let start = usize::min(offset.min(self.data.len() as u64) as usize, self.data.len());
        let end = usize::min(start.saturating_add(length), self.data.len());
        Some(self.data[start..end].to_vec())
    }

    fn len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Image file on the host filesystem. Seeks under a mutex so the handle
/// stays usable from the collector's worker threads.
pub struct FileSource {
    file: Mutex<File>,
    len: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl BlockSource for FileSource {
    fn read_at(&self, offset: u64, length: usize) -> Option<Vec<u8>> {
        if offset >= self.len {
            return Some(Vec::new());
        }
        let n = usize::min(length, (self.len - offset) as usize);
        let mut buf = vec![0u8; n];

        let mut file = self.file.lock().ok()?;
        file.seek(SeekFrom::Start(offset)).ok()?;
        let mut filled = 0;
        while filled < n {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(m) => filled += m,
                Err(_) => return None,
            }
        }
        buf.truncate(filled);
        Some(buf)
    }

    fn len(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// Adapter for a host-provided read callback (e.g. a live Firehose
/// partition read). The callback owns nothing and may fail transiently.
pub struct FnSource<F> {
    read: F,
}

impl<F> FnSource<F>
where
    F: Fn(u64, usize) -> Option<Vec<u8>> + Send + Sync,
{
    pub fn new(read: F) -> Self {
        Self { read }
    }
}

impl<F> BlockSource for FnSource<F>
where
    F: Fn(u64, usize) -> Option<Vec<u8>> + Send + Sync,
{
    fn read_at(&self, offset: u64, length: usize) -> Option<Vec<u8>> {
        (self.read)(offset, length)
    }
}

/// A window into another source, used to scope one partition out of a
/// whole-device view. Reads clamp to the window.
pub struct WindowSource {
    base: SharedSource,
    offset: u64,
    size: u64,
}

impl WindowSource {
    pub fn new(base: SharedSource, offset: u64, size: u64) -> Self {
        Self { base, offset, size }
    }

    pub fn shared(base: SharedSource, offset: u64, size: u64) -> SharedSource {
        Arc::new(Self::new(base, offset, size))
    }

    pub fn base_offset(&self) -> u64 {
        self.offset
    }
}

impl BlockSource for WindowSource {
    fn read_at(&self, offset: u64, length: usize) -> Option<Vec<u8>> {
        if offset >= self.size {
            return Some(Vec::new());
        }
        let n = usize::min(length, (self.size - offset) as usize);
        self.base.read_at(self.offset + offset, n)
    }

    fn len(&self) -> Option<u64> {
        Some(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_source_clamps_at_end() {
        let src = MemSource::new(vec![1, 2, 3, 4]);
        assert_eq!(src.read_at(0, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(src.read_at(2, 10).unwrap(), vec![3, 4]);
        assert!(src.read_at(4, 1).unwrap().is_empty());
        assert!(src.read_at(100, 1).unwrap().is_empty());
    }

    #[test]
    fn window_scopes_reads() {
        let base = MemSource::shared((0u8..32).collect());
        let win = WindowSource::new(base, 8, 8);
        assert_eq!(win.read_at(0, 4).unwrap(), vec![8, 9, 10, 11]);
        assert_eq!(win.read_at(6, 10).unwrap(), vec![14, 15]);
        assert!(win.read_at(8, 1).unwrap().is_empty());
        assert_eq!(win.len(), Some(8));
    }

    #[test]
    fn fn_source_propagates_failure() {
        let src = FnSource::new(|off, _| if off == 0 { Some(vec![0xAA]) } else { None });
        assert_eq!(src.read_at(0, 1).unwrap(), vec![0xAA]);
        assert!(src.read_at(512, 1).is_none());
    }
}
