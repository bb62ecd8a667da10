// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! A RAM disk backed by a heap buffer.

use alloc::vec::Vec;

use crate::{blockdev::*, config::SECTOR_SIZE, error::*};

/// Transfer counters of a [`RamDisk`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    /// `read_sectors` calls.
    pub reads: u64,
    /// `write_sectors` calls.
    pub writes: u64,
}

/// A RAM disk; the size is rounded up to whole sectors.
pub struct RamDisk {
    data: Vec<u8>,
    readonly: bool,
    stats: IoStats,
}

impl RamDisk {
    /// Creates a zero filled disk of at least `size_hint` bytes.
    pub fn new(size_hint: usize) -> Self {
        Self::from_image(alloc::vec![0; size_hint])
    }

    /// Wraps an existing image.
    pub fn from_image(mut data: Vec<u8>) -> Self {
        let size = data.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        data.resize(size, 0);
        Self {
            data,
            readonly: false,
            stats: IoStats::default(),
        }
    }

    pub fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    pub fn stats(&self) -> IoStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = IoStats::default();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn range(&self, start: u64, count: u64) -> BlockDevResult<core::ops::Range<usize>> {
        let limit = self.total_sectors();
        if start + count > limit {
            return Err(BlockDevError::OutOfRange {
                sector: start,
                count,
                limit,
            });
        }
        let begin = start as usize * SECTOR_SIZE;
        Ok(begin..begin + count as usize * SECTOR_SIZE)
    }
}

impl SectorDevice for RamDisk {
    fn read_sectors(&mut self, buffer: &mut [u8], start: u64, count: u64) -> BlockDevResult<()> {
        let required = check_buffer(buffer.len(), count)?;
        let range = self.range(start, count)?;
        buffer[..required].copy_from_slice(&self.data[range]);
        self.stats.reads += 1;
        Ok(())
    }

    fn write_sectors(&mut self, buffer: &[u8], start: u64, count: u64) -> BlockDevResult<()> {
        if self.readonly {
            return Err(BlockDevError::ReadOnly);
        }
        let required = check_buffer(buffer.len(), count)?;
        let range = self.range(start, count)?;
        self.data[range].copy_from_slice(&buffer[..required]);
        self.stats.writes += 1;
        Ok(())
    }

    fn total_sectors(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_rounds_up_to_sector() {
        let disk = RamDisk::new(1000);
        assert_eq!(disk.total_sectors(), 2);
    }

    #[test]
    fn test_read_write_and_bounds() {
        let mut disk = RamDisk::new(4 * SECTOR_SIZE);
        let data = [7u8; SECTOR_SIZE];
        disk.write_sectors(&data, 3, 1).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        disk.read_sectors(&mut out, 3, 1).unwrap();
        assert_eq!(out, data);
        assert!(disk.read_sectors(&mut out, 4, 1).is_err());
        assert_eq!(disk.stats(), IoStats { reads: 1, writes: 1 });
    }

    #[test]
    fn test_readonly_refuses_writes() {
        let mut disk = RamDisk::new(SECTOR_SIZE);
        disk.set_readonly(true);
        assert_eq!(
            disk.write_sectors(&[0u8; SECTOR_SIZE], 0, 1),
            Err(BlockDevError::ReadOnly)
        );
    }
}
