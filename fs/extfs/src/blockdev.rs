// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Sector devices, the per-device lock and partition views.
//!
//! The engine never talks to a device directly. A [`SectorDevice`] is wrapped in
//! a [`Disk`], which serializes every physical transfer behind a spinlock so two
//! mounted views of the same device cannot interleave partial sector writes.
//! A [`Partition`] is a window of a disk and carries the byte-granular block
//! reader used by every layer above.

use alloc::sync::Arc;

use log::trace;
use spin::{Mutex, MutexGuard};

use crate::{
    config::{SECTOR_BITS, SECTOR_SIZE},
    error::*,
};

/// Sector addressed storage implemented by backends.
pub trait SectorDevice {
    /// Reads `count` sectors starting at `start` into `buffer`.
    fn read_sectors(&mut self, buffer: &mut [u8], start: u64, count: u64) -> BlockDevResult<()>;

    /// Writes `count` sectors starting at `start` from `buffer`.
    fn write_sectors(&mut self, buffer: &[u8], start: u64, count: u64) -> BlockDevResult<()>;

    /// Device capacity in sectors.
    fn total_sectors(&self) -> u64;

    /// Pushes cached writes to stable storage.
    fn flush(&mut self) -> BlockDevResult<()> {
        Ok(())
    }

    fn is_readonly(&self) -> bool {
        false
    }
}

/// Checks that `buffer` can hold `count` sectors.
pub fn check_buffer(len: usize, count: u64) -> BlockDevResult<usize> {
    let required = count as usize * SECTOR_SIZE;
    if len < required {
        return Err(BlockDevError::BufferTooSmall {
            provided: len,
            required,
        });
    }
    Ok(required)
}

/// A shared, lock protected device.
pub struct Disk<D: SectorDevice> {
    inner: Arc<Mutex<D>>,
}

impl<D: SectorDevice> Clone for Disk<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: SectorDevice> Disk<D> {
    pub fn new(dev: D) -> Self {
        Self {
            inner: Arc::new(Mutex::new(dev)),
        }
    }

    /// Locks the device for direct access.
    pub fn lock(&self) -> MutexGuard<'_, D> {
        self.inner.lock()
    }

    pub fn total_sectors(&self) -> u64 {
        self.inner.lock().total_sectors()
    }

    pub fn is_readonly(&self) -> bool {
        self.inner.lock().is_readonly()
    }

    pub fn read(&self, buffer: &mut [u8], start: u64, count: u64) -> BlockDevResult<()> {
        let mut dev = self.inner.lock();
        dev.read_sectors(buffer, start, count)
    }

    pub fn write(&self, buffer: &[u8], start: u64, count: u64) -> BlockDevResult<()> {
        let mut dev = self.inner.lock();
        if dev.is_readonly() {
            return Err(BlockDevError::ReadOnly);
        }
        dev.write_sectors(buffer, start, count)
    }

    pub fn flush(&self) -> BlockDevResult<()> {
        self.inner.lock().flush()
    }

    /// View covering the whole device.
    pub fn whole(&self) -> Partition<D> {
        Partition {
            disk: self.clone(),
            start_sector: 0,
            length: self.total_sectors(),
        }
    }
}

/// A contiguous sector range of a [`Disk`].
pub struct Partition<D: SectorDevice> {
    disk: Disk<D>,
    start_sector: u64,
    length: u64,
}

impl<D: SectorDevice> Clone for Partition<D> {
    fn clone(&self) -> Self {
        Self {
            disk: self.disk.clone(),
            start_sector: self.start_sector,
            length: self.length,
        }
    }
}

impl<D: SectorDevice> Partition<D> {
    /// Creates a view from a byte offset and a length in sectors.
    pub fn new(disk: Disk<D>, byte_offset: u64, length_in_sectors: u64) -> BlockDevResult<Self> {
        if byte_offset % SECTOR_SIZE as u64 != 0 {
            return Err(BlockDevError::Misaligned {
                offset: byte_offset,
            });
        }
        let start_sector = byte_offset >> SECTOR_BITS;
        let limit = disk.total_sectors();
        if start_sector + length_in_sectors > limit {
            return Err(BlockDevError::OutOfRange {
                sector: start_sector,
                count: length_in_sectors,
                limit,
            });
        }
        Ok(Self {
            disk,
            start_sector,
            length: length_in_sectors,
        })
    }

    pub fn byte_offset(&self) -> u64 {
        self.start_sector << SECTOR_BITS
    }

    pub fn length_in_sectors(&self) -> u64 {
        self.length
    }

    pub fn disk(&self) -> &Disk<D> {
        &self.disk
    }

    pub fn is_readonly(&self) -> bool {
        self.disk.is_readonly()
    }

    fn check_range(&self, start: u64, count: u64) -> BlockDevResult<()> {
        if start.checked_add(count).is_none_or(|end| end > self.length) {
            return Err(BlockDevError::OutOfRange {
                sector: start,
                count,
                limit: self.length,
            });
        }
        Ok(())
    }

    /// Reads whole sectors relative to the partition start.
    pub fn partition_read(&self, start: u64, count: u64, buf: &mut [u8]) -> BlockDevResult<()> {
        self.check_range(start, count)?;
        check_buffer(buf.len(), count)?;
        self.disk.read(buf, self.start_sector + start, count)
    }

    /// Writes whole sectors relative to the partition start.
    pub fn partition_write(&self, start: u64, count: u64, buf: &[u8]) -> BlockDevResult<()> {
        self.check_range(start, count)?;
        check_buffer(buf.len(), count)?;
        self.disk.write(buf, self.start_sector + start, count)
    }

    /// Reads `buf.len()` bytes starting `byte_offset` bytes past `sector`.
    ///
    /// Unaligned requests are split into a partial head sector, a run of whole
    /// sectors read straight into `buf`, and a partial tail sector.
    pub fn read_bytes(&self, sector: u64, byte_offset: u64, buf: &mut [u8]) -> BlockDevResult<()> {
        let len = buf.len() as u64;
        if len == 0 {
            return Ok(());
        }
        let last = sector + ((byte_offset + len - 1) >> SECTOR_BITS);
        if last >= self.length {
            return Err(BlockDevError::OutOfRange {
                sector,
                count: last - sector + 1,
                limit: self.length,
            });
        }

        let mut sector = sector + (byte_offset >> SECTOR_BITS);
        let head = (byte_offset as usize) & (SECTOR_SIZE - 1);
        trace!("read_bytes: sector {sector} head {head} len {len}");

        let mut sec_buf = [0u8; SECTOR_SIZE];
        let mut done = 0usize;
        if head != 0 {
            self.partition_read(sector, 1, &mut sec_buf)?;
            let n = (SECTOR_SIZE - head).min(buf.len());
            buf[..n].copy_from_slice(&sec_buf[head..head + n]);
            done = n;
            sector += 1;
        }

        let whole = (buf.len() - done) & !(SECTOR_SIZE - 1);
        if whole != 0 {
            let count = (whole / SECTOR_SIZE) as u64;
            self.partition_read(sector, count, &mut buf[done..done + whole])?;
            done += whole;
            sector += count;
        }

        let tail = buf.len() - done;
        if tail != 0 {
            self.partition_read(sector, 1, &mut sec_buf)?;
            buf[done..].copy_from_slice(&sec_buf[..tail]);
        }
        Ok(())
    }

    /// Writes `data` at an absolute byte offset from the partition start.
    ///
    /// Partial sectors at either end are read, patched and written back.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> BlockDevResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let first = offset >> SECTOR_BITS;
        let last = (offset + data.len() as u64 - 1) >> SECTOR_BITS;
        self.check_range(first, last - first + 1)?;
        trace!("write_bytes: offset {offset} len {}", data.len());

        let mut sector = first;
        let head = (offset as usize) & (SECTOR_SIZE - 1);
        let mut sec_buf = [0u8; SECTOR_SIZE];
        let mut done = 0usize;
        if head != 0 || data.len() < SECTOR_SIZE {
            let n = (SECTOR_SIZE - head).min(data.len());
            self.partition_read(sector, 1, &mut sec_buf)?;
            sec_buf[head..head + n].copy_from_slice(&data[..n]);
            self.partition_write(sector, 1, &sec_buf)?;
            done = n;
            sector += 1;
        }

        let whole = (data.len() - done) & !(SECTOR_SIZE - 1);
        if whole != 0 {
            let count = (whole / SECTOR_SIZE) as u64;
            self.partition_write(sector, count, &data[done..done + whole])?;
            done += whole;
            sector += count;
        }

        let tail = data.len() - done;
        if tail != 0 {
            self.partition_read(sector, 1, &mut sec_buf)?;
            sec_buf[..tail].copy_from_slice(&data[done..]);
            self.partition_write(sector, 1, &sec_buf)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> BlockDevResult<()> {
        self.disk.flush()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::ramdisk::RamDisk;

    fn patterned(sectors: usize) -> RamDisk {
        let data: alloc::vec::Vec<u8> = (0..sectors * SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
        RamDisk::from_image(data)
    }

    #[test]
    fn test_read_bytes_head_whole_tail() {
        let disk = Disk::new(patterned(8));
        let part = disk.whole();
        let mut buf = vec![0u8; 1200];
        part.read_bytes(1, 700, &mut buf).unwrap();
        let base = 512 + 700;
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, ((base + i) % 251) as u8);
        }
    }

    #[test]
    fn test_read_bytes_within_one_sector() {
        let disk = Disk::new(patterned(4));
        let part = disk.whole();
        let mut buf = [0u8; 10];
        part.read_bytes(2, 3, &mut buf).unwrap();
        assert_eq!(buf[0], ((2 * 512 + 3) % 251) as u8);
        assert_eq!(buf[9], ((2 * 512 + 12) % 251) as u8);
    }

    #[test]
    fn test_read_bytes_rejects_outside_partition() {
        let disk = Disk::new(patterned(8));
        let part = Partition::new(disk, 2 * 512, 4).unwrap();
        let mut buf = [0u8; 16];
        assert!(part.read_bytes(3, 500, &mut buf).is_err());
        assert!(part.read_bytes(3, 400, &mut buf).is_ok());
    }

    #[test]
    fn test_partition_offsets_reads() {
        let disk = Disk::new(patterned(8));
        let part = Partition::new(disk.clone(), 3 * 512, 5).unwrap();
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        part.read_bytes(0, 0, &mut a).unwrap();
        disk.whole().read_bytes(3, 0, &mut b).unwrap();
        assert_eq!(a, b);
        assert_eq!(part.byte_offset(), 1536);
    }

    #[test]
    fn test_write_bytes_preserves_neighbours() {
        let disk = Disk::new(patterned(4));
        let part = disk.whole();
        let data = [0xAAu8; 700];
        part.write_bytes(300, &data).unwrap();

        let mut all = vec![0u8; 4 * SECTOR_SIZE];
        part.read_bytes(0, 0, &mut all).unwrap();
        assert_eq!(all[299], (299 % 251) as u8);
        assert!(all[300..1000].iter().all(|b| *b == 0xAA));
        assert_eq!(all[1000], (1000 % 251) as u8);
    }

    #[test]
    fn test_misaligned_partition_is_rejected() {
        let disk = Disk::new(patterned(4));
        assert_eq!(
            Partition::new(disk, 100, 1).err(),
            Some(BlockDevError::Misaligned { offset: 100 })
        );
    }
}
