use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use extfs::{
    SectorDevice,
    config::SECTOR_SIZE,
    error::{BlockDevError, BlockDevResult},
};
use log::trace;

/// Disk image file seen as a sector device.
pub struct FileDisk {
    file: File,
    total_sectors: u64,
    readonly: bool,
}

impl FileDisk {
    /// Opens an existing image; a trailing partial sector is ignored.
    pub fn open(path: &Path, readonly: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            total_sectors: len / SECTOR_SIZE as u64,
            readonly,
        })
    }

    /// Creates or truncates an image of `size` bytes.
    pub fn create(path: &Path, size: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            file,
            total_sectors: size / SECTOR_SIZE as u64,
            readonly: false,
        })
    }

    fn check_range(&self, start: u64, count: u64) -> BlockDevResult<()> {
        if start.checked_add(count).is_none_or(|end| end > self.total_sectors) {
            return Err(BlockDevError::OutOfRange {
                sector: start,
                count,
                limit: self.total_sectors,
            });
        }
        Ok(())
    }
}

impl SectorDevice for FileDisk {
    fn read_sectors(&mut self, buffer: &mut [u8], start: u64, count: u64) -> BlockDevResult<()> {
        self.check_range(start, count)?;
        let required = extfs::blockdev::check_buffer(buffer.len(), count)?;
        trace!("file disk: read {count} sectors at {start}");
        self.file
            .seek(SeekFrom::Start(start * SECTOR_SIZE as u64))
            .map_err(|_| BlockDevError::Io)?;
        self.file
            .read_exact(&mut buffer[..required])
            .map_err(|_| BlockDevError::ReadError)
    }

    fn write_sectors(&mut self, buffer: &[u8], start: u64, count: u64) -> BlockDevResult<()> {
        if self.readonly {
            return Err(BlockDevError::ReadOnly);
        }
        self.check_range(start, count)?;
        let required = extfs::blockdev::check_buffer(buffer.len(), count)?;
        trace!("file disk: write {count} sectors at {start}");
        self.file
            .seek(SeekFrom::Start(start * SECTOR_SIZE as u64))
            .map_err(|_| BlockDevError::Io)?;
        self.file
            .write_all(&buffer[..required])
            .map_err(|_| BlockDevError::WriteError)
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn flush(&mut self) -> BlockDevResult<()> {
        if self.readonly {
            return Ok(());
        }
        self.file.sync_all().map_err(|_| BlockDevError::Io)
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sectors_round_trip_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut disk = FileDisk::create(&path, 4 * SECTOR_SIZE as u64).unwrap();
        assert_eq!(disk.total_sectors(), 4);

        let data = vec![0xA5u8; 2 * SECTOR_SIZE];
        disk.write_sectors(&data, 1, 2).unwrap();
        let mut back = vec![0u8; 2 * SECTOR_SIZE];
        disk.read_sectors(&mut back, 1, 2).unwrap();
        assert_eq!(back, data);
        assert!(matches!(
            disk.read_sectors(&mut back, 3, 2),
            Err(BlockDevError::OutOfRange { .. })
        ));

        let mut ro = FileDisk::open(&path, true).unwrap();
        assert_eq!(ro.write_sectors(&data, 0, 1), Err(BlockDevError::ReadOnly));
    }
}
