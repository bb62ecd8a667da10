// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! File data I/O with run coalescing.
//!
//! Consecutive blocks that are also physically consecutive are merged into
//! one transfer. Reads and writes share the [`Run`] state machine; the result
//! is byte-identical to issuing one transfer per block.

use log::trace;

use crate::{
    blockdev::SectorDevice,
    config::{SECTOR_BITS, SECTOR_SIZE},
    disknode::Ext4Inode,
    error::*,
    ext4::Ext4FileSystem,
    resolver::BlockMapper,
};

/// Pending transfer state, in partition byte addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Run {
    NoRun,
    PendingRun { start: u64, len: usize },
}

impl Run {
    /// Appends `len` bytes at `addr`.
    ///
    /// Returns the run that must be flushed first when `addr` does not
    /// continue the pending one.
    pub(crate) fn extend(&mut self, addr: u64, len: usize) -> Option<(u64, usize)> {
        match *self {
            Run::PendingRun { start, len: cur } if start + cur as u64 == addr => {
                *self = Run::PendingRun {
                    start,
                    len: cur + len,
                };
                return None;
            }
            _ => {}
        }
        let prev = self.flush();
        *self = Run::PendingRun { start: addr, len };
        prev
    }

    /// Ends the pending run, if any.
    pub(crate) fn flush(&mut self) -> Option<(u64, usize)> {
        match core::mem::replace(self, Run::NoRun) {
            Run::PendingRun { start, len } => Some((start, len)),
            Run::NoRun => None,
        }
    }
}

impl<D: SectorDevice> Ext4FileSystem<D> {
    fn read_run(&self, run: Option<(u64, usize)>, buf: &mut [u8], end: usize) -> Ext4Result<()> {
        if let Some((start, len)) = run {
            trace!("read run: byte {start} len {len}");
            self.part.read_bytes(
                start >> SECTOR_BITS,
                start & (SECTOR_SIZE as u64 - 1),
                &mut buf[end - len..end],
            )?;
        }
        Ok(())
    }

    /// Reads file data at `pos` into `buf`; returns the bytes read.
    ///
    /// The request is clamped to the file size. Holes read as zeros.
    pub fn read_at(
        &self,
        inode: &Ext4Inode,
        mapper: &mut BlockMapper,
        pos: u64,
        buf: &mut [u8],
    ) -> Ext4Result<usize> {
        let size = inode.size();
        if pos >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(size - pos) as usize;
        let buf = &mut buf[..len];
        let bs = self.layout.block_size as u64;

        let mut run = Run::NoRun;
        let mut done = 0usize;
        while done < len {
            let file_pos = pos + done as u64;
            let lblk = file_pos / bs;
            let in_block = (file_pos % bs) as usize;
            let chunk = (bs as usize - in_block).min(len - done);

            let phys = mapper.map(&self.part, &self.layout, inode, lblk)?;
            if phys == 0 {
                self.read_run(run.flush(), buf, done)?;
                buf[done..done + chunk].fill(0);
            } else {
                let addr = self.layout.block_to_byte(phys) + in_block as u64;
                self.read_run(run.extend(addr, chunk), buf, done)?;
            }
            done += chunk;
        }
        self.read_run(run.flush(), buf, done)?;
        Ok(len)
    }

    /// Writes `data` over freshly mapped blocks; `blocks[i]` backs logical
    /// block `i`.
    #[cfg(feature = "write")]
    pub(crate) fn write_blocks(&self, blocks: &[u64], data: &[u8]) -> Ext4Result<()> {
        let bs = self.layout.block_size;
        let mut run = Run::NoRun;
        let mut done = 0usize;
        for (chunk, &phys) in data.chunks(bs).zip(blocks) {
            let addr = self.layout.block_to_byte(phys);
            if let Some((start, len)) = run.extend(addr, chunk.len()) {
                trace!("write run: byte {start} len {len}");
                self.part.write_bytes(start, &data[done - len..done])?;
            }
            done += chunk.len();
        }
        if let Some((start, len)) = run.flush() {
            trace!("write run: byte {start} len {len}");
            self.part.write_bytes(start, &data[done - len..done])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::{vec, vec::Vec};

    use super::*;
    use crate::{config::SINGLE_INDIRECT, endian::put_le32, test_util};

    #[test]
    fn test_run_state_machine() {
        let mut run = Run::NoRun;
        assert_eq!(run.extend(1000, 24), None);
        assert_eq!(run.extend(1024, 1024), None);
        assert_eq!(run, Run::PendingRun { start: 1000, len: 1048 });
        assert_eq!(run.extend(4096, 10), Some((1000, 1048)));
        assert_eq!(run.flush(), Some((4096, 10)));
        assert_eq!(run.flush(), None);
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    #[test]
    fn test_coalesced_read_matches_block_reads() {
        let part = test_util::formatted(1024, 2 * 1024 * 1024);
        let fs = Ext4FileSystem::mount(part).unwrap();
        let data = patterned(10 * 1024);
        // Blocks 1100..1105 contiguous, then 1200..1205 contiguous.
        let blocks: Vec<u64> = (1100..1105).chain(1200..1205).collect();
        fs.write_blocks(&blocks, &data).unwrap();

        let mut inode = Ext4Inode::default();
        for (i, b) in blocks.iter().enumerate() {
            inode.i_block[i] = *b as u32;
        }
        inode.set_size(data.len() as u64);

        fs.partition().disk().lock().reset_stats();
        let mut out = vec![0u8; data.len()];
        let n = fs.read_at(&inode, &mut BlockMapper::new(), 0, &mut out).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(out, data);
        assert_eq!(fs.partition().disk().lock().stats().reads, 2);

        // Same bytes one block at a time, from an unaligned start.
        let mut mapper = BlockMapper::new();
        let mut piecewise = vec![0u8; data.len() - 300];
        for (i, piece) in piecewise.chunks_mut(1024).enumerate() {
            fs.read_at(&inode, &mut mapper, 300 + i as u64 * 1024, piece)
                .unwrap();
        }
        assert_eq!(piecewise, &data[300..]);
    }

    #[test]
    fn test_read_clamps_and_zero_fills_holes() {
        let part = test_util::formatted(1024, 2 * 1024 * 1024);
        let fs = Ext4FileSystem::mount(part).unwrap();
        let data = patterned(1024);
        fs.write_blocks(&[1300], &data).unwrap();

        let mut inode = Ext4Inode::default();
        inode.i_block[1] = 1300;
        inode.set_size(2048 + 100);

        let mut out = vec![0xFFu8; 4096];
        let n = fs.read_at(&inode, &mut BlockMapper::new(), 0, &mut out).unwrap();
        assert_eq!(n, 2148);
        assert!(out[..1024].iter().all(|b| *b == 0));
        assert_eq!(&out[1024..2048], &data[..]);
        assert!(out[2048..2148].iter().all(|b| *b == 0));
        assert_eq!(out[2148], 0xFF);

        assert_eq!(
            fs.read_at(&inode, &mut BlockMapper::new(), 5000, &mut out)
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_read_through_single_indirect() {
        let part = test_util::formatted(1024, 2 * 1024 * 1024);
        let fs = Ext4FileSystem::mount(part).unwrap();
        let mut ptrs = vec![0u8; 1024];
        put_le32(&mut ptrs, 0, 1401);
        fs.write_block(1400, &ptrs).unwrap();
        let data = patterned(1024);
        fs.write_blocks(&[1401], &data).unwrap();

        let mut inode = Ext4Inode::default();
        inode.i_block[SINGLE_INDIRECT] = 1400;
        inode.set_size(13 * 1024);
        let mut out = vec![0u8; 1024];
        fs.read_at(&inode, &mut BlockMapper::new(), 12 * 1024, &mut out)
            .unwrap();
        assert_eq!(out, data);
    }
}
