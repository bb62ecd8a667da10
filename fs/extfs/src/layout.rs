// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Volume geometry built once at mount.

use alloc::vec;

use log::{debug, error, warn};

use crate::{
    blockdev::{Partition, SectorDevice},
    blockgroup_description::GroupDescTable,
    config::*,
    endian::DiskFormat,
    error::*,
    superblock::{READ_INCOMPAT_SUPPORTED, Superblock},
};

/// Superblock, descriptor table and the constants derived from them.
#[derive(Debug, Clone)]
pub struct Layout {
    pub sb: Superblock,
    pub gdt: GroupDescTable,
    pub block_size: usize,
    pub inode_size: usize,
    pub sectors_per_block: u64,
    pub group_count: u32,
    /// First block of the descriptor table.
    pub gdt_block: u64,
    /// Blocks occupied by the descriptor table.
    pub gdt_blocks: u64,
}

impl Layout {
    /// Reads and validates the superblock, then loads the descriptor table.
    pub fn load<D: SectorDevice>(part: &Partition<D>) -> Ext4Result<Self> {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        part.read_bytes(SUPERBLOCK_SECTOR, 0, &mut raw)?;
        let sb = Superblock::from_disk_bytes(&raw);
        if !sb.is_valid_magic() {
            error!("bad superblock magic {:#06x}", sb.s_magic);
            return Err(Ext4Error::InvalidMagic { found: sb.s_magic });
        }

        if sb.s_log_block_size > MAX_LOG_BLOCK_SIZE {
            error!("block size exponent {} out of range", sb.s_log_block_size);
            return Err(Ext4Error::Corrupted("block size"));
        }
        let block_size = sb.block_size();
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            error!("block size {block_size} out of range");
            return Err(Ext4Error::Corrupted("block size"));
        }
        if sb.s_blocks_per_group == 0 || sb.s_inodes_per_group == 0 {
            return Err(Ext4Error::Corrupted("zero blocks or inodes per group"));
        }
        let inode_size = sb.inode_size();
        if inode_size < GOOD_OLD_INODE_SIZE || inode_size > block_size {
            return Err(Ext4Error::Corrupted("inode size"));
        }
        if sb.blocks_count() <= sb.s_first_data_block as u64 {
            return Err(Ext4Error::Corrupted("block count"));
        }

        let unknown = sb.s_feature_incompat.difference(READ_INCOMPAT_SUPPORTED);
        if !unknown.is_empty() {
            warn!("unsupported incompat features {:#x}", unknown.bits());
        }

        let group_count = sb.group_count();
        if u64::from(sb.s_inodes_count) > u64::from(group_count) * u64::from(sb.s_inodes_per_group) {
            error!(
                "{} inodes do not fit {group_count} groups of {}",
                sb.s_inodes_count, sb.s_inodes_per_group
            );
            return Err(Ext4Error::Corrupted("inode count"));
        }
        let stride = sb.desc_size();
        let gdt_bytes = group_count as usize * stride;
        let gdt_blocks = gdt_bytes.div_ceil(block_size) as u64;
        let gdt_block = if block_size == MIN_BLOCK_SIZE { 2 } else { 1 };
        let sectors_per_block = (block_size >> SECTOR_BITS) as u64;

        let mut table = vec![0u8; gdt_blocks as usize * block_size];
        part.read_bytes(gdt_block * sectors_per_block, 0, &mut table)?;

        debug!(
            "mount: block size {block_size}, inode size {inode_size}, {group_count} groups, \
             {} blocks, {} inodes, gdt at {gdt_block} ({gdt_blocks} blocks, stride {stride})",
            sb.blocks_count(),
            sb.s_inodes_count
        );

        Ok(Self {
            gdt: GroupDescTable::new(table, stride, group_count),
            sb,
            block_size,
            inode_size,
            sectors_per_block,
            group_count,
            gdt_block,
            gdt_blocks,
        })
    }

    /// Sector of `block` relative to the partition start.
    pub fn block_to_sector(&self, block: u64) -> u64 {
        block * self.sectors_per_block
    }

    /// Byte offset of `block` relative to the partition start.
    pub fn block_to_byte(&self, block: u64) -> u64 {
        block * self.block_size as u64
    }

    /// Group, table block and byte offset of inode `ino`.
    pub fn inode_location(&self, ino: u32) -> Ext4Result<(u32, u64, usize)> {
        if ino == 0 || ino > self.sb.s_inodes_count {
            return Err(Ext4Error::Corrupted("inode number out of range"));
        }
        let ipg = self.sb.s_inodes_per_group;
        let group = (ino - 1) / ipg;
        if group >= self.group_count {
            return Err(Ext4Error::Corrupted("inode group out of range"));
        }
        let index = ((ino - 1) % ipg) as usize;
        let byte = index * self.inode_size;
        let table = self.gdt.get(group).inode_table();
        Ok((
            group,
            table + (byte / self.block_size) as u64,
            byte % self.block_size,
        ))
    }

    /// Group holding `block` and the bit index inside its bitmap.
    pub fn block_group_of(&self, block: u64) -> (u32, usize) {
        let rel = block - self.sb.s_first_data_block as u64;
        let bpg = self.sb.s_blocks_per_group as u64;
        ((rel / bpg) as u32, (rel % bpg) as usize)
    }

    /// First block of group `group`.
    pub fn group_first_block(&self, group: u32) -> u64 {
        self.sb.s_first_data_block as u64 + group as u64 * self.sb.s_blocks_per_group as u64
    }

    /// Blocks that actually exist in `group`; only the last one may be short.
    pub fn blocks_in_group(&self, group: u32) -> usize {
        let first = self.group_first_block(group);
        let end = (first + self.sb.s_blocks_per_group as u64).min(self.sb.blocks_count());
        (end - first) as usize
    }

    /// Sectors a data block accounts for in `i_blocks`.
    pub fn sectors_per_block(&self) -> u64 {
        self.sectors_per_block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blockdev::Disk,
        endian::{put_le16, put_le32},
        ramdisk::RamDisk,
        test_util,
    };

    #[test]
    fn test_load_formatted_volume() {
        let part = test_util::formatted(1024, 4 * 1024 * 1024);
        let layout = Layout::load(&part).unwrap();
        assert_eq!(layout.block_size, 1024);
        assert_eq!(layout.gdt_block, 2);
        assert_eq!(layout.sectors_per_block, 2);
        assert_eq!(layout.group_count, 1);
        assert_eq!(layout.gdt.count(), 1);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let disk = Disk::new(RamDisk::new(64 * 1024));
        let part = disk.whole();
        assert_eq!(
            Layout::load(&part).err(),
            Some(Ext4Error::InvalidMagic { found: 0 })
        );
        let mut bytes = [0u8; 2];
        put_le16(&mut bytes, 0, 0x1234);
        part.write_bytes(SUPERBLOCK_OFFSET + 56, &bytes).unwrap();
        assert_eq!(
            Layout::load(&part).err(),
            Some(Ext4Error::InvalidMagic { found: 0x1234 })
        );
    }

    #[test]
    fn test_corrupt_geometry_is_an_error() {
        let part = test_util::formatted(1024, 4 * 1024 * 1024);
        let mut field = [0u8; 4];
        put_le32(&mut field, 0, 70);
        part.write_bytes(SUPERBLOCK_OFFSET + 24, &field).unwrap();
        assert_eq!(Layout::load(&part).err(), Some(Ext4Error::Corrupted("block size")));

        let part = test_util::formatted(1024, 4 * 1024 * 1024);
        let ipg = Layout::load(&part).unwrap().sb.s_inodes_per_group;
        put_le32(&mut field, 0, ipg * 100);
        part.write_bytes(SUPERBLOCK_OFFSET, &field).unwrap();
        assert_eq!(Layout::load(&part).err(), Some(Ext4Error::Corrupted("inode count")));
    }

    #[test]
    fn test_inode_location() {
        let part = test_util::formatted(4096, 8 * 1024 * 1024);
        let layout = Layout::load(&part).unwrap();
        let table = layout.gdt.get(0).inode_table();
        let per_block = 4096 / layout.inode_size;
        let (group, block, offset) = layout.inode_location(2).unwrap();
        assert_eq!((group, block, offset), (0, table, layout.inode_size));
        let (_, block, offset) = layout.inode_location(per_block as u32 + 1).unwrap();
        assert_eq!((block, offset), (table + 1, 0));
        assert!(layout.inode_location(0).is_err());

        let mut wide = layout.clone();
        wide.sb.s_inodes_count = wide.sb.s_inodes_per_group * 100;
        assert_eq!(
            wide.inode_location(wide.sb.s_inodes_count).err(),
            Some(Ext4Error::Corrupted("inode group out of range"))
        );
    }
}
