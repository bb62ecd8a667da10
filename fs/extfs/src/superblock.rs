// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! The ext2/3/4 superblock.
//!
//! Only the fields the engine reads or maintains are decoded. The full 1024 byte
//! record is kept alongside so that writing the superblock back never clobbers
//! fields this crate does not model.

use alloc::{boxed::Box, string::String};

use bitflags::bitflags;

use crate::{config::*, endian::*};

bitflags! {
    /// `s_feature_compat`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureCompat: u32 {
        const DIR_PREALLOC = 0x0001;
        const HAS_JOURNAL = 0x0004;
        const EXT_ATTR = 0x0008;
        const RESIZE_INODE = 0x0010;
        const DIR_INDEX = 0x0020;
    }
}

bitflags! {
    /// `s_feature_incompat`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureIncompat: u32 {
        const COMPRESSION = 0x0001;
        const FILETYPE = 0x0002;
        const RECOVER = 0x0004;
        const JOURNAL_DEV = 0x0008;
        const META_BG = 0x0010;
        const EXTENTS = 0x0040;
        const BIT64 = 0x0080;
        const MMP = 0x0100;
        const FLEX_BG = 0x0200;
        const INLINE_DATA = 0x8000;
        const ENCRYPT = 0x10000;
    }
}

bitflags! {
    /// `s_feature_ro_compat`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureRoCompat: u32 {
        const SPARSE_SUPER = 0x0001;
        const LARGE_FILE = 0x0002;
        const BTREE_DIR = 0x0004;
        const HUGE_FILE = 0x0008;
        const GDT_CSUM = 0x0010;
        const DIR_NLINK = 0x0020;
        const EXTRA_ISIZE = 0x0040;
        const METADATA_CSUM = 0x0400;
    }
}

/// Incompatible features whose on-disk structures the reader understands.
pub const READ_INCOMPAT_SUPPORTED: FeatureIncompat = FeatureIncompat::FILETYPE
    .union(FeatureIncompat::RECOVER)
    .union(FeatureIncompat::EXTENTS)
    .union(FeatureIncompat::BIT64)
    .union(FeatureIncompat::FLEX_BG)
    .union(FeatureIncompat::MMP);

/// The superblock as loaded at mount.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub s_inodes_count: u32,
    pub s_blocks_count_lo: u32,
    pub s_r_blocks_count_lo: u32,
    pub s_free_blocks_count_lo: u32,
    pub s_free_inodes_count: u32,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32,
    pub s_log_cluster_size: u32,
    pub s_blocks_per_group: u32,
    pub s_clusters_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_mnt_count: u16,
    pub s_max_mnt_count: u16,
    pub s_magic: u16,
    pub s_state: u16,
    pub s_errors: u16,
    pub s_minor_rev_level: u16,
    pub s_lastcheck: u32,
    pub s_creator_os: u32,
    pub s_rev_level: u32,
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    pub s_block_group_nr: u16,
    pub s_feature_compat: FeatureCompat,
    pub s_feature_incompat: FeatureIncompat,
    pub s_feature_ro_compat: FeatureRoCompat,
    pub s_uuid: [u8; 16],
    pub s_volume_name: [u8; 16],
    pub s_reserved_gdt_blocks: u16,
    pub s_journal_inum: u32,
    pub s_desc_size: u16,
    pub s_mkfs_time: u32,
    pub s_blocks_count_hi: u32,
    pub s_free_blocks_count_hi: u32,
    raw: Box<[u8; SUPERBLOCK_SIZE]>,
}

impl Default for Superblock {
    fn default() -> Self {
        Self::from_disk_bytes(&[0u8; SUPERBLOCK_SIZE])
    }
}

impl Superblock {
    /// Cleanly unmounted.
    pub const STATE_VALID: u16 = 1;
    /// Errors detected.
    pub const STATE_ERROR: u16 = 2;
    /// Revision 0, fixed inode size.
    pub const GOOD_OLD_REV: u32 = 0;
    /// Revision 1, variable inode size and feature flags.
    pub const DYNAMIC_REV: u32 = 1;

    pub fn is_valid_magic(&self) -> bool {
        self.s_magic == EXT2_MAGIC
    }

    /// Block size in bytes; 0 when the exponent does not fit.
    pub fn block_size(&self) -> usize {
        1024usize.checked_shl(self.s_log_block_size).unwrap_or(0)
    }

    /// Inode record size; revision 0 volumes always use 128 bytes.
    pub fn inode_size(&self) -> usize {
        if self.s_rev_level == Self::GOOD_OLD_REV {
            GOOD_OLD_INODE_SIZE
        } else {
            self.s_inode_size as usize
        }
    }

    pub fn first_ino(&self) -> u32 {
        if self.s_rev_level == Self::GOOD_OLD_REV {
            GOOD_OLD_FIRST_INO
        } else {
            self.s_first_ino
        }
    }

    pub fn is_64bit(&self) -> bool {
        self.s_feature_incompat.contains(FeatureIncompat::BIT64)
    }

    pub fn blocks_count(&self) -> u64 {
        if self.is_64bit() {
            (self.s_blocks_count_hi as u64) << 32 | self.s_blocks_count_lo as u64
        } else {
            self.s_blocks_count_lo as u64
        }
    }

    pub fn free_blocks_count(&self) -> u64 {
        if self.is_64bit() {
            (self.s_free_blocks_count_hi as u64) << 32 | self.s_free_blocks_count_lo as u64
        } else {
            self.s_free_blocks_count_lo as u64
        }
    }

    pub fn set_free_blocks_count(&mut self, count: u64) {
        self.s_free_blocks_count_lo = count as u32;
        if self.is_64bit() {
            self.s_free_blocks_count_hi = (count >> 32) as u32;
        }
    }

    /// Group descriptor stride.
    pub fn desc_size(&self) -> usize {
        if self.is_64bit() && self.s_desc_size as usize >= GROUP_DESC_SIZE_64 {
            self.s_desc_size as usize
        } else {
            GROUP_DESC_SIZE
        }
    }

    /// `ceil((blocks - first_data_block) / blocks_per_group)`.
    pub fn group_count(&self) -> u32 {
        let data_blocks = self.blocks_count() - self.s_first_data_block as u64;
        data_blocks.div_ceil(self.s_blocks_per_group as u64) as u32
    }

    pub fn has_extents(&self) -> bool {
        self.s_feature_incompat.contains(FeatureIncompat::EXTENTS)
    }

    pub fn has_gdt_csum(&self) -> bool {
        self.s_feature_ro_compat.contains(FeatureRoCompat::GDT_CSUM)
    }

    /// Whether `group` carries a superblock backup.
    pub fn has_super_backup(&self, group: u32) -> bool {
        if !self
            .s_feature_ro_compat
            .contains(FeatureRoCompat::SPARSE_SUPER)
        {
            return true;
        }
        group <= 1 || is_power_of(group, 3) || is_power_of(group, 5) || is_power_of(group, 7)
    }

    /// Volume label with trailing NULs removed.
    pub fn volume_label(&self) -> Option<String> {
        let end = self
            .s_volume_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.s_volume_name.len());
        if end == 0 {
            return None;
        }
        Some(String::from_utf8_lossy(&self.s_volume_name[..end]).into_owned())
    }

    pub fn set_volume_label(&mut self, label: &str) {
        self.s_volume_name = [0; 16];
        let len = label.len().min(16);
        self.s_volume_name[..len].copy_from_slice(&label.as_bytes()[..len]);
    }
}

fn is_power_of(mut n: u32, base: u32) -> bool {
    if n == 0 {
        return false;
    }
    while n % base == 0 {
        n /= base;
    }
    n == 1
}

impl DiskFormat for Superblock {
    const DISK_SIZE: usize = SUPERBLOCK_SIZE;

    fn from_disk_bytes(b: &[u8]) -> Self {
        let mut raw = Box::new([0u8; SUPERBLOCK_SIZE]);
        raw.copy_from_slice(&b[..SUPERBLOCK_SIZE]);
        let mut s_uuid = [0u8; 16];
        s_uuid.copy_from_slice(&b[104..120]);
        let mut s_volume_name = [0u8; 16];
        s_volume_name.copy_from_slice(&b[120..136]);
        Self {
            s_inodes_count: le32(b, 0),
            s_blocks_count_lo: le32(b, 4),
            s_r_blocks_count_lo: le32(b, 8),
            s_free_blocks_count_lo: le32(b, 12),
            s_free_inodes_count: le32(b, 16),
            s_first_data_block: le32(b, 20),
            s_log_block_size: le32(b, 24),
            s_log_cluster_size: le32(b, 28),
            s_blocks_per_group: le32(b, 32),
            s_clusters_per_group: le32(b, 36),
            s_inodes_per_group: le32(b, 40),
            s_mtime: le32(b, 44),
            s_wtime: le32(b, 48),
            s_mnt_count: le16(b, 52),
            s_max_mnt_count: le16(b, 54),
            s_magic: le16(b, 56),
            s_state: le16(b, 58),
            s_errors: le16(b, 60),
            s_minor_rev_level: le16(b, 62),
            s_lastcheck: le32(b, 64),
            s_creator_os: le32(b, 72),
            s_rev_level: le32(b, 76),
            s_first_ino: le32(b, 84),
            s_inode_size: le16(b, 88),
            s_block_group_nr: le16(b, 90),
            s_feature_compat: FeatureCompat::from_bits_retain(le32(b, 92)),
            s_feature_incompat: FeatureIncompat::from_bits_retain(le32(b, 96)),
            s_feature_ro_compat: FeatureRoCompat::from_bits_retain(le32(b, 100)),
            s_uuid,
            s_volume_name,
            s_reserved_gdt_blocks: le16(b, 206),
            s_journal_inum: le32(b, 224),
            s_desc_size: le16(b, 254),
            s_mkfs_time: le32(b, 264),
            s_blocks_count_hi: le32(b, 336),
            s_free_blocks_count_hi: le32(b, 344),
            raw,
        }
    }

    fn to_disk_bytes(&self, b: &mut [u8]) {
        b[..SUPERBLOCK_SIZE].copy_from_slice(&self.raw[..]);
        put_le32(b, 0, self.s_inodes_count);
        put_le32(b, 4, self.s_blocks_count_lo);
        put_le32(b, 8, self.s_r_blocks_count_lo);
        put_le32(b, 12, self.s_free_blocks_count_lo);
        put_le32(b, 16, self.s_free_inodes_count);
        put_le32(b, 20, self.s_first_data_block);
        put_le32(b, 24, self.s_log_block_size);
        put_le32(b, 28, self.s_log_cluster_size);
        put_le32(b, 32, self.s_blocks_per_group);
        put_le32(b, 36, self.s_clusters_per_group);
        put_le32(b, 40, self.s_inodes_per_group);
        put_le32(b, 44, self.s_mtime);
        put_le32(b, 48, self.s_wtime);
        put_le16(b, 52, self.s_mnt_count);
        put_le16(b, 54, self.s_max_mnt_count);
        put_le16(b, 56, self.s_magic);
        put_le16(b, 58, self.s_state);
        put_le16(b, 60, self.s_errors);
        put_le16(b, 62, self.s_minor_rev_level);
        put_le32(b, 64, self.s_lastcheck);
        put_le32(b, 72, self.s_creator_os);
        put_le32(b, 76, self.s_rev_level);
        put_le32(b, 84, self.s_first_ino);
        put_le16(b, 88, self.s_inode_size);
        put_le16(b, 90, self.s_block_group_nr);
        put_le32(b, 92, self.s_feature_compat.bits());
        put_le32(b, 96, self.s_feature_incompat.bits());
        put_le32(b, 100, self.s_feature_ro_compat.bits());
        b[104..120].copy_from_slice(&self.s_uuid);
        b[120..136].copy_from_slice(&self.s_volume_name);
        put_le16(b, 206, self.s_reserved_gdt_blocks);
        put_le32(b, 224, self.s_journal_inum);
        put_le16(b, 254, self.s_desc_size);
        put_le32(b, 264, self.s_mkfs_time);
        put_le32(b, 336, self.s_blocks_count_hi);
        put_le32(b, 344, self.s_free_blocks_count_hi);
    }
}
