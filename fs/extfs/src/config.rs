// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Constants and runtime options of the engine.

// ============================================================================
// Device geometry
// ============================================================================

/// Size of one device sector in bytes.
pub const SECTOR_SIZE: usize = 512;
/// log2 of [`SECTOR_SIZE`].
pub const SECTOR_BITS: u32 = 9;

// ============================================================================
// On-disk layout
// ============================================================================

/// Byte offset of the primary superblock inside a partition.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// Sector holding the start of the primary superblock.
pub const SUPERBLOCK_SECTOR: u64 = SUPERBLOCK_OFFSET / SECTOR_SIZE as u64;
/// Superblock record size.
pub const SUPERBLOCK_SIZE: usize = 1024;

/// Superblock magic.
pub const EXT2_MAGIC: u16 = 0xEF53;

/// Smallest legal block size; volumes using it start data at block 1.
pub const MIN_BLOCK_SIZE: usize = 1024;
/// Largest block size the engine accepts.
pub const MAX_BLOCK_SIZE: usize = 65536;
/// Largest `s_log_block_size`: 1024 << 6 is 64 KiB.
pub const MAX_LOG_BLOCK_SIZE: u32 = 6;

/// Blocks or inodes per group the formatter puts in a 32-byte descriptor,
/// whose counters are 16 bits wide.
pub const MAX_GROUP_ENTRIES: u32 = 65528;

/// Base group descriptor record.
pub const GROUP_DESC_SIZE: usize = 32;
/// Group descriptor record on 64bit volumes.
pub const GROUP_DESC_SIZE_64: usize = 64;

/// Inode record size of revision 0 volumes.
pub const GOOD_OLD_INODE_SIZE: usize = 128;
/// First non-reserved inode of revision 0 volumes.
pub const GOOD_OLD_FIRST_INO: u32 = 11;

// ============================================================================
// Inodes and directories
// ============================================================================

/// Root directory inode number.
pub const ROOT_INO: u32 = 2;

/// Direct block pointers in an inode.
pub const DIRECT_BLOCKS: usize = 12;
/// Slot of the single indirect pointer in `i_block`.
pub const SINGLE_INDIRECT: usize = 12;
/// Slot of the double indirect pointer in `i_block`.
pub const DOUBLE_INDIRECT: usize = 13;
/// Slot of the triple indirect pointer in `i_block`.
pub const TRIPLE_INDIRECT: usize = 14;
/// Number of `u32` slots in `i_block`.
pub const INODE_BLOCK_SLOTS: usize = 15;

/// Symlink targets up to this length live inside `i_block`.
pub const INLINE_SYMLINK_MAX: usize = 60;
/// Maximum number of symlinks followed while resolving one path.
pub const SYMLINK_MAX_HOPS: u32 = 8;

/// Directory entry header: inode, rec_len, name_len, file_type.
pub const DIRENT_HEADER_LEN: usize = 8;
/// Longest name a directory entry can carry.
pub const DIRNAME_LEN: usize = 255;

/// Mode given to newly written regular files.
pub const NEW_FILE_MODE: u16 = 0o100755;
/// Mode given to new directories.
pub const NEW_DIR_MODE: u16 = 0o040755;
/// Mode given to new symlinks.
pub const NEW_SYMLINK_MODE: u16 = 0o120777;

// ============================================================================
// Write path
// ============================================================================

/// Blocks the shadow log keeps before it starts recycling entries.
pub const SHADOW_LOG_CAPACITY: usize = 100;

/// Extended boot record chain length accepted while listing logical partitions.
pub const MAX_LOGICAL_PARTITIONS: usize = 64;

/// Runtime options of one mount session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Refuse every mutating operation.
    pub read_only: bool,
}

impl MountOptions {
    pub const fn read_only() -> Self {
        Self { read_only: true }
    }
}

/// Seconds since the epoch used for new inode timestamps.
pub fn now() -> u32 {
    #[cfg(feature = "std")]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }
    #[cfg(not(feature = "std"))]
    {
        0
    }
}
