// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! The mounted filesystem handle.
//!
//! Everything a mount needs lives in [`Ext4FileSystem`]: the partition it
//! reads, the layout built at mount and, on write-capable builds, the
//! allocator state and shadow log. Independent mounts share nothing but the
//! device lock.

use alloc::string::String;

use log::{debug, info};

use crate::{
    blockdev::{Partition, SectorDevice},
    config::*,
    disknode::Ext4Inode,
    endian::DiskFormat,
    error::*,
    layout::Layout,
    superblock::Superblock,
};
#[cfg(feature = "write")]
use crate::{bmalloc::Allocator, shadow::ShadowLog};

/// Space usage of a mounted volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsStat {
    pub block_size: usize,
    pub blocks: u64,
    pub free_blocks: u64,
    pub inodes: u32,
    pub free_inodes: u32,
    pub groups: u32,
    pub label: Option<String>,
}

/// A mounted ext2/3/4 volume.
pub struct Ext4FileSystem<D: SectorDevice> {
    pub(crate) part: Partition<D>,
    pub(crate) layout: Layout,
    options: MountOptions,
    /// Bitmaps and cursors, loaded by the first mutating call.
    #[cfg(feature = "write")]
    pub(crate) alloc: Option<Allocator>,
    #[cfg(feature = "write")]
    pub(crate) shadow: ShadowLog,
}

impl<D: SectorDevice> Ext4FileSystem<D> {
    /// Mounts with default options.
    pub fn mount(part: Partition<D>) -> Ext4Result<Self> {
        Self::mount_with(part, MountOptions::default())
    }

    pub fn mount_with(part: Partition<D>, options: MountOptions) -> Ext4Result<Self> {
        let layout = Layout::load(&part)?;
        info!(
            "mounted ext volume at byte {}: {} blocks of {} bytes{}",
            part.byte_offset(),
            layout.sb.blocks_count(),
            layout.block_size,
            if options.read_only { ", read-only" } else { "" }
        );
        Ok(Self {
            part,
            layout,
            options,
            #[cfg(feature = "write")]
            alloc: None,
            #[cfg(feature = "write")]
            shadow: ShadowLog::new(SHADOW_LOG_CAPACITY),
        })
    }

    /// Flushes pending metadata and releases the mount.
    pub fn unmount(mut self) -> Ext4Result<()> {
        #[cfg(feature = "write")]
        if self.alloc.is_some() {
            self.sync()?;
        }
        self.part.flush()?;
        debug!("unmounted volume at byte {}", self.part.byte_offset());
        Ok(())
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn superblock(&self) -> &Superblock {
        &self.layout.sb
    }

    pub fn block_size(&self) -> usize {
        self.layout.block_size
    }

    pub fn partition(&self) -> &Partition<D> {
        &self.part
    }

    pub fn options(&self) -> MountOptions {
        self.options
    }

    /// Reads block `block` into `buf`, which must be one block long.
    pub fn read_block(&self, block: u64, buf: &mut [u8]) -> Ext4Result<()> {
        self.part
            .read_bytes(self.layout.block_to_sector(block), 0, buf)?;
        Ok(())
    }

    /// Writes `buf` at the start of block `block`.
    #[cfg(feature = "write")]
    pub fn write_block(&self, block: u64, buf: &[u8]) -> Ext4Result<()> {
        self.part.write_bytes(self.layout.block_to_byte(block), buf)?;
        Ok(())
    }

    /// Reads the base record of inode `ino`.
    pub fn read_inode(&self, ino: u32) -> Ext4Result<Ext4Inode> {
        let (_, block, offset) = self.layout.inode_location(ino)?;
        let mut raw = [0u8; GOOD_OLD_INODE_SIZE];
        self.part.read_bytes(
            self.layout.block_to_sector(block),
            offset as u64,
            &mut raw,
        )?;
        Ok(Ext4Inode::from_disk_bytes(&raw))
    }

    /// Writes the base record of inode `ino`; large-inode tails stay untouched.
    #[cfg(feature = "write")]
    pub fn write_inode(&self, ino: u32, inode: &Ext4Inode) -> Ext4Result<()> {
        let (_, block, offset) = self.layout.inode_location(ino)?;
        let mut raw = [0u8; GOOD_OLD_INODE_SIZE];
        inode.to_disk_bytes(&mut raw);
        self.part
            .write_bytes(self.layout.block_to_byte(block) + offset as u64, &raw)?;
        Ok(())
    }

    pub fn volume_label(&self) -> Option<String> {
        self.layout.sb.volume_label()
    }

    pub fn stat_fs(&self) -> FsStat {
        let sb = &self.layout.sb;
        FsStat {
            block_size: self.layout.block_size,
            blocks: sb.blocks_count(),
            free_blocks: sb.free_blocks_count(),
            inodes: sb.s_inodes_count,
            free_inodes: sb.s_free_inodes_count,
            groups: self.layout.group_count,
            label: sb.volume_label(),
        }
    }
}
