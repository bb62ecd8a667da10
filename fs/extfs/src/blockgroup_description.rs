// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Block group descriptors and the descriptor table.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::{config::GROUP_DESC_SIZE, endian::*};

bitflags! {
    /// `bg_flags`.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct GroupFlags: u16 {
        /// Inode bitmap and table not initialized.
        const INODE_UNINIT = 0x0001;
        /// Block bitmap not initialized.
        const BLOCK_UNINIT = 0x0002;
        /// Inode table zeroed.
        const ITABLE_ZEROED = 0x0004;
    }
}

/// One group descriptor.
///
/// The `_hi` halves are only decoded and written back when the table stride
/// is at least 64 bytes. Counters go through the combined accessors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ext4GroupDesc {
    pub bg_block_bitmap_lo: u32,
    pub bg_inode_bitmap_lo: u32,
    pub bg_inode_table_lo: u32,
    pub bg_free_blocks_count_lo: u16,
    pub bg_free_inodes_count_lo: u16,
    pub bg_used_dirs_count_lo: u16,
    pub bg_flags: GroupFlags,
    pub bg_itable_unused_lo: u16,
    pub bg_checksum: u16,

    pub bg_block_bitmap_hi: u32,
    pub bg_inode_bitmap_hi: u32,
    pub bg_inode_table_hi: u32,
    pub bg_free_blocks_count_hi: u16,
    pub bg_free_inodes_count_hi: u16,
    pub bg_used_dirs_count_hi: u16,
    pub bg_itable_unused_hi: u16,
}

fn join(lo: u16, hi: u16) -> u32 {
    (hi as u32) << 16 | lo as u32
}

fn split(value: u32) -> (u16, u16) {
    (value as u16, (value >> 16) as u16)
}

impl Ext4GroupDesc {
    /// Offset of `bg_checksum` inside the record.
    const CHECKSUM_OFFSET: usize = 0x1E;

    pub fn block_bitmap(&self) -> u64 {
        (self.bg_block_bitmap_hi as u64) << 32 | self.bg_block_bitmap_lo as u64
    }

    pub fn inode_bitmap(&self) -> u64 {
        (self.bg_inode_bitmap_hi as u64) << 32 | self.bg_inode_bitmap_lo as u64
    }

    pub fn inode_table(&self) -> u64 {
        (self.bg_inode_table_hi as u64) << 32 | self.bg_inode_table_lo as u64
    }

    pub fn free_blocks_count(&self) -> u32 {
        join(self.bg_free_blocks_count_lo, self.bg_free_blocks_count_hi)
    }

    pub fn set_free_blocks_count(&mut self, count: u32) {
        (self.bg_free_blocks_count_lo, self.bg_free_blocks_count_hi) = split(count);
    }

    pub fn free_inodes_count(&self) -> u32 {
        join(self.bg_free_inodes_count_lo, self.bg_free_inodes_count_hi)
    }

    pub fn set_free_inodes_count(&mut self, count: u32) {
        (self.bg_free_inodes_count_lo, self.bg_free_inodes_count_hi) = split(count);
    }

    pub fn used_dirs_count(&self) -> u32 {
        join(self.bg_used_dirs_count_lo, self.bg_used_dirs_count_hi)
    }

    pub fn set_used_dirs_count(&mut self, count: u32) {
        (self.bg_used_dirs_count_lo, self.bg_used_dirs_count_hi) = split(count);
    }

    pub fn itable_unused(&self) -> u32 {
        join(self.bg_itable_unused_lo, self.bg_itable_unused_hi)
    }

    pub fn set_itable_unused(&mut self, count: u32) {
        (self.bg_itable_unused_lo, self.bg_itable_unused_hi) = split(count);
    }

    pub fn is_block_bitmap_uninit(&self) -> bool {
        self.bg_flags.contains(GroupFlags::BLOCK_UNINIT)
    }

    pub fn is_inode_bitmap_uninit(&self) -> bool {
        self.bg_flags.contains(GroupFlags::INODE_UNINIT)
    }

    fn decode(b: &[u8], stride: usize) -> Self {
        let mut desc = Self {
            bg_block_bitmap_lo: le32(b, 0x00),
            bg_inode_bitmap_lo: le32(b, 0x04),
            bg_inode_table_lo: le32(b, 0x08),
            bg_free_blocks_count_lo: le16(b, 0x0C),
            bg_free_inodes_count_lo: le16(b, 0x0E),
            bg_used_dirs_count_lo: le16(b, 0x10),
            bg_flags: GroupFlags::from_bits_retain(le16(b, 0x12)),
            bg_itable_unused_lo: le16(b, 0x1C),
            bg_checksum: le16(b, Self::CHECKSUM_OFFSET),
            ..Self::default()
        };
        if stride >= 64 {
            desc.bg_block_bitmap_hi = le32(b, 0x20);
            desc.bg_inode_bitmap_hi = le32(b, 0x24);
            desc.bg_inode_table_hi = le32(b, 0x28);
            desc.bg_free_blocks_count_hi = le16(b, 0x2C);
            desc.bg_free_inodes_count_hi = le16(b, 0x2E);
            desc.bg_used_dirs_count_hi = le16(b, 0x30);
            desc.bg_itable_unused_hi = le16(b, 0x32);
        }
        desc
    }

    fn encode(&self, b: &mut [u8], stride: usize) {
        self.to_disk_bytes(b);
        if stride >= 64 {
            put_le32(b, 0x20, self.bg_block_bitmap_hi);
            put_le32(b, 0x24, self.bg_inode_bitmap_hi);
            put_le32(b, 0x28, self.bg_inode_table_hi);
            put_le16(b, 0x2C, self.bg_free_blocks_count_hi);
            put_le16(b, 0x2E, self.bg_free_inodes_count_hi);
            put_le16(b, 0x30, self.bg_used_dirs_count_hi);
            put_le16(b, 0x32, self.bg_itable_unused_hi);
        }
    }
}

impl DiskFormat for Ext4GroupDesc {
    const DISK_SIZE: usize = GROUP_DESC_SIZE;

    fn from_disk_bytes(bytes: &[u8]) -> Self {
        Self::decode(bytes, GROUP_DESC_SIZE)
    }

    fn to_disk_bytes(&self, b: &mut [u8]) {
        put_le32(b, 0x00, self.bg_block_bitmap_lo);
        put_le32(b, 0x04, self.bg_inode_bitmap_lo);
        put_le32(b, 0x08, self.bg_inode_table_lo);
        put_le16(b, 0x0C, self.bg_free_blocks_count_lo);
        put_le16(b, 0x0E, self.bg_free_inodes_count_lo);
        put_le16(b, 0x10, self.bg_used_dirs_count_lo);
        put_le16(b, 0x12, self.bg_flags.bits());
        put_le16(b, 0x1C, self.bg_itable_unused_lo);
        put_le16(b, Self::CHECKSUM_OFFSET, self.bg_checksum);
    }
}

/// The descriptor table, kept as the raw buffer read at mount.
#[derive(Debug, Clone)]
pub struct GroupDescTable {
    raw: Vec<u8>,
    stride: usize,
    count: u32,
}

impl GroupDescTable {
    /// Wraps `raw`, which must hold at least `count * stride` bytes.
    pub fn new(raw: Vec<u8>, stride: usize, count: u32) -> Self {
        Self { raw, stride, count }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Whole table as stored on disk, padded to full blocks.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    fn record(&self, group: u32) -> &[u8] {
        let off = group as usize * self.stride;
        &self.raw[off..off + self.stride]
    }

    pub fn get(&self, group: u32) -> Ext4GroupDesc {
        Ext4GroupDesc::decode(self.record(group), self.stride)
    }

    pub fn set(&mut self, group: u32, desc: &Ext4GroupDesc) {
        let off = group as usize * self.stride;
        desc.encode(&mut self.raw[off..off + self.stride], self.stride);
    }

    /// Applies `f` to descriptor `group` and stores the result.
    pub fn update(&mut self, group: u32, f: impl FnOnce(&mut Ext4GroupDesc)) {
        let mut desc = self.get(group);
        f(&mut desc);
        self.set(group, &desc);
    }

    pub fn iter(&self) -> impl Iterator<Item = Ext4GroupDesc> + '_ {
        (0..self.count).map(|g| self.get(g))
    }

    /// Sum of the per-group free block counters.
    pub fn total_free_blocks(&self) -> u64 {
        self.iter().map(|d| d.free_blocks_count() as u64).sum()
    }

    pub fn total_free_inodes(&self) -> u64 {
        self.iter().map(|d| d.free_inodes_count() as u64).sum()
    }

    /// `crc16(uuid ++ le32(group) ++ record)` with the checksum field skipped.
    pub fn checksum(&self, uuid: &[u8; 16], group: u32) -> u16 {
        let rec = self.record(group);
        let mut crc = crc16(!0, uuid);
        crc = crc16(crc, &group.to_le_bytes());
        crc = crc16(crc, &rec[..Ext4GroupDesc::CHECKSUM_OFFSET]);
        if self.stride > GROUP_DESC_SIZE {
            crc = crc16(crc, &rec[GROUP_DESC_SIZE..]);
        }
        crc
    }

    /// Recomputes every group checksum.
    pub fn refresh_checksums(&mut self, uuid: &[u8; 16]) {
        for g in 0..self.count {
            let crc = self.checksum(uuid, g);
            let off = g as usize * self.stride + Ext4GroupDesc::CHECKSUM_OFFSET;
            put_le16(&mut self.raw, off, crc);
        }
    }

    pub fn checksum_ok(&self, uuid: &[u8; 16], group: u32) -> bool {
        self.get(group).bg_checksum == self.checksum(uuid, group)
    }
}

/// CRC16 with the reflected 0x8005 polynomial.
pub fn crc16(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
    }
    crc
}
