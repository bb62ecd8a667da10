// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Extent tree nodes.
//!
//! A node is a 12-byte header followed by `eh_entries` 12-byte records: leaf
//! extents at depth 0, index entries above. The root lives in `i_block`, every
//! other node fills a block.

use log::error;

use crate::{endian::*, error::*};

/// Extent header magic.
pub const EXT4_EXT_MAGIC: u16 = 0xF30A;
/// Header and entry record size.
pub const EXTENT_RECORD_SIZE: usize = 12;
/// Leaf lengths above this mark an uninitialized extent.
pub const EXT_INIT_MAX_LEN: u16 = 1 << 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ext4ExtentHeader {
    pub eh_magic: u16,
    pub eh_entries: u16,
    pub eh_max: u16,
    /// 0 for leaf nodes.
    pub eh_depth: u16,
    pub eh_generation: u32,
}

impl Ext4ExtentHeader {
    pub fn new(max: u16, depth: u16) -> Self {
        Self {
            eh_magic: EXT4_EXT_MAGIC,
            eh_entries: 0,
            eh_max: max,
            eh_depth: depth,
            eh_generation: 0,
        }
    }
}

impl DiskFormat for Ext4ExtentHeader {
    const DISK_SIZE: usize = EXTENT_RECORD_SIZE;

    fn from_disk_bytes(b: &[u8]) -> Self {
        Self {
            eh_magic: le16(b, 0),
            eh_entries: le16(b, 2),
            eh_max: le16(b, 4),
            eh_depth: le16(b, 6),
            eh_generation: le32(b, 8),
        }
    }

    fn to_disk_bytes(&self, b: &mut [u8]) {
        put_le16(b, 0, self.eh_magic);
        put_le16(b, 2, self.eh_entries);
        put_le16(b, 4, self.eh_max);
        put_le16(b, 6, self.eh_depth);
        put_le32(b, 8, self.eh_generation);
    }
}

/// Leaf entry: a run of physical blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ext4Extent {
    pub ee_block: u32,
    pub ee_len: u16,
    pub ee_start_hi: u16,
    pub ee_start_lo: u32,
}

impl Ext4Extent {
    pub fn new(block: u32, len: u16, start: u64) -> Self {
        Self {
            ee_block: block,
            ee_len: len,
            ee_start_hi: (start >> 32) as u16,
            ee_start_lo: start as u32,
        }
    }

    pub fn start(&self) -> u64 {
        (self.ee_start_hi as u64) << 32 | self.ee_start_lo as u64
    }

    /// Mapped length, with the uninitialized marker removed.
    pub fn len(&self) -> u32 {
        if self.ee_len > EXT_INIT_MAX_LEN {
            (self.ee_len - EXT_INIT_MAX_LEN) as u32
        } else {
            self.ee_len as u32
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical block of `lblk`, if this extent covers it.
    pub fn map(&self, lblk: u32) -> Option<u64> {
        let off = lblk.checked_sub(self.ee_block)?;
        (off < self.len()).then(|| self.start() + off as u64)
    }
}

impl DiskFormat for Ext4Extent {
    const DISK_SIZE: usize = EXTENT_RECORD_SIZE;

    fn from_disk_bytes(b: &[u8]) -> Self {
        Self {
            ee_block: le32(b, 0),
            ee_len: le16(b, 4),
            ee_start_hi: le16(b, 6),
            ee_start_lo: le32(b, 8),
        }
    }

    fn to_disk_bytes(&self, b: &mut [u8]) {
        put_le32(b, 0, self.ee_block);
        put_le16(b, 4, self.ee_len);
        put_le16(b, 6, self.ee_start_hi);
        put_le32(b, 8, self.ee_start_lo);
    }
}

/// Index entry: covers logical blocks from `ei_block` onward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ext4ExtentIdx {
    pub ei_block: u32,
    pub ei_leaf_lo: u32,
    pub ei_leaf_hi: u16,
}

impl Ext4ExtentIdx {
    pub fn leaf(&self) -> u64 {
        (self.ei_leaf_hi as u64) << 32 | self.ei_leaf_lo as u64
    }
}

impl DiskFormat for Ext4ExtentIdx {
    const DISK_SIZE: usize = EXTENT_RECORD_SIZE;

    fn from_disk_bytes(b: &[u8]) -> Self {
        Self {
            ei_block: le32(b, 0),
            ei_leaf_lo: le32(b, 4),
            ei_leaf_hi: le16(b, 8),
        }
    }

    fn to_disk_bytes(&self, b: &mut [u8]) {
        put_le32(b, 0, self.ei_block);
        put_le32(b, 4, self.ei_leaf_lo);
        put_le16(b, 8, self.ei_leaf_hi);
        put_le16(b, 10, 0);
    }
}

/// A borrowed view of one tree node.
#[derive(Debug, Clone, Copy)]
pub struct ExtentNode<'a> {
    pub header: Ext4ExtentHeader,
    bytes: &'a [u8],
}

impl<'a> ExtentNode<'a> {
    /// Validates the header of the node stored in `bytes`.
    pub fn parse(bytes: &'a [u8]) -> Ext4Result<Self> {
        let header = Ext4ExtentHeader::from_disk_bytes(bytes);
        if header.eh_magic != EXT4_EXT_MAGIC {
            error!("extent node magic {:#06x}", header.eh_magic);
            return Err(Ext4Error::BadExtentMagic {
                found: header.eh_magic,
            });
        }
        let capacity = bytes.len() / EXTENT_RECORD_SIZE - 1;
        if header.eh_entries > header.eh_max || header.eh_entries as usize > capacity {
            error!(
                "extent node claims {} entries, room for {capacity}",
                header.eh_entries
            );
            return Err(Ext4Error::Corrupted("extent entry count"));
        }
        Ok(Self { header, bytes })
    }

    pub fn is_leaf(&self) -> bool {
        self.header.eh_depth == 0
    }

    fn record(&self, i: usize) -> &'a [u8] {
        let off = EXTENT_RECORD_SIZE * (i + 1);
        &self.bytes[off..off + EXTENT_RECORD_SIZE]
    }

    pub fn extents(self) -> impl Iterator<Item = Ext4Extent> + 'a {
        (0..self.header.eh_entries as usize).map(move |i| Ext4Extent::from_disk_bytes(self.record(i)))
    }

    pub fn indexes(self) -> impl Iterator<Item = Ext4ExtentIdx> + 'a {
        (0..self.header.eh_entries as usize)
            .map(move |i| Ext4ExtentIdx::from_disk_bytes(self.record(i)))
    }

    /// Last index entry starting at or before `lblk`.
    pub fn find_index(&self, lblk: u32) -> Option<Ext4ExtentIdx> {
        self.indexes().take_while(|ix| ix.ei_block <= lblk).last()
    }

    /// Last leaf extent starting at or before `lblk`.
    pub fn find_extent(&self, lblk: u32) -> Option<Ext4Extent> {
        self.extents().take_while(|ex| ex.ee_block <= lblk).last()
    }
}

/// Encodes a root node holding `extents` into `out` (the 60 bytes of `i_block`).
pub fn build_leaf_root(out: &mut [u8], extents: &[Ext4Extent]) {
    let max = (out.len() / EXTENT_RECORD_SIZE - 1) as u16;
    let mut header = Ext4ExtentHeader::new(max, 0);
    header.eh_entries = extents.len() as u16;
    header.to_disk_bytes(&mut out[..EXTENT_RECORD_SIZE]);
    for (i, ex) in extents.iter().enumerate() {
        let off = EXTENT_RECORD_SIZE * (i + 1);
        ex.to_disk_bytes(&mut out[off..off + EXTENT_RECORD_SIZE]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(extents: &[Ext4Extent]) -> [u8; 60] {
        let mut raw = [0u8; 60];
        build_leaf_root(&mut raw, extents);
        raw
    }

    #[test]
    fn test_last_extent_not_exceeding_target() {
        let raw = root(&[Ext4Extent::new(0, 5, 100), Ext4Extent::new(10, 5, 500)]);
        let node = ExtentNode::parse(&raw).unwrap();
        assert_eq!(node.header.eh_max, 4);
        assert_eq!(node.find_extent(3).map(|e| e.ee_block), Some(0));
        assert_eq!(node.find_extent(7).map(|e| e.ee_block), Some(0));
        assert_eq!(node.find_extent(7).and_then(|e| e.map(7)), None);
        assert_eq!(node.find_extent(12).and_then(|e| e.map(12)), Some(502));
        assert_eq!(node.find_extent(99).and_then(|e| e.map(99)), None);
    }

    #[test]
    fn test_uninitialized_length_is_masked() {
        let ex = Ext4Extent::new(0, EXT_INIT_MAX_LEN + 3, 40);
        assert_eq!(ex.len(), 3);
        assert_eq!(ex.map(2), Some(42));
        assert_eq!(ex.map(3), None);
    }

    #[test]
    fn test_bad_magic_is_reported() {
        let mut raw = root(&[]);
        raw[0] = 0;
        assert_eq!(
            ExtentNode::parse(&raw).err(),
            Some(Ext4Error::BadExtentMagic { found: 0xF300 })
        );
    }

    #[test]
    fn test_index_search() {
        let mut raw = [0u8; 60];
        let mut header = Ext4ExtentHeader::new(4, 1);
        header.eh_entries = 2;
        header.to_disk_bytes(&mut raw);
        Ext4ExtentIdx {
            ei_block: 0,
            ei_leaf_lo: 70,
            ei_leaf_hi: 0,
        }
        .to_disk_bytes(&mut raw[12..24]);
        Ext4ExtentIdx {
            ei_block: 100,
            ei_leaf_lo: 80,
            ei_leaf_hi: 1,
        }
        .to_disk_bytes(&mut raw[24..36]);
        let node = ExtentNode::parse(&raw).unwrap();
        assert!(!node.is_leaf());
        assert_eq!(node.find_index(99).map(|i| i.leaf()), Some(70));
        assert_eq!(node.find_index(100).map(|i| i.leaf()), Some((1 << 32) | 80));
    }
}
