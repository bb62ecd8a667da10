// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Block and inode allocation.
//!
//! Each bitmap has its own cursor. The first allocation of an operation scans
//! groups in order and takes the first clear bit of the first group with free
//! space. Later allocations continue forward from the previous result,
//! jumping over groups whose descriptor reports no free items. Cursors are
//! reset once the operation completes.
//!
//! Every bit flip updates the in-memory bitmap, the group descriptor and the
//! superblock counter. The bitmap block is shadowed before its group is first
//! touched.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::{
    bitmap::Bitmap,
    blockdev::SectorDevice,
    blockgroup_description::GroupFlags,
    config::*,
    endian::DiskFormat,
    error::*,
    ext4::Ext4FileSystem,
    layout::Layout,
    superblock::{FeatureIncompat, FeatureRoCompat, READ_INCOMPAT_SUPPORTED},
};

/// Scan position of one bitmap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cursor {
    /// The first-pass scan already ran for the current operation.
    resumed: bool,
    /// Last number handed out.
    last: u64,
    /// Group whose bitmap was shadowed last.
    group: Option<u32>,
}

/// Allocation state of a write session.
#[derive(Debug)]
pub struct Allocator {
    block_maps: Vec<Bitmap>,
    inode_maps: Vec<Bitmap>,
    blocks: Cursor,
    inodes: Cursor,
}

impl Allocator {
    pub fn block_bitmap(&self, group: u32) -> &Bitmap {
        &self.block_maps[group as usize]
    }

    pub fn inode_bitmap(&self, group: u32) -> &Bitmap {
        &self.inode_maps[group as usize]
    }

    /// Starts the next operation with a fresh first-pass scan.
    pub fn reset_cursors(&mut self) {
        self.blocks = Cursor::default();
        self.inodes = Cursor::default();
    }
}

/// Block bitmap of a group holding nothing but metadata.
///
/// Used for groups flagged `BLOCK_UNINIT` and by the formatter. Only the
/// metadata placed inside the group and the padding past its last block are
/// in use.
pub(crate) fn metadata_block_bitmap(layout: &Layout, group: u32) -> Bitmap {
    let first = layout.group_first_block(group);
    let bits = layout.blocks_in_group(group);
    let mut bm = Bitmap::zeroed(layout.block_size, bits);
    let mut mark = |start: u64, count: u64| {
        for b in start..start + count {
            if b >= first && b < first + bits as u64 {
                bm.set((b - first) as usize);
            }
        }
    };
    if layout.sb.has_super_backup(group) {
        mark(
            first,
            1 + layout.gdt_blocks + layout.sb.s_reserved_gdt_blocks as u64,
        );
    }
    let itable_blocks = (layout.sb.s_inodes_per_group as usize * layout.inode_size)
        .div_ceil(layout.block_size) as u64;
    for desc in layout.gdt.iter() {
        mark(desc.block_bitmap(), 1);
        mark(desc.inode_bitmap(), 1);
        mark(desc.inode_table(), itable_blocks);
    }
    bm.set_range(bits, layout.block_size * 8);
    bm
}

impl<D: SectorDevice> Ext4FileSystem<D> {
    /// Checks the mount accepts writes and loads the allocator on first use.
    pub(crate) fn begin_write(&mut self) -> Ext4Result<()> {
        if self.options().read_only || self.part.is_readonly() {
            return Err(Ext4Error::ReadOnly);
        }
        let sb = &self.layout.sb;
        if sb
            .s_feature_ro_compat
            .contains(FeatureRoCompat::METADATA_CSUM)
        {
            return Err(Ext4Error::Unsupported("metadata checksums"));
        }
        if sb.s_feature_incompat.contains(FeatureIncompat::RECOVER) {
            return Err(Ext4Error::Unsupported("journal needs recovery"));
        }
        if !sb
            .s_feature_incompat
            .difference(READ_INCOMPAT_SUPPORTED)
            .is_empty()
        {
            return Err(Ext4Error::Unsupported("incompatible features"));
        }
        if self.alloc.is_some() {
            return Ok(());
        }

        let layout = &mut self.layout;
        let bs = layout.block_size;
        let ipg = layout.sb.s_inodes_per_group as usize;
        let mut block_maps = Vec::with_capacity(layout.group_count as usize);
        let mut inode_maps = Vec::with_capacity(layout.group_count as usize);
        for g in 0..layout.group_count {
            let desc = layout.gdt.get(g);
            let bits = layout.blocks_in_group(g);
            let bm = if desc.is_block_bitmap_uninit() {
                metadata_block_bitmap(layout, g)
            } else {
                let mut raw = alloc::vec![0u8; bs];
                self.part
                    .read_bytes(layout.block_to_sector(desc.block_bitmap()), 0, &mut raw)?;
                Bitmap::from_bytes(raw, bits)
            };
            block_maps.push(bm);

            let im = if desc.is_inode_bitmap_uninit() {
                let mut im = Bitmap::zeroed(bs, ipg);
                im.set_range(ipg, bs * 8);
                im
            } else {
                let mut raw = alloc::vec![0u8; bs];
                self.part
                    .read_bytes(layout.block_to_sector(desc.inode_bitmap()), 0, &mut raw)?;
                Bitmap::from_bytes(raw, ipg)
            };
            inode_maps.push(im);
        }

        let free_blocks = layout.gdt.total_free_blocks();
        if free_blocks != layout.sb.free_blocks_count() {
            warn!(
                "superblock free blocks {} disagree with groups {free_blocks}, correcting",
                layout.sb.free_blocks_count()
            );
            layout.sb.set_free_blocks_count(free_blocks);
        }
        let free_inodes = layout.gdt.total_free_inodes() as u32;
        if free_inodes != layout.sb.s_free_inodes_count {
            warn!(
                "superblock free inodes {} disagree with groups {free_inodes}, correcting",
                layout.sb.s_free_inodes_count
            );
            layout.sb.s_free_inodes_count = free_inodes;
        }

        debug!("write session: loaded {} group bitmaps", block_maps.len());
        self.alloc = Some(Allocator {
            block_maps,
            inode_maps,
            blocks: Cursor::default(),
            inodes: Cursor::default(),
        });
        Ok(())
    }

    pub fn allocator(&self) -> Option<&Allocator> {
        self.alloc.as_ref()
    }

    pub(crate) fn reset_cursors(&mut self) {
        if let Some(alloc) = self.alloc.as_mut() {
            alloc.reset_cursors();
        }
    }

    /// Allocates one block.
    pub(crate) fn alloc_block(&mut self) -> Ext4Result<u64> {
        let Self {
            part,
            layout,
            alloc,
            shadow,
            ..
        } = self;
        let alloc = alloc
            .as_mut()
            .ok_or(Ext4Error::Corrupted("write session not started"))?;
        let cur = &mut alloc.blocks;

        if !cur.resumed {
            for g in 0..layout.group_count {
                let desc = layout.gdt.get(g);
                if desc.free_blocks_count() == 0 {
                    debug!("no space left in block group {g}");
                    continue;
                }
                if desc.is_block_bitmap_uninit() {
                    alloc.block_maps[g as usize] = metadata_block_bitmap(layout, g);
                    layout
                        .gdt
                        .update(g, |d| d.bg_flags.remove(GroupFlags::BLOCK_UNINIT));
                }
                let bm = &mut alloc.block_maps[g as usize];
                let Some(bit) = bm.first_clear() else {
                    continue;
                };
                bm.set(bit);
                shadow.backup(part, layout, desc.block_bitmap())?;
                take_block(layout, g);
                cur.resumed = true;
                cur.last = layout.group_first_block(g) + bit as u64;
                cur.group = Some(g);
                debug!("allocated block {} (first pass)", cur.last);
                return Ok(cur.last);
            }
            return Err(Ext4Error::NoSpace);
        }

        loop {
            cur.last += 1;
            if cur.last >= layout.sb.blocks_count() {
                return Err(Ext4Error::NoSpace);
            }
            let (g, bit) = layout.block_group_of(cur.last);
            if g >= layout.group_count {
                return Err(Ext4Error::NoSpace);
            }
            let desc = layout.gdt.get(g);
            if desc.free_blocks_count() == 0 {
                debug!("block group {g} is full, skipping");
                cur.last = layout.group_first_block(g + 1) - 1;
                continue;
            }
            if desc.is_block_bitmap_uninit() {
                alloc.block_maps[g as usize] = metadata_block_bitmap(layout, g);
                layout
                    .gdt
                    .update(g, |d| d.bg_flags.remove(GroupFlags::BLOCK_UNINIT));
            }
            if !alloc.block_maps[g as usize].set(bit) {
                continue;
            }
            if cur.group != Some(g) {
                shadow.backup(part, layout, desc.block_bitmap())?;
                cur.group = Some(g);
            }
            take_block(layout, g);
            return Ok(cur.last);
        }
    }

    /// Allocates one inode number.
    pub(crate) fn alloc_inode(&mut self) -> Ext4Result<u32> {
        let Self {
            part,
            layout,
            alloc,
            shadow,
            ..
        } = self;
        let alloc = alloc
            .as_mut()
            .ok_or(Ext4Error::Corrupted("write session not started"))?;
        let cur = &mut alloc.inodes;
        let ipg = layout.sb.s_inodes_per_group as u64;
        let first_ino = layout.sb.first_ino() as u64;

        if !cur.resumed {
            for g in 0..layout.group_count {
                let desc = layout.gdt.get(g);
                if desc.free_inodes_count() == 0 {
                    debug!("no free inode in group {g}");
                    continue;
                }
                if desc.is_inode_bitmap_uninit() {
                    init_inode_bitmap(&mut alloc.inode_maps[g as usize], layout.block_size);
                    layout
                        .gdt
                        .update(g, |d| d.bg_flags.remove(GroupFlags::INODE_UNINIT));
                }
                let bm = &mut alloc.inode_maps[g as usize];
                let Some(bit) = bm.first_clear() else {
                    continue;
                };
                let ino = g as u64 * ipg + bit as u64 + 1;
                if ino < first_ino {
                    warn!("reserved inode {ino} marked free, skipping group {g}");
                    continue;
                }
                bm.set(bit);
                shadow.backup(part, layout, desc.inode_bitmap())?;
                take_inode(layout, g);
                cur.resumed = true;
                cur.last = ino;
                cur.group = Some(g);
                debug!("allocated inode {ino} (first pass)");
                return Ok(ino as u32);
            }
            return Err(Ext4Error::NoFreeInode);
        }

        loop {
            cur.last += 1;
            let g = ((cur.last - 1) / ipg) as u32;
            let bit = ((cur.last - 1) % ipg) as usize;
            if g >= layout.group_count {
                return Err(Ext4Error::NoFreeInode);
            }
            let desc = layout.gdt.get(g);
            if desc.free_inodes_count() == 0 {
                debug!("inode group {g} is full, skipping");
                cur.last = (g as u64 + 1) * ipg;
                continue;
            }
            if desc.is_inode_bitmap_uninit() {
                init_inode_bitmap(&mut alloc.inode_maps[g as usize], layout.block_size);
                layout
                    .gdt
                    .update(g, |d| d.bg_flags.remove(GroupFlags::INODE_UNINIT));
            }
            if cur.last < first_ino || !alloc.inode_maps[g as usize].set(bit) {
                continue;
            }
            if cur.group != Some(g) {
                shadow.backup(part, layout, desc.inode_bitmap())?;
                cur.group = Some(g);
            }
            take_inode(layout, g);
            return Ok(cur.last as u32);
        }
    }

    /// Returns `block` to its group.
    pub(crate) fn free_block(&mut self, block: u64) -> Ext4Result<()> {
        let Self {
            part,
            layout,
            alloc,
            shadow,
            ..
        } = self;
        let alloc = alloc
            .as_mut()
            .ok_or(Ext4Error::Corrupted("write session not started"))?;
        if block < layout.sb.s_first_data_block as u64 || block >= layout.sb.blocks_count() {
            warn!("refusing to free out-of-range block {block}");
            return Err(Ext4Error::Corrupted("freeing block outside the volume"));
        }
        let (g, bit) = layout.block_group_of(block);
        if !alloc.block_maps[g as usize].clear(bit) {
            warn!("block {block} already free");
            return Ok(());
        }
        shadow.backup(part, layout, layout.gdt.get(g).block_bitmap())?;
        layout
            .gdt
            .update(g, |d| d.set_free_blocks_count(d.free_blocks_count().saturating_add(1)));
        let free = layout.sb.free_blocks_count();
        layout.sb.set_free_blocks_count(free + 1);
        Ok(())
    }

    /// Returns inode `ino` to its group.
    pub(crate) fn free_inode(&mut self, ino: u32) -> Ext4Result<()> {
        let Self {
            part,
            layout,
            alloc,
            shadow,
            ..
        } = self;
        let alloc = alloc
            .as_mut()
            .ok_or(Ext4Error::Corrupted("write session not started"))?;
        let ipg = layout.sb.s_inodes_per_group;
        let g = (ino - 1) / ipg;
        let bit = ((ino - 1) % ipg) as usize;
        if !alloc.inode_maps[g as usize].clear(bit) {
            warn!("inode {ino} already free");
            return Ok(());
        }
        shadow.backup(part, layout, layout.gdt.get(g).inode_bitmap())?;
        layout
            .gdt
            .update(g, |d| d.set_free_inodes_count(d.free_inodes_count().saturating_add(1)));
        layout.sb.s_free_inodes_count += 1;
        Ok(())
    }

    /// Adjusts the used-directory counter of the group holding `ino`.
    pub(crate) fn count_dir(&mut self, ino: u32, delta: i32) {
        let g = (ino - 1) / self.layout.sb.s_inodes_per_group;
        self.layout.gdt.update(g, |d| {
            d.set_used_dirs_count(d.used_dirs_count().saturating_add_signed(delta));
        });
    }

    /// Writes superblock, bitmaps and descriptor table back, then commits the
    /// shadow log.
    pub fn sync(&mut self) -> Ext4Result<()> {
        let Some(alloc) = self.alloc.as_ref() else {
            return Ok(());
        };
        let layout = &mut self.layout;
        layout.sb.s_wtime = now();
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        layout.sb.to_disk_bytes(&mut raw);
        self.part.write_bytes(SUPERBLOCK_OFFSET, &raw)?;

        for (g, desc) in layout.gdt.iter().enumerate() {
            self.part.write_bytes(
                layout.block_to_byte(desc.block_bitmap()),
                alloc.block_maps[g].as_bytes(),
            )?;
            self.part.write_bytes(
                layout.block_to_byte(desc.inode_bitmap()),
                alloc.inode_maps[g].as_bytes(),
            )?;
        }

        if layout.sb.has_gdt_csum() {
            let uuid = layout.sb.s_uuid;
            layout.gdt.refresh_checksums(&uuid);
        }
        self.part
            .write_bytes(layout.block_to_byte(layout.gdt_block), layout.gdt.as_bytes())?;

        self.shadow.commit();
        self.part.flush()?;
        debug!(
            "synced metadata: {} free blocks, {} free inodes",
            layout.sb.free_blocks_count(),
            layout.sb.s_free_inodes_count
        );
        Ok(())
    }
}

fn take_block(layout: &mut Layout, group: u32) {
    layout
        .gdt
        .update(group, |d| d.set_free_blocks_count(d.free_blocks_count().saturating_sub(1)));
    let free = layout.sb.free_blocks_count();
    layout.sb.set_free_blocks_count(free.saturating_sub(1));
}

fn take_inode(layout: &mut Layout, group: u32) {
    layout.gdt.update(group, |d| {
        let free = d.free_inodes_count().saturating_sub(1);
        d.set_free_inodes_count(free);
        d.set_itable_unused(free);
    });
    layout.sb.s_free_inodes_count = layout.sb.s_free_inodes_count.saturating_sub(1);
}

fn init_inode_bitmap(bm: &mut Bitmap, block_size: usize) {
    let bits = bm.bits();
    *bm = Bitmap::zeroed(block_size, bits);
    bm.set_range(bits, block_size * 8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    fn check_invariant<D: SectorDevice>(fs: &Ext4FileSystem<D>) {
        let layout = fs.layout();
        let alloc = fs.allocator().unwrap();
        for g in 0..layout.group_count {
            let desc = layout.gdt.get(g);
            assert_eq!(
                alloc.block_bitmap(g).count_set() + desc.free_blocks_count() as usize,
                layout.blocks_in_group(g),
                "block group {g}"
            );
            assert_eq!(
                alloc.inode_bitmap(g).count_set() + desc.free_inodes_count() as usize,
                layout.sb.s_inodes_per_group as usize,
                "inode group {g}"
            );
        }
        assert_eq!(layout.gdt.total_free_blocks(), layout.sb.free_blocks_count());
    }

    #[test]
    fn test_cursor_allocates_forward_and_frees() {
        let part = test_util::formatted(1024, 4 * 1024 * 1024);
        let mut fs = Ext4FileSystem::mount(part).unwrap();
        fs.begin_write().unwrap();
        check_invariant(&fs);

        let a = fs.alloc_block().unwrap();
        let b = fs.alloc_block().unwrap();
        let c = fs.alloc_block().unwrap();
        assert_eq!((b, c), (a + 1, a + 2));
        check_invariant(&fs);

        fs.free_block(b).unwrap();
        check_invariant(&fs);
        // The cursor keeps moving forward until the operation ends.
        assert_eq!(fs.alloc_block().unwrap(), a + 3);
        fs.reset_cursors();
        assert_eq!(fs.alloc_block().unwrap(), b);
        check_invariant(&fs);

        let i1 = fs.alloc_inode().unwrap();
        let i2 = fs.alloc_inode().unwrap();
        assert_eq!(i1, 12);
        assert_eq!(i2, 13);
        fs.free_inode(i1).unwrap();
        check_invariant(&fs);
        fs.sync().unwrap();
        assert!(fs.shadow.is_empty());
    }

    #[test]
    fn test_allocation_crosses_groups() {
        // 1 KiB blocks, 8192 blocks per group: three groups.
        let part = test_util::formatted(1024, 20 * 1024 * 1024);
        let mut fs = Ext4FileSystem::mount(part).unwrap();
        assert!(fs.layout().group_count >= 2);
        fs.begin_write().unwrap();
        let free0 = fs.layout().gdt.get(0).free_blocks_count();
        let mut last = 0;
        for _ in 0..free0 + 5 {
            last = fs.alloc_block().unwrap();
        }
        assert_eq!(fs.layout().gdt.get(0).free_blocks_count(), 0);
        assert_eq!(fs.layout().block_group_of(last).0, 1);
        check_invariant(&fs);
        assert!(fs.shadow.contains(fs.layout().gdt.get(1).block_bitmap()));
    }

    #[test]
    fn test_exhaustion_reports_no_space() {
        let part = test_util::formatted(1024, 1024 * 1024);
        let mut fs = Ext4FileSystem::mount(part).unwrap();
        fs.begin_write().unwrap();
        let free = fs.superblock().free_blocks_count();
        for _ in 0..free {
            fs.alloc_block().unwrap();
        }
        assert_eq!(fs.alloc_block(), Err(Ext4Error::NoSpace));
        fs.reset_cursors();
        assert_eq!(fs.alloc_block(), Err(Ext4Error::NoSpace));
        check_invariant(&fs);
    }

    #[test]
    fn test_read_only_mount_refuses_write_session() {
        let part = test_util::formatted(1024, 1024 * 1024);
        let mut fs = Ext4FileSystem::mount_with(part, MountOptions::read_only()).unwrap();
        assert_eq!(fs.begin_write(), Err(Ext4Error::ReadOnly));
    }

    #[test]
    fn test_superblock_count_reconciled() {
        let part = test_util::formatted(1024, 1024 * 1024);
        let mut fs = Ext4FileSystem::mount(part).unwrap();
        let real = fs.superblock().free_blocks_count();
        fs.layout.sb.set_free_blocks_count(real + 40);
        fs.begin_write().unwrap();
        assert_eq!(fs.superblock().free_blocks_count(), real);
    }

    #[test]
    fn test_uninit_group_bitmap_marks_metadata() {
        let part = test_util::formatted(1024, 20 * 1024 * 1024);
        let mut fs = Ext4FileSystem::mount(part).unwrap();
        fs.layout
            .gdt
            .update(1, |d| d.bg_flags.insert(GroupFlags::BLOCK_UNINIT));
        let expected = fs.layout().gdt.get(1).free_blocks_count() as usize;
        fs.begin_write().unwrap();
        let bm = fs.allocator().unwrap().block_bitmap(1);
        assert_eq!(bm.bits() - bm.count_set(), expected);
    }
}
