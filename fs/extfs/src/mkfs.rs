// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Formatting a partition as a fresh ext2 volume.
//!
//! The result uses the revision 1 layout with sparse superblock backups and
//! typed directory entries: a root directory holding `lost+found`, and
//! nothing else.

use alloc::{string::String, vec, vec::Vec};

use log::{debug, info};

use crate::{
    bitmap::Bitmap,
    blockdev::{Partition, SectorDevice},
    blockgroup_description::{Ext4GroupDesc, GroupDescTable},
    bmalloc::metadata_block_bitmap,
    config::*,
    disknode::{Ext4Inode, FileType},
    endian::DiskFormat,
    entries::{Ext4DirEntry2, write_record},
    error::*,
    layout::Layout,
    superblock::{FeatureIncompat, FeatureRoCompat, Superblock},
};

/// Inode of the `lost+found` directory on fresh volumes.
pub const LOST_FOUND_INO: u32 = 11;

/// Parameters of a new volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    pub block_size: usize,
    pub inode_size: u16,
    /// One inode is provisioned for every this many bytes of volume.
    pub bytes_per_inode: usize,
    pub label: Option<String>,
    pub uuid: [u8; 16],
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            inode_size: 256,
            bytes_per_inode: 8192,
            label: None,
            uuid: [0; 16],
        }
    }
}

/// Geometry chosen for a volume before anything is written.
struct Plan {
    block_size: usize,
    blocks: u64,
    first_data_block: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    groups: u32,
    gdt_blocks: u64,
    itable_blocks: u64,
}

impl Plan {
    fn new(total_bytes: u64, opts: &FormatOptions) -> Ext4Result<Self> {
        let bs = opts.block_size;
        if !bs.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&bs) {
            return Err(Ext4Error::Unsupported("block size"));
        }
        let inode_size = opts.inode_size as usize;
        if !inode_size.is_power_of_two() || inode_size < GOOD_OLD_INODE_SIZE || inode_size > bs {
            return Err(Ext4Error::Unsupported("inode size"));
        }

        let first_data_block = u32::from(bs == MIN_BLOCK_SIZE);
        let blocks_per_group = (bs as u32 * 8).min(MAX_GROUP_ENTRIES);
        let mut blocks = total_bytes / bs as u64;
        if blocks <= first_data_block as u64 {
            return Err(Ext4Error::NoSpace);
        }
        let mut groups = (blocks - first_data_block as u64).div_ceil(blocks_per_group as u64) as u32;

        let per_block = bs / inode_size;
        let wanted = (blocks * bs as u64 / opts.bytes_per_inode.max(bs) as u64).max(16);
        let align = per_block.max(8) as u64;
        let ipg_limit = (bs as u64 * 8).min(MAX_GROUP_ENTRIES as u64) / align * align;
        let inodes_per_group = (wanted.div_ceil(groups as u64).div_ceil(align) * align)
            .min(ipg_limit) as u32;
        let itable_blocks = (inodes_per_group as usize * inode_size).div_ceil(bs) as u64;
        let gdt_blocks = (groups as usize * GROUP_DESC_SIZE).div_ceil(bs) as u64;

        // A short last group must still hold its own metadata.
        let last_len = blocks - first_data_block as u64 - (groups as u64 - 1) * blocks_per_group as u64;
        let overhead = 1 + gdt_blocks + 2 + itable_blocks;
        if last_len < overhead + 1 {
            debug!("mkfs: dropping short last group of {last_len} blocks");
            blocks -= last_len;
            groups -= 1;
        }
        // Group 0 also holds the root and lost+found blocks.
        if groups == 0 || blocks - (first_data_block as u64) < overhead + 2 {
            return Err(Ext4Error::NoSpace);
        }

        Ok(Self {
            block_size: bs,
            blocks,
            first_data_block,
            blocks_per_group,
            inodes_per_group,
            groups,
            gdt_blocks,
            itable_blocks,
        })
    }

    fn superblock(&self, opts: &FormatOptions) -> Superblock {
        let t = now();
        let mut sb = Superblock::default();
        sb.s_inodes_count = self.inodes_per_group * self.groups;
        sb.s_blocks_count_lo = self.blocks as u32;
        sb.s_first_data_block = self.first_data_block;
        sb.s_log_block_size = (self.block_size / MIN_BLOCK_SIZE).trailing_zeros();
        sb.s_log_cluster_size = sb.s_log_block_size;
        sb.s_blocks_per_group = self.blocks_per_group;
        sb.s_clusters_per_group = self.blocks_per_group;
        sb.s_inodes_per_group = self.inodes_per_group;
        sb.s_wtime = t;
        sb.s_mkfs_time = t;
        sb.s_lastcheck = t;
        sb.s_max_mnt_count = u16::MAX;
        sb.s_magic = EXT2_MAGIC;
        sb.s_state = Superblock::STATE_VALID;
        sb.s_errors = 1;
        sb.s_rev_level = Superblock::DYNAMIC_REV;
        sb.s_first_ino = LOST_FOUND_INO;
        sb.s_inode_size = opts.inode_size;
        sb.s_feature_incompat = FeatureIncompat::FILETYPE;
        sb.s_feature_ro_compat = FeatureRoCompat::SPARSE_SUPER | FeatureRoCompat::LARGE_FILE;
        sb.s_uuid = opts.uuid;
        if let Some(label) = &opts.label {
            sb.set_volume_label(label);
        }
        sb
    }

    /// Descriptor table placing each group's bitmaps and inode table right
    /// after its superblock backup.
    fn descriptors(&self, sb: &Superblock) -> GroupDescTable {
        let bs = self.block_size;
        let mut gdt = GroupDescTable::new(
            vec![0u8; self.gdt_blocks as usize * bs],
            GROUP_DESC_SIZE,
            self.groups,
        );
        for g in 0..self.groups {
            let first = self.first_data_block as u64 + g as u64 * self.blocks_per_group as u64;
            let mut meta = first;
            if sb.has_super_backup(g) {
                meta += 1 + self.gdt_blocks;
            }
            let desc = Ext4GroupDesc {
                bg_block_bitmap_lo: meta as u32,
                bg_inode_bitmap_lo: (meta + 1) as u32,
                bg_inode_table_lo: (meta + 2) as u32,
                ..Default::default()
            };
            gdt.set(g, &desc);
        }
        gdt
    }
}

fn dir_block(bs: usize, ino: u32, parent: u32, children: &[(&str, u32)]) -> Vec<u8> {
    let dir = FileType::Directory.to_dirent();
    let mut buf = vec![0u8; bs];
    let mut entries: Vec<(&str, u32)> = vec![(".", ino), ("..", parent)];
    entries.extend_from_slice(children);
    let mut off = 0;
    for (i, (name, target)) in entries.iter().enumerate() {
        let len = if i + 1 == entries.len() {
            bs - off
        } else {
            Ext4DirEntry2::entry_len(name.len())
        };
        write_record(&mut buf, off, *target, len, dir, name.as_bytes());
        off += len;
    }
    buf
}

fn write_inode<D: SectorDevice>(
    part: &Partition<D>,
    layout: &Layout,
    ino: u32,
    inode: &Ext4Inode,
) -> Ext4Result<()> {
    let (_, block, offset) = layout.inode_location(ino)?;
    let mut raw = [0u8; GOOD_OLD_INODE_SIZE];
    inode.to_disk_bytes(&mut raw);
    part.write_bytes(layout.block_to_byte(block) + offset as u64, &raw)?;
    Ok(())
}

/// Formats `part`, destroying whatever it held.
pub fn mkfs<D: SectorDevice>(part: &Partition<D>, opts: &FormatOptions) -> Ext4Result<()> {
    if part.is_readonly() {
        return Err(Ext4Error::ReadOnly);
    }
    let plan = Plan::new(part.length_in_sectors() * SECTOR_SIZE as u64, opts)?;
    let bs = plan.block_size;
    let mut sb = plan.superblock(opts);
    let gdt = plan.descriptors(&sb);
    let mut layout = Layout {
        gdt,
        block_size: bs,
        inode_size: opts.inode_size as usize,
        sectors_per_block: (bs >> SECTOR_BITS) as u64,
        group_count: plan.groups,
        gdt_block: plan.first_data_block as u64 + 1,
        gdt_blocks: plan.gdt_blocks,
        sb: sb.clone(),
    };

    let ipg = plan.inodes_per_group as usize;
    let mut block_maps: Vec<Bitmap> = (0..plan.groups)
        .map(|g| metadata_block_bitmap(&layout, g))
        .collect();
    let mut inode_maps: Vec<Bitmap> = (0..plan.groups)
        .map(|_| {
            let mut bm = Bitmap::zeroed(bs, ipg);
            bm.set_range(ipg, bs * 8);
            bm
        })
        .collect();

    let root_block = layout.group_first_block(0) + block_maps[0].first_clear().ok_or(Ext4Error::NoSpace)? as u64;
    block_maps[0].set((root_block - layout.group_first_block(0)) as usize);
    let lf_block = layout.group_first_block(0) + block_maps[0].first_clear().ok_or(Ext4Error::NoSpace)? as u64;
    block_maps[0].set((lf_block - layout.group_first_block(0)) as usize);
    for bit in 0..LOST_FOUND_INO as usize {
        inode_maps[0].set(bit);
    }

    let mut free_blocks = 0u64;
    let mut free_inodes = 0u32;
    for g in 0..plan.groups {
        let fb = (layout.blocks_in_group(g) - block_maps[g as usize].count_set()) as u32;
        let fi = (ipg - inode_maps[g as usize].count_set()) as u32;
        layout.gdt.update(g, |d| {
            d.set_free_blocks_count(fb);
            d.set_free_inodes_count(fi);
            d.set_itable_unused(fi);
            d.set_used_dirs_count(if g == 0 { 2 } else { 0 });
        });
        free_blocks += fb as u64;
        free_inodes += fi;
    }
    sb.set_free_blocks_count(free_blocks);
    sb.s_free_inodes_count = free_inodes;
    layout.sb = sb.clone();

    let zero_table = vec![0u8; plan.itable_blocks as usize * bs];
    for (g, desc) in layout.gdt.iter().enumerate() {
        part.write_bytes(layout.block_to_byte(desc.inode_table()), &zero_table)?;
        part.write_bytes(
            layout.block_to_byte(desc.block_bitmap()),
            block_maps[g].as_bytes(),
        )?;
        part.write_bytes(
            layout.block_to_byte(desc.inode_bitmap()),
            inode_maps[g].as_bytes(),
        )?;
    }

    part.write_bytes(
        layout.block_to_byte(root_block),
        &dir_block(bs, ROOT_INO, ROOT_INO, &[("lost+found", LOST_FOUND_INO)]),
    )?;
    part.write_bytes(
        layout.block_to_byte(lf_block),
        &dir_block(bs, LOST_FOUND_INO, ROOT_INO, &[]),
    )?;
    let t = now();
    let dir_inode = |mode: u16, links: u16, block: u64| {
        let mut inode = Ext4Inode {
            i_mode: mode,
            i_links_count: links,
            i_atime: t,
            i_ctime: t,
            i_mtime: t,
            i_blocks_lo: layout.sectors_per_block as u32,
            ..Default::default()
        };
        inode.i_block[0] = block as u32;
        inode.set_size(bs as u64);
        inode
    };
    write_inode(part, &layout, ROOT_INO, &dir_inode(NEW_DIR_MODE, 3, root_block))?;
    write_inode(
        part,
        &layout,
        LOST_FOUND_INO,
        &dir_inode(Ext4Inode::S_IFDIR | 0o700, 2, lf_block),
    )?;

    // Primary copies, then the sparse backups.
    let mut raw = [0u8; SUPERBLOCK_SIZE];
    for g in 0..plan.groups {
        if !sb.has_super_backup(g) {
            continue;
        }
        let mut copy = sb.clone();
        copy.s_block_group_nr = g as u16;
        copy.to_disk_bytes(&mut raw);
        let (sb_at, gdt_at) = if g == 0 {
            (SUPERBLOCK_OFFSET, layout.block_to_byte(layout.gdt_block))
        } else {
            let first = layout.group_first_block(g);
            (layout.block_to_byte(first), layout.block_to_byte(first + 1))
        };
        part.write_bytes(gdt_at, layout.gdt.as_bytes())?;
        part.write_bytes(sb_at, &raw)?;
    }
    part.flush()?;

    info!(
        "formatted {} blocks of {bs} bytes: {} groups, {} inodes per group, {free_blocks} blocks free",
        plan.blocks, plan.groups, plan.inodes_per_group
    );
    Ok(())
}
