// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Logical to physical block mapping.
//!
//! Legacy inodes map through 12 direct pointers followed by single, double and
//! triple indirect blocks. Extent inodes walk the tree rooted in `i_block`.
//! A result of 0 is a hole.

use alloc::{boxed::Box, vec};

use log::{error, trace};

use crate::{
    blockdev::{Partition, SectorDevice},
    config::*,
    disknode::Ext4Inode,
    endian::le32,
    error::*,
    extents_tree::ExtentNode,
    layout::Layout,
};

/// One cached metadata block.
type CachedBlock = Option<(u64, Box<[u8]>)>;

/// Maps logical blocks of one inode, caching the metadata blocks it reads.
///
/// Slot `n` holds the last block read at indirection level `n`; extent walks
/// share a separate slot for tree nodes. A slot is only refetched when the
/// block it must hold changes.
#[derive(Debug, Default)]
pub struct BlockMapper {
    levels: [CachedBlock; 3],
    node: CachedBlock,
}

fn fetch<'a, D: SectorDevice>(
    slot: &'a mut CachedBlock,
    part: &Partition<D>,
    layout: &Layout,
    block: u64,
) -> Ext4Result<&'a [u8]> {
    let stale = match slot {
        Some((cached, buf)) => *cached != block || buf.len() != layout.block_size,
        None => true,
    };
    if stale {
        let mut buf = match slot.take() {
            Some((_, buf)) if buf.len() == layout.block_size => buf,
            _ => vec![0u8; layout.block_size].into_boxed_slice(),
        };
        trace!("resolver: fetch metadata block {block}");
        part.read_bytes(layout.block_to_sector(block), 0, &mut buf)?;
        *slot = Some((block, buf));
    }
    match slot {
        Some((_, buf)) => Ok(&buf[..]),
        None => Err(Ext4Error::Corrupted("metadata cache")),
    }
}

fn slot_at(buf: &[u8], index: u64) -> u64 {
    le32(buf, index as usize * 4) as u64
}

impl BlockMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every cached block.
    pub fn invalidate(&mut self) {
        self.levels = [None, None, None];
        self.node = None;
    }

    /// Physical block backing logical block `lblk` of `inode`, 0 for a hole.
    pub fn map<D: SectorDevice>(
        &mut self,
        part: &Partition<D>,
        layout: &Layout,
        inode: &Ext4Inode,
        lblk: u64,
    ) -> Ext4Result<u64> {
        let phys = if inode.uses_extents() {
            self.map_extent(part, layout, inode, lblk)?
        } else {
            self.map_legacy(part, layout, inode, lblk)?
        };
        trace!("resolver: lblk {lblk} -> {phys}");
        Ok(phys)
    }

    fn map_legacy<D: SectorDevice>(
        &mut self,
        part: &Partition<D>,
        layout: &Layout,
        inode: &Ext4Inode,
        lblk: u64,
    ) -> Ext4Result<u64> {
        let ppb = (layout.block_size / 4) as u64;
        if lblk < DIRECT_BLOCKS as u64 {
            return Ok(inode.i_block[lblk as usize] as u64);
        }

        let mut rel = lblk - DIRECT_BLOCKS as u64;
        let (root, depth) = if rel < ppb {
            (inode.i_block[SINGLE_INDIRECT], 1)
        } else if rel - ppb < ppb * ppb {
            rel -= ppb;
            (inode.i_block[DOUBLE_INDIRECT], 2)
        } else if rel - ppb - ppb * ppb < ppb * ppb * ppb {
            rel -= ppb + ppb * ppb;
            (inode.i_block[TRIPLE_INDIRECT], 3)
        } else {
            error!("logical block {lblk} past the triple indirect range");
            return Err(Ext4Error::Corrupted("logical block out of range"));
        };

        let mut block = root as u64;
        for level in 0..depth {
            if block == 0 {
                return Ok(0);
            }
            let span = ppb.pow((depth - 1 - level) as u32);
            let buf = fetch(&mut self.levels[level], part, layout, block)?;
            block = slot_at(buf, rel / span);
            rel %= span;
        }
        Ok(block)
    }

    fn map_extent<D: SectorDevice>(
        &mut self,
        part: &Partition<D>,
        layout: &Layout,
        inode: &Ext4Inode,
        lblk: u64,
    ) -> Ext4Result<u64> {
        let target = u32::try_from(lblk)
            .map_err(|_| Ext4Error::Corrupted("logical block out of range"))?;
        let root = inode.block_bytes();
        let node = ExtentNode::parse(&root)?;
        if node.is_leaf() {
            return leaf_lookup(node, target);
        }

        let mut depth = node.header.eh_depth;
        let mut child = index_lookup(node, target)?;
        loop {
            let buf = fetch(&mut self.node, part, layout, child)?;
            let next = ExtentNode::parse(buf)?;
            if next.header.eh_depth + 1 != depth {
                error!(
                    "extent node {child} at depth {} below depth {depth}",
                    next.header.eh_depth
                );
                return Err(Ext4Error::Corrupted("extent depth"));
            }
            if next.is_leaf() {
                return leaf_lookup(next, target);
            }
            depth = next.header.eh_depth;
            child = index_lookup(next, target)?;
        }
    }
}

fn index_lookup(node: ExtentNode<'_>, target: u32) -> Ext4Result<u64> {
    match node.find_index(target) {
        Some(idx) => Ok(idx.leaf()),
        None => {
            error!("no extent index covers block {target}");
            Err(Ext4Error::Corrupted("extent index search"))
        }
    }
}

fn leaf_lookup(node: ExtentNode<'_>, target: u32) -> Ext4Result<u64> {
    match node.find_extent(target) {
        Some(ex) => Ok(ex.map(target).unwrap_or(0)),
        None => {
            error!("no extent starts at or before block {target}");
            Err(Ext4Error::Corrupted("extent leaf search"))
        }
    }
}
