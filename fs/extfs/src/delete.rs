// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Removing directory entries and releasing inodes.

use alloc::{vec, vec::Vec};

use log::{debug, info, warn};

use crate::{
    blockdev::SectorDevice,
    config::*,
    dir::split_parent,
    disknode::{Ext4Inode, FileType},
    endian::le32,
    entries::{clear_inode, records, set_rec_len},
    error::*,
    ext4::Ext4FileSystem,
    extents_tree::ExtentNode,
    resolver::BlockMapper,
};

/// Depth limit when collecting extent tree blocks.
const MAX_EXTENT_DEPTH: u16 = 5;

impl<D: SectorDevice> Ext4FileSystem<D> {
    /// Removes the regular file or symlink `path`.
    ///
    /// The link itself is removed, never its target.
    pub fn delete_file(&mut self, path: &str) -> Ext4Result<()> {
        self.begin_write()?;
        let result = self.delete_inner(path);
        self.reset_cursors();
        result
    }

    fn delete_inner(&mut self, path: &str) -> Ext4Result<()> {
        let (parent_path, name) = split_parent(path)?;
        let (_, parent) = self.find(parent_path, FileType::Directory)?;
        match self.lookup(&parent, name)? {
            None => return Err(Ext4Error::NotFound),
            Some((_, FileType::Directory)) => return Err(Ext4Error::IsADirectory),
            Some(_) => {}
        }
        self.unlink(&parent, name)?;
        self.sync()?;
        info!("deleted {path}");
        Ok(())
    }

    /// Drops the entry `name` from `parent` and releases the inode once its
    /// last link is gone.
    pub(crate) fn unlink(&mut self, parent: &Ext4Inode, name: &str) -> Ext4Result<()> {
        let ino = self.remove_dirent(parent, name)?;
        let mut inode = self.read_inode(ino)?;
        inode.i_links_count = inode.i_links_count.saturating_sub(1);
        if inode.i_links_count > 0 {
            debug!("inode {ino} still has {} links", inode.i_links_count);
            inode.i_ctime = now();
            return self.write_inode(ino, &inode);
        }
        self.release_inode(ino, &inode)
    }

    /// Removes the record named `name`, merging its bytes into the record in
    /// front of it. The first record of a block only loses its inode number.
    fn remove_dirent(&mut self, dir: &Ext4Inode, name: &str) -> Ext4Result<u32> {
        let bs = self.layout.block_size;
        let blocks = dir.size().div_ceil(bs as u64);
        let mut mapper = BlockMapper::new();
        let mut buf = vec![0u8; bs];

        for lblk in 0..blocks {
            let phys = mapper.map(&self.part, &self.layout, dir, lblk)?;
            if phys == 0 {
                continue;
            }
            self.read_block(phys, &mut buf)?;
            let mut prev: Option<(usize, usize)> = None;
            let mut hit = None;
            for rec in records(&buf) {
                let rec = rec?;
                if rec.is_used() && rec.name == name.as_bytes() {
                    hit = Some((rec.offset, rec.entry.rec_len as usize, rec.entry.inode));
                    break;
                }
                prev = Some((rec.offset, rec.entry.rec_len as usize));
            }
            let Some((offset, rec_len, ino)) = hit else {
                continue;
            };

            self.shadow.backup(&self.part, &self.layout, phys)?;
            match prev {
                Some((prev_off, prev_len)) => set_rec_len(&mut buf, prev_off, prev_len + rec_len),
                None => clear_inode(&mut buf, offset),
            }
            self.write_block(phys, &buf)?;
            debug!("removed dirent {name} -> {ino} from block {phys}");
            return Ok(ino);
        }
        Err(Ext4Error::NotFound)
    }

    /// Frees every block of `inode`, then the inode itself.
    fn release_inode(&mut self, ino: u32, inode: &Ext4Inode) -> Ext4Result<()> {
        let blocks = if inode.is_fast_symlink(self.layout.sectors_per_block()) {
            Vec::new()
        } else if inode.uses_extents() {
            let mut out = Vec::new();
            self.collect_extent_blocks(&inode.block_bytes(), MAX_EXTENT_DEPTH, &mut out)?;
            out
        } else {
            self.collect_mapped_blocks(inode)?
        };
        debug!("releasing inode {ino}: {} blocks", blocks.len());
        for b in &blocks {
            self.free_block(*b)?;
        }

        let (_, block, offset) = self.layout.inode_location(ino)?;
        let zero = vec![0u8; self.layout.inode_size];
        self.part
            .write_bytes(self.layout.block_to_byte(block) + offset as u64, &zero)?;
        self.free_inode(ino)?;
        if inode.is_dir() {
            self.count_dir(ino, -1);
        }
        Ok(())
    }

    /// Data and index blocks of a block-mapped inode.
    fn collect_mapped_blocks(&self, inode: &Ext4Inode) -> Ext4Result<Vec<u64>> {
        let bs = self.layout.block_size as u64;
        let mut remaining = inode.size().div_ceil(bs);
        let mut out = Vec::new();
        for slot in &inode.i_block[..DIRECT_BLOCKS] {
            if remaining == 0 {
                return Ok(out);
            }
            if *slot != 0 {
                out.push(*slot as u64);
            }
            remaining -= 1;
        }
        for (level, slot) in [(1u32, SINGLE_INDIRECT), (2, DOUBLE_INDIRECT), (3, TRIPLE_INDIRECT)] {
            if remaining == 0 {
                break;
            }
            self.collect_indirect(inode.i_block[slot] as u64, level, &mut remaining, &mut out)?;
        }
        Ok(out)
    }

    fn collect_indirect(
        &self,
        block: u64,
        level: u32,
        remaining: &mut u64,
        out: &mut Vec<u64>,
    ) -> Ext4Result<()> {
        let per = (self.layout.block_size / 4) as u64;
        let span = per.pow(level - 1);
        if block == 0 {
            *remaining = remaining.saturating_sub(span * per);
            return Ok(());
        }
        let mut buf = vec![0u8; self.layout.block_size];
        self.read_block(block, &mut buf)?;
        for i in 0..per as usize {
            if *remaining == 0 {
                break;
            }
            let child = le32(&buf, i * 4) as u64;
            if level == 1 {
                if child != 0 {
                    out.push(child);
                }
                *remaining -= 1;
            } else {
                self.collect_indirect(child, level - 1, remaining, out)?;
            }
        }
        out.push(block);
        Ok(())
    }

    /// Blocks covered by the extent tree rooted in `node`, index nodes
    /// included.
    fn collect_extent_blocks(
        &self,
        node: &[u8],
        depth_left: u16,
        out: &mut Vec<u64>,
    ) -> Ext4Result<()> {
        let node = ExtentNode::parse(node)?;
        if node.is_leaf() {
            for ex in node.extents() {
                out.extend(ex.start()..ex.start() + ex.len() as u64);
            }
            return Ok(());
        }
        if depth_left == 0 {
            warn!("extent tree deeper than {MAX_EXTENT_DEPTH}");
            return Err(Ext4Error::Corrupted("extent tree depth"));
        }
        let mut buf = vec![0u8; self.layout.block_size];
        for idx in node.indexes() {
            self.read_block(idx.leaf(), &mut buf)?;
            self.collect_extent_blocks(&buf, depth_left - 1, out)?;
            out.push(idx.leaf());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        extents_tree::{Ext4Extent, build_leaf_root},
        test_util,
    };

    #[test]
    fn test_delete_restores_counts() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 4 * 1024 * 1024)).unwrap();
        let before = fs.stat_fs();
        fs.write_new_file("/big", &vec![7u8; 300 * 1024]).unwrap();
        fs.symlink("/slow", &"s".repeat(80)).unwrap();
        fs.symlink("/fast", "big").unwrap();
        assert!(fs.stat_fs().free_blocks < before.free_blocks);

        fs.delete_file("/big").unwrap();
        fs.delete_file("/slow").unwrap();
        fs.delete_file("/fast").unwrap();
        let after = fs.stat_fs();
        assert_eq!(after.free_blocks, before.free_blocks);
        assert_eq!(after.free_inodes, before.free_inodes);
        assert_eq!(fs.resolve_path("/big", false).err(), Some(Ext4Error::NotFound));
    }

    #[test]
    fn test_deleting_a_link_keeps_its_target() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 2 * 1024 * 1024)).unwrap();
        fs.write_new_file("/target", b"data").unwrap();
        fs.symlink("/link", "/target").unwrap();
        fs.delete_file("/link").unwrap();
        assert!(fs.find("/target", FileType::RegularFile).is_ok());
    }

    #[test]
    fn test_delete_refuses_directories_and_missing() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 2 * 1024 * 1024)).unwrap();
        fs.mkdir("/d").unwrap();
        assert_eq!(fs.delete_file("/d"), Err(Ext4Error::IsADirectory));
        assert_eq!(fs.delete_file("/missing"), Err(Ext4Error::NotFound));
        assert_eq!(fs.delete_file("/d/missing"), Err(Ext4Error::NotFound));
    }

    #[test]
    fn test_removed_record_space_is_reused() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 2 * 1024 * 1024)).unwrap();
        fs.mkdir("/d").unwrap();
        fs.write_new_file("/d/one", b"1").unwrap();
        fs.write_new_file("/d/two", b"2").unwrap();
        fs.write_new_file("/d/three", b"3").unwrap();
        fs.delete_file("/d/two").unwrap();
        fs.write_new_file("/d/owt", b"4").unwrap();

        let (_, dir) = fs.find("/d", FileType::Directory).unwrap();
        assert_eq!(dir.size(), 1024);
        let mut names = Vec::new();
        fs.scan_dir(&dir, |rec| {
            names.push(alloc::string::String::from_utf8_lossy(rec.name).into_owned());
            core::ops::ControlFlow::<()>::Continue(())
        })
        .unwrap();
        assert_eq!(names, [".", "..", "one", "owt", "three"]);
    }

    #[test]
    fn test_first_record_keeps_its_slot() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 4 * 1024 * 1024)).unwrap();
        fs.mkdir("/d").unwrap();
        let long = |c: char| alloc::format!("/d/{}", alloc::string::String::from(c).repeat(250));
        // Three long names fill the first block; the fourth opens a second one.
        for c in ['a', 'b', 'c', 'e'] {
            fs.write_new_file(&long(c), b"").unwrap();
        }
        let (_, dir) = fs.find("/d", FileType::Directory).unwrap();
        assert_eq!(dir.size(), 2048);
        fs.delete_file(&long('e')).unwrap();

        let mut mapper = BlockMapper::new();
        let second = mapper.map(&fs.part, &fs.layout, &dir, 1).unwrap();
        let mut buf = vec![0u8; 1024];
        fs.read_block(second, &mut buf).unwrap();
        let first = records(&buf).next().unwrap().unwrap();
        assert!(!first.is_used());
        assert_eq!(first.entry.rec_len, 1024);

        fs.write_new_file(&long('z'), b"").unwrap();
        fs.read_block(second, &mut buf).unwrap();
        let first = records(&buf).next().unwrap().unwrap();
        assert!(first.is_used());
        assert_eq!(first.name, &long('z').as_bytes()[3..]);
    }

    #[test]
    fn test_extent_file_blocks_are_freed() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 2 * 1024 * 1024)).unwrap();
        fs.write_new_file("/f", &vec![1u8; 2048]).unwrap();
        let (ino, mut inode) = fs.resolve_path("/f", false).unwrap();
        let before = fs.stat_fs().free_blocks;

        // Remap the file's two blocks as a single extent.
        let first = inode.i_block[0] as u64;
        assert_eq!(inode.i_block[1] as u64, first + 1);
        let mut root = [0u8; 60];
        build_leaf_root(&mut root, &[Ext4Extent::new(0, 2, first)]);
        inode.set_block_bytes(&root);
        inode.i_flags |= Ext4Inode::EXT4_EXTENTS_FL;
        fs.write_inode(ino, &inode).unwrap();

        fs.delete_file("/f").unwrap();
        assert_eq!(fs.stat_fs().free_blocks, before + 2);
    }
}
