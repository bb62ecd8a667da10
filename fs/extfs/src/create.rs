// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Creating files, directories and symlinks.
//!
//! New inodes always use the classic block map. Data blocks are allocated
//! before the indirect blocks that point at them so that file content stays
//! contiguous.

use alloc::{vec, vec::Vec};

use log::{debug, info};

use crate::{
    blockdev::SectorDevice,
    config::*,
    dir::split_parent,
    disknode::{Ext4Inode, FileType},
    endian::put_le32,
    entries::{Ext4DirEntry2, records, set_rec_len, write_record},
    error::*,
    ext4::Ext4FileSystem,
    resolver::BlockMapper,
    superblock::FeatureIncompat,
};

/// Where a new record goes inside an existing directory block.
enum Slot {
    /// Reuse the deleted record at this offset.
    Reuse { offset: usize, rec_len: usize },
    /// Shrink the record at `offset` to `used` bytes and append after it.
    Split {
        offset: usize,
        used: usize,
        rec_len: usize,
    },
}

fn find_slot(block: &[u8], needed: usize) -> Ext4Result<Option<Slot>> {
    for rec in records(block) {
        let rec = rec?;
        let rec_len = rec.entry.rec_len as usize;
        if !rec.is_used() {
            if rec_len >= needed {
                return Ok(Some(Slot::Reuse {
                    offset: rec.offset,
                    rec_len,
                }));
            }
        } else if rec.slack() >= needed {
            return Ok(Some(Slot::Split {
                offset: rec.offset,
                used: rec.entry.used_len(),
                rec_len,
            }));
        }
    }
    Ok(None)
}

/// Index blocks needed to map `count` data blocks with `per` pointers each.
fn indirect_overhead(count: u64, per: u64) -> u64 {
    let mut rest = count.saturating_sub(DIRECT_BLOCKS as u64);
    let mut total = 0;
    if rest == 0 {
        return 0;
    }
    // Single indirect.
    total += 1;
    rest = rest.saturating_sub(per);
    if rest == 0 {
        return total;
    }
    let di = rest.min(per * per);
    total += 1 + di.div_ceil(per);
    rest -= di;
    if rest == 0 {
        return total;
    }
    total += 1 + rest.div_ceil(per * per) + rest.div_ceil(per);
    total
}

impl<D: SectorDevice> Ext4FileSystem<D> {
    fn dirent_type(&self, ft: FileType) -> u8 {
        if self
            .layout
            .sb
            .s_feature_incompat
            .contains(FeatureIncompat::FILETYPE)
        {
            ft.to_dirent()
        } else {
            0
        }
    }

    /// Adds `name -> ino` to `parent`, growing it by one block when no
    /// existing block has room. Writes `parent` back when it grows.
    pub(crate) fn insert_dirent(
        &mut self,
        parent_ino: u32,
        parent: &mut Ext4Inode,
        name: &str,
        ino: u32,
        ft: FileType,
    ) -> Ext4Result<()> {
        let bs = self.layout.block_size;
        let needed = Ext4DirEntry2::entry_len(name.len());
        let type_byte = self.dirent_type(ft);
        let blocks = parent.size().div_ceil(bs as u64);
        let mut mapper = BlockMapper::new();
        let mut buf = vec![0u8; bs];

        for lblk in 0..blocks {
            let phys = mapper.map(&self.part, &self.layout, parent, lblk)?;
            if phys == 0 {
                continue;
            }
            self.read_block(phys, &mut buf)?;
            let Some(slot) = find_slot(&buf, needed)? else {
                continue;
            };
            self.shadow.backup(&self.part, &self.layout, phys)?;
            match slot {
                Slot::Reuse { offset, rec_len } => {
                    write_record(&mut buf, offset, ino, rec_len, type_byte, name.as_bytes());
                }
                Slot::Split {
                    offset,
                    used,
                    rec_len,
                } => {
                    set_rec_len(&mut buf, offset, used);
                    write_record(
                        &mut buf,
                        offset + used,
                        ino,
                        rec_len - used,
                        type_byte,
                        name.as_bytes(),
                    );
                }
            }
            self.write_block(phys, &buf)?;
            debug!("dirent {name} -> {ino} in block {phys}");
            return Ok(());
        }

        if parent.uses_extents() {
            return Err(Ext4Error::Unsupported("growing an extent-mapped directory"));
        }
        let idx = blocks as usize;
        if idx >= DIRECT_BLOCKS {
            return Err(Ext4Error::DirectoryFull);
        }
        let phys = self.alloc_block()?;
        buf.fill(0);
        write_record(&mut buf, 0, ino, bs, type_byte, name.as_bytes());
        self.write_block(phys, &buf)?;
        parent.i_block[idx] = phys as u32;
        parent.set_size(parent.size() + bs as u64);
        parent.i_blocks_lo += self.layout.sectors_per_block() as u32;
        self.write_inode(parent_ino, parent)?;
        debug!("directory {parent_ino} grew to {} blocks", idx + 1);
        Ok(())
    }

    fn write_pointers(&self, block: u64, ptrs: &[u64]) -> Ext4Result<()> {
        let mut buf = vec![0u8; self.layout.block_size];
        for (i, p) in ptrs.iter().enumerate() {
            put_le32(&mut buf, i * 4, *p as u32);
        }
        self.write_block(block, &buf)
    }

    /// Allocates an index block at `level` mapping `data`; returns it.
    fn build_indirect(&mut self, data: &[u64], level: u32) -> Ext4Result<u64> {
        let per = self.layout.block_size / 4;
        let ptrs: Vec<u64> = if level == 1 {
            data.to_vec()
        } else {
            let span = per.pow(level - 1);
            data.chunks(span)
                .map(|chunk| self.build_indirect(chunk, level - 1))
                .collect::<Ext4Result<_>>()?
        };
        let block = self.alloc_block()?;
        self.write_pointers(block, &ptrs)?;
        Ok(block)
    }

    /// Allocates `count` data blocks and the index blocks mapping them into
    /// `inode.i_block`. Returns the data blocks in logical order.
    fn map_new_blocks(&mut self, inode: &mut Ext4Inode, count: u64) -> Ext4Result<Vec<u64>> {
        let per = (self.layout.block_size / 4) as u64;
        let data: Vec<u64> = (0..count)
            .map(|_| self.alloc_block())
            .collect::<Ext4Result<_>>()?;

        let direct = data.len().min(DIRECT_BLOCKS);
        for (slot, b) in inode.i_block.iter_mut().zip(&data[..direct]) {
            *slot = *b as u32;
        }
        let mut rest = &data[direct..];
        for (level, slot) in [(1u32, SINGLE_INDIRECT), (2, DOUBLE_INDIRECT), (3, TRIPLE_INDIRECT)] {
            if rest.is_empty() {
                break;
            }
            let span = per.pow(level) as usize;
            let (here, next) = rest.split_at(rest.len().min(span));
            inode.i_block[slot] = self.build_indirect(here, level)? as u32;
            rest = next;
        }
        Ok(data)
    }

    fn new_inode(mode: u16, links: u16) -> Ext4Inode {
        let t = now();
        Ext4Inode {
            i_mode: mode,
            i_links_count: links,
            i_atime: t,
            i_ctime: t,
            i_mtime: t,
            ..Default::default()
        }
    }

    /// Resolves the parent directory of `path` and checks `name` is free.
    fn prepare_create<'p>(&self, path: &'p str) -> Ext4Result<(u32, Ext4Inode, &'p str)> {
        let (parent_path, name) = split_parent(path)?;
        let (pino, parent) = self.find(parent_path, FileType::Directory)?;
        if self.lookup(&parent, name)?.is_some() {
            return Err(Ext4Error::AlreadyExists);
        }
        Ok((pino, parent, name))
    }

    /// Writes `data` as the regular file `path`, replacing an existing file.
    ///
    /// Returns the new inode number.
    pub fn write_new_file(&mut self, path: &str, data: &[u8]) -> Ext4Result<u32> {
        self.begin_write()?;
        let result = self.write_new_file_inner(path, data);
        self.reset_cursors();
        result
    }

    fn write_new_file_inner(&mut self, path: &str, data: &[u8]) -> Ext4Result<u32> {
        let (parent_path, name) = split_parent(path)?;
        let (pino, mut parent) = self.find(parent_path, FileType::Directory)?;
        if let Some((_, ft)) = self.lookup(&parent, name)? {
            if ft == FileType::Directory {
                return Err(Ext4Error::IsADirectory);
            }
            debug!("{path}: replacing existing entry");
            self.unlink(&parent, name)?;
            self.reset_cursors();
            parent = self.read_inode(pino)?;
        }

        let bs = self.layout.block_size as u64;
        let count = (data.len() as u64).div_ceil(bs);
        let total = count + indirect_overhead(count, bs / 4);
        let max = DIRECT_BLOCKS as u64 + (bs / 4) + (bs / 4).pow(2) + (bs / 4).pow(3);
        if count > max {
            return Err(Ext4Error::Unsupported("file too large for a block map"));
        }
        if self.layout.sb.free_blocks_count() < total {
            return Err(Ext4Error::NoSpace);
        }

        let ino = self.alloc_inode()?;
        let mut inode = Self::new_inode(NEW_FILE_MODE, 1);
        inode.set_size(data.len() as u64);
        let blocks = self.map_new_blocks(&mut inode, count)?;
        inode.i_blocks_lo = (total * self.layout.sectors_per_block()) as u32;
        self.write_inode(ino, &inode)?;
        self.write_blocks(&blocks, data)?;
        self.insert_dirent(pino, &mut parent, name, ino, FileType::RegularFile)?;
        self.sync()?;
        info!("wrote {path}: {} bytes, inode {ino}", data.len());
        Ok(ino)
    }

    /// Creates the empty directory `path`; returns its inode number.
    pub fn mkdir(&mut self, path: &str) -> Ext4Result<u32> {
        self.begin_write()?;
        let result = self.mkdir_inner(path);
        self.reset_cursors();
        result
    }

    fn mkdir_inner(&mut self, path: &str) -> Ext4Result<u32> {
        let (pino, mut parent, name) = self.prepare_create(path)?;
        if self.layout.sb.free_blocks_count() == 0 {
            return Err(Ext4Error::NoSpace);
        }
        let bs = self.layout.block_size;
        let ino = self.alloc_inode()?;
        let block = self.alloc_block()?;

        let dir_type = self.dirent_type(FileType::Directory);
        let mut buf = vec![0u8; bs];
        let dot_len = Ext4DirEntry2::entry_len(1);
        write_record(&mut buf, 0, ino, dot_len, dir_type, b".");
        write_record(&mut buf, dot_len, pino, bs - dot_len, dir_type, b"..");
        self.write_block(block, &buf)?;

        let mut inode = Self::new_inode(NEW_DIR_MODE, 2);
        inode.set_size(bs as u64);
        inode.i_block[0] = block as u32;
        inode.i_blocks_lo = self.layout.sectors_per_block() as u32;
        self.write_inode(ino, &inode)?;

        self.insert_dirent(pino, &mut parent, name, ino, FileType::Directory)?;
        parent.i_links_count += 1;
        self.write_inode(pino, &parent)?;
        self.count_dir(ino, 1);
        self.sync()?;
        info!("created directory {path}, inode {ino}");
        Ok(ino)
    }

    /// Creates the symlink `path` pointing at `target`; returns its inode
    /// number.
    pub fn symlink(&mut self, path: &str, target: &str) -> Ext4Result<u32> {
        self.begin_write()?;
        let result = self.symlink_inner(path, target);
        self.reset_cursors();
        result
    }

    fn symlink_inner(&mut self, path: &str, target: &str) -> Ext4Result<u32> {
        if target.is_empty() {
            return Err(Ext4Error::InvalidPath);
        }
        let bs = self.layout.block_size;
        if target.len() >= bs {
            return Err(Ext4Error::NameTooLong);
        }
        let (pino, mut parent, name) = self.prepare_create(path)?;
        let inline = target.len() <= INLINE_SYMLINK_MAX;
        if !inline && self.layout.sb.free_blocks_count() == 0 {
            return Err(Ext4Error::NoSpace);
        }

        let ino = self.alloc_inode()?;
        let mut inode = Self::new_inode(NEW_SYMLINK_MODE, 1);
        inode.set_size(target.len() as u64);
        if inline {
            inode.set_block_bytes(target.as_bytes());
        } else {
            let block = self.alloc_block()?;
            let mut buf = vec![0u8; bs];
            buf[..target.len()].copy_from_slice(target.as_bytes());
            self.write_block(block, &buf)?;
            inode.i_block[0] = block as u32;
            inode.i_blocks_lo = self.layout.sectors_per_block() as u32;
        }
        self.write_inode(ino, &inode)?;
        self.insert_dirent(pino, &mut parent, name, ino, FileType::Symlink)?;
        self.sync()?;
        debug!("symlink {path} -> {target}, inode {ino}");
        Ok(ino)
    }
}

#[cfg(test)]
mod tests {
    use core::ops::ControlFlow;

    use super::*;
    use crate::test_util;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn read_all<D: SectorDevice>(fs: &Ext4FileSystem<D>, path: &str) -> Vec<u8> {
        let (_, inode) = fs.find(path, FileType::RegularFile).unwrap();
        let mut out = vec![0u8; inode.size() as usize];
        let n = fs
            .read_at(&inode, &mut BlockMapper::new(), 0, &mut out)
            .unwrap();
        assert_eq!(n, out.len());
        out
    }

    #[test]
    fn test_overhead_counts_index_blocks() {
        assert_eq!(indirect_overhead(12, 256), 0);
        assert_eq!(indirect_overhead(13, 256), 1);
        assert_eq!(indirect_overhead(12 + 256, 256), 1);
        assert_eq!(indirect_overhead(12 + 256 + 1, 256), 3);
        assert_eq!(indirect_overhead(12 + 256 + 512, 256), 4);
    }

    #[test]
    fn test_write_odd_length_and_read_back() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 4 * 1024 * 1024)).unwrap();
        let data = patterned(5000);
        let free = fs.superblock().free_blocks_count();
        let ino = fs.write_new_file("/odd.bin", &data).unwrap();
        assert_eq!(read_all(&fs, "/odd.bin"), data);
        assert_eq!(fs.superblock().free_blocks_count(), free - 5);

        let inode = fs.read_inode(ino).unwrap();
        assert_eq!(inode.i_mode, NEW_FILE_MODE);
        assert_eq!(inode.i_links_count, 1);
        assert_eq!(inode.i_blocks_lo, 10);
    }

    #[test]
    fn test_double_indirect_file() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 4 * 1024 * 1024)).unwrap();
        // 300 blocks: 12 direct, 256 single indirect, 32 through the double.
        let data = patterned(300 * 1024 - 17);
        let free = fs.superblock().free_blocks_count();
        let ino = fs.write_new_file("/big", &data).unwrap();
        assert_eq!(fs.superblock().free_blocks_count(), free - 303);
        let inode = fs.read_inode(ino).unwrap();
        assert_ne!(inode.i_block[DOUBLE_INDIRECT], 0);
        assert_eq!(inode.i_block[TRIPLE_INDIRECT], 0);
        assert_eq!(inode.i_blocks_lo, 303 * 2);
        assert_eq!(read_all(&fs, "/big"), data);

        // Data blocks were handed out before the index blocks.
        let mut mapper = BlockMapper::new();
        let first = mapper.map(&fs.part, &fs.layout, &inode, 0).unwrap();
        let last = mapper.map(&fs.part, &fs.layout, &inode, 299).unwrap();
        assert_eq!(last, first + 299);
    }

    #[test]
    fn test_empty_file() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 2 * 1024 * 1024)).unwrap();
        let ino = fs.write_new_file("/empty", &[]).unwrap();
        let inode = fs.read_inode(ino).unwrap();
        assert_eq!(inode.size(), 0);
        assert_eq!(inode.i_blocks_lo, 0);
        assert!(read_all(&fs, "/empty").is_empty());
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 2 * 1024 * 1024)).unwrap();
        fs.write_new_file("/f", &patterned(4000)).unwrap();
        let free = fs.superblock().free_blocks_count();
        fs.write_new_file("/f", b"short").unwrap();
        assert_eq!(read_all(&fs, "/f"), b"short");
        assert_eq!(fs.superblock().free_blocks_count(), free + 3);
    }

    #[test]
    fn test_errors_leave_volume_untouched() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 2 * 1024 * 1024)).unwrap();
        fs.mkdir("/d").unwrap();
        assert_eq!(fs.write_new_file("/d", b"x"), Err(Ext4Error::IsADirectory));
        assert_eq!(fs.write_new_file("/nope/f", b"x"), Err(Ext4Error::NotFound));
        assert_eq!(fs.write_new_file("rel", b"x"), Err(Ext4Error::InvalidPath));
        assert_eq!(fs.mkdir("/d"), Err(Ext4Error::AlreadyExists));

        let free = fs.superblock().free_blocks_count() as usize;
        let too_big = vec![0u8; (free + 1) * 1024];
        assert_eq!(fs.write_new_file("/huge", &too_big), Err(Ext4Error::NoSpace));
        assert_eq!(fs.superblock().free_blocks_count() as usize, free);
    }

    #[test]
    fn test_mkdir_links_and_nesting() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(4096, 8 * 1024 * 1024)).unwrap();
        let root_links = fs.read_inode(ROOT_INO).unwrap().i_links_count;
        let dirs = fs.layout().gdt.get(0).used_dirs_count();
        let ino = fs.mkdir("/etc").unwrap();
        fs.write_new_file("/etc/hosts", b"127.0.0.1 localhost\n")
            .unwrap();

        assert_eq!(fs.read_inode(ROOT_INO).unwrap().i_links_count, root_links + 1);
        assert_eq!(fs.layout().gdt.get(0).used_dirs_count(), dirs + 1);
        let dir = fs.read_inode(ino).unwrap();
        assert_eq!(dir.i_links_count, 2);
        assert_eq!(fs.lookup(&dir, "..").unwrap(), Some((ROOT_INO, FileType::Directory)));
        assert_eq!(read_all(&fs, "/etc/hosts"), b"127.0.0.1 localhost\n");
    }

    #[test]
    fn test_directory_grows_then_fills() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 4 * 1024 * 1024)).unwrap();
        fs.mkdir("/many").unwrap();
        // 240 byte names: four records per 1 KiB block.
        let name = |i: usize| alloc::format!("/many/{i:03}{}", "n".repeat(237));
        let mut created = 0;
        let err = loop {
            match fs.write_new_file(&name(created), b"") {
                Ok(_) => created += 1,
                Err(e) => break e,
            }
        };
        assert_eq!(err, Ext4Error::DirectoryFull);
        assert_eq!(created, 12 * 4);
        let (_, dir) = fs.find("/many", FileType::Directory).unwrap();
        assert_eq!(dir.size(), 12 * 1024);
    }

    #[test]
    fn test_directory_grows_on_64k_blocks() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(65536, 64 * 1024 * 1024)).unwrap();
        // 260 byte records: 251 fit after ".", ".." and "lost+found".
        let name = |i: usize| alloc::format!("/{i:03}{}", "w".repeat(247));
        for i in 0..260 {
            fs.write_new_file(&name(i), b"").unwrap();
        }
        let (_, root) = fs.find("/", FileType::Directory).unwrap();
        assert_eq!(root.size(), 2 * 65536);

        let mut listed = 0;
        fs.read_dir(&root, |_, _, _| {
            listed += 1;
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(listed, 3 + 260);
        assert!(fs.lookup(&root, &name(259)[1..]).unwrap().is_some());
        fs.write_new_file("/after", b"x").unwrap();
        assert_eq!(read_all(&fs, "/after"), b"x");
    }

    #[test]
    fn test_fast_and_slow_symlinks() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 2 * 1024 * 1024)).unwrap();
        let free = fs.superblock().free_blocks_count();
        let ino = fs.symlink("/short", "/etc/passwd").unwrap();
        let link = fs.read_inode(ino).unwrap();
        assert!(link.is_fast_symlink(fs.layout().sectors_per_block()));
        assert_eq!(fs.superblock().free_blocks_count(), free);

        let target = "t".repeat(100);
        let ino = fs.symlink("/long", &target).unwrap();
        let link = fs.read_inode(ino).unwrap();
        assert_eq!(link.i_blocks_lo, 2);
        assert_eq!(fs.read_link(&link).unwrap(), target);

        assert_eq!(fs.symlink("/x", ""), Err(Ext4Error::InvalidPath));
        assert_eq!(
            fs.symlink("/x", &"y".repeat(1024)),
            Err(Ext4Error::NameTooLong)
        );
    }

    #[test]
    fn test_listing_shows_new_entries() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 2 * 1024 * 1024)).unwrap();
        fs.write_new_file("/a", b"1").unwrap();
        fs.mkdir("/b").unwrap();
        fs.symlink("/c", "a").unwrap();
        let root = fs.read_inode(ROOT_INO).unwrap();
        let mut seen = Vec::new();
        fs.read_dir(&root, |name, stat, is_dir| {
            seen.push((alloc::string::String::from(name), stat.file_type(), is_dir));
            ControlFlow::Continue(())
        })
        .unwrap();
        assert!(seen.contains(&("a".into(), FileType::RegularFile, false)));
        assert!(seen.contains(&("b".into(), FileType::Directory, true)));
        assert!(seen.contains(&("c".into(), FileType::Symlink, false)));
    }

    #[test]
    fn test_read_only_mount_rejects_writes() {
        let part = test_util::formatted(1024, 2 * 1024 * 1024);
        let mut fs = Ext4FileSystem::mount_with(part, MountOptions::read_only()).unwrap();
        assert_eq!(fs.write_new_file("/f", b"x"), Err(Ext4Error::ReadOnly));
        assert_eq!(fs.mkdir("/d"), Err(Ext4Error::ReadOnly));
    }
}
