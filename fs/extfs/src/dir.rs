// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Directory scans and path resolution.

use alloc::{
    string::{String, ToString},
    vec,
    vec::Vec,
};
use core::ops::ControlFlow;

use log::{debug, warn};

use crate::{
    blockdev::SectorDevice,
    config::*,
    disknode::{Ext4Inode, FileType, Stat},
    entries::{DirRecord, records},
    error::*,
    ext4::Ext4FileSystem,
    resolver::BlockMapper,
};

/// Non-empty components of `path`; leading, trailing and repeated slashes
/// are ignored.
pub fn components(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Splits an absolute path into its parent path and final name.
pub fn split_parent(path: &str) -> Ext4Result<(&str, &str)> {
    if !path.starts_with('/') {
        return Err(Ext4Error::InvalidPath);
    }
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = match trimmed.rfind('/') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => return Err(Ext4Error::InvalidPath),
    };
    if name.is_empty() || name == "." || name == ".." {
        return Err(Ext4Error::InvalidPath);
    }
    if name.len() > DIRNAME_LEN {
        return Err(Ext4Error::NameTooLong);
    }
    Ok((if parent.is_empty() { "/" } else { parent }, name))
}

impl<D: SectorDevice> Ext4FileSystem<D> {
    /// Visits every used record of `dir` in on-disk order.
    ///
    /// Stops at the first `Break` and hands its value back.
    pub(crate) fn scan_dir<T>(
        &self,
        dir: &Ext4Inode,
        mut f: impl FnMut(&DirRecord<'_>) -> ControlFlow<T>,
    ) -> Ext4Result<Option<T>> {
        let bs = self.layout.block_size;
        let blocks = dir.size().div_ceil(bs as u64);
        let mut mapper = BlockMapper::new();
        let mut buf = vec![0u8; bs];
        for lblk in 0..blocks {
            let n = self.read_at(dir, &mut mapper, lblk * bs as u64, &mut buf)?;
            for rec in records(&buf[..n]) {
                let rec = rec?;
                if !rec.is_used() || rec.entry.name_len == 0 {
                    continue;
                }
                if let ControlFlow::Break(v) = f(&rec) {
                    return Ok(Some(v));
                }
            }
        }
        Ok(None)
    }

    /// Type of the object `rec` points to.
    ///
    /// Taken from the record when the volume stores it, else from the inode.
    fn record_type(rec: &DirRecord<'_>, inode: &Ext4Inode) -> FileType {
        match FileType::from_dirent(rec.entry.file_type) {
            FileType::Unknown => {
                if rec.entry.file_type != 0 {
                    warn!("unknown dirent file type {}", rec.entry.file_type);
                }
                inode.file_type()
            }
            ft => ft,
        }
    }

    /// Looks `name` up in `dir`.
    pub fn lookup(&self, dir: &Ext4Inode, name: &str) -> Ext4Result<Option<(u32, FileType)>> {
        if !dir.is_dir() {
            return Err(Ext4Error::NotADirectory);
        }
        let found = self.scan_dir(dir, |rec| {
            if rec.name == name.as_bytes() {
                ControlFlow::Break((rec.entry.inode, rec.entry.file_type))
            } else {
                ControlFlow::Continue(())
            }
        })?;
        let Some((ino, type_byte)) = found else {
            return Ok(None);
        };
        let ft = match FileType::from_dirent(type_byte) {
            FileType::Unknown => self.read_inode(ino)?.file_type(),
            ft => ft,
        };
        Ok(Some((ino, ft)))
    }

    /// Target of a symlink.
    pub fn read_link(&self, inode: &Ext4Inode) -> Ext4Result<String> {
        if !inode.is_symlink() {
            return Err(Ext4Error::InvalidPath);
        }
        let size = inode.size() as usize;
        let target = if inode.is_fast_symlink(self.layout.sectors_per_block()) {
            inode.block_bytes()[..size].to_vec()
        } else {
            let mut buf = vec![0u8; size];
            let n = self.read_at(inode, &mut BlockMapper::new(), 0, &mut buf)?;
            buf.truncate(n);
            buf
        };
        String::from_utf8(target).map_err(|_| Ext4Error::Corrupted("symlink target"))
    }

    /// Resolves `path` from the root directory.
    ///
    /// Symlinks met on the way are followed, the final component only when
    /// `follow_last` is set. Following more than [`SYMLINK_MAX_HOPS`] links
    /// fails with [`Ext4Error::SymlinkLoop`].
    pub fn resolve_path(&self, path: &str, follow_last: bool) -> Ext4Result<(u32, Ext4Inode)> {
        let root = (ROOT_INO, self.read_inode(ROOT_INO)?);
        let mut cur = root;
        let mut pending: Vec<String> = components(path).rev().map(ToString::to_string).collect();
        let mut hops = 0;

        while let Some(name) = pending.pop() {
            if name.len() > DIRNAME_LEN {
                return Err(Ext4Error::NameTooLong);
            }
            let (ino, _) = self.lookup(&cur.1, &name)?.ok_or(Ext4Error::NotFound)?;
            let inode = self.read_inode(ino)?;
            if inode.is_symlink() && (follow_last || !pending.is_empty()) {
                hops += 1;
                if hops > SYMLINK_MAX_HOPS {
                    warn!("{path}: more than {SYMLINK_MAX_HOPS} symlinks");
                    return Err(Ext4Error::SymlinkLoop);
                }
                let target = self.read_link(&inode)?;
                debug!("{path}: {name} -> {target}");
                if target.starts_with('/') {
                    cur = root;
                }
                pending.extend(components(&target).rev().map(ToString::to_string));
                continue;
            }
            cur = (ino, inode);
        }
        Ok(cur)
    }

    /// Resolves `path` and checks the object has the `expected` type.
    pub fn find(&self, path: &str, expected: FileType) -> Ext4Result<(u32, Ext4Inode)> {
        let (ino, inode) = self.resolve_path(path, true)?;
        let actual = inode.file_type();
        if actual == expected {
            return Ok((ino, inode));
        }
        Err(match expected {
            FileType::Directory => Ext4Error::NotADirectory,
            _ if actual == FileType::Directory => Ext4Error::IsADirectory,
            _ => Ext4Error::NotFound,
        })
    }

    /// Reports every entry of `dir`, `.` and `..` included.
    ///
    /// The visitor gets the name, the entry's stat and whether it is a
    /// directory; returning `Break` ends the walk early.
    pub fn read_dir(
        &self,
        dir: &Ext4Inode,
        mut visitor: impl FnMut(&str, &Stat, bool) -> ControlFlow<()>,
    ) -> Ext4Result<()> {
        if !dir.is_dir() {
            return Err(Ext4Error::NotADirectory);
        }
        let outcome = self.scan_dir(dir, |rec| {
            let child = match self.read_inode(rec.entry.inode) {
                Ok(inode) => inode,
                Err(e) => return ControlFlow::Break(Err(e)),
            };
            let is_dir = Self::record_type(rec, &child) == FileType::Directory;
            let name = String::from_utf8_lossy(rec.name);
            match visitor(&name, &child.stat(rec.entry.inode), is_dir) {
                ControlFlow::Continue(()) => ControlFlow::Continue(()),
                ControlFlow::Break(()) => ControlFlow::Break(Ok(())),
            }
        })?;
        outcome.unwrap_or(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn test_components_and_split() {
        let parts: Vec<&str> = components("//a/b//c/").collect();
        assert_eq!(parts, ["a", "b", "c"]);
        assert_eq!(split_parent("/a/b").unwrap(), ("/a", "b"));
        assert_eq!(split_parent("/top").unwrap(), ("/", "top"));
        assert_eq!(split_parent("/dir/").unwrap(), ("/", "dir"));
        assert_eq!(split_parent("rel"), Err(Ext4Error::InvalidPath));
        assert_eq!(split_parent("/"), Err(Ext4Error::InvalidPath));
        let long = alloc::format!("/{}", "x".repeat(256));
        assert_eq!(split_parent(&long), Err(Ext4Error::NameTooLong));
    }

    #[test]
    fn test_root_listing_has_dot_entries() {
        let fs = Ext4FileSystem::mount(test_util::formatted(1024, 2 * 1024 * 1024)).unwrap();
        let root = fs.read_inode(ROOT_INO).unwrap();
        let mut names = Vec::new();
        fs.read_dir(&root, |name, stat, is_dir| {
            assert!(is_dir);
            if name.starts_with('.') {
                assert_eq!(stat.ino, ROOT_INO);
            }
            names.push(name.to_string());
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(names, [".", "..", "lost+found"]);
    }

    #[test]
    fn test_visitor_can_stop_early() {
        let fs = Ext4FileSystem::mount(test_util::formatted(1024, 2 * 1024 * 1024)).unwrap();
        let root = fs.read_inode(ROOT_INO).unwrap();
        let mut seen = 0;
        fs.read_dir(&root, |_, _, _| {
            seen += 1;
            ControlFlow::Break(())
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_missing_component() {
        let fs = Ext4FileSystem::mount(test_util::formatted(1024, 2 * 1024 * 1024)).unwrap();
        assert_eq!(fs.resolve_path("/", true).unwrap().0, ROOT_INO);
        assert_eq!(fs.resolve_path("/./..", true).unwrap().0, ROOT_INO);
        assert_eq!(
            fs.resolve_path("/nope/x", true).err(),
            Some(Ext4Error::NotFound)
        );
        assert_eq!(
            fs.find("/", FileType::RegularFile).err(),
            Some(Ext4Error::IsADirectory)
        );
    }

    #[cfg(feature = "write")]
    #[test]
    fn test_symlink_hop_limit() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 4 * 1024 * 1024)).unwrap();
        fs.write_new_file("/target", b"payload").unwrap();
        fs.symlink("/l1", "/target").unwrap();
        for i in 2..=9 {
            fs.symlink(&alloc::format!("/l{i}"), &alloc::format!("l{}", i - 1))
                .unwrap();
        }
        assert!(fs.find("/l7", FileType::RegularFile).is_ok());
        assert!(fs.find("/l8", FileType::RegularFile).is_ok());
        assert_eq!(
            fs.find("/l9", FileType::RegularFile).err(),
            Some(Ext4Error::SymlinkLoop)
        );
        // The link itself is still reachable without following it.
        let (_, link) = fs.resolve_path("/l9", false).unwrap();
        assert_eq!(fs.read_link(&link).unwrap(), "l8");
    }

    #[cfg(feature = "write")]
    #[test]
    fn test_self_loop_and_long_target() {
        let mut fs = Ext4FileSystem::mount(test_util::formatted(1024, 4 * 1024 * 1024)).unwrap();
        fs.symlink("/loop", "loop").unwrap();
        assert_eq!(
            fs.resolve_path("/loop", true).err(),
            Some(Ext4Error::SymlinkLoop)
        );

        fs.mkdir("/deep").unwrap();
        fs.write_new_file("/deep/f", b"abc").unwrap();
        let long = alloc::format!("/deep/{}f", "./".repeat(40));
        assert!(long.len() > INLINE_SYMLINK_MAX);
        fs.symlink("/far", &long).unwrap();
        let (_, link) = fs.resolve_path("/far", false).unwrap();
        assert!(!link.is_fast_symlink(fs.layout().sectors_per_block()));
        assert_eq!(fs.read_link(&link).unwrap(), long);
        let (_, file) = fs.find("/far", FileType::RegularFile).unwrap();
        assert_eq!(file.size(), 3);

        fs.symlink("/up", "deep/../deep/f").unwrap();
        assert!(fs.find("/up", FileType::RegularFile).is_ok());
    }
}
