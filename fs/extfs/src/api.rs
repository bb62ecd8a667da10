// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Flat API for a filesystem shim.
//!
//! Path failures of any kind (missing component, wrong type, symlink loop,
//! malformed path) are reported as [`Ext4Error::NotFound`].

use alloc::string::String;
use core::ops::ControlFlow;

use log::debug;

use crate::{
    blockdev::{Partition, SectorDevice},
    disknode::{Ext4Inode, FileType, Stat},
    error::*,
    ext4::Ext4FileSystem,
    resolver::BlockMapper,
};

/// An open regular file.
///
/// Carries its own resolver cache, so repeated reads of the same file reuse
/// the indirect blocks already fetched.
#[derive(Debug)]
pub struct OpenFile {
    pub ino: u32,
    pub inode: Ext4Inode,
    /// Position used by [`read`].
    pub offset: u64,
    mapper: BlockMapper,
}

fn collapse(err: Ext4Error) -> Ext4Error {
    if err.is_path_error() {
        Ext4Error::NotFound
    } else {
        err
    }
}

pub fn mount<D: SectorDevice>(part: Partition<D>) -> Ext4Result<Ext4FileSystem<D>> {
    Ext4FileSystem::mount(part)
}

pub fn unmount<D: SectorDevice>(fs: Ext4FileSystem<D>) -> Ext4Result<()> {
    fs.unmount()
}

/// Opens the regular file at `path`, following symlinks.
pub fn open_file<D: SectorDevice>(fs: &Ext4FileSystem<D>, path: &str) -> Ext4Result<OpenFile> {
    let (ino, inode) = fs.find(path, FileType::RegularFile).map_err(collapse)?;
    debug!("open {path}: inode {ino}, {} bytes", inode.size());
    Ok(OpenFile {
        ino,
        inode,
        offset: 0,
        mapper: BlockMapper::new(),
    })
}

/// Reads at `offset` into `buf`; returns the bytes read, 0 at end of file.
pub fn read_file<D: SectorDevice>(
    fs: &Ext4FileSystem<D>,
    file: &mut OpenFile,
    offset: u64,
    buf: &mut [u8],
) -> Ext4Result<usize> {
    fs.read_at(&file.inode, &mut file.mapper, offset, buf)
}

/// Reads at the file position and advances it.
pub fn read<D: SectorDevice>(
    fs: &Ext4FileSystem<D>,
    file: &mut OpenFile,
    buf: &mut [u8],
) -> Ext4Result<usize> {
    let pos = file.offset;
    let n = read_file(fs, file, pos, buf)?;
    file.offset += n as u64;
    Ok(n)
}

/// Moves the file position.
pub fn lseek(file: &mut OpenFile, offset: u64) {
    file.offset = offset;
}

pub fn stat_file(file: &OpenFile) -> Stat {
    file.inode.stat(file.ino)
}

pub fn close_file(file: OpenFile) {
    debug!("close inode {}", file.ino);
}

/// Calls `visitor` with the name, stat and directory flag of every entry of
/// the directory at `path`.
pub fn iterate_directory<D: SectorDevice>(
    fs: &Ext4FileSystem<D>,
    path: &str,
    mut visitor: impl FnMut(&str, &Stat, bool),
) -> Ext4Result<()> {
    let (_, dir) = fs.find(path, FileType::Directory).map_err(collapse)?;
    fs.read_dir(&dir, |name, stat, is_dir| {
        visitor(name, stat, is_dir);
        ControlFlow::Continue(())
    })
}

pub fn volume_label<D: SectorDevice>(fs: &Ext4FileSystem<D>) -> Option<String> {
    fs.volume_label()
}

/// Creates or replaces the regular file `path` with `data`.
#[cfg(feature = "write")]
pub fn write_new_file<D: SectorDevice>(
    fs: &mut Ext4FileSystem<D>,
    path: &str,
    data: &[u8],
) -> Ext4Result<()> {
    fs.write_new_file(path, data).map_err(collapse)?;
    Ok(())
}

#[cfg(feature = "write")]
pub fn delete_file<D: SectorDevice>(fs: &mut Ext4FileSystem<D>, path: &str) -> Ext4Result<()> {
    fs.delete_file(path).map_err(collapse)
}

#[cfg(test)]
mod tests {
    use alloc::{string::ToString, vec, vec::Vec};

    use super::*;
    use crate::{config::ROOT_INO, test_util};

    #[test]
    fn test_open_read_stat_close() {
        let mut fs = mount(test_util::formatted_with_label(1024, 2 * 1024 * 1024, "boot")).unwrap();
        let data: Vec<u8> = (0..3000).map(|i| (i % 13) as u8).collect();
        write_new_file(&mut fs, "/kernel", &data).unwrap();

        let mut file = open_file(&fs, "/kernel").unwrap();
        let st = stat_file(&file);
        assert_eq!(st.size, 3000);
        assert_eq!(st.file_type(), FileType::RegularFile);

        let mut buf = vec![0u8; 1000];
        assert_eq!(read_file(&fs, &mut file, 2500, &mut buf).unwrap(), 500);
        assert_eq!(&buf[..500], &data[2500..]);
        assert_eq!(read_file(&fs, &mut file, 3000, &mut buf).unwrap(), 0);

        let mut whole = Vec::new();
        lseek(&mut file, 0);
        loop {
            let n = read(&fs, &mut file, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            whole.extend_from_slice(&buf[..n]);
        }
        assert_eq!(whole, data);
        close_file(file);

        assert_eq!(volume_label(&fs).as_deref(), Some("boot"));
        unmount(fs).unwrap();
    }

    #[test]
    fn test_path_errors_collapse_to_not_found() {
        let mut fs = mount(test_util::formatted(1024, 2 * 1024 * 1024)).unwrap();
        fs.symlink("/loop", "loop").unwrap();
        for path in ["/missing", "/", "/loop", "/lost+found", "relative"] {
            assert_eq!(open_file(&fs, path).err(), Some(Ext4Error::NotFound), "{path}");
        }
        assert_eq!(
            iterate_directory(&fs, "/missing", |_, _, _| {}),
            Err(Ext4Error::NotFound)
        );
        assert_eq!(delete_file(&mut fs, "/lost+found"), Err(Ext4Error::NotFound));
    }

    #[test]
    fn test_iterate_directory_visits_all() {
        let mut fs = mount(test_util::formatted(4096, 4 * 1024 * 1024)).unwrap();
        fs.mkdir("/bin").unwrap();
        write_new_file(&mut fs, "/bin/sh", b"#!").unwrap();
        let mut seen = Vec::new();
        iterate_directory(&fs, "/bin", |name, stat, is_dir| {
            seen.push((name.to_string(), stat.size, is_dir));
        })
        .unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].0, "..");
        assert!(seen[1].2);
        assert_eq!(seen[2], ("sh".to_string(), 2, false));

        let mut root_entries = 0;
        iterate_directory(&fs, "/", |name, stat, _| {
            if name == "." {
                assert_eq!(stat.ino, ROOT_INO);
            }
            root_entries += 1;
        })
        .unwrap();
        assert_eq!(root_entries, 4);
    }

    #[test]
    fn test_written_file_survives_remount() {
        let part = test_util::formatted(1024, 2 * 1024 * 1024);
        let mut fs = mount(part.clone()).unwrap();
        write_new_file(&mut fs, "/persist", b"still here").unwrap();
        unmount(fs).unwrap();

        let fs = mount(part).unwrap();
        let mut file = open_file(&fs, "/persist").unwrap();
        let mut buf = [0u8; 32];
        let n = read_file(&fs, &mut file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"still here");
    }
}
