// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! On-disk inode record.

use crate::{
    config::{GOOD_OLD_INODE_SIZE, INLINE_SYMLINK_MAX, INODE_BLOCK_SLOTS},
    endian::*,
};

/// Type of a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Unknown,
    RegularFile,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
}

impl FileType {
    /// Decodes a directory entry `file_type` byte.
    pub fn from_dirent(byte: u8) -> Self {
        match byte {
            1 => FileType::RegularFile,
            2 => FileType::Directory,
            3 => FileType::CharDevice,
            4 => FileType::BlockDevice,
            5 => FileType::Fifo,
            6 => FileType::Socket,
            7 => FileType::Symlink,
            _ => FileType::Unknown,
        }
    }

    pub fn to_dirent(self) -> u8 {
        match self {
            FileType::Unknown => 0,
            FileType::RegularFile => 1,
            FileType::Directory => 2,
            FileType::CharDevice => 3,
            FileType::BlockDevice => 4,
            FileType::Fifo => 5,
            FileType::Socket => 6,
            FileType::Symlink => 7,
        }
    }

    /// Decodes the type bits of `i_mode`.
    pub fn from_mode(mode: u16) -> Self {
        match mode & Ext4Inode::S_IFMT {
            Ext4Inode::S_IFREG => FileType::RegularFile,
            Ext4Inode::S_IFDIR => FileType::Directory,
            Ext4Inode::S_IFCHR => FileType::CharDevice,
            Ext4Inode::S_IFBLK => FileType::BlockDevice,
            Ext4Inode::S_IFIFO => FileType::Fifo,
            Ext4Inode::S_IFSOCK => FileType::Socket,
            Ext4Inode::S_IFLNK => FileType::Symlink,
            _ => FileType::Unknown,
        }
    }
}

/// Metadata reported for an inode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub ino: u32,
    pub mode: u16,
    pub size: u64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub dtime: u32,
    pub links: u16,
}

impl Stat {
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }
}

/// The 128-byte base inode record.
///
/// Fields past the base record (large inodes) are never modified and never
/// rewritten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ext4Inode {
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size_lo: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_gid: u16,
    pub i_links_count: u16,
    /// 512-byte sectors in use, metadata blocks included.
    pub i_blocks_lo: u32,
    pub i_flags: u32,
    pub l_i_version: u32,
    /// Block pointers, an extent tree root or an inline symlink target.
    pub i_block: [u32; INODE_BLOCK_SLOTS],
    pub i_generation: u32,
    pub i_file_acl_lo: u32,
    /// High size bits; `dir_acl` on old revisions.
    pub i_size_high: u32,
    pub i_obso_faddr: u32,
    pub osd2: [u8; 12],
}

impl Ext4Inode {
    pub const S_IFMT: u16 = 0o170000;
    pub const S_IFSOCK: u16 = 0o140000;
    pub const S_IFLNK: u16 = 0o120000;
    pub const S_IFREG: u16 = 0o100000;
    pub const S_IFBLK: u16 = 0o060000;
    pub const S_IFDIR: u16 = 0o040000;
    pub const S_IFCHR: u16 = 0o020000;
    pub const S_IFIFO: u16 = 0o010000;

    /// Inode uses an extent tree.
    pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
    /// Inode keeps its data inline.
    pub const EXT4_INLINE_DATA_FL: u32 = 0x1000_0000;

    pub fn size(&self) -> u64 {
        (self.i_size_high as u64) << 32 | self.i_size_lo as u64
    }

    pub fn set_size(&mut self, size: u64) {
        self.i_size_lo = size as u32;
        self.i_size_high = (size >> 32) as u32;
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.i_mode)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == FileType::RegularFile
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == FileType::Symlink
    }

    pub fn uses_extents(&self) -> bool {
        self.i_flags & Self::EXT4_EXTENTS_FL != 0
    }

    /// Symlink whose target lives in `i_block`.
    ///
    /// An extended attribute block is counted in `i_blocks` too, so its
    /// `sectors_per_block` sectors do not make the target block-backed.
    pub fn is_fast_symlink(&self, sectors_per_block: u64) -> bool {
        if !self.is_symlink() || self.size() as usize > INLINE_SYMLINK_MAX {
            return false;
        }
        let ea_sectors = if self.i_file_acl_lo != 0 { sectors_per_block } else { 0 };
        u64::from(self.i_blocks_lo) == ea_sectors
    }

    /// `i_block` as the 60 raw bytes it occupies on disk.
    pub fn block_bytes(&self) -> [u8; INODE_BLOCK_SLOTS * 4] {
        let mut out = [0u8; INODE_BLOCK_SLOTS * 4];
        for (i, v) in self.i_block.iter().enumerate() {
            put_le32(&mut out, i * 4, *v);
        }
        out
    }

    pub fn set_block_bytes(&mut self, bytes: &[u8]) {
        let mut raw = [0u8; INODE_BLOCK_SLOTS * 4];
        let n = bytes.len().min(raw.len());
        raw[..n].copy_from_slice(&bytes[..n]);
        for (i, v) in self.i_block.iter_mut().enumerate() {
            *v = le32(&raw, i * 4);
        }
    }

    pub fn stat(&self, ino: u32) -> Stat {
        Stat {
            ino,
            mode: self.i_mode,
            size: self.size(),
            atime: self.i_atime,
            mtime: self.i_mtime,
            ctime: self.i_ctime,
            dtime: self.i_dtime,
            links: self.i_links_count,
        }
    }
}

impl DiskFormat for Ext4Inode {
    const DISK_SIZE: usize = GOOD_OLD_INODE_SIZE;

    fn from_disk_bytes(b: &[u8]) -> Self {
        let mut i_block = [0u32; INODE_BLOCK_SLOTS];
        for (i, slot) in i_block.iter_mut().enumerate() {
            *slot = le32(b, 0x28 + i * 4);
        }
        let mut osd2 = [0u8; 12];
        osd2.copy_from_slice(&b[0x74..0x80]);
        Self {
            i_mode: le16(b, 0x00),
            i_uid: le16(b, 0x02),
            i_size_lo: le32(b, 0x04),
            i_atime: le32(b, 0x08),
            i_ctime: le32(b, 0x0C),
            i_mtime: le32(b, 0x10),
            i_dtime: le32(b, 0x14),
            i_gid: le16(b, 0x18),
            i_links_count: le16(b, 0x1A),
            i_blocks_lo: le32(b, 0x1C),
            i_flags: le32(b, 0x20),
            l_i_version: le32(b, 0x24),
            i_block,
            i_generation: le32(b, 0x64),
            i_file_acl_lo: le32(b, 0x68),
            i_size_high: le32(b, 0x6C),
            i_obso_faddr: le32(b, 0x70),
            osd2,
        }
    }

    fn to_disk_bytes(&self, b: &mut [u8]) {
        put_le16(b, 0x00, self.i_mode);
        put_le16(b, 0x02, self.i_uid);
        put_le32(b, 0x04, self.i_size_lo);
        put_le32(b, 0x08, self.i_atime);
        put_le32(b, 0x0C, self.i_ctime);
        put_le32(b, 0x10, self.i_mtime);
        put_le32(b, 0x14, self.i_dtime);
        put_le16(b, 0x18, self.i_gid);
        put_le16(b, 0x1A, self.i_links_count);
        put_le32(b, 0x1C, self.i_blocks_lo);
        put_le32(b, 0x20, self.i_flags);
        put_le32(b, 0x24, self.l_i_version);
        for (i, v) in self.i_block.iter().enumerate() {
            put_le32(b, 0x28 + i * 4, *v);
        }
        put_le32(b, 0x64, self.i_generation);
        put_le32(b, 0x68, self.i_file_acl_lo);
        put_le32(b, 0x6C, self.i_size_high);
        put_le32(b, 0x70, self.i_obso_faddr);
        b[0x74..0x80].copy_from_slice(&self.osd2);
    }
}
