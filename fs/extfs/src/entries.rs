// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Linear directory entry records.
//!
//! A directory block is a chain of records whose `rec_len` values add up to
//! the block size. Unused bytes are never left as a gap: they belong to the
//! `rec_len` of the record in front of them.

use log::error;

use crate::{config::DIRENT_HEADER_LEN, endian::*, error::*};

/// Fixed part of a directory entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ext4DirEntry2 {
    pub inode: u32,
    /// Decoded length; may be 65536 on 64 KiB blocks.
    pub rec_len: u32,
    pub name_len: u8,
    pub file_type: u8,
}

/// Largest value the 16-bit field holds; stands for a whole 64 KiB block.
const MAX_DISK_REC_LEN: u16 = 0xFFFF;

/// Decodes the on-disk `rec_len`. Lengths of 64 KiB and more keep their high
/// bits in the two low bits, which are otherwise always zero.
pub fn rec_len_from_disk(raw: u16) -> u32 {
    if raw == 0 || raw == MAX_DISK_REC_LEN {
        return 1 << 16;
    }
    let raw = u32::from(raw);
    (raw & 0xFFFC) | ((raw & 3) << 16)
}

/// Encodes a record length for the 16-bit field.
pub fn rec_len_to_disk(len: u32) -> u16 {
    if len == 1 << 16 {
        return MAX_DISK_REC_LEN;
    }
    ((len & 0xFFFC) | ((len >> 16) & 3)) as u16
}

impl Ext4DirEntry2 {
    /// Bytes a record with a `name_len` long name needs, padded to 4.
    pub fn entry_len(name_len: usize) -> usize {
        (DIRENT_HEADER_LEN + name_len).div_ceil(4) * 4
    }

    /// Bytes this record needs for its own name.
    pub fn used_len(&self) -> usize {
        if self.inode == 0 {
            0
        } else {
            Self::entry_len(self.name_len as usize)
        }
    }
}

impl DiskFormat for Ext4DirEntry2 {
    const DISK_SIZE: usize = DIRENT_HEADER_LEN;

    fn from_disk_bytes(b: &[u8]) -> Self {
        Self {
            inode: le32(b, 0),
            rec_len: rec_len_from_disk(le16(b, 4)),
            name_len: b[6],
            file_type: b[7],
        }
    }

    fn to_disk_bytes(&self, b: &mut [u8]) {
        put_le32(b, 0, self.inode);
        put_le16(b, 4, rec_len_to_disk(self.rec_len));
        b[6] = self.name_len;
        b[7] = self.file_type;
    }
}

/// A record borrowed from a directory block.
#[derive(Debug, Clone, Copy)]
pub struct DirRecord<'a> {
    /// Offset of the record inside its block.
    pub offset: usize,
    pub entry: Ext4DirEntry2,
    pub name: &'a [u8],
}

impl DirRecord<'_> {
    /// Unused bytes past the record's own name.
    pub fn slack(&self) -> usize {
        self.entry.rec_len as usize - self.entry.used_len()
    }

    pub fn is_used(&self) -> bool {
        self.entry.inode != 0
    }
}

/// Walks the records of one directory block.
pub struct DirRecords<'a> {
    block: &'a [u8],
    offset: usize,
}

/// Iterates the records of `block`.
pub fn records(block: &[u8]) -> DirRecords<'_> {
    DirRecords { block, offset: 0 }
}

impl<'a> Iterator for DirRecords<'a> {
    type Item = Ext4Result<DirRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.block.len() {
            return None;
        }
        let off = self.offset;
        if off + DIRENT_HEADER_LEN > self.block.len() {
            self.offset = self.block.len();
            return Some(Err(Ext4Error::Corrupted("truncated directory entry")));
        }
        let entry = Ext4DirEntry2::from_disk_bytes(&self.block[off..]);
        let rec_len = entry.rec_len as usize;
        if rec_len < DIRENT_HEADER_LEN
            || rec_len % 4 != 0
            || off + rec_len > self.block.len()
            || DIRENT_HEADER_LEN + entry.name_len as usize > rec_len
        {
            error!(
                "bad directory entry at {off}: rec_len {rec_len} name_len {}",
                entry.name_len
            );
            self.offset = self.block.len();
            return Some(Err(Ext4Error::Corrupted("directory entry length")));
        }
        self.offset += rec_len;
        let name_start = off + DIRENT_HEADER_LEN;
        Some(Ok(DirRecord {
            offset: off,
            entry,
            name: &self.block[name_start..name_start + entry.name_len as usize],
        }))
    }
}

/// Writes a record with `name` at `offset`.
pub fn write_record(
    block: &mut [u8],
    offset: usize,
    inode: u32,
    rec_len: usize,
    file_type: u8,
    name: &[u8],
) {
    Ext4DirEntry2 {
        inode,
        rec_len: rec_len as u32,
        name_len: name.len() as u8,
        file_type,
    }
    .to_disk_bytes(&mut block[offset..]);
    let start = offset + DIRENT_HEADER_LEN;
    block[start..start + name.len()].copy_from_slice(name);
}

/// Rewrites only the `rec_len` of the record at `offset`.
pub fn set_rec_len(block: &mut [u8], offset: usize, rec_len: usize) {
    put_le16(block, offset + 4, rec_len_to_disk(rec_len as u32));
}

/// Clears the inode of the record at `offset`, keeping its length.
pub fn clear_inode(block: &mut [u8], offset: usize) {
    put_le32(block, offset, 0);
}
