// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Little-endian field access for on-disk records.
//!
//! Every multi-byte integer in the ext2/3/4 format is little endian. Records are
//! decoded field by field at fixed offsets instead of transmuting packed structs.

/// Reads a `u16` at `off`.
#[inline]
pub fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

/// Reads a `u32` at `off`.
#[inline]
pub fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Writes a `u16` at `off`.
#[inline]
pub fn put_le16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

/// Writes a `u32` at `off`.
#[inline]
pub fn put_le32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

/// A record with a fixed on-disk encoding.
pub trait DiskFormat: Sized {
    /// Encoded size in bytes.
    const DISK_SIZE: usize;

    /// Decodes from at least [`Self::DISK_SIZE`] bytes.
    fn from_disk_bytes(bytes: &[u8]) -> Self;

    /// Encodes into the first [`Self::DISK_SIZE`] bytes, leaving the rest alone.
    fn to_disk_bytes(&self, bytes: &mut [u8]);
}
