// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Error types of the device layer and of the filesystem engine.

use core::fmt;

/// Errors raised by sector devices and partition views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDevError {
    /// The device failed a read.
    ReadError,
    /// The device failed a write.
    WriteError,
    /// Transfer would leave the device or partition.
    OutOfRange { sector: u64, count: u64, limit: u64 },
    /// Caller buffer cannot hold the transfer.
    BufferTooSmall { provided: usize, required: usize },
    /// Byte offset is not sector aligned where it has to be.
    Misaligned { offset: u64 },
    /// Device was opened without write access.
    ReadOnly,
    /// Host I/O failure.
    Io,
}

impl fmt::Display for BlockDevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockDevError::ReadError => write!(f, "failed to read from block device"),
            BlockDevError::WriteError => write!(f, "failed to write to block device"),
            BlockDevError::OutOfRange {
                sector,
                count,
                limit,
            } => write!(
                f,
                "sectors {sector}..{} outside device (limit {limit})",
                sector + count
            ),
            BlockDevError::BufferTooSmall { provided, required } => write!(
                f,
                "buffer too small: provided {provided} bytes, required {required} bytes"
            ),
            BlockDevError::Misaligned { offset } => {
                write!(f, "offset {offset} is not sector aligned")
            }
            BlockDevError::ReadOnly => write!(f, "device is read-only"),
            BlockDevError::Io => write!(f, "I/O error"),
        }
    }
}

impl core::error::Error for BlockDevError {}

/// Result of device operations.
pub type BlockDevResult<T> = Result<T, BlockDevError>;

/// Errors raised by the filesystem engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ext4Error {
    /// Underlying sector transfer failed.
    Io(BlockDevError),
    /// Superblock magic mismatch.
    InvalidMagic { found: u16 },
    /// Extent node header magic mismatch.
    BadExtentMagic { found: u16 },
    /// Metadata is inconsistent.
    Corrupted(&'static str),
    /// No free block left.
    NoSpace,
    /// No free inode left.
    NoFreeInode,
    /// Directory cannot grow past its direct blocks.
    DirectoryFull,
    /// Path component does not exist.
    NotFound,
    /// Intermediate component or expected directory is not one.
    NotADirectory,
    /// Expected a file, found a directory.
    IsADirectory,
    /// Name is already taken in its directory.
    AlreadyExists,
    /// Too many symlinks followed.
    SymlinkLoop,
    /// Path is empty or not absolute where it must be.
    InvalidPath,
    /// A component is longer than a directory entry can store.
    NameTooLong,
    /// Mount session refuses writes.
    ReadOnly,
    /// Structure the engine does not handle.
    Unsupported(&'static str),
}

impl Ext4Error {
    /// Missing component, type mismatch or symlink overflow.
    pub fn is_path_error(&self) -> bool {
        matches!(
            self,
            Ext4Error::NotFound
                | Ext4Error::NotADirectory
                | Ext4Error::IsADirectory
                | Ext4Error::SymlinkLoop
                | Ext4Error::InvalidPath
                | Ext4Error::NameTooLong
        )
    }

    /// Free space or inode exhaustion.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Ext4Error::NoSpace | Ext4Error::NoFreeInode | Ext4Error::DirectoryFull
        )
    }
}

impl From<BlockDevError> for Ext4Error {
    fn from(err: BlockDevError) -> Self {
        Ext4Error::Io(err)
    }
}

impl fmt::Display for Ext4Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ext4Error::Io(e) => write!(f, "I/O error: {e}"),
            Ext4Error::InvalidMagic { found } => {
                write!(f, "not an ext2/3/4 volume (magic {found:#06x})")
            }
            Ext4Error::BadExtentMagic { found } => {
                write!(f, "bad extent header magic {found:#06x}")
            }
            Ext4Error::Corrupted(what) => write!(f, "corrupted filesystem: {what}"),
            Ext4Error::NoSpace => write!(f, "no space left on filesystem"),
            Ext4Error::NoFreeInode => write!(f, "no free inode left"),
            Ext4Error::DirectoryFull => write!(f, "directory exceeds its direct blocks"),
            Ext4Error::NotFound => write!(f, "no such file or directory"),
            Ext4Error::NotADirectory => write!(f, "not a directory"),
            Ext4Error::IsADirectory => write!(f, "is a directory"),
            Ext4Error::AlreadyExists => write!(f, "file exists"),
            Ext4Error::SymlinkLoop => write!(f, "too many levels of symbolic links"),
            Ext4Error::InvalidPath => write!(f, "invalid path"),
            Ext4Error::NameTooLong => write!(f, "file name too long"),
            Ext4Error::ReadOnly => write!(f, "filesystem mounted read-only"),
            Ext4Error::Unsupported(what) => write!(f, "unsupported: {what}"),
        }
    }
}

impl core::error::Error for Ext4Error {}

/// Result of engine operations.
pub type Ext4Result<T> = Result<T, Ext4Error>;

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;

    #[test]
    fn test_path_errors_are_classified() {
        assert!(Ext4Error::SymlinkLoop.is_path_error());
        assert!(Ext4Error::IsADirectory.is_path_error());
        assert!(!Ext4Error::NoSpace.is_path_error());
        assert!(Ext4Error::DirectoryFull.is_exhaustion());
    }

    #[test]
    fn test_device_error_converts() {
        let err: Ext4Error = BlockDevError::ReadError.into();
        assert_eq!(err, Ext4Error::Io(BlockDevError::ReadError));
        assert_eq!(
            err.to_string(),
            "I/O error: failed to read from block device"
        );
    }
}
