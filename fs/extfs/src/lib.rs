// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # extfs
//!
//! On-disk engine for ext2/3/4 volumes.
//!
//! The crate is organised in layers:
//! - sector devices, partition windows and MBR discovery (blockdev, partition, ramdisk)
//! - the superblock, group descriptors and derived geometry (superblock, blockgroup_description, layout)
//! - logical to physical block mapping for block maps and extent trees (resolver, extents_tree)
//! - inodes, directory records and path resolution (disknode, entries, dir)
//! - file reads with run coalescing (file)
//! - on write-capable builds: allocation, shadow copies, create/delete and the formatter
//!
//! [`api`] exposes the flat call set a filesystem shim needs.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub use api::{OpenFile, close_file, iterate_directory, open_file, read_file, stat_file};
pub use blockdev::{Disk, Partition, SectorDevice};
pub use config::MountOptions;
pub use disknode::{Ext4Inode, FileType, Stat};
pub use error::{BlockDevError, BlockDevResult, Ext4Error, Ext4Result};
pub use ext4::{Ext4FileSystem, FsStat};
#[cfg(feature = "write")]
pub use mkfs::{FormatOptions, mkfs};
pub use partition::{PartitionEntry, has_partition_table, list_partitions, open_partition};
pub use ramdisk::RamDisk;

pub mod api;
pub mod blockdev;
pub mod blockgroup_description;
pub mod config;
pub mod dir;
pub mod disknode;
pub mod endian;
pub mod entries;
pub mod error;
pub mod ext4;
pub mod extents_tree;
pub mod file;
pub mod layout;
pub mod partition;
pub mod ramdisk;
pub mod resolver;
pub mod superblock;

#[cfg(feature = "write")]
pub mod bitmap;
#[cfg(feature = "write")]
pub mod bmalloc;
#[cfg(feature = "write")]
mod create;
#[cfg(feature = "write")]
mod delete;
#[cfg(feature = "write")]
pub mod mkfs;
#[cfg(feature = "write")]
pub mod shadow;

#[cfg(test)]
mod test_util;
