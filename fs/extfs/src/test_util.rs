// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Fresh volumes on RAM disks for unit tests.

use alloc::string::ToString;

use crate::{
    blockdev::{Disk, Partition},
    mkfs::{FormatOptions, mkfs},
    ramdisk::RamDisk,
};

/// A `bytes` long RAM disk formatted with `block_size` blocks.
pub fn formatted(block_size: usize, bytes: usize) -> Partition<RamDisk> {
    format(block_size, bytes, None)
}

pub fn formatted_with_label(block_size: usize, bytes: usize, label: &str) -> Partition<RamDisk> {
    format(block_size, bytes, Some(label))
}

fn format(block_size: usize, bytes: usize, label: Option<&str>) -> Partition<RamDisk> {
    let _ = env_logger::builder().is_test(true).try_init();
    let part = Disk::new(RamDisk::new(bytes)).whole();
    let opts = FormatOptions {
        block_size,
        label: label.map(ToString::to_string),
        uuid: [0x42; 16],
        ..Default::default()
    };
    mkfs(&part, &opts).unwrap();
    part
}
