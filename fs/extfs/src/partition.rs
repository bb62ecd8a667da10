// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! MBR partition discovery.
//!
//! Primary slots are numbered first in slot order; when a slot holds an
//! extended partition its logical partitions are numbered in place, following
//! the EBR chain.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::{
    blockdev::{Disk, Partition, SectorDevice},
    config::{MAX_LOGICAL_PARTITIONS, SECTOR_BITS, SECTOR_SIZE},
    endian::{le16, le32},
    error::*,
};

const TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const SIGNATURE_OFFSET: usize = 510;
const BOOT_SIGNATURE: u16 = 0xAA55;

/// Type bytes of extended container partitions.
const EXTENDED_CHS: u8 = 0x05;
const EXTENDED_LBA: u8 = 0x0F;

/// One data partition found in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    /// 1-based number in discovery order.
    pub number: u32,
    /// MBR type byte.
    pub kind: u8,
    pub bootable: bool,
    /// First sector from the start of the disk.
    pub start_sector: u64,
    pub sectors: u64,
    /// Found through an extended boot record.
    pub logical: bool,
}

#[derive(Debug, Clone, Copy)]
struct RawSlot {
    status: u8,
    kind: u8,
    offset: u32,
    length: u32,
}

impl RawSlot {
    fn parse(sector: &[u8], index: usize) -> Self {
        let e = TABLE_OFFSET + ENTRY_SIZE * index;
        Self {
            status: sector[e],
            kind: sector[e + 4],
            offset: le32(sector, e + 8),
            length: le32(sector, e + 12),
        }
    }

    fn is_extended(&self) -> bool {
        self.kind == EXTENDED_CHS || self.kind == EXTENDED_LBA
    }
}

fn read_sector<D: SectorDevice>(disk: &Disk<D>, lba: u64) -> BlockDevResult<[u8; SECTOR_SIZE]> {
    let mut buf = [0u8; SECTOR_SIZE];
    disk.read(&mut buf, lba, 1)?;
    Ok(buf)
}

/// Whether sector 0 carries the boot signature.
pub fn has_partition_table<D: SectorDevice>(disk: &Disk<D>) -> BlockDevResult<bool> {
    let mbr = read_sector(disk, 0)?;
    Ok(le16(&mbr, SIGNATURE_OFFSET) == BOOT_SIGNATURE)
}

/// Lists every data partition of the disk.
pub fn list_partitions<D: SectorDevice>(disk: &Disk<D>) -> BlockDevResult<Vec<PartitionEntry>> {
    let mut found = Vec::new();
    let mbr = read_sector(disk, 0)?;
    if le16(&mbr, SIGNATURE_OFFSET) != BOOT_SIGNATURE {
        debug!("no MBR signature, treating disk as unpartitioned");
        return Ok(found);
    }

    for x in 0..4 {
        let slot = RawSlot::parse(&mbr, x);
        debug!(
            "mbr slot {x}: status {:#x} type {:#x} off {} len {}",
            slot.status, slot.kind, slot.offset, slot.length
        );
        if slot.is_extended() {
            walk_logical(disk, slot.offset as u64, &mut found)?;
        } else if slot.kind != 0 {
            let number = found.len() as u32 + 1;
            found.push(PartitionEntry {
                number,
                kind: slot.kind,
                bootable: slot.status & 0x80 != 0,
                start_sector: slot.offset as u64,
                sectors: slot.length as u64,
                logical: false,
            });
        }
    }
    Ok(found)
}

/// Follows the EBR chain of the extended partition starting at `base`.
fn walk_logical<D: SectorDevice>(
    disk: &Disk<D>,
    base: u64,
    found: &mut Vec<PartitionEntry>,
) -> BlockDevResult<()> {
    let mut next = Some(0u64);
    let mut hops = 0;
    while let Some(rel) = next.take() {
        hops += 1;
        if hops > MAX_LOGICAL_PARTITIONS {
            warn!("EBR chain at sector {base} longer than {MAX_LOGICAL_PARTITIONS}, stopping");
            break;
        }
        let ebr_lba = base + rel;
        let ebr = read_sector(disk, ebr_lba)?;
        for x in 0..2 {
            let slot = RawSlot::parse(&ebr, x);
            debug!(
                "ebr {ebr_lba} slot {x}: type {:#x} off {} len {}",
                slot.kind, slot.offset, slot.length
            );
            if slot.is_extended() {
                if slot.offset as u64 != rel {
                    next = Some(slot.offset as u64);
                }
            } else if slot.kind != 0 {
                let number = found.len() as u32 + 1;
                found.push(PartitionEntry {
                    number,
                    kind: slot.kind,
                    bootable: slot.status & 0x80 != 0,
                    start_sector: ebr_lba + slot.offset as u64,
                    sectors: slot.length as u64,
                    logical: true,
                });
            }
        }
    }
    Ok(())
}

/// Opens partition `number`; `0` selects the whole disk.
pub fn open_partition<D: SectorDevice>(disk: &Disk<D>, number: u32) -> Ext4Result<Partition<D>> {
    if number == 0 {
        return Ok(disk.whole());
    }
    let entry = list_partitions(disk)?
        .into_iter()
        .find(|p| p.number == number)
        .ok_or(Ext4Error::NotFound)?;
    debug!(
        "partition {number}: start {} length {}",
        entry.start_sector, entry.sectors
    );
    Ok(Partition::new(
        disk.clone(),
        entry.start_sector << SECTOR_BITS,
        entry.sectors,
    )?)
}
