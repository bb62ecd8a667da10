// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Shadow copies of metadata blocks taken before they are modified.
//!
//! Before a bitmap or directory block changes in place, its current content
//! is read, remembered and written straight back at its absolute offset. The
//! log only keeps these copies until the next metadata flush; nothing replays
//! them on mount.

use alloc::{boxed::Box, collections::VecDeque, vec};

use log::{trace, warn};

use crate::{
    blockdev::{Partition, SectorDevice},
    error::*,
    layout::Layout,
};

/// One saved block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowEntry {
    pub block: u64,
    pub original: Box<[u8]>,
}

/// Blocks shadowed since the last flush.
#[derive(Debug)]
pub struct ShadowLog {
    entries: VecDeque<ShadowEntry>,
    capacity: usize,
}

impl ShadowLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, block: u64) -> bool {
        self.entries.iter().any(|e| e.block == block)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ShadowEntry> {
        self.entries.iter()
    }

    /// Shadows `block` unless it already was since the last flush.
    pub fn backup<D: SectorDevice>(
        &mut self,
        part: &Partition<D>,
        layout: &Layout,
        block: u64,
    ) -> Ext4Result<()> {
        if self.contains(block) {
            return Ok(());
        }
        let mut original = vec![0u8; layout.block_size].into_boxed_slice();
        part.read_bytes(layout.block_to_sector(block), 0, &mut original)?;
        part.write_bytes(layout.block_to_byte(block), &original)?;
        trace!("shadowed block {block}");
        if self.entries.len() == self.capacity {
            warn!("shadow log full, dropping the oldest copy");
            self.entries.pop_front();
        }
        self.entries.push_back(ShadowEntry { block, original });
        Ok(())
    }

    /// Forgets every copy once the metadata it protected reached the disk.
    pub fn commit(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn test_backup_keeps_content_and_dedups() {
        let part = test_util::formatted(1024, 2 * 1024 * 1024);
        let layout = Layout::load(&part).unwrap();
        let stamp = [0x5Au8; 1024];
        part.write_bytes(layout.block_to_byte(900), &stamp).unwrap();

        let mut log = ShadowLog::new(2);
        log.backup(&part, &layout, 900).unwrap();
        log.backup(&part, &layout, 900).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(&log.entries().next().unwrap().original[..], &stamp[..]);

        let mut back = [0u8; 1024];
        part.read_bytes(layout.block_to_sector(900), 0, &mut back)
            .unwrap();
        assert_eq!(back, stamp);

        log.backup(&part, &layout, 901).unwrap();
        log.backup(&part, &layout, 902).unwrap();
        assert_eq!(log.len(), 2);
        assert!(!log.contains(900));
        log.commit();
        assert!(log.is_empty());
    }
}
