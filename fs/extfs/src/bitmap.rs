// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Per-group allocation bitmaps. Bit `n` set means item `n` is in use.

use alloc::vec::Vec;

/// One group's block or inode bitmap, one block long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    data: Vec<u8>,
    /// Bits that describe real items; the rest of the block is padding.
    bits: usize,
}

impl Bitmap {
    pub fn from_bytes(data: Vec<u8>, bits: usize) -> Self {
        Self { data, bits }
    }

    /// An all-free bitmap of `len` bytes.
    pub fn zeroed(len: usize, bits: usize) -> Self {
        Self::from_bytes(alloc::vec![0; len], bits)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn is_set(&self, idx: usize) -> bool {
        self.data[idx / 8] & (1 << (idx % 8)) != 0
    }

    /// Sets bit `idx`; false when it was already set.
    pub fn set(&mut self, idx: usize) -> bool {
        let was = self.is_set(idx);
        self.data[idx / 8] |= 1 << (idx % 8);
        !was
    }

    /// Clears bit `idx`; false when it was already clear.
    pub fn clear(&mut self, idx: usize) -> bool {
        let was = self.is_set(idx);
        self.data[idx / 8] &= !(1 << (idx % 8));
        was
    }

    /// First clear bit below [`Self::bits`].
    pub fn first_clear(&self) -> Option<usize> {
        for (byte_idx, &byte) in self.data.iter().enumerate() {
            if byte == 0xFF {
                continue;
            }
            let idx = byte_idx * 8 + (!byte).trailing_zeros() as usize;
            return (idx < self.bits).then_some(idx);
        }
        None
    }

    /// Set bits below [`Self::bits`].
    pub fn count_set(&self) -> usize {
        (0..self.bits).filter(|i| self.is_set(*i)).count()
    }

    /// Marks `from..to` used; used for the padding past the last real item.
    pub fn set_range(&mut self, from: usize, to: usize) {
        for i in from..to.min(self.data.len() * 8) {
            self.data[i / 8] |= 1 << (i % 8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_and_search() {
        let mut bm = Bitmap::zeroed(4, 20);
        assert_eq!(bm.first_clear(), Some(0));
        for i in 0..9 {
            assert!(bm.set(i));
        }
        assert!(!bm.set(3));
        assert_eq!(bm.first_clear(), Some(9));
        assert_eq!(bm.count_set(), 9);
        assert!(bm.clear(3));
        assert!(!bm.clear(3));
        assert_eq!(bm.first_clear(), Some(3));
    }

    #[test]
    fn test_padding_is_never_returned() {
        let mut bm = Bitmap::zeroed(2, 10);
        for i in 0..10 {
            bm.set(i);
        }
        assert_eq!(bm.first_clear(), None);
        bm.set_range(10, 16);
        assert_eq!(bm.as_bytes(), &[0xFF, 0xFF]);
        assert_eq!(bm.count_set(), 10);
    }
}
