//! Host-side construction of the paged-attention page table.
//!
//! Logical block `j` of user `u` lives in physical block
//! `page_table[u][j]`. The table is the inverse of a seeded random
//! permutation of the pool, reshaped to `[batch, blocks_per_user]`, so
//! kernels go through the indirection from the first step and no two
//! `(user, logical block)` pairs share a physical block.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::model_args::PageParams;
use crate::tensor::TILE_HEIGHT;
use crate::{Error, Result};

/// A permutation of the block pool and its inverse.
#[derive(Debug, Clone)]
pub struct PageTable {
    batch: usize,
    block_size: usize,
    blocks_per_user: usize,
    permutation: Vec<usize>,
    reverse: Vec<usize>,
}

impl PageTable {
    /// Build the table for `batch` users from `params` with a seeded shuffle.
    ///
    /// # Errors
    /// Returns a configuration error if the block size is not a multiple of
    /// the tile height or the pool does not split evenly across users.
    pub fn new(batch: usize, params: &PageParams, seed: u64) -> Result<Self> {
        let block_size = params.page_block_size;
        let max_blocks = params.page_max_num_blocks;
        if block_size == 0 || block_size % TILE_HEIGHT != 0 {
            return Err(Error::config(format!(
                "page_block_size {block_size} must be a positive multiple of {TILE_HEIGHT}"
            )));
        }
        if batch == 0 || max_blocks == 0 || max_blocks % batch != 0 {
            return Err(Error::config(format!(
                "page_max_num_blocks {max_blocks} does not split over batch {batch}"
            )));
        }

        let mut permutation: Vec<usize> = (0..max_blocks).collect();
        permutation.shuffle(&mut StdRng::seed_from_u64(seed));
        let mut reverse = vec![0usize; max_blocks];
        for (i, &p) in permutation.iter().enumerate() {
            reverse[p] = i;
        }

        Ok(Self {
            batch,
            block_size,
            blocks_per_user: max_blocks / batch,
            permutation,
            reverse,
        })
    }

    #[must_use]
    pub fn batch(&self) -> usize {
        self.batch
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn blocks_per_user(&self) -> usize {
        self.blocks_per_user
    }

    #[must_use]
    pub fn max_num_blocks(&self) -> usize {
        self.permutation.len()
    }

    /// Tokens each user can hold.
    #[must_use]
    pub fn capacity_per_user(&self) -> usize {
        self.blocks_per_user * self.block_size
    }

    #[must_use]
    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    #[must_use]
    pub fn reverse(&self) -> &[usize] {
        &self.reverse
    }

    /// Physical block backing logical block `logical` of `user`.
    ///
    /// # Panics
    /// Panics if `user` or `logical` is out of range.
    #[must_use]
    pub fn physical_block(&self, user: usize, logical: usize) -> usize {
        assert!(user < self.batch, "user {user} out of range (batch {})", self.batch);
        assert!(
            logical < self.blocks_per_user,
            "logical block {logical} out of range ({} per user)",
            self.blocks_per_user
        );
        self.reverse[user * self.blocks_per_user + logical]
    }

    /// Row-major `[batch, blocks_per_user]` entries for upload.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn to_i32(&self) -> Vec<i32> {
        self.reverse.iter().map(|&b| b as i32).collect()
    }

    /// Shape of the uploaded table.
    #[must_use]
    pub fn shape(&self) -> [usize; 2] {
        [self.batch, self.blocks_per_user]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn params(block_size: usize, blocks: usize) -> PageParams {
        PageParams {
            page_block_size: block_size,
            page_max_num_blocks: blocks,
        }
    }

    #[test]
    fn test_reverse_inverts_permutation() {
        let pt = PageTable::new(4, &params(32, 64), 1234).unwrap();
        for b in 0..64 {
            assert_eq!(pt.reverse()[pt.permutation()[b]], b);
        }
    }

    #[test]
    fn test_entries_in_range_and_unique() {
        let pt = PageTable::new(8, &params(64, 128), 7).unwrap();
        assert_eq!(pt.shape(), [8, 16]);
        let entries = pt.to_i32();
        assert!(entries.iter().all(|&e| (0..128).contains(&e)));
        let unique: HashSet<_> = entries.iter().collect();
        assert_eq!(unique.len(), entries.len());
        assert_eq!(pt.capacity_per_user(), 16 * 64);
    }

    #[test]
    fn test_seed_controls_layout() {
        let a = PageTable::new(2, &params(32, 32), 1).unwrap();
        let b = PageTable::new(2, &params(32, 32), 1).unwrap();
        let c = PageTable::new(2, &params(32, 32), 2).unwrap();
        assert_eq!(a.to_i32(), b.to_i32());
        assert_ne!(a.to_i32(), c.to_i32());
    }

    #[test]
    fn test_bad_geometry_is_config_error() {
        assert!(PageTable::new(2, &params(48, 32), 0).is_err());
        assert!(PageTable::new(3, &params(32, 32), 0).is_err());
        assert!(PageTable::new(0, &params(32, 32), 0).is_err());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_physical_block_bounds() {
        let pt = PageTable::new(2, &params(32, 4), 0).unwrap();
        let _ = pt.physical_block(2, 0);
    }
}
