//! Block pool for one tier of the paged KV cache.
//!
//! Blocks are stored in a flat arena indexed by `block_id`, each with a reference count.
//! Free blocks sit in a FIFO queue: allocation pops from the head, freeing appends to the
//! tail, so a block that was just released is the last to be handed out again.

use std::collections::VecDeque;

use serde::Serialize;

/// The memory tier a block lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum BlockDevice {
    Gpu,
    Cpu,
}

/// Metadata for a single KV cache block.
#[derive(Debug)]
pub struct KVCacheBlock {
    /// Block ID, ranging from 0 to num_blocks - 1.
    pub block_id: usize,
    /// Number of block table entries pointing at this block. 0 means the block is free.
    pub ref_cnt: u32,
}

pub struct BlockPool {
    device: BlockDevice,
    blocks: Vec<KVCacheBlock>,
    free_queue: VecDeque<usize>,
}

impl BlockPool {
    pub fn new(device: BlockDevice, num_blocks: usize) -> Self {
        Self {
            device,
            blocks: (0..num_blocks)
                .map(|block_id| KVCacheBlock {
                    block_id,
                    ref_cnt: 0,
                })
                .collect(),
            free_queue: (0..num_blocks).collect(),
        }
    }

    pub fn device(&self) -> BlockDevice {
        self.device
    }

    /// Get the number of free blocks available for allocation.
    pub fn num_free_blocks(&self) -> usize {
        self.free_queue.len()
    }

    pub fn num_total_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Get cache usage as a fraction [0.0, 1.0].
    #[allow(clippy::cast_precision_loss)]
    pub fn usage(&self) -> f64 {
        if self.blocks.is_empty() {
            return 0.0;
        }
        1.0 - (self.num_free_blocks() as f64 / self.blocks.len() as f64)
    }

    /// Allocate `num_blocks` new blocks, each with a reference count of 1.
    ///
    /// Returns `None` and leaves the pool untouched if not enough free blocks are available.
    pub fn get_new_blocks(&mut self, num_blocks: usize) -> Option<Vec<usize>> {
        if num_blocks > self.free_queue.len() {
            return None;
        }
        let result: Vec<usize> = self.free_queue.drain(..num_blocks).collect();
        for &block_id in &result {
            debug_assert_eq!(self.blocks[block_id].ref_cnt, 0);
            self.blocks[block_id].ref_cnt = 1;
        }
        Some(result)
    }

    pub fn get_new_block(&mut self) -> Option<usize> {
        self.get_new_blocks(1).map(|blocks| blocks[0])
    }

    /// Add one reference to each of the (already allocated) blocks.
    pub fn touch(&mut self, block_ids: &[usize]) {
        for &block_id in block_ids {
            let block = &mut self.blocks[block_id];
            assert!(
                block.ref_cnt > 0,
                "{:?} block {} is free and cannot be shared",
                self.device,
                block.block_id
            );
            block.ref_cnt += 1;
        }
    }

    /// Drop one reference from each block. Blocks whose count reaches zero return to the free
    /// queue. Freeing a block that is already free is a fatal accounting error.
    pub fn free_blocks(&mut self, block_ids: &[usize]) {
        for &block_id in block_ids {
            let block = &mut self.blocks[block_id];
            if block.ref_cnt == 0 {
                panic!(
                    "{:?} block {} experienced a double free!",
                    self.device, block.block_id
                );
            }
            block.ref_cnt -= 1;
            if block.ref_cnt == 0 {
                self.free_queue.push_back(block_id);
            }
        }
    }

    /// Get the ref_cnt for a block.
    pub fn block_ref_cnt(&self, block_id: usize) -> u32 {
        self.blocks[block_id].ref_cnt
    }
}
