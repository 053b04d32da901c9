use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use super::block_pool::{BlockDevice, BlockPool};
use crate::{
    config::CacheConfig,
    sequence::{Sequence, SequenceGroup},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStatus {
    Ok,
    Later,
    Impossible,
}

/// Ordered physical blocks backing one sequence, or the encoder of one group.
#[derive(Debug, Clone, Serialize)]
pub struct BlockTable {
    device: BlockDevice,
    blocks: Vec<usize>,
}

impl BlockTable {
    pub fn device(&self) -> BlockDevice {
        self.device
    }

    pub fn block_ids(&self) -> &[usize] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Where the newest token of a sequence goes, and the block copy that must happen first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendedSlot {
    pub slot: usize,
    /// `(src, dst)` when a shared last block was replaced by a private copy.
    pub copy_on_write: Option<(usize, usize)>,
}

#[derive(Debug, Serialize)]
pub struct BlockEngineSnapshot {
    pub block_size: usize,
    pub free_gpu_blocks: usize,
    pub free_cpu_blocks: usize,
    pub block_tables: BTreeMap<usize, BlockTable>,
    pub cross_block_tables: BTreeMap<usize, BlockTable>,
}

/// Maps sequences to physical KV cache blocks on the GPU and CPU tiers. Operations performed by
/// the block engine never touch cache memory; data movement is returned to the caller as block
/// mappings.
pub struct BlockEngine {
    block_size: usize,
    watermark_blocks: usize,
    gpu_pool: BlockPool,
    cpu_pool: BlockPool,
    // Decoder tables, by sequence id.
    block_tables: HashMap<usize, BlockTable>,
    // Encoder cross-attention tables, by request id.
    cross_block_tables: HashMap<usize, BlockTable>,
}

impl BlockEngine {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            block_size: config.block_size,
            watermark_blocks: config.watermark_blocks(),
            gpu_pool: BlockPool::new(BlockDevice::Gpu, config.num_gpu_blocks),
            cpu_pool: BlockPool::new(BlockDevice::Cpu, config.num_cpu_blocks),
            block_tables: HashMap::new(),
            cross_block_tables: HashMap::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_gpu_blocks(&self) -> usize {
        self.gpu_pool.num_total_blocks()
    }

    pub fn num_free_gpu_blocks(&self) -> usize {
        self.gpu_pool.num_free_blocks()
    }

    pub fn num_free_cpu_blocks(&self) -> usize {
        self.cpu_pool.num_free_blocks()
    }

    pub fn gpu_usage(&self) -> f64 {
        self.gpu_pool.usage()
    }

    pub fn block_ref_cnt(&self, device: BlockDevice, block_id: usize) -> u32 {
        match device {
            BlockDevice::Gpu => self.gpu_pool.block_ref_cnt(block_id),
            BlockDevice::Cpu => self.cpu_pool.block_ref_cnt(block_id),
        }
    }

    pub fn block_table(&self, seq_id: usize) -> Option<&BlockTable> {
        self.block_tables.get(&seq_id)
    }

    pub fn cross_block_table(&self, request_id: usize) -> Option<&BlockTable> {
        self.cross_block_tables.get(&request_id)
    }

    pub fn num_required_blocks(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    /// Blocks needed to hold every unfinished sequence of `group` from scratch, plus its
    /// encoder.
    pub fn num_group_blocks(&self, group: &SequenceGroup) -> usize {
        let decoder: usize = group
            .unfinished_seqs()
            .map(|seq| self.num_required_blocks(seq.len()))
            .sum();
        let encoder = group
            .encoder_seq()
            .map_or(0, |enc| self.num_required_blocks(enc.len()));
        decoder + encoder
    }

    fn gpu_status(&self, required: usize, watermark: usize) -> AllocStatus {
        let total = self.gpu_pool.num_total_blocks();
        let free = self.gpu_pool.num_free_blocks();
        if total.saturating_sub(watermark) < required {
            AllocStatus::Impossible
        } else if free.saturating_sub(required) >= watermark && free >= required {
            AllocStatus::Ok
        } else {
            AllocStatus::Later
        }
    }

    pub fn can_allocate(&self, group: &SequenceGroup) -> AllocStatus {
        self.gpu_status(self.num_group_blocks(group), self.watermark_blocks)
    }

    /// Like `can_allocate`, without the watermark. For groups that were already admitted once
    /// and lost their blocks to a recompute preemption.
    pub fn can_reallocate(&self, group: &SequenceGroup) -> AllocStatus {
        self.gpu_status(self.num_group_blocks(group), 0)
    }

    /// Give every unfinished sequence of `group` a fresh GPU block table covering its tokens,
    /// and the encoder its cross-attention table. Must only follow `can_allocate == Ok`.
    pub fn allocate(&mut self, group: &SequenceGroup) {
        for seq in group.unfinished_seqs() {
            assert!(
                !self.block_tables.contains_key(&seq.id()),
                "Sequence {} already has a block table",
                seq.id()
            );
            let blocks = self.allocate_gpu_blocks(seq.len(), seq.id());
            self.block_tables.insert(
                seq.id(),
                BlockTable {
                    device: BlockDevice::Gpu,
                    blocks,
                },
            );
        }
        if let Some(encoder) = group.encoder_seq() {
            assert!(
                !self.cross_block_tables.contains_key(&group.request_id()),
                "Request {} already has a cross-attention block table",
                group.request_id()
            );
            let blocks = self.allocate_gpu_blocks(encoder.len(), encoder.id());
            self.cross_block_tables.insert(
                group.request_id(),
                BlockTable {
                    device: BlockDevice::Gpu,
                    blocks,
                },
            );
        }
    }

    fn allocate_gpu_blocks(&mut self, num_tokens: usize, seq_id: usize) -> Vec<usize> {
        let required = self.num_required_blocks(num_tokens);
        match self.gpu_pool.get_new_blocks(required) {
            Some(blocks) => blocks,
            None => panic!(
                "Out of GPU blocks allocating {required} blocks for sequence {seq_id} ({} free)",
                self.gpu_pool.num_free_blocks()
            ),
        }
    }

    // 1 if the next token of `seq` needs a block it does not privately own yet.
    fn blocks_to_add_new_tok(&self, seq: &Sequence) -> usize {
        let Some(table) = self.block_tables.get(&seq.id()) else {
            return 0;
        };
        let required = self.num_required_blocks(seq.len());
        if required > table.blocks.len() {
            return 1;
        }
        match table.blocks.last() {
            Some(&last) if self.gpu_pool.block_ref_cnt(last) > 1 => 1,
            _ => 0,
        }
    }

    pub fn can_append_slots(&self, group: &SequenceGroup) -> bool {
        let required: usize = group
            .unfinished_seqs()
            .map(|seq| self.blocks_to_add_new_tok(seq))
            .sum();
        required <= self.gpu_pool.num_free_blocks()
    }

    /// Reserve the slot for the last token of `seq`. Grows the table by one block when the last
    /// block is full and replaces a shared last block with a private copy.
    pub fn append_slot(&mut self, seq: &Sequence) -> AppendedSlot {
        assert!(
            !seq.is_finished(),
            "Cannot append a slot to finished sequence {}",
            seq.id()
        );
        assert!(!seq.is_empty(), "Sequence {} has no tokens", seq.id());
        let block_size = self.block_size;
        let required = seq.len().div_ceil(block_size);
        let Some(table) = self.block_tables.get_mut(&seq.id()) else {
            panic!("Sequence {} has no block table", seq.id());
        };
        assert_eq!(
            table.device,
            BlockDevice::Gpu,
            "Sequence {} is not resident on the GPU",
            seq.id()
        );

        let mut copy_on_write = None;
        if required == table.blocks.len() + 1 {
            let Some(block) = self.gpu_pool.get_new_block() else {
                panic!("Out of GPU blocks appending to sequence {}", seq.id());
            };
            table.blocks.push(block);
        } else if required == table.blocks.len() {
            let last = table.blocks[required - 1];
            if self.gpu_pool.block_ref_cnt(last) > 1 {
                let Some(block) = self.gpu_pool.get_new_block() else {
                    panic!("Out of GPU blocks copying block {last} for sequence {}", seq.id());
                };
                self.gpu_pool.free_blocks(&[last]);
                table.blocks[required - 1] = block;
                copy_on_write = Some((last, block));
            }
        } else {
            panic!(
                "Block table of sequence {} has {} blocks for {} tokens",
                seq.id(),
                table.blocks.len(),
                seq.len()
            );
        }

        let position = seq.len() - 1;
        AppendedSlot {
            slot: table.blocks[position / block_size] * block_size + position % block_size,
            copy_on_write,
        }
    }

    /// The child starts out sharing every block of the parent.
    pub fn fork(&mut self, parent: &Sequence, child: &Sequence) {
        let Some(table) = self.block_tables.get(&parent.id()).cloned() else {
            panic!("Parent sequence {} has no block table", parent.id());
        };
        assert!(
            !self.block_tables.contains_key(&child.id()),
            "Sequence {} already has a block table",
            child.id()
        );
        match table.device {
            BlockDevice::Gpu => self.gpu_pool.touch(&table.blocks),
            BlockDevice::Cpu => self.cpu_pool.touch(&table.blocks),
        }
        self.block_tables.insert(child.id(), table);
    }

    fn group_blocks(&self, group: &SequenceGroup, device: BlockDevice) -> HashSet<usize> {
        let decoder = group
            .unfinished_seqs()
            .filter_map(|seq| self.block_tables.get(&seq.id()));
        let cross = self.cross_block_tables.get(&group.request_id());
        decoder
            .chain(cross)
            .filter(|table| table.device == device)
            .flat_map(|table| table.blocks.iter().copied())
            .collect()
    }

    pub fn can_swap_out(&self, group: &SequenceGroup) -> bool {
        self.group_blocks(group, BlockDevice::Gpu).len() <= self.cpu_pool.num_free_blocks()
    }

    /// Swapping in also reserves one block per sequence for the slot appended right after. The
    /// watermark only holds back new admissions.
    pub fn can_swap_in(&self, group: &SequenceGroup) -> AllocStatus {
        let required =
            self.group_blocks(group, BlockDevice::Cpu).len() + group.num_unfinished_seqs();
        self.gpu_status(required, 0)
    }

    /// Move the whole group to the CPU tier. Returns the GPU to CPU block mapping.
    pub fn swap_out(&mut self, group: &SequenceGroup) -> HashMap<usize, usize> {
        self.move_group(group, BlockDevice::Gpu)
    }

    /// Move the whole group back to the GPU tier. Returns the CPU to GPU block mapping.
    pub fn swap_in(&mut self, group: &SequenceGroup) -> HashMap<usize, usize> {
        self.move_group(group, BlockDevice::Cpu)
    }

    fn move_group(&mut self, group: &SequenceGroup, from: BlockDevice) -> HashMap<usize, usize> {
        let (src_pool, dst_pool) = match from {
            BlockDevice::Gpu => (&mut self.gpu_pool, &mut self.cpu_pool),
            BlockDevice::Cpu => (&mut self.cpu_pool, &mut self.gpu_pool),
        };
        let mut mapping = HashMap::new();
        for seq in group.unfinished_seqs() {
            if let Some(table) = self.block_tables.get_mut(&seq.id()) {
                Self::move_table(table, src_pool, dst_pool, &mut mapping);
            }
        }
        if let Some(table) = self.cross_block_tables.get_mut(&group.request_id()) {
            Self::move_table(table, src_pool, dst_pool, &mut mapping);
        }
        mapping
    }

    // Blocks already in `mapping` are shared and only gain a reference on the destination.
    fn move_table(
        table: &mut BlockTable,
        src_pool: &mut BlockPool,
        dst_pool: &mut BlockPool,
        mapping: &mut HashMap<usize, usize>,
    ) {
        if table.device != src_pool.device() {
            return;
        }
        for block in table.blocks.iter_mut() {
            let moved = match mapping.get(block) {
                Some(&moved) => {
                    dst_pool.touch(&[moved]);
                    moved
                }
                None => {
                    let Some(moved) = dst_pool.get_new_block() else {
                        panic!("Out of {:?} blocks while swapping", dst_pool.device());
                    };
                    mapping.insert(*block, moved);
                    moved
                }
            };
            src_pool.free_blocks(&[*block]);
            *block = moved;
        }
        table.device = dst_pool.device();
    }

    /// Release the decoder blocks of one sequence.
    pub fn free(&mut self, seq_id: usize) {
        if let Some(table) = self.block_tables.remove(&seq_id) {
            self.free_table(&table);
        }
    }

    /// Release the encoder blocks of one request.
    pub fn free_cross(&mut self, request_id: usize) {
        if let Some(table) = self.cross_block_tables.remove(&request_id) {
            self.free_table(&table);
        }
    }

    pub fn free_group(&mut self, group: &SequenceGroup) {
        for seq in group.seqs() {
            self.free(seq.id());
        }
        self.free_cross(group.request_id());
    }

    fn free_table(&mut self, table: &BlockTable) {
        match table.device {
            BlockDevice::Gpu => self.gpu_pool.free_blocks(&table.blocks),
            BlockDevice::Cpu => self.cpu_pool.free_blocks(&table.blocks),
        }
    }

    pub fn snapshot(&self) -> BlockEngineSnapshot {
        BlockEngineSnapshot {
            block_size: self.block_size,
            free_gpu_blocks: self.gpu_pool.num_free_blocks(),
            free_cpu_blocks: self.cpu_pool.num_free_blocks(),
            block_tables: self
                .block_tables
                .iter()
                .map(|(id, table)| (*id, table.clone()))
                .collect(),
            cross_block_tables: self
                .cross_block_tables
                .iter()
                .map(|(id, table)| (*id, table.clone()))
                .collect(),
        }
    }
}
