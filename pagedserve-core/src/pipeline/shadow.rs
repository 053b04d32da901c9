#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use anyhow::{Context, Result};
use candle_core::Tensor;

use super::{ModelExecutor, SequenceOutput};
use crate::{
    config::CacheConfig,
    inputs_processor::{ModelInput, PAD_SLOT_ID},
    paged_attention::{BlockDevice, CacheOps},
};

const VOCAB_SIZE: u64 = 32_000;

/// A stand-in for a real model that keeps one token id per KV slot instead of key/value
/// vectors.
///
/// Every step it applies the cache operations, stores the input tokens at their slots and then
/// reads each sequence's context back through its block tables. The sampled token is a hash of
/// everything it read, so any misplaced block, lost swap or missing copy changes the generated
/// text, and an empty slot inside a context is an error.
pub struct ShadowExecutor {
    block_size: usize,
    gpu: Vec<Option<u32>>,
    cpu: Vec<Option<u32>>,
    num_steps: usize,
}

impl ShadowExecutor {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            block_size: config.block_size,
            gpu: vec![None; config.num_gpu_blocks * config.block_size],
            cpu: vec![None; config.num_cpu_blocks * config.block_size],
            num_steps: 0,
        }
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// The first `len` tokens stored in `blocks` on `device`.
    pub fn read_back(&self, device: BlockDevice, blocks: &[usize], len: usize) -> Result<Vec<u32>> {
        let cache = match device {
            BlockDevice::Gpu => &self.gpu,
            BlockDevice::Cpu => &self.cpu,
        };
        (0..len)
            .map(|pos| {
                let block = blocks
                    .get(pos / self.block_size)
                    .with_context(|| format!("No block holds position {pos}"))?;
                let slot = block * self.block_size + pos % self.block_size;
                cache
                    .get(slot)
                    .copied()
                    .flatten()
                    .with_context(|| format!("{device:?} slot {slot} (position {pos}) is empty"))
            })
            .collect()
    }

    fn copy_block(src: &[Option<u32>], dst: &mut [Option<u32>], from: usize, to: usize, bs: usize) {
        dst[to * bs..(to + 1) * bs].copy_from_slice(&src[from * bs..(from + 1) * bs]);
    }

    fn apply_cache_ops(&mut self, ops: &CacheOps) {
        let bs = self.block_size;
        for (&cpu_block, &gpu_block) in &ops.blocks_to_swap_in {
            Self::copy_block(&self.cpu, &mut self.gpu, cpu_block, gpu_block, bs);
        }
        for (&gpu_block, &cpu_block) in &ops.blocks_to_swap_out {
            Self::copy_block(&self.gpu, &mut self.cpu, gpu_block, cpu_block, bs);
        }
        for (&src, dsts) in &ops.blocks_to_copy {
            for &dst in dsts {
                self.gpu.copy_within(src * bs..(src + 1) * bs, dst * bs);
            }
        }
    }

    fn write_slots(&mut self, tokens: &[u32], slots: &[i64]) -> Result<()> {
        if tokens.len() != slots.len() {
            anyhow::bail!(
                "Got {} tokens but {} slots",
                tokens.len(),
                slots.len()
            );
        }
        for (&tok, &slot) in tokens.iter().zip(slots) {
            if slot == PAD_SLOT_ID {
                continue;
            }
            let entry = self
                .gpu
                .get_mut(slot as usize)
                .with_context(|| format!("Slot {slot} is out of range"))?;
            *entry = Some(tok);
        }
        Ok(())
    }

    fn forward(&mut self, input: &ModelInput) -> Result<Vec<SequenceOutput>> {
        let Some(meta) = &input.attn_metadata else {
            return Ok(Vec::new());
        };
        let input_tokens = input.input_tokens.to_vec1::<u32>()?;
        self.write_slots(&input_tokens, &input.slot_mapping.to_vec1::<i64>()?)?;

        let encoder_tokens = input.encoder_input_tokens.to_vec1::<u32>()?;
        let cross_rows = match &meta.cross {
            Some(cross) => {
                self.write_slots(&encoder_tokens, &cross.cross_slot_mapping.to_vec1::<i64>()?)?;
                Some(rows(&cross.cross_block_tables)?)
            }
            None => None,
        };

        let query_start_loc = meta.query_start_loc.to_vec1::<u32>()?;
        let context_lens = meta.context_lens_tensor.to_vec1::<u32>()?;
        let block_tables = rows(&meta.block_tables)?;
        let mut encoder_offset = 0;
        let mut outputs = Vec::new();
        for (i, entry) in input.sampling.iter().enumerate() {
            let is_prefill = i < meta.num_prefills;
            let context_len = context_lens[i] as usize;
            let mut history = self.read_back(BlockDevice::Gpu, &block_tables[i], context_len)?;
            let query = query_start_loc[i] as usize..query_start_loc[i + 1] as usize;
            history.extend_from_slice(&input_tokens[query]);

            let mut hash = fnv1a(FNV_OFFSET, &history);
            if let (Some(cross), Some(cross_rows)) = (&meta.cross, &cross_rows) {
                let encoder_len = cross.encoder_seq_lens[i];
                let encoder = if is_prefill {
                    let encoder = &encoder_tokens[encoder_offset..encoder_offset + encoder_len];
                    encoder_offset += encoder_len;
                    encoder.to_vec()
                } else {
                    self.read_back(BlockDevice::Gpu, &cross_rows[i], encoder_len)?
                };
                hash = fnv1a(hash, &encoder);
            }

            outputs.extend((0..entry.num_samples).map(|sample| SequenceOutput {
                parent_seq_id: entry.seq_id,
                output_token: (hash.wrapping_add(sample as u64) % VOCAB_SIZE) as u32,
            }));
        }
        Ok(outputs)
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

fn fnv1a(mut hash: u64, tokens: &[u32]) -> u64 {
    for tok in tokens {
        for byte in tok.to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}

// Zero-width tables have no rows to chunk, so go through the flat buffer.
fn rows(table: &Tensor) -> Result<Vec<Vec<usize>>> {
    let (num_rows, width) = table.dims2()?;
    let flat = table.flatten_all()?.to_vec1::<u32>()?;
    Ok((0..num_rows)
        .map(|row| {
            flat[row * width..(row + 1) * width]
                .iter()
                .map(|b| *b as usize)
                .collect()
        })
        .collect())
}

#[async_trait::async_trait]
impl ModelExecutor for ShadowExecutor {
    async fn execute(
        &mut self,
        input: &ModelInput,
        cache_ops: &CacheOps,
    ) -> Result<Vec<SequenceOutput>> {
        self.apply_cache_ops(cache_ops);
        self.num_steps += 1;
        self.forward(input)
    }
}
