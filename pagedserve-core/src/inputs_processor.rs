#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use anyhow::Result;
use candle_core::{Device, Tensor, WithDType};

use crate::{
    config::GraphConfig,
    paged_attention::{AttentionMetadata, CrossAttentionMetadata},
};

/// Slot mapping entry for tokens whose KV is not written anywhere.
pub const PAD_SLOT_ID: i64 = -1;
/// Block table padding. Kernels never read past the sequence length, so the value is only filler.
pub const PAD_BLOCK_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// All uncomputed tokens of the sequence are fed at once.
    Prefill,
    /// One token per sequence.
    Decode,
}

#[derive(Debug, Clone, Copy)]
pub enum AttentionKind<'a> {
    DecoderOnly,
    EncoderDecoder {
        encoder_tokens: &'a [u32],
        cross_block_table: &'a [usize],
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceData<'a> {
    pub seq_id: usize,
    pub tokens: &'a [u32],
    pub num_computed_tokens: usize,
    pub block_table: &'a [usize],
}

/// One scheduled group, as seen by the batch builder.
#[derive(Debug, Clone)]
pub struct SequenceGroupMetadata<'a> {
    pub request_id: usize,
    pub phase: Phase,
    pub seqs: Vec<SequenceData<'a>>,
    pub attention: AttentionKind<'a>,
    /// Tokens to sample from each sequence's last position.
    pub num_samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingEntry {
    pub seq_id: usize,
    /// Index of the sequence's last token in the flattened batch.
    pub selected_token_index: usize,
    pub num_samples: usize,
}

#[derive(Clone, Debug)]
pub struct ModelInput {
    pub input_tokens: Tensor,
    pub input_positions: Tensor,
    pub encoder_input_tokens: Tensor,
    pub encoder_input_positions: Tensor,
    pub slot_mapping: Tensor,
    pub seq_lens: Vec<usize>,
    pub query_lens: Vec<usize>,
    pub selected_token_indices: Tensor,
    pub sampling: Vec<SamplingEntry>,
    /// Captured batch size to pad to when `use_cuda_graph` is set.
    pub graph_batch_size: Option<usize>,
    /// `None` when nothing is scheduled.
    pub attn_metadata: Option<AttentionMetadata>,
}

impl ModelInput {
    pub fn is_empty(&self) -> bool {
        self.attn_metadata.is_none()
    }
}

fn make_tensor_with_pad<D: WithDType>(x: Vec<Vec<D>>, pad: D, device: &Device) -> Result<Tensor> {
    let max_len = x.iter().map(Vec::len).max().unwrap_or(0);
    let num_rows = x.len();
    let mut padded_x = Vec::with_capacity(num_rows * max_len);
    for mut x_i in x {
        x_i.resize(max_len, pad);
        padded_x.extend(x_i);
    }
    Ok(Tensor::from_vec(padded_x, (num_rows, max_len), device)?)
}

fn make_tensor<D: WithDType>(x: Vec<D>, device: &Device) -> Result<Tensor> {
    let len = x.len();
    Ok(Tensor::from_vec(x, (len,), device)?)
}

fn start_locs(lens: &[usize]) -> Vec<u32> {
    let mut locs = Vec::with_capacity(lens.len() + 1);
    let mut acc = 0;
    locs.push(0);
    for len in lens {
        acc += *len as u32;
        locs.push(acc);
    }
    locs
}

fn slot_for(block_table: &[usize], position: usize, block_size: usize) -> Result<i64> {
    if block_table.is_empty() {
        return Ok(PAD_SLOT_ID);
    }
    let Some(block_number) = block_table.get(position / block_size) else {
        anyhow::bail!(
            "Block table is too small! position={position} block_size={block_size} table_len={}",
            block_table.len()
        );
    };
    Ok((block_number * block_size + position % block_size) as i64)
}

/// Smallest captured batch size holding `batch_size` sequences.
pub fn graph_batch_size(batch_size: usize) -> usize {
    match batch_size {
        0..=2 => batch_size,
        3..=4 => 4,
        _ => batch_size.div_ceil(8) * 8,
    }
}

/// Builds the flattened model input for the groups the scheduler admitted this step.
pub struct InputsProcessor {
    block_size: usize,
    graph: GraphConfig,
    device: Device,
}

#[derive(Default)]
struct BatchBuilder {
    input_tokens: Vec<u32>,
    input_positions: Vec<i64>,
    slot_mapping: Vec<i64>,
    seq_lens: Vec<usize>,
    query_lens: Vec<usize>,
    context_lens: Vec<u32>,
    block_tables: Vec<Vec<u32>>,
    sampling: Vec<SamplingEntry>,
    num_prefills: usize,
    num_prefill_tokens: usize,
    num_decode_tokens: usize,
    max_prefill_seq_len: usize,
    max_decode_seq_len: usize,

    has_encoder: bool,
    encoder_input_tokens: Vec<u32>,
    encoder_input_positions: Vec<i64>,
    encoder_seq_lens: Vec<usize>,
    cross_slot_mapping: Vec<i64>,
    cross_block_tables: Vec<Vec<u32>>,
}

impl InputsProcessor {
    pub fn new(block_size: usize, graph: GraphConfig, device: Device) -> Self {
        Self {
            block_size,
            graph,
            device,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn prepare_model_input(&self, groups: &[SequenceGroupMetadata<'_>]) -> Result<ModelInput> {
        let mut batch = BatchBuilder::default();
        let prefills = groups.iter().filter(|group| group.phase == Phase::Prefill);
        let decodes = groups.iter().filter(|group| group.phase == Phase::Decode);
        for group in prefills.chain(decodes) {
            for seq in &group.seqs {
                self.add_sequence(&mut batch, group, seq)?;
            }
        }
        self.finish(batch)
    }

    fn add_sequence(
        &self,
        batch: &mut BatchBuilder,
        group: &SequenceGroupMetadata<'_>,
        seq: &SequenceData<'_>,
    ) -> Result<()> {
        let is_prefill = group.phase == Phase::Prefill;
        let seq_len = seq.tokens.len();
        let context_len = if is_prefill {
            seq.num_computed_tokens
        } else {
            seq_len.saturating_sub(1)
        };
        if context_len >= seq_len {
            anyhow::bail!(
                "Sequence {} has no tokens to compute (context {context_len}, length {seq_len})",
                seq.seq_id
            );
        }
        let query_len = seq_len - context_len;

        batch
            .input_tokens
            .extend_from_slice(&seq.tokens[context_len..]);
        for position in context_len..seq_len {
            batch.input_positions.push(position as i64);
            batch
                .slot_mapping
                .push(slot_for(seq.block_table, position, self.block_size)?);
        }

        // Prefill rows only carry a table when part of the context is already cached.
        let row = if is_prefill && context_len == 0 {
            Vec::new()
        } else {
            seq.block_table.iter().map(|b| *b as u32).collect()
        };
        batch.block_tables.push(row);
        batch.seq_lens.push(seq_len);
        batch.query_lens.push(query_len);
        batch.context_lens.push(context_len as u32);
        if is_prefill {
            batch.num_prefills += 1;
            batch.num_prefill_tokens += query_len;
            batch.max_prefill_seq_len = batch.max_prefill_seq_len.max(seq_len);
        } else {
            batch.num_decode_tokens += query_len;
            batch.max_decode_seq_len = batch.max_decode_seq_len.max(seq_len);
        }
        batch.sampling.push(SamplingEntry {
            seq_id: seq.seq_id,
            selected_token_index: batch.input_tokens.len() - 1,
            num_samples: group.num_samples,
        });

        match group.attention {
            AttentionKind::EncoderDecoder {
                encoder_tokens,
                cross_block_table,
            } => {
                batch.has_encoder = true;
                batch.encoder_seq_lens.push(encoder_tokens.len());
                if is_prefill {
                    batch.encoder_input_tokens.extend_from_slice(encoder_tokens);
                    for position in 0..encoder_tokens.len() {
                        batch.encoder_input_positions.push(position as i64);
                        batch.cross_slot_mapping.push(slot_for(
                            cross_block_table,
                            position,
                            self.block_size,
                        )?);
                    }
                    batch.cross_block_tables.push(Vec::new());
                } else {
                    batch
                        .cross_block_tables
                        .push(cross_block_table.iter().map(|b| *b as u32).collect());
                }
            }
            AttentionKind::DecoderOnly => {
                batch.encoder_seq_lens.push(0);
                batch.cross_block_tables.push(Vec::new());
            }
        }
        Ok(())
    }

    fn finish(&self, batch: BatchBuilder) -> Result<ModelInput> {
        let device = &self.device;
        let num_seqs = batch.seq_lens.len();
        let selected: Vec<u32> = batch
            .sampling
            .iter()
            .map(|entry| entry.selected_token_index as u32)
            .collect();
        let slot_mapping = make_tensor(batch.slot_mapping, device)?;

        let attn_metadata = if num_seqs == 0 {
            None
        } else {
            let decode_batch = num_seqs - batch.num_prefills;
            let use_cuda_graph = batch.num_prefills == 0
                && !self.graph.enforce_eager
                && decode_batch <= self.graph.max_graph_batch_size
                && batch.max_decode_seq_len <= self.graph.max_seq_len_to_capture;

            let cross = if batch.has_encoder {
                Some(CrossAttentionMetadata {
                    encoder_seq_lens_tensor: make_tensor(
                        batch.encoder_seq_lens.iter().map(|l| *l as u32).collect(),
                        device,
                    )?,
                    max_encoder_seq_len: batch.encoder_seq_lens.iter().copied().max().unwrap_or(0),
                    num_encoder_tokens: batch.encoder_seq_lens.iter().sum(),
                    encoder_seq_lens: batch.encoder_seq_lens,
                    cross_slot_mapping: make_tensor(batch.cross_slot_mapping, device)?,
                    cross_block_tables: make_tensor_with_pad(
                        batch.cross_block_tables,
                        PAD_BLOCK_ID,
                        device,
                    )?,
                })
            } else {
                None
            };

            Some(AttentionMetadata {
                num_prefills: batch.num_prefills,
                num_prefill_tokens: batch.num_prefill_tokens,
                num_decode_tokens: batch.num_decode_tokens,
                slot_mapping: slot_mapping.clone(),
                seq_lens_tensor: make_tensor(
                    batch.seq_lens.iter().map(|l| *l as u32).collect(),
                    device,
                )?,
                max_query_len: batch.query_lens.iter().copied().max().unwrap_or(0),
                max_prefill_seq_len: batch.max_prefill_seq_len,
                max_decode_seq_len: batch.max_decode_seq_len,
                query_start_loc: make_tensor(start_locs(&batch.query_lens), device)?,
                seq_start_loc: make_tensor(start_locs(&batch.seq_lens), device)?,
                context_lens_tensor: make_tensor(batch.context_lens, device)?,
                block_tables: make_tensor_with_pad(batch.block_tables, PAD_BLOCK_ID, device)?,
                seq_lens: batch.seq_lens.clone(),
                use_cuda_graph,
                cross,
            })
        };

        let graph_batch_size = attn_metadata
            .as_ref()
            .filter(|meta| meta.use_cuda_graph)
            .map(|meta| graph_batch_size(meta.num_seqs()));

        Ok(ModelInput {
            input_tokens: make_tensor(batch.input_tokens, device)?,
            input_positions: make_tensor(batch.input_positions, device)?,
            encoder_input_tokens: make_tensor(batch.encoder_input_tokens, device)?,
            encoder_input_positions: make_tensor(batch.encoder_input_positions, device)?,
            slot_mapping,
            seq_lens: batch.seq_lens,
            query_lens: batch.query_lens,
            selected_token_indices: make_tensor(selected, device)?,
            sampling: batch.sampling,
            graph_batch_size,
            attn_metadata,
        })
    }
}
