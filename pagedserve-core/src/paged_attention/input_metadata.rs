use candle_core::Tensor;

/// Encoder side of an encoder-decoder batch. Lists hold one entry per decoder sequence.
#[derive(Clone, Debug)]
pub struct CrossAttentionMetadata {
    pub encoder_seq_lens: Vec<usize>,
    pub encoder_seq_lens_tensor: Tensor,
    pub max_encoder_seq_len: usize,
    /// Total encoder length of the batch, whether or not the encoder runs this step.
    pub num_encoder_tokens: usize,
    /// One slot per encoder input token. Empty for decode steps.
    pub cross_slot_mapping: Tensor,
    /// `[num_seqs, max_width]`, rows of prefilling sequences are empty.
    pub cross_block_tables: Tensor,
}

/// Everything an attention backend needs to run one step over the flattened batch.
///
/// Prefill sequences come first, followed by decode sequences.
#[derive(Clone, Debug)]
pub struct AttentionMetadata {
    pub num_prefills: usize,
    pub num_prefill_tokens: usize,
    pub num_decode_tokens: usize,
    pub slot_mapping: Tensor,
    pub seq_lens: Vec<usize>,
    pub seq_lens_tensor: Tensor,
    pub max_query_len: usize,
    pub max_prefill_seq_len: usize,
    pub max_decode_seq_len: usize,
    /// Cumulative query lengths, `num_seqs + 1` entries starting at 0.
    pub query_start_loc: Tensor,
    /// Cumulative sequence lengths, `num_seqs + 1` entries starting at 0.
    pub seq_start_loc: Tensor,
    pub context_lens_tensor: Tensor,
    /// `[num_seqs, max_width]` padded with `PAD_BLOCK_ID`.
    pub block_tables: Tensor,
    /// Whether this step may replay a captured decode graph.
    pub use_cuda_graph: bool,
    pub cross: Option<CrossAttentionMetadata>,
}

impl AttentionMetadata {
    pub fn num_seqs(&self) -> usize {
        self.seq_lens.len()
    }

    pub fn is_encoder_decoder(&self) -> bool {
        self.cross.is_some()
    }
}
