mod shadow;

pub use shadow::ShadowExecutor;

use anyhow::Result;

use crate::{inputs_processor::ModelInput, paged_attention::CacheOps};

/// One token sampled for a sequence. A sequence that was asked for several samples gets one
/// output per sample, all naming it as parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceOutput {
    pub parent_seq_id: usize,
    pub output_token: u32,
}

/// Runs the model over a prepared batch.
///
/// `cache_ops` must be applied to the KV cache before the forward pass, in the order swap in,
/// swap out, then copy. A step may carry cache operations with an empty batch.
#[async_trait::async_trait]
pub trait ModelExecutor: Send {
    async fn execute(
        &mut self,
        input: &ModelInput,
        cache_ops: &CacheOps,
    ) -> Result<Vec<SequenceOutput>>;
}
