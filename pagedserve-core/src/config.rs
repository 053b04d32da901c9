use std::{fmt, fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

pub const DEFAULT_BLOCK_SIZE: usize = 16;
/// Largest decode batch a captured graph is recorded for.
pub const DEFAULT_MAX_GRAPH_BATCH_SIZE: usize = 256;
pub const DEFAULT_MAX_SEQ_LEN_TO_CAPTURE: usize = 8192;

/// Sizes of the two KV cache tiers, in blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Token slots per block.
    pub block_size: usize,
    pub num_gpu_blocks: usize,
    pub num_cpu_blocks: usize,
    /// Fraction of GPU blocks kept free when admitting new groups.
    pub watermark: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            num_gpu_blocks: 512,
            num_cpu_blocks: 512,
            watermark: 0.01,
        }
    }
}

impl CacheConfig {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn watermark_blocks(&self) -> usize {
        (self.watermark * self.num_gpu_blocks as f64) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreemptionMode {
    /// Recompute single-sequence groups, swap groups with several sequences.
    #[default]
    Auto,
    Swap,
    Recompute,
}

impl FromStr for PreemptionMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "swap" => Ok(Self::Swap),
            "recompute" => Ok(Self::Recompute),
            other => Err(format!(
                "Unexpected preemption mode `{other}`, expected `auto`, `swap` or `recompute`."
            )),
        }
    }
}

impl fmt::Display for PreemptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Swap => write!(f, "swap"),
            Self::Recompute => write!(f, "recompute"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of sequences running in one step.
    pub max_num_seqs: usize,
    /// Maximum number of tokens processed in one prefill step.
    pub max_num_batched_tokens: usize,
    pub max_model_len: usize,
    pub preemption_mode: PreemptionMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_num_batched_tokens: 4096,
            max_model_len: 4096,
            preemption_mode: PreemptionMode::Auto,
        }
    }
}

impl SchedulerConfig {
    /// Longest prompt that can ever be admitted.
    pub fn prompt_limit(&self) -> usize {
        self.max_model_len.min(self.max_num_batched_tokens)
    }
}

/// Controls whether decode steps are eligible for graph replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub enforce_eager: bool,
    pub max_graph_batch_size: usize,
    pub max_seq_len_to_capture: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enforce_eager: false,
            max_graph_batch_size: DEFAULT_MAX_GRAPH_BATCH_SIZE,
            max_seq_len_to_capture: DEFAULT_MAX_SEQ_LEN_TO_CAPTURE,
        }
    }
}

/// Everything an [`Engine`](crate::Engine) needs, as read from a TOML file:
///
/// ```toml
/// [cache]
/// block_size = 16
/// num_gpu_blocks = 1024
///
/// [scheduler]
/// max_num_seqs = 64
/// preemption_mode = "swap"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub graph: GraphConfig,
}

impl EngineConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.block_size == 0 {
            anyhow::bail!("`block_size` must be at least 1.");
        }
        if self.cache.num_gpu_blocks == 0 {
            anyhow::bail!("`num_gpu_blocks` must be at least 1.");
        }
        if !(0.0..1.0).contains(&self.cache.watermark) {
            anyhow::bail!(
                "`watermark` must be in [0, 1), got {}.",
                self.cache.watermark
            );
        }
        if self.scheduler.max_num_seqs == 0 {
            anyhow::bail!("`max_num_seqs` must be at least 1.");
        }
        // A sequence preempted at `max_model_len - 1` tokens must fit in one prefill step.
        if self.scheduler.max_num_batched_tokens < self.scheduler.max_model_len {
            anyhow::bail!(
                "`max_num_batched_tokens` ({}) is smaller than `max_model_len` ({}).",
                self.scheduler.max_num_batched_tokens,
                self.scheduler.max_model_len
            );
        }
        Ok(())
    }
}
