#![deny(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::sync::atomic::AtomicBool;

mod config;
mod engine;
mod error;
mod inputs_processor;
pub mod paged_attention;
pub mod pipeline;
mod sequence;
mod utils;

pub use config::{
    CacheConfig, EngineConfig, GraphConfig, PreemptionMode, SchedulerConfig, DEFAULT_BLOCK_SIZE,
};
pub use engine::{
    Engine, GroupOutput, NewRequest, Request, Response, SequenceResult, StepStats,
};
pub use error::SchedulerError;
pub use inputs_processor::{
    graph_batch_size, AttentionKind, InputsProcessor, ModelInput, Phase, SamplingEntry,
    SequenceData, SequenceGroupMetadata, PAD_BLOCK_ID, PAD_SLOT_ID,
};
pub use sequence::{SamplingParams, Sequence, SequenceGroup, SequenceState, StopReason};
pub use utils::debug::initialize_logging;

/// `true` if `PAGEDSERVE_DEBUG=1`
pub(crate) static DEBUG: AtomicBool = AtomicBool::new(false);
