/// The higher-level manager of the blocks allocated. Operations performed by the block engine do
/// not directly change memory.
mod block_engine;
/// Per-tier arena of blocks with reference counts and a FIFO free queue.
mod block_pool;
mod input_metadata;
mod scheduler;

pub use block_engine::{AllocStatus, AppendedSlot, BlockEngine, BlockEngineSnapshot, BlockTable};
pub use block_pool::BlockDevice;
pub use input_metadata::{AttentionMetadata, CrossAttentionMetadata};
pub use scheduler::{CacheOps, ScheduledGroup, Scheduler, SchedulerOutputs};
