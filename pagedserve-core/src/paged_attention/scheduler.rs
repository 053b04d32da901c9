//! The Scheduler uses a BlockEngine to schedule and automatically batch sequence groups. The
//! primary method `schedule` returns the groups to run this step, as well as the operations to be
//! executed on the cache before the model runs.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::Ordering,
};

use tracing::{debug, warn};

use super::block_engine::{AllocStatus, BlockEngine};
use crate::{
    config::{CacheConfig, PreemptionMode, SchedulerConfig},
    error::SchedulerError,
    inputs_processor::{AttentionKind, Phase, SequenceData, SequenceGroupMetadata},
    pipeline::SequenceOutput,
    sequence::{Sequence, SequenceGroup, SequenceState, StopReason},
    DEBUG,
};

type SrcBlockFrom = usize;
type DstBlocksTo = Vec<usize>;

/// Block movements the executor applies before running the model: swap in, swap out, then copy.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheOps {
    /// CPU block to GPU block.
    pub blocks_to_swap_in: HashMap<usize, usize>,
    /// GPU block to CPU block.
    pub blocks_to_swap_out: HashMap<usize, usize>,
    pub blocks_to_copy: HashMap<SrcBlockFrom, DstBlocksTo>,
}

impl CacheOps {
    pub fn is_empty(&self) -> bool {
        self.blocks_to_swap_in.is_empty()
            && self.blocks_to_swap_out.is_empty()
            && self.blocks_to_copy.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledGroup {
    pub request_id: usize,
    pub phase: Phase,
}

#[derive(Debug, Default)]
pub struct SchedulerOutputs {
    /// Prefill groups first, then decode groups.
    pub scheduled: Vec<ScheduledGroup>,
    pub num_batched_tokens: usize,
    pub cache_ops: CacheOps,
    /// Groups refused at admission. They will never run.
    pub ignored: Vec<SequenceGroup>,
    /// Preempted groups that can no longer be brought back.
    pub aborted: Vec<SequenceGroup>,
    pub num_preempted: usize,
    /// Groups swapped out this step. Their data only reaches the CPU tier once the executor
    /// applies `cache_ops`.
    pub swapped_out: Vec<usize>,
}

impl SchedulerOutputs {
    /// Nothing for the executor to do this step.
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty() && self.cache_ops.is_empty()
    }

    pub fn num_prefill_groups(&self) -> usize {
        self.scheduled
            .iter()
            .filter(|group| group.phase == Phase::Prefill)
            .count()
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    block_engine: BlockEngine,
    waiting: VecDeque<SequenceGroup>,
    running: VecDeque<SequenceGroup>,
    swapped: VecDeque<SequenceGroup>,
    next_seq_id: usize,
    num_swap_preemptions: usize,
    num_recompute_preemptions: usize,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, cache_config: &CacheConfig) -> Self {
        Self {
            config,
            block_engine: BlockEngine::new(cache_config),
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            swapped: VecDeque::new(),
            next_seq_id: 0,
            num_swap_preemptions: 0,
            num_recompute_preemptions: 0,
        }
    }

    pub fn block_engine(&self) -> &BlockEngine {
        &self.block_engine
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn num_swapped(&self) -> usize {
        self.swapped.len()
    }

    pub fn has_unfinished(&self) -> bool {
        !(self.waiting.is_empty() && self.running.is_empty() && self.swapped.is_empty())
    }

    /// Cumulative (swap, recompute) preemption counts.
    pub fn preemption_stats(&self) -> (usize, usize) {
        (self.num_swap_preemptions, self.num_recompute_preemptions)
    }

    /// A sequence id not used by any group seen so far.
    pub fn reserve_seq_id(&mut self) -> usize {
        let id = self.next_seq_id;
        self.next_seq_id += 1;
        id
    }

    pub fn group(&self, request_id: usize) -> Option<&SequenceGroup> {
        self.waiting
            .iter()
            .chain(&self.running)
            .chain(&self.swapped)
            .find(|group| group.request_id() == request_id)
    }

    /// Queue a new request. Requests that can never run are refused here.
    pub fn add_seq_group(&mut self, mut group: SequenceGroup) -> Result<(), SchedulerError> {
        let request_id = group.request_id();
        if group.seqs().any(Sequence::is_empty) {
            return Err(SchedulerError::EmptyPrompt(request_id));
        }
        if self.group(request_id).is_some() {
            return Err(SchedulerError::DuplicateRequest(request_id));
        }
        let len = group.seqs().map(Sequence::len).max().unwrap_or_default();
        let limit = self.config.prompt_limit();
        if len > limit {
            return Err(SchedulerError::PromptTooLong {
                request_id,
                len,
                limit,
            });
        }
        if self.block_engine.can_allocate(&group) == AllocStatus::Impossible {
            return Err(SchedulerError::ExceedsCacheCapacity {
                request_id,
                required: self.block_engine.num_group_blocks(&group),
                capacity: self.block_engine.num_gpu_blocks(),
            });
        }

        if let Some(max_id) = group.seqs().map(Sequence::id).max() {
            self.next_seq_id = self.next_seq_id.max(max_id + 1);
        }
        group.set_state(SequenceState::Waiting);
        debug!("Request {request_id} queued with a prompt of {len} tokens");
        self.waiting.push_back(group);
        Ok(())
    }

    /// Remove a group from whichever queue holds it and release its blocks.
    pub fn abort_seq_group(&mut self, request_id: usize) -> Option<SequenceGroup> {
        let mut group = Self::remove_from(&mut self.waiting, request_id)
            .or_else(|| Self::remove_from(&mut self.running, request_id))
            .or_else(|| Self::remove_from(&mut self.swapped, request_id))?;
        self.block_engine.free_group(&group);
        group.finish(StopReason::Canceled);
        Some(group)
    }

    fn remove_from(queue: &mut VecDeque<SequenceGroup>, request_id: usize) -> Option<SequenceGroup> {
        let idx = queue
            .iter()
            .position(|group| group.request_id() == request_id)?;
        queue.remove(idx)
    }

    pub fn schedule(&mut self) -> SchedulerOutputs {
        let mut outputs = SchedulerOutputs::default();

        // Swapped groups always resume before anything new is admitted.
        if self.swapped.is_empty() {
            self.schedule_prefills(&mut outputs);
            if !outputs.scheduled.is_empty() {
                self.log_step(&outputs);
                return outputs;
            }
        }

        self.schedule_running(&mut outputs);
        if outputs.num_preempted == 0 {
            self.schedule_swapped(&mut outputs);
        }
        outputs.num_batched_tokens = outputs
            .scheduled
            .iter()
            .filter_map(|scheduled| self.group(scheduled.request_id))
            .map(SequenceGroup::num_unfinished_seqs)
            .sum();
        self.log_step(&outputs);
        outputs
    }

    fn num_running_seqs(&self) -> usize {
        self.running
            .iter()
            .map(SequenceGroup::num_unfinished_seqs)
            .sum()
    }

    fn schedule_prefills(&mut self, outputs: &mut SchedulerOutputs) {
        let prompt_limit = self.config.prompt_limit();
        let mut num_batched_tokens = 0;
        let mut num_curr_seqs = self.num_running_seqs();

        while let Some(group) = self.waiting.front() {
            let request_id = group.request_id();
            let num_tokens = group.num_prefill_tokens();
            // Groups back from a recompute preemption were accepted already and must not be
            // refused now.
            let resumed = group.prefilled_once();
            let longest = group.unfinished_seqs().map(Sequence::len).max().unwrap_or(0);
            if !resumed && longest > prompt_limit {
                warn!(
                    "Request {request_id} with a sequence of {longest} tokens exceeds the limit of {prompt_limit} tokens and will be ignored."
                );
                self.ignore_front(outputs);
                continue;
            }
            let status = if resumed {
                self.block_engine.can_reallocate(group)
            } else {
                self.block_engine.can_allocate(group)
            };
            match status {
                AllocStatus::Later => break,
                AllocStatus::Impossible if resumed => {
                    warn!(
                        "Request {request_id} no longer fits in the KV cache after preemption and is aborted."
                    );
                    if let Some(mut group) = self.waiting.pop_front() {
                        group.finish(StopReason::Canceled);
                        outputs.aborted.push(group);
                    }
                    continue;
                }
                AllocStatus::Impossible => {
                    warn!(
                        "Request {request_id} with {num_tokens} tokens is too long and exceeds KV cache size. To fix, increase `num_gpu_blocks`."
                    );
                    self.ignore_front(outputs);
                    continue;
                }
                AllocStatus::Ok => {}
            }
            // A group larger than the whole token budget still runs, alone.
            if num_batched_tokens > 0
                && num_batched_tokens + num_tokens > self.config.max_num_batched_tokens
            {
                break;
            }
            let new_seqs = group.max_num_running_seqs();
            if num_curr_seqs + new_seqs > self.config.max_num_seqs {
                break;
            }

            let Some(mut group) = self.waiting.pop_front() else {
                break;
            };
            self.block_engine.allocate(&group);
            group.set_state(SequenceState::Running);
            num_batched_tokens += num_tokens;
            num_curr_seqs += new_seqs;
            outputs.scheduled.push(ScheduledGroup {
                request_id,
                phase: Phase::Prefill,
            });
            self.running.push_back(group);
        }
        outputs.num_batched_tokens = num_batched_tokens;
    }

    fn ignore_front(&mut self, outputs: &mut SchedulerOutputs) {
        if let Some(mut group) = self.waiting.pop_front() {
            group.finish(StopReason::Ignored);
            outputs.ignored.push(group);
        }
    }

    /// Reserve token slots for the running groups, preempting the lowest priority first.
    fn schedule_running(&mut self, outputs: &mut SchedulerOutputs) {
        self.sort_running_by_priority_fcfs();

        let mut running = VecDeque::with_capacity(self.running.len());
        'groups: while let Some(group) = self.running.pop_front() {
            while !self.block_engine.can_append_slots(&group) {
                match self.running.pop_back() {
                    Some(victim) => self.preempt(victim, outputs),
                    None => {
                        // Nothing left to preempt, preempt ourselves.
                        self.preempt(group, outputs);
                        continue 'groups;
                    }
                }
            }
            self.append_slots(&group, &mut outputs.cache_ops);
            outputs.scheduled.push(ScheduledGroup {
                request_id: group.request_id(),
                phase: Phase::Decode,
            });
            running.push_back(group);
        }
        self.running = running;
    }

    fn schedule_swapped(&mut self, outputs: &mut SchedulerOutputs) {
        self.swapped
            .make_contiguous()
            .sort_by_key(|group| (group.priority(), group.arrival_time()));
        let mut num_curr_seqs = self.num_running_seqs();

        while let Some(group) = self.swapped.front() {
            let request_id = group.request_id();
            match self.block_engine.can_swap_in(group) {
                AllocStatus::Later => break,
                AllocStatus::Impossible => {
                    warn!("Request {request_id} can no longer be swapped in and is aborted.");
                    if let Some(mut group) = self.swapped.pop_front() {
                        self.block_engine.free_group(&group);
                        group.finish(StopReason::Canceled);
                        outputs.aborted.push(group);
                    }
                    continue;
                }
                AllocStatus::Ok => {}
            }
            let new_seqs = group.num_unfinished_seqs();
            if num_curr_seqs + new_seqs > self.config.max_num_seqs {
                break;
            }

            let Some(mut group) = self.swapped.pop_front() else {
                break;
            };
            let mapping = self.block_engine.swap_in(&group);
            outputs.cache_ops.blocks_to_swap_in.extend(mapping);
            group.set_state(SequenceState::Running);
            self.append_slots(&group, &mut outputs.cache_ops);
            num_curr_seqs += new_seqs;
            outputs.scheduled.push(ScheduledGroup {
                request_id,
                phase: Phase::Decode,
            });
            self.running.push_back(group);
        }
    }

    fn append_slots(&mut self, group: &SequenceGroup, cache_ops: &mut CacheOps) {
        for seq in group.unfinished_seqs() {
            let appended = self.block_engine.append_slot(seq);
            if let Some((src_block, dst_block)) = appended.copy_on_write {
                cache_ops
                    .blocks_to_copy
                    .entry(src_block)
                    .or_default()
                    .push(dst_block);
            }
        }
    }

    fn preempt(&mut self, group: SequenceGroup, outputs: &mut SchedulerOutputs) {
        let mut mode = match self.config.preemption_mode {
            PreemptionMode::Auto if group.num_unfinished_seqs() == 1 => PreemptionMode::Recompute,
            PreemptionMode::Auto => PreemptionMode::Swap,
            mode => mode,
        };
        // Recomputed forks no longer share blocks, so the group may outgrow the whole pool.
        if mode == PreemptionMode::Recompute
            && self.block_engine.num_group_blocks(&group) > self.block_engine.num_gpu_blocks()
            && self.block_engine.can_swap_out(&group)
        {
            debug!(
                "Request {} cannot be recomputed within the GPU cache, swapping instead.",
                group.request_id()
            );
            mode = PreemptionMode::Swap;
        }
        outputs.num_preempted += 1;
        if mode == PreemptionMode::Swap && self.block_engine.can_swap_out(&group) {
            outputs.swapped_out.push(group.request_id());
            self.preempt_by_swap(group, &mut outputs.cache_ops);
        } else {
            if mode == PreemptionMode::Swap {
                warn!(
                    "Request {} does not fit in the CPU cache, preempting by recompute instead.",
                    group.request_id()
                );
            }
            self.preempt_by_recompute(group);
        }
    }

    /// Drop the cache of the group; it is rebuilt by a fresh prefill.
    fn preempt_by_recompute(&mut self, mut group: SequenceGroup) {
        debug!("Preempting request {} by recompute", group.request_id());
        self.block_engine.free_group(&group);
        for seq in group.unfinished_seqs_mut() {
            seq.reset_computed();
            seq.set_state(SequenceState::Waiting);
        }
        self.num_recompute_preemptions += 1;
        self.waiting.push_front(group);
    }

    /// Swap victims of a step whose cache operations never ran hold nothing on the CPU tier.
    /// Recompute them instead.
    pub fn recompute_swapped_out(&mut self, request_ids: &[usize]) {
        for &request_id in request_ids.iter().rev() {
            if let Some(group) = Self::remove_from(&mut self.swapped, request_id) {
                self.num_swap_preemptions -= 1;
                self.preempt_by_recompute(group);
            }
        }
    }

    fn preempt_by_swap(&mut self, mut group: SequenceGroup, cache_ops: &mut CacheOps) {
        debug!("Preempting request {} by swap", group.request_id());
        let mapping = self.block_engine.swap_out(&group);
        cache_ops.blocks_to_swap_out.extend(mapping);
        group.set_state(SequenceState::Swapped);
        self.num_swap_preemptions += 1;
        self.swapped.push_back(group);
    }

    /// Most important first: lower priority value, then earlier arrival.
    fn sort_running_by_priority_fcfs(&mut self) {
        self.running
            .make_contiguous()
            .sort_by_key(|group| (group.priority(), group.arrival_time()));
    }

    /// Borrow the scheduled groups in the layout the batch metadata builder consumes.
    pub fn group_metadata(&self, outputs: &SchedulerOutputs) -> Vec<SequenceGroupMetadata<'_>> {
        let running: HashMap<usize, &SequenceGroup> = self
            .running
            .iter()
            .map(|group| (group.request_id(), group))
            .collect();
        outputs
            .scheduled
            .iter()
            .filter_map(|scheduled| {
                let group = *running.get(&scheduled.request_id)?;
                Some(self.metadata_for(group, scheduled.phase))
            })
            .collect()
    }

    fn metadata_for<'a>(&'a self, group: &'a SequenceGroup, phase: Phase) -> SequenceGroupMetadata<'a> {
        let seqs = group
            .unfinished_seqs()
            .map(|seq| SequenceData {
                seq_id: seq.id(),
                tokens: seq.tokens(),
                num_computed_tokens: seq.num_computed_tokens(),
                block_table: self
                    .block_engine
                    .block_table(seq.id())
                    .map_or(&[][..], |table| table.block_ids()),
            })
            .collect();
        let attention = match group.encoder_seq() {
            Some(encoder) => AttentionKind::EncoderDecoder {
                encoder_tokens: encoder.tokens(),
                cross_block_table: self
                    .block_engine
                    .cross_block_table(group.request_id())
                    .map_or(&[][..], |table| table.block_ids()),
            },
            None => AttentionKind::DecoderOnly,
        };
        let num_samples = if phase == Phase::Prefill && !group.prefilled_once() {
            group.sampling().n.max(1)
        } else {
            1
        };
        SequenceGroupMetadata {
            request_id: group.request_id(),
            phase,
            seqs,
            attention,
            num_samples,
        }
    }

    /// Apply the tokens sampled for the scheduled groups. A sequence that received several tokens
    /// is forked once per extra token. Returns the groups that finished.
    pub fn process_outputs(
        &mut self,
        scheduled: &[ScheduledGroup],
        samples: &[SequenceOutput],
    ) -> Vec<SequenceGroup> {
        let mut by_parent: HashMap<usize, Vec<u32>> = HashMap::new();
        for sample in samples {
            by_parent
                .entry(sample.parent_seq_id)
                .or_default()
                .push(sample.output_token);
        }

        let max_model_len = self.config.max_model_len;
        for scheduled in scheduled {
            let Some(group) = self
                .running
                .iter_mut()
                .find(|group| group.request_id() == scheduled.request_id)
            else {
                continue;
            };
            let sampling = group.sampling().clone();
            let parent_ids: Vec<usize> = group.unfinished_seqs().map(Sequence::id).collect();
            for parent_id in parent_ids {
                let Some(tokens) = by_parent.remove(&parent_id) else {
                    continue;
                };
                let Some(parent) = group.seq_mut(parent_id) else {
                    continue;
                };
                let query_len = parent.query_len();
                parent.mark_computed(query_len);

                // Children share the parent's blocks, so fork before the parent grows.
                let mut children = Vec::with_capacity(tokens.len() - 1);
                for &tok in &tokens[1..] {
                    let mut child = parent.fork(self.next_seq_id);
                    self.next_seq_id += 1;
                    self.block_engine.fork(parent, &child);
                    child.append_token(tok);
                    children.push((child, tok));
                }
                parent.append_token(tokens[0]);
                if let Some(reason) = parent.is_done(tokens[0], &sampling, max_model_len) {
                    parent.set_state(SequenceState::Done(reason));
                    self.block_engine.free(parent_id);
                }

                for (mut child, tok) in children {
                    if let Some(reason) = child.is_done(tok, &sampling, max_model_len) {
                        child.set_state(SequenceState::Done(reason));
                        self.block_engine.free(child.id());
                    }
                    group.add_seq(child);
                }
            }
            if scheduled.phase == Phase::Prefill {
                group.mark_prefilled();
            }
        }
        self.free_finished_groups()
    }

    fn free_finished_groups(&mut self) -> Vec<SequenceGroup> {
        let mut finished = Vec::new();
        let mut running = VecDeque::with_capacity(self.running.len());
        for group in self.running.drain(..) {
            if group.is_finished() {
                finished.push(group);
            } else {
                running.push_back(group);
            }
        }
        self.running = running;
        for group in &finished {
            self.block_engine.free_cross(group.request_id());
        }
        finished
    }

    fn log_step(&self, outputs: &SchedulerOutputs) {
        if outputs.num_preempted > 0 {
            debug!(
                "Preempted {} groups, {} running, {} waiting, {} swapped",
                outputs.num_preempted,
                self.running.len(),
                self.waiting.len(),
                self.swapped.len()
            );
        }
        if DEBUG.load(Ordering::Relaxed) {
            match serde_json::to_string(&self.block_engine.snapshot()) {
                Ok(snapshot) => debug!("Block tables: {snapshot}"),
                Err(e) => warn!("Could not serialize block tables: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{paged_attention::BlockDevice, sequence::SamplingParams};

    fn scheduler_with(
        config: SchedulerConfig,
        block_size: usize,
        num_gpu_blocks: usize,
        num_cpu_blocks: usize,
    ) -> Scheduler {
        Scheduler::new(
            config,
            &CacheConfig {
                block_size,
                num_gpu_blocks,
                num_cpu_blocks,
                watermark: 0.0,
            },
        )
    }

    fn scheduler(
        block_size: usize,
        num_gpu_blocks: usize,
        num_cpu_blocks: usize,
        preemption_mode: PreemptionMode,
    ) -> Scheduler {
        let config = SchedulerConfig {
            preemption_mode,
            ..Default::default()
        };
        scheduler_with(config, block_size, num_gpu_blocks, num_cpu_blocks)
    }

    fn group_n(request_id: usize, len: usize, max_tokens: usize, n: usize) -> SequenceGroup {
        let prompt = (0..len as u32).collect();
        let sampling = SamplingParams {
            n,
            ..SamplingParams::deterministic(max_tokens)
        };
        SequenceGroup::new(
            request_id,
            request_id * 10,
            prompt,
            sampling,
            request_id as u128,
        )
    }

    fn group(request_id: usize, len: usize, max_tokens: usize) -> SequenceGroup {
        group_n(request_id, len, max_tokens, 1)
    }

    // Sample `100 + i` for the i-th sample of every scheduled sequence.
    fn samples(scheduler: &Scheduler, outputs: &SchedulerOutputs) -> Vec<SequenceOutput> {
        scheduler
            .group_metadata(outputs)
            .iter()
            .flat_map(|group| {
                group.seqs.iter().flat_map(move |seq| {
                    (0..group.num_samples).map(move |i| SequenceOutput {
                        parent_seq_id: seq.seq_id,
                        output_token: 100 + i as u32,
                    })
                })
            })
            .collect()
    }

    fn step(scheduler: &mut Scheduler) -> (SchedulerOutputs, Vec<SequenceGroup>) {
        let outputs = scheduler.schedule();
        let samples = samples(scheduler, &outputs);
        let finished = scheduler.process_outputs(&outputs.scheduled, &samples);
        (outputs, finished)
    }

    fn scheduled(outputs: &SchedulerOutputs) -> Vec<(usize, Phase)> {
        outputs
            .scheduled
            .iter()
            .map(|s| (s.request_id, s.phase))
            .collect()
    }

    #[test]
    fn test_fcfs_admission_is_prefill_only() {
        let mut s = scheduler(4, 64, 0, PreemptionMode::Auto);
        for id in 0..3 {
            s.add_seq_group(group(id, 4, 8)).unwrap();
        }
        let (out, _) = step(&mut s);
        assert_eq!(
            scheduled(&out),
            vec![(0, Phase::Prefill), (1, Phase::Prefill), (2, Phase::Prefill)]
        );
        assert_eq!(out.num_batched_tokens, 12);
        assert_eq!(out.num_prefill_groups(), 3);

        // A new arrival is prefilled alone, running groups wait a step.
        s.add_seq_group(group(3, 4, 8)).unwrap();
        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(3, Phase::Prefill)]);

        let (out, _) = step(&mut s);
        assert_eq!(out.scheduled.len(), 4);
        assert!(out.scheduled.iter().all(|g| g.phase == Phase::Decode));
        assert_eq!(out.num_batched_tokens, 4);
        assert!(out.cache_ops.is_empty());
    }

    #[test]
    fn test_submit_rejections() {
        let config = SchedulerConfig {
            max_num_batched_tokens: 16,
            ..Default::default()
        };
        let mut s = scheduler_with(config, 4, 2, 0);
        assert!(matches!(
            s.add_seq_group(group(0, 0, 4)),
            Err(SchedulerError::EmptyPrompt(0))
        ));
        assert!(matches!(
            s.add_seq_group(group(1, 17, 4)),
            Err(SchedulerError::PromptTooLong {
                len: 17,
                limit: 16,
                ..
            })
        ));
        assert!(matches!(
            s.add_seq_group(group(2, 9, 4)),
            Err(SchedulerError::ExceedsCacheCapacity {
                required: 3,
                capacity: 2,
                ..
            })
        ));
        s.add_seq_group(group(3, 8, 4)).unwrap();
        assert!(matches!(
            s.add_seq_group(group(3, 4, 4)),
            Err(SchedulerError::DuplicateRequest(3))
        ));
        assert_eq!(s.num_waiting(), 1);
    }

    #[test]
    fn test_admission_ignores_groups_that_cannot_run() {
        let config = SchedulerConfig {
            max_num_batched_tokens: 8,
            ..Default::default()
        };
        let mut s = scheduler_with(config, 4, 1, 0);
        // Queued directly, bypassing the checks at submission.
        s.waiting.push_back(group(0, 9, 4));
        s.waiting.push_back(group(1, 8, 4));
        s.waiting.push_back(group(2, 3, 4));
        let out = s.schedule();
        assert_eq!(scheduled(&out), vec![(2, Phase::Prefill)]);
        let ignored: Vec<usize> = out.ignored.iter().map(SequenceGroup::request_id).collect();
        assert_eq!(ignored, vec![0, 1]);
        assert!(out.ignored.iter().all(|g| g
            .seqs()
            .all(|seq| seq.stop_reason() == Some(StopReason::Ignored))));
    }

    #[test]
    fn test_batched_token_budget() {
        let config = SchedulerConfig {
            max_num_batched_tokens: 10,
            ..Default::default()
        };
        let mut s = scheduler_with(config.clone(), 4, 64, 0);
        s.add_seq_group(group(0, 6, 4)).unwrap();
        s.add_seq_group(group(1, 6, 4)).unwrap();
        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(0, Phase::Prefill)]);
        assert_eq!(out.num_batched_tokens, 6);
        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(1, Phase::Prefill)]);

        // A group larger than the budget still runs, alone.
        let mut s = scheduler_with(config, 4, 64, 0);
        let mut big = group(2, 6, 4);
        let child = big.seq(20).unwrap().fork(21);
        big.add_seq(child);
        s.add_seq_group(big).unwrap();
        s.add_seq_group(group(3, 2, 4)).unwrap();
        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(2, Phase::Prefill)]);
        assert_eq!(out.num_batched_tokens, 12);
    }

    #[test]
    fn test_max_num_seqs_counts_future_samples() {
        let config = SchedulerConfig {
            max_num_seqs: 4,
            ..Default::default()
        };
        let mut s = scheduler_with(config, 4, 64, 0);
        s.add_seq_group(group_n(0, 4, 4, 3)).unwrap();
        s.add_seq_group(group(1, 4, 4)).unwrap();
        s.add_seq_group(group(2, 4, 4)).unwrap();
        let (out, _) = step(&mut s);
        assert_eq!(
            scheduled(&out),
            vec![(0, Phase::Prefill), (1, Phase::Prefill)]
        );
        assert_eq!(s.num_waiting(), 1);
    }

    #[test]
    fn test_recompute_preemption() {
        let mut s = scheduler(4, 4, 0, PreemptionMode::Recompute);
        s.add_seq_group(group(0, 8, 4)).unwrap();
        s.add_seq_group(group(1, 8, 8)).unwrap();
        let (out, _) = step(&mut s);
        assert_eq!(out.scheduled.len(), 2);
        assert_eq!(s.block_engine().num_free_gpu_blocks(), 0);

        // Request 0 needs a third block; the most recent group gives its blocks up.
        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(0, Phase::Decode)]);
        assert_eq!(out.num_preempted, 1);
        assert!(out.cache_ops.is_empty());
        assert_eq!(s.preemption_stats(), (0, 1));
        assert_eq!(s.num_waiting(), 1);
        let preempted = s.group(1).unwrap().seq(10).unwrap();
        assert_eq!(preempted.state(), SequenceState::Waiting);
        assert_eq!(preempted.num_computed_tokens(), 0);
        assert_eq!(preempted.len(), 9);
        assert!(s.block_engine().block_table(10).is_none());

        // It cannot come back while request 0 holds three blocks.
        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(0, Phase::Decode)]);
        let (out, finished) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(0, Phase::Decode)]);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].request_id(), 0);

        // Recomputed as a prefill over prompt and generated tokens.
        let out = s.schedule();
        assert_eq!(scheduled(&out), vec![(1, Phase::Prefill)]);
        let metadata = s.group_metadata(&out);
        assert_eq!(metadata[0].seqs[0].tokens.len(), 9);
        assert_eq!(metadata[0].seqs[0].num_computed_tokens, 0);
        assert_eq!(metadata[0].num_samples, 1);
    }

    #[test]
    fn test_swap_preemption_and_resume() {
        let mut s = scheduler(4, 4, 8, PreemptionMode::Swap);
        s.add_seq_group(group(0, 8, 4)).unwrap();
        s.add_seq_group(group(1, 8, 8)).unwrap();
        step(&mut s);

        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(0, Phase::Decode)]);
        assert_eq!(
            out.cache_ops.blocks_to_swap_out,
            HashMap::from([(2, 0), (3, 1)])
        );
        assert_eq!(s.num_swapped(), 1);
        assert_eq!(s.preemption_stats(), (1, 0));
        let table = s.block_engine().block_table(10).unwrap();
        assert_eq!(table.device(), BlockDevice::Cpu);
        assert_eq!(table.block_ids(), &[0, 1]);

        // No admissions while a group is swapped out.
        s.add_seq_group(group(2, 4, 1)).unwrap();
        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(0, Phase::Decode)]);
        let (_, finished) = step(&mut s);
        assert_eq!(finished.len(), 1);

        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(1, Phase::Decode)]);
        assert_eq!(out.cache_ops.blocks_to_swap_in, HashMap::from([(0, 3), (1, 0)]));
        assert!(out.cache_ops.blocks_to_swap_out.is_empty());
        let table = s.block_engine().block_table(10).unwrap();
        assert_eq!(table.device(), BlockDevice::Gpu);
        assert_eq!(table.block_ids(), &[3, 0, 1]);
        assert_eq!(s.block_engine().num_free_cpu_blocks(), 8);

        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(2, Phase::Prefill)]);
    }

    #[test]
    fn test_swap_without_cpu_room_recomputes() {
        let mut s = scheduler(4, 4, 0, PreemptionMode::Swap);
        s.add_seq_group(group(0, 8, 4)).unwrap();
        s.add_seq_group(group(1, 8, 8)).unwrap();
        step(&mut s);
        let (out, _) = step(&mut s);
        assert!(out.cache_ops.blocks_to_swap_out.is_empty());
        assert_eq!(s.preemption_stats(), (0, 1));
        assert_eq!(s.num_swapped(), 0);
        assert_eq!(s.num_waiting(), 1);
    }

    fn run_to_completion(s: &mut Scheduler) -> Vec<SequenceGroup> {
        let mut finished = Vec::new();
        for _ in 0..100 {
            if !s.has_unfinished() {
                return finished;
            }
            let (out, done) = step(s);
            assert!(out.ignored.is_empty(), "a queued request was ignored");
            assert!(out.aborted.is_empty(), "a queued request was aborted");
            finished.extend(done);
        }
        panic!("scheduler made no progress");
    }

    #[test]
    fn test_recomputed_group_is_not_refused_on_return() {
        // Every limit is below what the low priority request reaches before it is preempted.
        let config = SchedulerConfig {
            max_num_batched_tokens: 9,
            max_model_len: 64,
            preemption_mode: PreemptionMode::Recompute,
            ..Default::default()
        };
        let mut s = Scheduler::new(
            config,
            &CacheConfig {
                block_size: 4,
                num_gpu_blocks: 4,
                num_cpu_blocks: 0,
                watermark: 0.25,
            },
        );
        s.add_seq_group(group(0, 7, 6).with_priority(1)).unwrap();
        s.add_seq_group(group(1, 1, 6)).unwrap();
        let (out, _) = step(&mut s);
        assert_eq!(out.scheduled.len(), 2);

        for _ in 0..3 {
            step(&mut s);
        }
        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(1, Phase::Decode)]);
        assert_eq!(s.preemption_stats(), (0, 1));
        assert_eq!(s.group(0).unwrap().seq(0).unwrap().len(), 11);

        let mut finished = run_to_completion(&mut s);
        finished.sort_by_key(SequenceGroup::request_id);
        assert_eq!(finished.len(), 2);
        let resumed = finished[0].seq(0).unwrap();
        assert_eq!(resumed.stop_reason(), Some(StopReason::Length(6)));
        assert_eq!(resumed.generated_tokens().len(), 6);
        assert_eq!(s.block_engine().num_free_gpu_blocks(), 4);
    }

    #[test]
    fn test_recompute_swaps_forks_that_cannot_be_rebuilt() {
        let mut s = scheduler(4, 4, 8, PreemptionMode::Recompute);
        s.add_seq_group(group(0, 1, 2)).unwrap();
        s.add_seq_group(group_n(1, 8, 3, 2).with_priority(1)).unwrap();
        step(&mut s);
        assert_eq!(s.block_engine().num_free_gpu_blocks(), 1);

        // Both forks need a third block. Rebuilt separately they would need six of four.
        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(0, Phase::Decode)]);
        assert_eq!(out.cache_ops.blocks_to_swap_out.len(), 2);
        assert_eq!(out.swapped_out, vec![1]);
        assert_eq!(s.preemption_stats(), (1, 0));

        let finished = run_to_completion(&mut s);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].request_id(), 1);
        assert!(finished[0]
            .seqs()
            .all(|seq| seq.stop_reason() == Some(StopReason::Length(3))));
    }

    #[test]
    fn test_unapplied_swap_out_becomes_recompute() {
        let mut s = scheduler(4, 4, 8, PreemptionMode::Swap);
        s.add_seq_group(group(0, 8, 4)).unwrap();
        s.add_seq_group(group(1, 8, 8)).unwrap();
        step(&mut s);

        // The step that swaps request 1 out never runs.
        let out = s.schedule();
        assert_eq!(out.swapped_out, vec![1]);
        s.recompute_swapped_out(&out.swapped_out);
        assert_eq!(s.num_swapped(), 0);
        assert_eq!(s.num_waiting(), 1);
        assert_eq!(s.preemption_stats(), (0, 1));
        assert_eq!(s.block_engine().num_free_cpu_blocks(), 8);
        let seq = s.group(1).unwrap().seq(10).unwrap();
        assert_eq!(seq.num_computed_tokens(), 0);
        assert_eq!(seq.state(), SequenceState::Waiting);
    }

    #[test]
    fn test_auto_mode_swaps_multi_sequence_groups() {
        let mut s = scheduler(4, 4, 8, PreemptionMode::Auto);
        s.add_seq_group(group(0, 4, 8)).unwrap();
        s.add_seq_group(group_n(1, 4, 8, 2)).unwrap();
        step(&mut s);
        assert_eq!(s.group(1).unwrap().num_seqs(), 2);

        // Both samples of request 1 need a new block, only one is left after request 0.
        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(0, Phase::Decode)]);
        assert_eq!(out.cache_ops.blocks_to_swap_out, HashMap::from([(1, 0)]));
        assert_eq!(s.preemption_stats(), (1, 0));
        assert_eq!(s.block_engine().block_ref_cnt(BlockDevice::Cpu, 0), 2);
    }

    #[test]
    fn test_priority_selects_victim() {
        let mut s = scheduler(4, 4, 0, PreemptionMode::Recompute);
        s.add_seq_group(group(0, 8, 8).with_priority(1)).unwrap();
        s.add_seq_group(group(1, 8, 8)).unwrap();
        step(&mut s);
        let (out, _) = step(&mut s);
        assert_eq!(scheduled(&out), vec![(1, Phase::Decode)]);
        assert!(s
            .group(0)
            .unwrap()
            .seqs()
            .all(|seq| seq.state() == SequenceState::Waiting));
    }

    #[test]
    fn test_abort_frees_blocks() {
        let mut s = scheduler(4, 8, 8, PreemptionMode::Auto);
        s.add_seq_group(group(0, 6, 4)).unwrap();
        step(&mut s);
        s.add_seq_group(group(1, 6, 4)).unwrap();
        assert_eq!(s.block_engine().num_free_gpu_blocks(), 6);

        let aborted = s.abort_seq_group(0).unwrap();
        assert!(aborted.is_finished());
        assert_eq!(
            aborted.seq(0).unwrap().stop_reason(),
            Some(StopReason::Canceled)
        );
        assert_eq!(s.block_engine().num_free_gpu_blocks(), 8);
        assert!(s.abort_seq_group(1).is_some());
        assert!(s.abort_seq_group(1).is_none());
        assert!(!s.has_unfinished());
    }

    #[test]
    fn test_parallel_sampling_forks_and_copies() {
        let mut s = scheduler(8, 16, 0, PreemptionMode::Auto);
        s.add_seq_group(group_n(0, 5, 8, 3)).unwrap();
        let out = s.schedule();
        assert_eq!(s.group_metadata(&out)[0].num_samples, 3);
        let samples = samples(&s, &out);
        assert_eq!(samples.len(), 3);
        s.process_outputs(&out.scheduled, &samples);

        let group = s.group(0).unwrap();
        assert_eq!(group.num_seqs(), 3);
        let generated: Vec<&[u32]> = group.seqs().map(Sequence::generated_tokens).collect();
        assert_eq!(generated, vec![&[100][..], &[101][..], &[102][..]]);
        assert_eq!(s.block_engine().block_ref_cnt(BlockDevice::Gpu, 0), 3);

        // Two writers get a private copy of the shared block, the last one keeps it.
        let (out, _) = step(&mut s);
        assert_eq!(out.cache_ops.blocks_to_copy, HashMap::from([(0, vec![1, 2])]));
        assert_eq!(s.block_engine().block_table(0).unwrap().block_ids(), &[1]);
        assert_eq!(s.block_engine().block_table(1).unwrap().block_ids(), &[2]);
        assert_eq!(s.block_engine().block_table(2).unwrap().block_ids(), &[0]);
        assert_eq!(s.block_engine().block_ref_cnt(BlockDevice::Gpu, 0), 1);
        assert_eq!(out.num_batched_tokens, 3);
        assert_eq!(s.group_metadata(&out)[0].num_samples, 1);
    }

    #[test]
    fn test_finished_groups_release_blocks() {
        let mut s = scheduler(4, 8, 0, PreemptionMode::Auto);
        s.add_seq_group(group(0, 6, 2)).unwrap();
        let eos = SequenceGroup::new(
            1,
            10,
            vec![1, 2, 3],
            SamplingParams {
                eos_token_id: Some(100),
                ..Default::default()
            },
            1,
        );
        s.add_seq_group(eos).unwrap();

        let (_, finished) = step(&mut s);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].request_id(), 1);
        assert_eq!(
            finished[0].seq(10).unwrap().stop_reason(),
            Some(StopReason::Eos)
        );

        let (_, finished) = step(&mut s);
        assert_eq!(
            finished[0].seq(0).unwrap().stop_reason(),
            Some(StopReason::Length(2))
        );
        assert_eq!(finished[0].seq(0).unwrap().generated_tokens(), &[100, 100]);
        assert_eq!(s.block_engine().num_free_gpu_blocks(), 8);
        assert!(!s.has_unfinished());
    }

    #[test]
    fn test_encoder_decoder_cross_table_lifecycle() {
        let mut s = scheduler(4, 16, 0, PreemptionMode::Auto);
        s.add_seq_group(group(0, 3, 1).with_encoder_prompt((0..6).collect()))
            .unwrap();
        let out = s.schedule();
        assert_eq!(s.block_engine().cross_block_table(0).unwrap().len(), 2);
        assert_eq!(s.block_engine().block_table(0).unwrap().len(), 1);
        let metadata = s.group_metadata(&out);
        match metadata[0].attention {
            AttentionKind::EncoderDecoder {
                encoder_tokens,
                cross_block_table,
            } => {
                assert_eq!(encoder_tokens.len(), 6);
                assert_eq!(cross_block_table.len(), 2);
            }
            AttentionKind::DecoderOnly => panic!("expected cross attention"),
        }
        drop(metadata);

        let samples = samples(&s, &out);
        let finished = s.process_outputs(&out.scheduled, &samples);
        assert_eq!(finished.len(), 1);
        assert!(s.block_engine().cross_block_table(0).is_none());
        assert_eq!(s.block_engine().num_free_gpu_blocks(), 16);
    }
}
