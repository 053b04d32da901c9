use std::{collections::HashMap, time::Duration, time::Instant};

use anyhow::Result;
use candle_core::Device;
use serde::Serialize;
use tokio::sync::mpsc::{error::TryRecvError, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::{
    config::EngineConfig,
    error::SchedulerError,
    inputs_processor::InputsProcessor,
    paged_attention::Scheduler,
    pipeline::ModelExecutor,
    sequence::{SamplingParams, SequenceGroup, StopReason},
};

mod logger;

use logger::IntervalLogger;

const LOG_INTERVAL: Duration = Duration::from_secs(5);

/// A generation request, as submitted to the engine.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub request_id: usize,
    pub prompt: Vec<u32>,
    /// Encoder input of encoder-decoder models.
    pub encoder_prompt: Option<Vec<u32>>,
    pub sampling: SamplingParams,
    pub priority: i32,
    pub responder: Sender<Response>,
}

pub enum Request {
    Submit(NewRequest),
    Abort(usize),
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceResult {
    pub seq_id: usize,
    pub generated: Vec<u32>,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupOutput {
    pub request_id: usize,
    pub prompt_len: usize,
    pub sequences: Vec<SequenceResult>,
}

impl From<&SequenceGroup> for GroupOutput {
    fn from(group: &SequenceGroup) -> Self {
        Self {
            request_id: group.request_id(),
            prompt_len: group.prompt_len(),
            sequences: group
                .seqs()
                .map(|seq| SequenceResult {
                    seq_id: seq.id(),
                    generated: seq.generated_tokens().to_vec(),
                    stop_reason: seq.stop_reason(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Response {
    /// The request finished, or was ignored at admission (`StopReason::Ignored`).
    Done(GroupOutput),
    /// The request was refused at submission.
    Rejected(String),
    Aborted(usize),
    /// The executor failed while the request was in flight.
    ModelError(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    pub num_scheduled: usize,
    pub num_prefill_groups: usize,
    pub num_batched_tokens: usize,
    pub num_preempted: usize,
    pub num_finished: usize,
}

/// Drives the scheduler, the batch builder and a model executor one step at a time.
pub struct Engine<E: ModelExecutor> {
    scheduler: Scheduler,
    inputs_processor: InputsProcessor,
    executor: E,
    responders: HashMap<usize, Sender<Response>>,
    in_flight: Vec<usize>,
    start: Instant,
    logger: IntervalLogger,
}

// Waits for room in the requester's channel. Fails only if the requester is gone.
async fn respond(responder: &Sender<Response>, response: Response) {
    if let Err(e) = responder.send(response).await {
        warn!("Could not deliver response, the requester hung up: {e}");
    }
}

impl<E: ModelExecutor> Engine<E> {
    pub fn new(config: EngineConfig, executor: E, device: Device) -> Result<Self> {
        config.validate()?;
        let inputs_processor =
            InputsProcessor::new(config.cache.block_size, config.graph.clone(), device);
        info!(
            "Paged KV cache: {} GPU blocks, {} CPU blocks of {} tokens, preemption mode {:?}",
            config.cache.num_gpu_blocks,
            config.cache.num_cpu_blocks,
            config.cache.block_size,
            config.scheduler.preemption_mode
        );
        Ok(Self {
            scheduler: Scheduler::new(config.scheduler, &config.cache),
            inputs_processor,
            executor,
            responders: HashMap::new(),
            in_flight: Vec::new(),
            start: Instant::now(),
            logger: IntervalLogger::new(LOG_INTERVAL),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn has_unfinished(&self) -> bool {
        self.scheduler.has_unfinished()
    }

    /// Queue a request. A refused request also gets `Response::Rejected`.
    pub async fn add_request(&mut self, request: NewRequest) -> Result<(), SchedulerError> {
        let NewRequest {
            request_id,
            prompt,
            encoder_prompt,
            sampling,
            priority,
            responder,
        } = request;
        let seq_id = self.scheduler.reserve_seq_id();
        let arrival_time = self.start.elapsed().as_nanos();
        let mut group = SequenceGroup::new(request_id, seq_id, prompt, sampling, arrival_time)
            .with_priority(priority);
        if let Some(encoder_prompt) = encoder_prompt {
            group = group.with_encoder_prompt(encoder_prompt);
        }
        match self.scheduler.add_seq_group(group) {
            Ok(()) => {
                self.responders.insert(request_id, responder);
                Ok(())
            }
            Err(e) => {
                warn!("{e}");
                respond(&responder, Response::Rejected(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Returns false if no unfinished request has this id.
    pub async fn abort_request(&mut self, request_id: usize) -> bool {
        let Some(group) = self.scheduler.abort_seq_group(request_id) else {
            return false;
        };
        debug!("Request {} aborted", group.request_id());
        if let Some(responder) = self.responders.remove(&request_id) {
            respond(&responder, Response::Aborted(request_id)).await;
        }
        true
    }

    /// Schedule, build the batch, run the executor and apply its samples.
    pub async fn step(&mut self) -> Result<StepStats> {
        let outputs = self.scheduler.schedule();
        for group in &outputs.ignored {
            if let Some(responder) = self.responders.remove(&group.request_id()) {
                respond(&responder, Response::Done(group.into())).await;
            }
        }
        for group in &outputs.aborted {
            if let Some(responder) = self.responders.remove(&group.request_id()) {
                respond(&responder, Response::Aborted(group.request_id())).await;
            }
        }

        let mut stats = StepStats {
            num_scheduled: outputs.scheduled.len(),
            num_prefill_groups: outputs.num_prefill_groups(),
            num_batched_tokens: outputs.num_batched_tokens,
            num_preempted: outputs.num_preempted,
            num_finished: 0,
        };
        self.logger.add_preemptions(outputs.num_preempted);
        if outputs.is_empty() {
            self.update_logger();
            return Ok(stats);
        }

        self.in_flight = outputs.scheduled.iter().map(|s| s.request_id).collect();
        let input = {
            let metadata = self.scheduler.group_metadata(&outputs);
            self.inputs_processor.prepare_model_input(&metadata)
        };
        let executed = match input {
            Ok(input) => self.executor.execute(&input, &outputs.cache_ops).await,
            Err(e) => Err(e),
        };
        let samples = match executed {
            Ok(samples) => samples,
            Err(e) => {
                // The swap-out copies of this step never happened.
                self.scheduler.recompute_swapped_out(&outputs.swapped_out);
                return Err(e);
            }
        };
        self.in_flight.clear();

        let finished = self.scheduler.process_outputs(&outputs.scheduled, &samples);
        stats.num_finished = finished.len();
        for group in &finished {
            if let Some(responder) = self.responders.remove(&group.request_id()) {
                respond(&responder, Response::Done(group.into())).await;
            }
        }
        self.logger.add_tokens_processed(outputs.num_batched_tokens);
        self.update_logger();
        Ok(stats)
    }

    fn update_logger(&self) {
        self.logger.set_queues(
            self.scheduler.num_running(),
            self.scheduler.num_waiting(),
            self.scheduler.num_swapped(),
        );
        self.logger
            .set_gpu_usage(self.scheduler.block_engine().gpu_usage());
    }

    /// Abort every group of the failed step and tell its requester why.
    async fn abort_in_flight(&mut self, reason: &str) {
        for request_id in std::mem::take(&mut self.in_flight) {
            if self.scheduler.abort_seq_group(request_id).is_none() {
                continue;
            }
            if let Some(responder) = self.responders.remove(&request_id) {
                respond(&responder, Response::ModelError(reason.to_string())).await;
            }
        }
    }

    async fn abort_all(&mut self) {
        let ids: Vec<usize> = self.responders.keys().copied().collect();
        for request_id in ids {
            self.abort_request(request_id).await;
        }
    }

    // Returns false on `Terminate`.
    async fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Submit(request) => {
                // Refusals are already reported to the requester.
                let _ = self.add_request(request).await;
            }
            Request::Abort(request_id) => {
                self.abort_request(request_id).await;
            }
            Request::Terminate => return false,
        }
        true
    }

    /// Serve requests until `Terminate` arrives, or until the channel is closed and every
    /// request has finished. Requests are only picked up between steps.
    pub async fn run(&mut self, mut rx: Receiver<Request>) {
        self.logger.enable_logging();
        'lp: loop {
            loop {
                match rx.try_recv() {
                    Ok(request) => {
                        if !self.handle_request(request).await {
                            break 'lp;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if !self.has_unfinished() {
                            break 'lp;
                        }
                        break;
                    }
                }
            }

            if !self.has_unfinished() {
                match rx.recv().await {
                    Some(request) => {
                        if !self.handle_request(request).await {
                            break 'lp;
                        }
                        continue;
                    }
                    None => break 'lp,
                }
            }

            if let Err(e) = self.step().await {
                error!("Model step failed: {e}");
                self.abort_in_flight(&e.to_string()).await;
            }
        }
        self.abort_all().await;
    }
}
