use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum StopReason {
    Eos,
    StopTok(u32),
    Length(usize),
    ModelLength(usize),
    /// Aborted by the requester.
    Canceled,
    /// Refused at admission, it can never fit.
    Ignored,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SequenceState {
    Waiting,
    Running,
    Swapped,
    Done(StopReason),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Number of parallel samples drawn from the prompt.
    pub n: usize,
    pub max_tokens: Option<usize>,
    pub stop_toks: Vec<u32>,
    pub eos_token_id: Option<u32>,
    pub ignore_eos: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            n: 1,
            max_tokens: None,
            stop_toks: Vec::new(),
            eos_token_id: None,
            ignore_eos: false,
        }
    }
}

impl SamplingParams {
    pub fn deterministic(max_tokens: usize) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct Sequence {
    id: usize,
    tokens: Vec<u32>,
    prompt_len: usize,
    // Tokens whose KV entries are already in the cache.
    num_computed_tokens: usize,
    state: SequenceState,
}

impl Sequence {
    pub fn new_waiting(id: usize, tokens: Vec<u32>) -> Self {
        let prompt_len = tokens.len();
        Self {
            id,
            tokens,
            prompt_len,
            num_computed_tokens: 0,
            state: SequenceState::Waiting,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn generated_tokens(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }

    pub fn num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    /// A sequence needs a prefill until any of its KV has been computed. After a recompute
    /// preemption this covers the generated tokens too.
    pub fn is_prefill(&self) -> bool {
        self.num_computed_tokens == 0
    }

    /// Number of tokens this sequence feeds to the model in its next step.
    pub fn query_len(&self) -> usize {
        self.tokens.len() - self.num_computed_tokens
    }

    pub fn mark_computed(&mut self, num_tokens: usize) {
        self.num_computed_tokens += num_tokens;
        debug_assert!(self.num_computed_tokens <= self.tokens.len());
    }

    pub fn reset_computed(&mut self) {
        self.num_computed_tokens = 0;
    }

    pub fn append_token(&mut self, tok: u32) {
        self.tokens.push(tok);
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn set_state(&mut self, state: SequenceState) {
        self.state = state;
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, SequenceState::Done(_))
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state {
            SequenceState::Done(reason) => Some(reason),
            _ => None,
        }
    }

    /// A copy of this sequence under a new id, sharing its full token history.
    pub fn fork(&self, id: usize) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }

    /// Checks the stop conditions after `tok` has been appended.
    pub fn is_done(
        &self,
        tok: u32,
        sampling: &SamplingParams,
        max_model_len: usize,
    ) -> Option<StopReason> {
        let generated = self.tokens.len().saturating_sub(self.prompt_len);
        if !sampling.ignore_eos && sampling.eos_token_id == Some(tok) {
            Some(StopReason::Eos)
        } else if sampling.stop_toks.contains(&tok) {
            Some(StopReason::StopTok(tok))
        } else if sampling.max_tokens.is_some_and(|max| generated >= max) {
            Some(StopReason::Length(generated))
        } else if self.tokens.len() >= max_model_len {
            Some(StopReason::ModelLength(max_model_len))
        } else {
            None
        }
    }
}

/// All sequences generated from one request.
#[derive(Clone, Debug)]
pub struct SequenceGroup {
    request_id: usize,
    seqs: IndexMap<usize, Sequence>,
    // Fixed encoder input of encoder-decoder models. Never grows.
    encoder_seq: Option<Sequence>,
    sampling: SamplingParams,
    arrival_time: u128,
    priority: i32,
    prefilled_once: bool,
}

impl SequenceGroup {
    pub fn new(
        request_id: usize,
        seq_id: usize,
        prompt: Vec<u32>,
        sampling: SamplingParams,
        arrival_time: u128,
    ) -> Self {
        let mut seqs = IndexMap::new();
        seqs.insert(seq_id, Sequence::new_waiting(seq_id, prompt));
        Self {
            request_id,
            seqs,
            encoder_seq: None,
            sampling,
            arrival_time,
            priority: 0,
            prefilled_once: false,
        }
    }

    /// The encoder sequence reuses the id of the first decoder sequence. It never owns a
    /// decoder block table, its cache lives in the group's cross-attention table.
    pub fn with_encoder_prompt(mut self, encoder_prompt: Vec<u32>) -> Self {
        let id = self.seqs.keys().next().copied().unwrap_or_default();
        self.encoder_seq = Some(Sequence::new_waiting(id, encoder_prompt));
        self
    }

    /// Lower values are scheduled first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn request_id(&self) -> usize {
        self.request_id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn arrival_time(&self) -> u128 {
        self.arrival_time
    }

    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    pub fn encoder_seq(&self) -> Option<&Sequence> {
        self.encoder_seq.as_ref()
    }

    pub fn is_encoder_decoder(&self) -> bool {
        self.encoder_seq.is_some()
    }

    pub fn seqs(&self) -> impl Iterator<Item = &Sequence> {
        self.seqs.values()
    }

    pub fn seqs_mut(&mut self) -> impl Iterator<Item = &mut Sequence> {
        self.seqs.values_mut()
    }

    pub fn seq(&self, seq_id: usize) -> Option<&Sequence> {
        self.seqs.get(&seq_id)
    }

    pub fn seq_mut(&mut self, seq_id: usize) -> Option<&mut Sequence> {
        self.seqs.get_mut(&seq_id)
    }

    pub fn unfinished_seqs(&self) -> impl Iterator<Item = &Sequence> {
        self.seqs.values().filter(|seq| !seq.is_finished())
    }

    pub fn unfinished_seqs_mut(&mut self) -> impl Iterator<Item = &mut Sequence> {
        self.seqs.values_mut().filter(|seq| !seq.is_finished())
    }

    pub fn num_seqs(&self) -> usize {
        self.seqs.len()
    }

    pub fn num_unfinished_seqs(&self) -> usize {
        self.unfinished_seqs().count()
    }

    pub fn is_finished(&self) -> bool {
        self.seqs.values().all(Sequence::is_finished)
    }

    pub fn add_seq(&mut self, seq: Sequence) {
        self.seqs.insert(seq.id(), seq);
    }

    pub fn prompt_len(&self) -> usize {
        self.seqs.values().next().map_or(0, Sequence::prompt_len)
    }

    /// Upper bound on the sequences this group runs in its next steps. A group that has not
    /// yet produced its first tokens will expand to `n` sequences.
    pub fn max_num_running_seqs(&self) -> usize {
        if self.prefilled_once {
            self.num_unfinished_seqs()
        } else {
            self.sampling.n.max(self.num_unfinished_seqs())
        }
    }

    /// Tokens the group feeds to the model in a prefill step.
    pub fn num_prefill_tokens(&self) -> usize {
        self.unfinished_seqs().map(Sequence::query_len).sum()
    }

    pub fn is_prefill(&self) -> bool {
        self.unfinished_seqs().any(Sequence::is_prefill)
    }

    pub fn prefilled_once(&self) -> bool {
        self.prefilled_once
    }

    pub fn mark_prefilled(&mut self) {
        self.prefilled_once = true;
    }

    pub fn set_state(&mut self, state: SequenceState) {
        for seq in self.unfinished_seqs_mut() {
            seq.set_state(state);
        }
    }

    /// Finish every remaining sequence with `reason`.
    pub fn finish(&mut self, reason: StopReason) {
        self.set_state(SequenceState::Done(reason));
    }
}
