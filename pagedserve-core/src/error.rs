use thiserror::Error;

/// Reasons a request is permanently refused by the scheduler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Request {request_id} has a prompt of {len} tokens, which exceeds the limit of {limit} tokens.")]
    PromptTooLong {
        request_id: usize,
        len: usize,
        limit: usize,
    },
    #[error("Request {request_id} needs {required} KV cache blocks but the cache only has {capacity}.")]
    ExceedsCacheCapacity {
        request_id: usize,
        required: usize,
        capacity: usize,
    },
    #[error("Request {0} is already scheduled.")]
    DuplicateRequest(usize),
    #[error("Request {0} has an empty prompt.")]
    EmptyPrompt(usize),
}
