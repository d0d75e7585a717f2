//! # Request
//!
//! A submitted generation request and the value it resolves to.
//!
//! A [`Request`] is owned by the scheduler from submission until it reaches
//! [`RequestStatus::Done`]. Resolving it consumes it, so a request can only
//! ever deliver one result to its caller.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;
use crate::cache::CacheHandle;
use crate::error::GenerationError;

/// Vocabulary index of a single token.
pub type TokenId = u32;

/// What a caller eventually receives for a request.
pub type GenerationResult = Result<Completion, GenerationError>;

/// Unique identifier assigned to every request at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a request inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Registered and waiting for a batch slot.
    Pending,
    /// Holds a batch slot and takes part in every tick.
    Active,
    /// Resolved. Resolving consumes the [`Request`], so this state is
    /// reported by [`Request::status`] only for requests that reached a
    /// terminal token but have not been resolved yet.
    Done,
}

/// Why generation stopped for a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// The model produced the end-of-sequence marker.
    EndOfSequence,
    /// The configured output length was reached first.
    MaxOutputLength,
}

/// The full token sequence of a finished request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub id: RequestId,
    /// Input tokens followed by every generated token.
    pub tokens: Vec<TokenId>,
    /// How many leading entries of `tokens` were the input.
    pub input_len: usize,
    pub finish: FinishReason,
}

impl Completion {
    /// The generated suffix of the sequence.
    pub fn generated(&self) -> &[TokenId] {
        &self.tokens[self.input_len..]
    }

    /// `true` when generation hit the output length limit rather than
    /// choosing to stop.
    pub fn is_truncated(&self) -> bool {
        self.finish == FinishReason::MaxOutputLength
    }
}

/// Scheduler-side state of one request.
#[derive(Debug)]
pub struct Request {
    id: RequestId,

    /// Monotonic submission number, used for FIFO admission.
    seq: u64,

    input: Vec<TokenId>,

    generated: Vec<TokenId>,

    status: RequestStatus,

    /// Slot holding this request's evaluator cache state.
    cache: CacheHandle,

    /// Set by the caller to withdraw the request.
    cancelled: Arc<AtomicBool>,

    result: oneshot::Sender<GenerationResult>,

    /// Per-token stream, present only for streaming submissions.
    tokens: Option<mpsc::UnboundedSender<TokenId>>,
}

impl Request {
    pub(crate) fn new(
        id: RequestId,
        seq: u64,
        input: Vec<TokenId>,
        cache: CacheHandle,
        cancelled: Arc<AtomicBool>,
        result: oneshot::Sender<GenerationResult>,
        tokens: Option<mpsc::UnboundedSender<TokenId>>,
    ) -> Self {
        Self {
            id,
            seq,
            input,
            generated: Vec::new(),
            status: RequestStatus::Pending,
            cache,
            cancelled,
            result,
            tokens,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn input(&self) -> &[TokenId] {
        &self.input
    }

    pub fn generated(&self) -> &[TokenId] {
        &self.generated
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Marks the request finished once its latest token ended it.
    pub(crate) fn retire(&mut self) {
        self.status = RequestStatus::Done;
    }

    pub fn cache(&self) -> CacheHandle {
        self.cache
    }

    pub(crate) fn activate(&mut self) {
        self.status = RequestStatus::Active;
    }

    /// Whether the caller has withdrawn, either explicitly or by dropping
    /// the receiving side.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.result.is_closed()
    }

    /// Tokens to feed the evaluator this tick: the whole input on first
    /// participation, afterwards only the newest generated token.
    pub fn step_tokens(&self) -> Vec<TokenId> {
        match self.generated.last() {
            None => self.input.clone(),
            Some(&last) => vec![last],
        }
    }

    /// Appends one generated token and forwards it to the token stream,
    /// if the caller asked for one.
    pub(crate) fn push_token(&mut self, token: TokenId) {
        self.generated.push(token);
        if let Some(stream) = &self.tokens {
            // a closed stream only means the caller stopped listening
            let _ = stream.send(token);
        }
    }

    /// Terminal state reached after the latest token, if any.
    pub fn finish_reason(&self, eos_token: TokenId, max_output_length: usize) -> Option<FinishReason> {
        match self.generated.last() {
            Some(&last) if last == eos_token => Some(FinishReason::EndOfSequence),
            _ if self.generated.len() >= max_output_length => Some(FinishReason::MaxOutputLength),
            _ => None,
        }
    }

    /// Delivers the completed sequence to the caller.
    pub(crate) fn complete(mut self, finish: FinishReason) {
        debug_assert_eq!(self.status, RequestStatus::Done);
        let mut tokens = self.input;
        let input_len = tokens.len();
        tokens.append(&mut self.generated);
        let completion = Completion { id: self.id, tokens, input_len, finish };
        let _ = self.result.send(Ok(completion));
    }

    /// Delivers a failure to the caller.
    pub(crate) fn fail(self, error: GenerationError) {
        let _ = self.result.send(Err(error));
    }
}

#[cfg(test)]
pub(crate) fn test_request(
    seq: u64,
    input: Vec<TokenId>,
    cache: CacheHandle,
) -> (Request, oneshot::Receiver<GenerationResult>, Arc<AtomicBool>) {
    let (tx, rx) = oneshot::channel();
    let cancelled = Arc::new(AtomicBool::new(false));
    let request = Request::new(RequestId::new(), seq, input, cache, cancelled.clone(), tx, None);
    (request, rx, cancelled)
}
