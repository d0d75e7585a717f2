use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use crate::error::EvaluationError;
use crate::evaluator::{Evaluation, ModelEvaluator, StepInput, StepOutput};
use crate::request::TokenId;

pub const EOS: TokenId = 0;

/// What the mock remembers per request: everything it has been fed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCache {
    pub input_len: usize,
    pub history: Vec<TokenId>,
}

impl MockCache {
    pub fn generated(&self) -> usize {
        self.history.len() - self.input_len
    }
}

type Rule = Box<dyn Fn(&MockCache) -> TokenId + Send + Sync>;

pub struct MockEvaluator {
    rule: Rule,
    fail_on_call: Option<usize>,
    panic_on_call: Option<usize>,
    drop_output_on_call: Option<usize>,
    inferences: u64,
    fail_release: bool,
    panic_on_close: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    released: AtomicUsize,
    closed: AtomicBool,
}

impl MockEvaluator {
    pub fn new<F>(rule: F) -> Self
    where
        F: Fn(&MockCache) -> TokenId + Send + Sync + 'static,
    {
        Self {
            rule: Box::new(rule),
            fail_on_call: None,
            panic_on_call: None,
            drop_output_on_call: None,
            inferences: 1,
            fail_release: false,
            panic_on_close: false,
            delay: None,
            calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(vec![]),
            released: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Emits a filler token, then the end marker once `n` tokens came before it.
    pub fn stop_after(n: usize) -> Self {
        Self::new(move |cache| if cache.generated() + 1 >= n { EOS } else { 7 })
    }

    /// Never emits the end marker; the next token hashes the whole history.
    pub fn hashing() -> Self {
        Self::new(|cache| history_hash(&cache.history))
    }

    /// Fails the `call`-th evaluation, counting from 1.
    pub fn failing_on(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    /// Panics inside the `call`-th evaluation, counting from 1.
    pub fn panicking_on(mut self, call: usize) -> Self {
        self.panic_on_call = Some(call);
        self
    }

    /// Answers the `call`-th evaluation with one output too few.
    pub fn dropping_output_on(mut self, call: usize) -> Self {
        self.drop_output_on_call = Some(call);
        self
    }

    /// Reports every evaluation as `inferences` model inferences.
    pub fn with_inferences(mut self, inferences: u64) -> Self {
        self.inferences = inferences;
        self
    }

    pub fn panicking_on_close(mut self) -> Self {
        self.panic_on_close = true;
        self
    }

    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Non-zero token derived from a full history.
pub fn history_hash(history: &[TokenId]) -> TokenId {
    let h = history
        .iter()
        .fold(17u32, |acc, t| acc.wrapping_mul(31).wrapping_add(*t));
    h % 997 + 1
}

#[async_trait]
impl ModelEvaluator for MockEvaluator {
    type Cache = MockCache;

    fn eos_token(&self) -> TokenId {
        EOS
    }

    async fn evaluate(&self, batch: Vec<StepInput<MockCache>>) -> Result<Evaluation<MockCache>, EvaluationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.batch_sizes.lock().unwrap().push(batch.len());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_on_call == Some(call) {
            return Err(EvaluationError::new(format!("mock failure on call {call}")));
        }
        if self.panic_on_call == Some(call) {
            panic!("mock panic on call {call}");
        }

        let mut outputs: Vec<_> = batch
            .into_iter()
            .map(|input| {
                let mut cache = input.cache.unwrap_or_else(|| MockCache {
                    input_len: input.tokens.len(),
                    history: vec![],
                });
                cache.history.extend(input.tokens);
                let token = (self.rule)(&cache);
                StepOutput { token, cache }
            })
            .collect();
        if self.drop_output_on_call == Some(call) {
            outputs.pop();
        }
        Ok(Evaluation { outputs, inferences: self.inferences })
    }

    fn release(&self, cache: MockCache) -> Result<(), EvaluationError> {
        drop(cache);
        self.released.fetch_add(1, Ordering::SeqCst);
        if self.fail_release {
            return Err(EvaluationError::new("mock release failure"));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), EvaluationError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.panic_on_close {
            panic!("mock panic on close");
        }
        Ok(())
    }
}
