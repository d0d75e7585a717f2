use async_trait::async_trait;
use crate::error::EvaluationError;
use crate::request::TokenId;

/// One batch member's contribution to a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInput<C> {
    /// The full input sequence on a request's first tick, afterwards the
    /// single most recently generated token.
    pub tokens: Vec<TokenId>,

    /// The state returned for this request by the previous tick, `None`
    /// on the first tick.
    pub cache: Option<C>,
}

/// The evaluator's answer for one batch member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput<C> {
    /// The next token chosen for the request.
    pub token: TokenId,

    /// The request's state with `token` accounted for.
    pub cache: C,
}

/// Result of one evaluator invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation<C> {
    /// One output per input, in input order.
    pub outputs: Vec<StepOutput<C>>,

    /// Model inferences this call took. Evaluators that split a batch into
    /// several device calls report more than one.
    pub inferences: u64,
}

impl<C> Evaluation<C> {
    /// An evaluation performed as a single inference.
    pub fn single(outputs: Vec<StepOutput<C>>) -> Self {
        Self { outputs, inferences: 1 }
    }
}

/// # ModelEvaluator
///
/// A batched next-token model with per-request incremental state.
///
/// ```rust
/// use async_trait::async_trait;
/// use teppan::{Evaluation, EvaluationError, ModelEvaluator, StepInput, StepOutput, TokenId};
///
/// /// Counts upward from the last token it saw, stopping at 0 after 9.
/// struct Counter;
///
/// #[async_trait]
/// impl ModelEvaluator for Counter {
///     type Cache = TokenId;
///
///     fn eos_token(&self) -> TokenId {
///         0
///     }
///
///     async fn evaluate(&self, batch: Vec<StepInput<TokenId>>) -> Result<Evaluation<TokenId>, EvaluationError> {
///         let outputs = batch
///             .into_iter()
///             .map(|input| {
///                 let last = input.tokens.last().copied().unwrap_or_default();
///                 let token = if last >= 9 { 0 } else { last + 1 };
///                 StepOutput { token, cache: token }
///             })
///             .collect();
///         Ok(Evaluation::single(outputs))
///     }
/// }
/// ```
///
/// ## Contract
///
/// - `evaluate` returns exactly one output per input, in input order.
///   Anything else fails the whole tick.
/// - The output for member *i* depends only on member *i*'s tokens and
///   cache. Batch order and the other members must not change it.
/// - The scheduler serializes calls: at most one `evaluate` is in flight
///   per host at any time.
/// - States handed to `evaluate` are moved in; on failure they are
///   considered lost and the affected requests are failed.
#[async_trait]
pub trait ModelEvaluator: Send + Sync + 'static {
    /// Per-request incremental state, opaque to the scheduler.
    type Cache: Send + 'static;

    /// The token id that ends a sequence.
    fn eos_token(&self) -> TokenId;

    /// Runs one decoding step for every member of the batch.
    async fn evaluate(
        &self,
        batch: Vec<StepInput<Self::Cache>>,
    ) -> Result<Evaluation<Self::Cache>, EvaluationError>;

    /// Disposes of a state whose request has finished.
    fn release(&self, cache: Self::Cache) -> Result<(), EvaluationError> {
        drop(cache);
        Ok(())
    }

    /// Ends the evaluator session when the host shuts down.
    async fn close(&self) -> Result<(), EvaluationError> {
        Ok(())
    }
}

/// Lets several hosts, or a host and its owner, share one evaluator.
#[async_trait]
impl<T: ModelEvaluator> ModelEvaluator for std::sync::Arc<T> {
    type Cache = T::Cache;

    fn eos_token(&self) -> TokenId {
        self.as_ref().eos_token()
    }

    async fn evaluate(
        &self,
        batch: Vec<StepInput<Self::Cache>>,
    ) -> Result<Evaluation<Self::Cache>, EvaluationError> {
        self.as_ref().evaluate(batch).await
    }

    fn release(&self, cache: Self::Cache) -> Result<(), EvaluationError> {
        self.as_ref().release(cache)
    }

    async fn close(&self) -> Result<(), EvaluationError> {
        self.as_ref().close().await
    }
}
