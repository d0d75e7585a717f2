use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{debug, info};
use crate::cache::CacheStore;
use crate::communication::{PendingCompletion, Streaming, TokenStream};
use crate::config::HostConfig;
use crate::core::queue::SubmissionQueue;
use crate::core::scheduler::{Scheduler, ShutdownReport};
use crate::core::worker::BatchWorkerHandle;
use crate::counters::{CounterSnapshot, Counters};
use crate::error::{GenerationError, HostError};
use crate::evaluator::ModelEvaluator;
use crate::request::{GenerationResult, Request, RequestId, TokenId};

/// # GenerationHost
///
/// Multiplexes concurrent generation requests onto shared evaluator calls.
///
/// Starting a host spawns its tick loop on the current tokio runtime. Any
/// number of tasks may then [`submit`](Self::submit) through a shared
/// reference; each gets back its own [`PendingCompletion`]. Submission only
/// touches the submission queue, so it never waits for a tick to finish.
///
/// Call [`shutdown`](Self::shutdown) to stop the host and wait for its
/// resources to be released, or use [`with_host`] to have that happen on
/// every exit path. Dropping a host that was not shut down stops the tick
/// loop, which then completes the shutdown sequence in the background.
pub struct GenerationHost<E: ModelEvaluator> {
    config: HostConfig,
    queue: Arc<Mutex<SubmissionQueue>>,
    cache: Arc<Mutex<CacheStore<E::Cache>>>,
    counters: Arc<Counters>,
    notifier: Arc<Notify>,
    worker: Mutex<BatchWorkerHandle<ShutdownReport>>,
}

impl<E: ModelEvaluator> GenerationHost<E> {
    /// Validates `config` and brings up the tick loop.
    pub fn start(evaluator: E, config: HostConfig) -> Result<Self, HostError> {
        config.validate()?;
        let runtime = Handle::try_current()?;

        let queue = Arc::new(Mutex::new(SubmissionQueue::new()));
        let cache = Arc::new(Mutex::new(CacheStore::new()));
        let counters = Arc::new(Counters::new());
        let scheduler = Scheduler::new(
            Arc::new(evaluator),
            &config,
            queue.clone(),
            cache.clone(),
            counters.clone(),
        );

        let worker = BatchWorkerHandle::new(move |running, notifier| {
            runtime.spawn(scheduler.run(running, notifier))
        });
        info!(
            max_batch_size = config.max_batch_size,
            max_output_length = config.max_output_length,
            admission = ?config.admission,
            "generation host started"
        );

        Ok(Self {
            config,
            queue,
            cache,
            counters,
            notifier: worker.notifier(),
            worker: Mutex::new(worker),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Registers a request for `input` and returns the handle its result
    /// will arrive on.
    ///
    /// The request takes part in the first tick that starts after this
    /// returns and has a free slot. Requests with no input tokens, and
    /// requests submitted after shutdown began, resolve immediately with
    /// an error and are not counted as queries.
    pub async fn submit(&self, input: Vec<TokenId>) -> PendingCompletion {
        self.enqueue(input, None).await
    }

    /// Like [`submit`](Self::submit), additionally streaming each
    /// generated token as soon as its tick completes.
    pub async fn stream(&self, input: Vec<TokenId>) -> Streaming {
        let (tx, rx) = mpsc::unbounded_channel();
        let completion = self.enqueue(input, Some(tx)).await;
        Streaming {
            tokens: TokenStream::new(rx),
            completion,
        }
    }

    /// Submits `input` and waits for the completed sequence.
    pub async fn generate(&self, input: Vec<TokenId>) -> GenerationResult {
        self.submit(input).await.await
    }

    async fn enqueue(&self, input: Vec<TokenId>, tokens: Option<mpsc::UnboundedSender<TokenId>>) -> PendingCompletion {
        let id = RequestId::new();
        if input.is_empty() {
            return PendingCompletion::rejected(id, GenerationError::EmptyInput);
        }

        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut queue = self.queue.lock().await;
            let handle = self.cache.lock().await.allocate(id);
            let request = Request::new(id, queue.next_seq(), input, handle, cancelled.clone(), tx, tokens);
            if let Err(request) = queue.push(request) {
                let _ = self.cache.lock().await.release(request.cache());
                return PendingCompletion::rejected(id, GenerationError::Closed);
            }
        }
        self.counters.record_query();
        self.notifier.notify_one();
        debug!(request = %id, "request submitted");

        PendingCompletion::new(id, rx, cancelled, self.notifier.clone())
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Zeroes the counters. In-flight requests keep running.
    pub fn reset_counters(&self) {
        self.counters.reset();
    }

    /// Stops accepting requests, drains or cancels the accepted ones as
    /// configured, releases every cache state, and closes the evaluator.
    pub async fn shutdown(&self) -> Result<ShutdownReport, HostError> {
        let mut worker = self.worker.lock().await;
        match worker.join().await {
            None => Err(HostError::AlreadyStopped),
            Some(joined) => Ok(joined?),
        }
    }
}

/// Runs `body` against a freshly started host and shuts the host down
/// afterwards.
///
/// Only a failure to start is returned as the outer error. Once `body`
/// has run, its value is always handed back, paired with the outcome of
/// the shutdown.
///
/// ```rust
/// # use async_trait::async_trait;
/// # use teppan::{Evaluation, EvaluationError, ModelEvaluator, StepInput, StepOutput, TokenId};
/// # struct Echo;
/// # #[async_trait]
/// # impl ModelEvaluator for Echo {
/// #     type Cache = ();
/// #     fn eos_token(&self) -> TokenId { 0 }
/// #     async fn evaluate(&self, batch: Vec<StepInput<()>>) -> Result<Evaluation<()>, EvaluationError> {
/// #         Ok(Evaluation::single(batch.into_iter().map(|_| StepOutput { token: 0, cache: () }).collect()))
/// #     }
/// # }
/// use teppan::{with_host, HostConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), teppan::HostError> {
/// let (completion, shutdown) = with_host(Echo, HostConfig::default(), |host| async move {
///     host.generate(vec![4, 2]).await
/// }).await?;
///
/// assert_eq!(completion.unwrap().tokens, vec![4, 2, 0]);
/// assert_eq!(shutdown?.cancelled, 0);
/// # Ok(())
/// # }
/// ```
///
/// The host is shut down whether `body` returns normally or not: if it
/// panics, dropping the host stops the tick loop during unwinding.
pub async fn with_host<E, F, Fut, T>(
    evaluator: E,
    config: HostConfig,
    body: F,
) -> Result<(T, Result<ShutdownReport, HostError>), HostError>
where
    E: ModelEvaluator,
    F: FnOnce(Arc<GenerationHost<E>>) -> Fut,
    Fut: Future<Output = T>,
{
    let host = Arc::new(GenerationHost::start(evaluator, config)?);
    let value = body(host.clone()).await;
    let shutdown = host.shutdown().await;
    Ok((value, shutdown))
}
