use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use futures::FutureExt;
use tokio::sync::{Mutex, Notify};
use tokio::time::error::Elapsed;
use tracing::{debug, info, warn};
use crate::cache::{CacheHandle, CacheStore};
use crate::config::{HostConfig, ShutdownPolicy};
use crate::counters::Counters;
use crate::error::{EvaluationError, GenerationError};
use crate::evaluator::{ModelEvaluator, StepInput, StepOutput};
use crate::request::{Request, TokenId};
use super::assembler::BatchAssembler;
use super::queue::SubmissionQueue;

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was active; the evaluator was not called.
    Idle,
    /// The evaluator answered for every member.
    Evaluated {
        batch_size: usize,
        admitted: usize,
        /// Members that reached a terminal state this tick.
        resolved: usize,
    },
    /// The evaluator call failed and every member was failed with it.
    Failed { batch_size: usize },
}

/// Summary of the shutdown phase of a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Requests resolved by ticks that ran after shutdown began.
    pub drained: usize,
    /// Requests resolved as cancelled by the shutdown itself.
    pub cancelled: usize,
    /// Cache states or evaluator sessions that failed to release.
    pub release_failures: usize,
}

/// The tick loop: assemble, evaluate once, apply, retire.
///
/// Owns the active batch outright. The submission queue and the cache
/// store are shared with the host, but neither lock is held while the
/// evaluator runs, so submitting never waits on a tick.
pub struct Scheduler<E: ModelEvaluator> {
    evaluator: Arc<E>,
    assembler: BatchAssembler,
    eos_token: TokenId,
    max_output_length: usize,
    shutdown_policy: ShutdownPolicy,
    batch_window: Duration,
    idle_poll: Duration,
    queue: Arc<Mutex<SubmissionQueue>>,
    cache: Arc<Mutex<CacheStore<E::Cache>>>,
    counters: Arc<Counters>,
    active: Vec<Request>,
}

impl<E: ModelEvaluator> Scheduler<E> {
    pub fn new(
        evaluator: Arc<E>,
        config: &HostConfig,
        queue: Arc<Mutex<SubmissionQueue>>,
        cache: Arc<Mutex<CacheStore<E::Cache>>>,
        counters: Arc<Counters>,
    ) -> Self {
        let eos_token = evaluator.eos_token();
        Self {
            evaluator,
            assembler: BatchAssembler::new(config.max_batch_size, config.admission),
            eos_token,
            max_output_length: config.max_output_length,
            shutdown_policy: config.shutdown,
            batch_window: config.batch_window,
            idle_poll: config.idle_poll,
            queue,
            cache,
            counters,
            active: vec![],
        }
    }

    /// Number of requests currently holding a batch slot.
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub async fn has_work(&self) -> bool {
        !self.active.is_empty() || !self.queue.lock().await.is_empty()
    }

    /// Runs until `running` is cleared, then shuts down according to the
    /// configured [`ShutdownPolicy`].
    pub async fn run(mut self, running: Arc<AtomicBool>, notifier: Arc<Notify>) -> ShutdownReport {
        let mut guard = QueueGuard::new(self.queue.clone());
        loop {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            if !self.has_work().await {
                // No work to do, wait for a submission or check periodically
                if self.await_notifier(&notifier).await.is_err() {
                    continue;
                }
                if !self.batch_window.is_zero() {
                    tokio::time::sleep(self.batch_window).await;
                }
            }
            self.run_tick().await;
        }

        self.queue.lock().await.close();
        info!(policy = ?self.shutdown_policy, active = self.active.len(), "generation host shutting down");

        let mut drained = 0;
        if self.shutdown_policy == ShutdownPolicy::Drain {
            while self.has_work().await {
                match self.run_tick().await {
                    TickOutcome::Idle => {}
                    TickOutcome::Evaluated { resolved, .. } => drained += resolved,
                    TickOutcome::Failed { batch_size } => drained += batch_size,
                }
            }
        }
        let report = self.finish(drained).await;
        guard.disarm();
        report
    }

    #[inline]
    async fn await_notifier(&self, notifier: &Notify) -> Result<(), Elapsed> {
        tokio::time::timeout(self.idle_poll, notifier.notified()).await
    }

    /// One round of the scheduler.
    ///
    /// Withdrawn requests are dropped first, then free slots are filled,
    /// then every active request is evaluated exactly once and either
    /// continues or is resolved.
    pub async fn run_tick(&mut self) -> TickOutcome {
        self.withdraw_cancelled().await;

        let admitted = {
            let mut queue = self.queue.lock().await;
            self.assembler.admit(queue.requests_mut(), &mut self.active)
        };
        if self.active.is_empty() {
            return TickOutcome::Idle;
        }

        let batch = self.checkout_batch().await;
        if batch.is_empty() {
            return TickOutcome::Idle;
        }
        let batch_size = batch.len();

        // a panicking evaluator fails this tick like any other error
        let evaluated = AssertUnwindSafe(self.evaluator.evaluate(batch))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(EvaluationError::new("evaluator panicked")));

        match evaluated {
            Err(err) => {
                self.counters.record_batch(1);
                warn!(batch_size, error = %err, "evaluation failed, failing batch");
                self.fail_batch(err, Vec::new()).await;
                TickOutcome::Failed { batch_size }
            }
            Ok(evaluation) if evaluation.outputs.len() != batch_size => {
                self.counters.record_batch(evaluation.inferences);
                let err = EvaluationError::new(format!(
                    "evaluator returned {} outputs for a batch of {}",
                    evaluation.outputs.len(),
                    batch_size
                ));
                warn!(batch_size, error = %err, "evaluation failed, failing batch");
                self.fail_batch(err, evaluation.outputs).await;
                TickOutcome::Failed { batch_size }
            }
            Ok(evaluation) => {
                self.counters.record_batch(evaluation.inferences);
                self.counters.record_tokens(batch_size as u64);
                let resolved = self.apply(evaluation.outputs).await;
                debug!(batch_size, admitted, resolved, "tick complete");
                TickOutcome::Evaluated { batch_size, admitted, resolved }
            }
        }
    }

    /// Resolves withdrawn requests, waiting or active, as cancelled.
    async fn withdraw_cancelled(&mut self) -> usize {
        let mut withdrawn = {
            let mut queue = self.queue.lock().await;
            BatchAssembler::withdraw_cancelled(queue.requests_mut())
        };
        let (cancelled, active): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(Request::is_cancelled);
        self.active = active;
        withdrawn.extend(cancelled);
        if withdrawn.is_empty() {
            return 0;
        }

        let count = withdrawn.len();
        let cache = self.cache.clone();
        let mut store = cache.lock().await;
        for request in withdrawn {
            release_slot(self.evaluator.as_ref(), &mut store, request.cache());
            request.fail(GenerationError::Cancelled);
        }
        debug!(count, "withdrew cancelled requests");
        count
    }

    /// Takes each active request's cache state out of the store and pairs
    /// it with the tokens to feed this tick.
    async fn checkout_batch(&mut self) -> Vec<StepInput<E::Cache>> {
        let cache = self.cache.clone();
        let mut store = cache.lock().await;
        let mut batch = Vec::with_capacity(self.active.len());
        let mut kept = Vec::with_capacity(self.active.len());
        for request in std::mem::take(&mut self.active) {
            match store.take(request.cache()) {
                Ok(state) => {
                    batch.push(StepInput { tokens: request.step_tokens(), cache: state });
                    kept.push(request);
                }
                Err(err) => {
                    warn!(request = %request.id(), error = %err, "request lost its cache slot");
                    request.fail(err.into());
                }
            }
        }
        self.active = kept;
        batch
    }

    /// Applies one output to each active request, in batch order, and
    /// resolves the ones that reached a terminal state.
    async fn apply(&mut self, outputs: Vec<StepOutput<E::Cache>>) -> usize {
        let cache = self.cache.clone();
        let mut store = cache.lock().await;
        let mut resolved = 0;
        let mut continuing = Vec::with_capacity(self.active.len());

        for (mut request, output) in std::mem::take(&mut self.active).into_iter().zip(outputs) {
            // token and cache state land together, under the store lock
            if let Err(err) = store.update(request.cache(), output.cache) {
                warn!(request = %request.id(), error = %err, "request lost its cache slot");
                request.fail(err.into());
                resolved += 1;
                continue;
            }
            request.push_token(output.token);

            match request.finish_reason(self.eos_token, self.max_output_length) {
                None => continuing.push(request),
                Some(finish) => {
                    request.retire();
                    release_slot(self.evaluator.as_ref(), &mut store, request.cache());
                    request.complete(finish);
                    resolved += 1;
                }
            }
        }

        self.active = continuing;
        resolved
    }

    /// Fails every active request with `err`. Their cache states went into
    /// the failed call and are indeterminate, so they are not restored;
    /// any states the evaluator did hand back are released.
    async fn fail_batch(&mut self, err: EvaluationError, returned: Vec<StepOutput<E::Cache>>) {
        for output in returned {
            if let Err(release_err) = self.evaluator.release(output.cache) {
                warn!(error = %release_err, "failed to release cache state");
            }
        }
        let cache = self.cache.clone();
        let mut store = cache.lock().await;
        for request in std::mem::take(&mut self.active) {
            release_slot(self.evaluator.as_ref(), &mut store, request.cache());
            request.fail(GenerationError::Evaluation(err.clone()));
        }
    }

    /// Cancels whatever is left, releases every cache slot, and closes the
    /// evaluator. Release failures are counted and logged, never fatal.
    async fn finish(&mut self, drained: usize) -> ShutdownReport {
        let mut report = ShutdownReport { drained, ..ShutdownReport::default() };

        let queued = self.queue.lock().await.take_all();
        let leftover = std::mem::take(&mut self.active);
        {
            let cache = self.cache.clone();
            let mut store = cache.lock().await;
            for request in leftover.into_iter().chain(queued) {
                if !release_slot(self.evaluator.as_ref(), &mut store, request.cache()) {
                    report.release_failures += 1;
                }
                request.fail(GenerationError::Cancelled);
                report.cancelled += 1;
            }
            for (handle, state) in store.release_all() {
                warn!(%handle, "releasing orphaned cache slot");
                if let Some(state) = state {
                    if let Err(err) = self.evaluator.release(state) {
                        warn!(%handle, error = %err, "failed to release cache state");
                        report.release_failures += 1;
                    }
                }
            }
        }

        if let Err(err) = self.evaluator.close().await {
            warn!(error = %err, "failed to close evaluator session");
            report.release_failures += 1;
        }
        info!(
            drained = report.drained,
            cancelled = report.cancelled,
            release_failures = report.release_failures,
            "generation host stopped"
        );
        report
    }
}

/// Closes the submission queue and fails everything still waiting in it
/// if the tick loop unwinds before finishing its shutdown sequence.
///
/// Active requests need no help: they are owned by the loop, so unwinding
/// drops their senders and their callers see [`GenerationError::Closed`].
struct QueueGuard {
    queue: Arc<Mutex<SubmissionQueue>>,
    armed: bool,
}

impl QueueGuard {
    fn new(queue: Arc<Mutex<SubmissionQueue>>) -> Self {
        Self { queue, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // a destructor cannot wait for the lock
        match self.queue.try_lock() {
            Ok(mut queue) => {
                queue.close();
                let waiting = queue.take_all();
                warn!(waiting = waiting.len(), "tick loop stopped unexpectedly, failing waiting requests");
                for request in waiting {
                    request.fail(GenerationError::Closed);
                }
            }
            Err(_) => warn!("tick loop stopped unexpectedly with the submission queue locked"),
        }
    }
}

/// Frees `handle` and gives its state back to the evaluator. Returns
/// `false` if either step failed.
fn release_slot<E: ModelEvaluator>(evaluator: &E, store: &mut CacheStore<E::Cache>, handle: CacheHandle) -> bool {
    match store.release(handle) {
        Err(err) => {
            warn!(error = %err, "cache slot already released");
            false
        }
        Ok(None) => true,
        Ok(Some(state)) => match evaluator.release(state) {
            Ok(()) => true,
            Err(err) => {
                warn!(%handle, error = %err, "failed to release cache state");
                false
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;
    use crate::config::AdmissionPolicy;
    use crate::evaluator::mock::{history_hash, MockEvaluator, EOS};
    use crate::request::{FinishReason, GenerationResult, RequestId};

    struct Harness {
        scheduler: Scheduler<MockEvaluator>,
        evaluator: Arc<MockEvaluator>,
        queue: Arc<Mutex<SubmissionQueue>>,
        cache: Arc<Mutex<CacheStore<crate::evaluator::mock::MockCache>>>,
        counters: Arc<Counters>,
    }

    impl Harness {
        fn new(evaluator: MockEvaluator, config: HostConfig) -> Self {
            let evaluator = Arc::new(evaluator);
            let queue = Arc::new(Mutex::new(SubmissionQueue::new()));
            let cache = Arc::new(Mutex::new(CacheStore::new()));
            let counters = Arc::new(Counters::new());
            let scheduler = Scheduler::new(evaluator.clone(), &config, queue.clone(), cache.clone(), counters.clone());
            Self { scheduler, evaluator, queue, cache, counters }
        }

        async fn submit(&self, input: Vec<TokenId>) -> (oneshot::Receiver<GenerationResult>, Arc<AtomicBool>) {
            let (tx, rx) = oneshot::channel();
            let cancelled = Arc::new(AtomicBool::new(false));
            let id = RequestId::new();
            let mut queue = self.queue.lock().await;
            let handle = self.cache.lock().await.allocate(id);
            let request = Request::new(id, queue.next_seq(), input, handle, cancelled.clone(), tx, None);
            queue.push(request).unwrap();
            self.counters.record_query();
            (rx, cancelled)
        }

        async fn tick_until_idle(&mut self) -> usize {
            let mut ticks = 0;
            while self.scheduler.run_tick().await != TickOutcome::Idle {
                ticks += 1;
            }
            ticks
        }
    }

    fn config(max_batch_size: usize, max_output_length: usize) -> HostConfig {
        HostConfig::default()
            .with_max_batch_size(max_batch_size)
            .with_max_output_length(max_output_length)
    }

    #[tokio::test]
    async fn test_three_requests_stop_after_two_tokens() {
        let mut h = Harness::new(MockEvaluator::stop_after(2), config(8, 5));
        let (a, _) = h.submit(vec![101]).await;
        let (b, _) = h.submit(vec![102]).await;
        let (c, _) = h.submit(vec![103]).await;

        let ticks = h.tick_until_idle().await;
        assert_eq!(ticks, 2);

        for (rx, input) in [(a, 101), (b, 102), (c, 103)] {
            let completion = rx.await.unwrap().unwrap();
            assert_eq!(completion.tokens, vec![input, 7, EOS]);
            assert_eq!(completion.finish, FinishReason::EndOfSequence);
        }

        let counters = h.counters.snapshot();
        assert_eq!(counters.queries, 3);
        assert_eq!(counters.batches, 2);
        assert_eq!(counters.inferences, 2);
        assert_eq!(counters.tokens, 6);
        assert_eq!(h.evaluator.batch_sizes(), vec![3, 3]);
        assert!(h.cache.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_truncation_at_max_output_length() {
        let mut h = Harness::new(MockEvaluator::hashing(), config(4, 5));
        let (rx, _) = h.submit(vec![1, 2, 3]).await;

        assert_eq!(h.tick_until_idle().await, 5);
        let completion = rx.await.unwrap().unwrap();
        assert_eq!(completion.generated().len(), 5);
        assert_eq!(completion.tokens.len(), 8);
        assert!(completion.is_truncated());
    }

    #[tokio::test]
    async fn test_evaluator_failure_is_localized_to_tick() {
        let mut h = Harness::new(MockEvaluator::hashing().failing_on(3), config(4, 5));
        let (a, _) = h.submit(vec![1]).await;
        let (b, _) = h.submit(vec![2]).await;

        assert!(matches!(h.scheduler.run_tick().await, TickOutcome::Evaluated { batch_size: 2, .. }));
        assert!(matches!(h.scheduler.run_tick().await, TickOutcome::Evaluated { batch_size: 2, .. }));
        assert_eq!(h.scheduler.run_tick().await, TickOutcome::Failed { batch_size: 2 });

        for rx in [a, b] {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err, GenerationError::Evaluation(_)));
        }
        assert_eq!(h.scheduler.active_len(), 0);
        assert!(h.cache.lock().await.is_empty());

        // the scheduler keeps serving
        let (c, _) = h.submit(vec![3]).await;
        h.tick_until_idle().await;
        let completion = c.await.unwrap().unwrap();
        assert_eq!(completion.generated().len(), 5);

        let counters = h.counters.snapshot();
        assert_eq!(counters.batches, 8);
        assert_eq!(counters.tokens, 2 + 2 + 5);
    }

    #[tokio::test]
    async fn test_batch_size_limit_admits_fifo() {
        let mut h = Harness::new(MockEvaluator::stop_after(3), config(2, 10));
        let mut receivers = vec![];
        for input in 0..5 {
            receivers.push(h.submit(vec![10 + input]).await.0);
        }

        assert_eq!(h.scheduler.run_tick().await, TickOutcome::Evaluated { batch_size: 2, admitted: 2, resolved: 0 });
        h.tick_until_idle().await;

        // pairs run back to back; the fifth runs alone
        assert_eq!(h.evaluator.batch_sizes(), vec![2, 2, 2, 2, 2, 2, 1, 1, 1]);
        for (idx, rx) in receivers.into_iter().enumerate() {
            let completion = rx.await.unwrap().unwrap();
            assert_eq!(completion.tokens[0], 10 + idx as TokenId);
            assert_eq!(completion.generated().len(), 3);
        }
    }

    #[tokio::test]
    async fn test_late_arrival_joins_next_tick() {
        let mut h = Harness::new(MockEvaluator::stop_after(3), config(4, 10));
        let (first, _) = h.submit(vec![1]).await;
        h.scheduler.run_tick().await;

        let (second, _) = h.submit(vec![2]).await;
        assert_eq!(h.scheduler.run_tick().await, TickOutcome::Evaluated { batch_size: 2, admitted: 1, resolved: 0 });
        assert_eq!(h.scheduler.run_tick().await, TickOutcome::Evaluated { batch_size: 2, admitted: 0, resolved: 1 });
        h.tick_until_idle().await;

        assert_eq!(first.await.unwrap().unwrap().generated().len(), 3);
        assert_eq!(second.await.unwrap().unwrap().generated().len(), 3);
        assert_eq!(h.evaluator.batch_sizes(), vec![1, 2, 2, 1]);
    }

    #[tokio::test]
    async fn test_isolation_from_other_batch_members() {
        let input = vec![5, 9, 2];

        let mut alone = Harness::new(MockEvaluator::hashing(), config(4, 6));
        let (rx, _) = alone.submit(input.clone()).await;
        alone.tick_until_idle().await;
        let solo = rx.await.unwrap().unwrap();

        let mut crowded = Harness::new(MockEvaluator::hashing(), config(4, 6));
        let (other, _) = crowded.submit(vec![8]).await;
        let (rx, _) = crowded.submit(input.clone()).await;
        let (third, _) = crowded.submit(vec![8, 8, 8, 8]).await;
        crowded.tick_until_idle().await;
        let shared = rx.await.unwrap().unwrap();

        assert_eq!(solo.tokens, shared.tokens);
        // divergent histories give divergent outputs
        assert_ne!(other.await.unwrap().unwrap().generated(), shared.generated());
        assert_ne!(third.await.unwrap().unwrap().generated(), shared.generated());
    }

    #[tokio::test]
    async fn test_generated_tokens_follow_own_history() {
        let mut h = Harness::new(MockEvaluator::hashing(), config(4, 4));
        let (rx, _) = h.submit(vec![3, 4]).await;
        let (_other, _) = h.submit(vec![6]).await;
        h.tick_until_idle().await;

        let completion = rx.await.unwrap().unwrap();
        let mut history = vec![3, 4];
        for &token in completion.generated() {
            assert_eq!(token, history_hash(&history));
            history.push(token);
        }
    }

    #[tokio::test]
    async fn test_cancel_waiting_request_never_reaches_evaluator() {
        let mut h = Harness::new(MockEvaluator::stop_after(2), config(1, 5));
        let (first, _) = h.submit(vec![1]).await;
        let (second, flag) = h.submit(vec![2]).await;
        flag.store(true, Ordering::Release);

        h.tick_until_idle().await;
        assert_eq!(second.await.unwrap(), Err(GenerationError::Cancelled));
        assert!(first.await.unwrap().is_ok());
        assert_eq!(h.evaluator.batch_sizes(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_cancel_active_request_releases_cache_at_next_tick() {
        let mut h = Harness::new(MockEvaluator::hashing(), config(4, 10));
        let (keep, _) = h.submit(vec![1]).await;
        let (drop_me, flag) = h.submit(vec![2]).await;

        h.scheduler.run_tick().await;
        assert_eq!(h.cache.lock().await.len(), 2);

        flag.store(true, Ordering::Release);
        assert!(matches!(h.scheduler.run_tick().await, TickOutcome::Evaluated { batch_size: 1, .. }));
        assert_eq!(h.cache.lock().await.len(), 1);
        assert_eq!(h.evaluator.released(), 1);
        assert_eq!(drop_me.await.unwrap(), Err(GenerationError::Cancelled));

        h.tick_until_idle().await;
        assert!(keep.await.unwrap().unwrap().is_truncated());
    }

    #[tokio::test]
    async fn test_dropped_receiver_counts_as_cancelled() {
        let mut h = Harness::new(MockEvaluator::hashing(), config(4, 10));
        let (rx, _) = h.submit(vec![1]).await;
        h.scheduler.run_tick().await;
        drop(rx);

        assert_eq!(h.scheduler.run_tick().await, TickOutcome::Idle);
        assert!(h.cache.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_shortest_input_first_policy() {
        let config = config(1, 1).with_admission(AdmissionPolicy::ShortestInputFirst);
        let mut h = Harness::new(MockEvaluator::hashing(), config);
        let (long, _) = h.submit(vec![1, 1, 1]).await;
        let (short, _) = h.submit(vec![2]).await;

        assert!(matches!(h.scheduler.run_tick().await, TickOutcome::Evaluated { resolved: 1, .. }));
        assert!(short.await.is_ok());
        assert!(h.scheduler.has_work().await);
        h.tick_until_idle().await;
        assert!(long.await.is_ok());
    }

    #[tokio::test]
    async fn test_run_drains_on_shutdown() {
        let h = Harness::new(MockEvaluator::stop_after(3), config(4, 10));
        let (a, _) = h.submit(vec![1]).await;
        let (b, _) = h.submit(vec![2]).await;

        let running = Arc::new(AtomicBool::new(false));
        let report = h.scheduler.run(running, Arc::new(Notify::new())).await;

        assert_eq!(report, ShutdownReport { drained: 2, cancelled: 0, release_failures: 0 });
        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert!(h.evaluator.is_closed());
        assert!(h.queue.lock().await.is_closed());
    }

    #[tokio::test]
    async fn test_run_cancels_on_shutdown() {
        let config = config(4, 10).with_shutdown(ShutdownPolicy::Cancel);
        let h = Harness::new(MockEvaluator::stop_after(3).failing_release(), config);
        let (a, _) = h.submit(vec![1]).await;

        let running = Arc::new(AtomicBool::new(false));
        let report = h.scheduler.run(running, Arc::new(Notify::new())).await;

        assert_eq!(report.cancelled, 1);
        assert_eq!(report.drained, 0);
        // the slot was never filled, so there was no state to fail on
        assert_eq!(report.release_failures, 0);
        assert_eq!(a.await.unwrap(), Err(GenerationError::Cancelled));
        assert_eq!(h.evaluator.calls(), 0);
    }

    #[tokio::test]
    async fn test_release_failures_do_not_stop_cleanup() {
        let config = config(4, 10).with_shutdown(ShutdownPolicy::Cancel);
        let mut h = Harness::new(MockEvaluator::hashing().failing_release(), config);
        let (a, _) = h.submit(vec![1]).await;
        let (b, _) = h.submit(vec![2]).await;
        h.scheduler.run_tick().await;

        let running = Arc::new(AtomicBool::new(false));
        let report = h.scheduler.run(running, Arc::new(Notify::new())).await;

        assert_eq!(report.cancelled, 2);
        assert_eq!(report.release_failures, 2);
        assert_eq!(h.evaluator.released(), 2);
        assert!(h.cache.lock().await.is_empty());
        assert!(h.evaluator.is_closed());
        assert_eq!(a.await.unwrap(), Err(GenerationError::Cancelled));
        assert_eq!(b.await.unwrap(), Err(GenerationError::Cancelled));
    }

    #[tokio::test]
    async fn test_evaluator_panic_fails_tick_and_scheduler_recovers() {
        let mut h = Harness::new(MockEvaluator::hashing().panicking_on(2), config(4, 5));
        let (a, _) = h.submit(vec![1]).await;
        let (b, _) = h.submit(vec![2]).await;

        assert!(matches!(h.scheduler.run_tick().await, TickOutcome::Evaluated { batch_size: 2, .. }));
        assert_eq!(h.scheduler.run_tick().await, TickOutcome::Failed { batch_size: 2 });

        for rx in [a, b] {
            match rx.await.unwrap() {
                Err(GenerationError::Evaluation(err)) => assert_eq!(err.message(), "evaluator panicked"),
                other => panic!("unexpected result {other:?}"),
            }
        }
        assert!(h.cache.lock().await.is_empty());

        let (c, _) = h.submit(vec![3]).await;
        h.tick_until_idle().await;
        assert_eq!(c.await.unwrap().unwrap().generated().len(), 5);
    }

    #[tokio::test]
    async fn test_output_count_mismatch_fails_whole_tick() {
        let mut h = Harness::new(MockEvaluator::hashing().dropping_output_on(2), config(4, 5));
        let (a, _) = h.submit(vec![1]).await;
        let (b, _) = h.submit(vec![2]).await;

        h.scheduler.run_tick().await;
        assert_eq!(h.scheduler.run_tick().await, TickOutcome::Failed { batch_size: 2 });

        for rx in [a, b] {
            assert!(matches!(rx.await.unwrap(), Err(GenerationError::Evaluation(_))));
        }
        // the one state handed back is released, the lost one was never returned
        assert_eq!(h.evaluator.released(), 1);
        assert!(h.cache.lock().await.is_empty());

        let counters = h.counters.snapshot();
        assert_eq!(counters.batches, 2);
        assert_eq!(counters.tokens, 2);

        let (c, _) = h.submit(vec![3]).await;
        h.tick_until_idle().await;
        assert!(c.await.unwrap().unwrap().is_truncated());
    }

    #[tokio::test]
    async fn test_inferences_follow_evaluator_report() {
        let mut h = Harness::new(MockEvaluator::hashing().with_inferences(3), config(4, 4));
        let (a, _) = h.submit(vec![1]).await;
        let (b, _) = h.submit(vec![2, 2]).await;

        assert_eq!(h.tick_until_idle().await, 4);
        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());

        let counters = h.counters.snapshot();
        assert_eq!(counters.batches, 4);
        assert_eq!(counters.inferences, 3 * counters.batches);
        assert_eq!(counters.tokens, 8);
    }

    #[tokio::test]
    async fn test_queue_guard_fails_waiting_requests_when_armed() {
        let h = Harness::new(MockEvaluator::hashing(), config(4, 5));
        let (rx, _) = h.submit(vec![1]).await;

        drop(QueueGuard::new(h.queue.clone()));

        assert_eq!(rx.await.unwrap(), Err(GenerationError::Closed));
        let queue = h.queue.lock().await;
        assert!(queue.is_closed());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_disarmed_queue_guard_leaves_queue_alone() {
        let h = Harness::new(MockEvaluator::hashing(), config(4, 5));
        let (_rx, _) = h.submit(vec![1]).await;

        let mut guard = QueueGuard::new(h.queue.clone());
        guard.disarm();
        drop(guard);

        let queue = h.queue.lock().await;
        assert!(!queue.is_closed());
        assert_eq!(queue.len(), 1);
    }
}
