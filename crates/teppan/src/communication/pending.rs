use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, Notify};
use crate::error::GenerationError;
use crate::request::{GenerationResult, RequestId};

/// # PendingCompletion
///
/// The caller's side of a submitted request.
///
/// Resolves to the completed sequence or to the reason there is none.
/// Awaiting one request never depends on any other request finishing.
///
/// Dropping a `PendingCompletion` withdraws the request: the scheduler
/// notices the closed channel at the next tick boundary and frees the
/// request's slot and cache state.
#[derive(Debug)]
pub struct PendingCompletion {
    id: RequestId,
    receiver: oneshot::Receiver<GenerationResult>,
    cancelled: Arc<AtomicBool>,
    notifier: Arc<Notify>,
}

impl PendingCompletion {
    pub(crate) fn new(
        id: RequestId,
        receiver: oneshot::Receiver<GenerationResult>,
        cancelled: Arc<AtomicBool>,
        notifier: Arc<Notify>,
    ) -> Self {
        Self { id, receiver, cancelled, notifier }
    }

    /// A completion that is already resolved with `error`.
    pub(crate) fn rejected(id: RequestId, error: GenerationError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self::new(id, rx, Arc::new(AtomicBool::new(true)), Arc::new(Notify::new()))
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Withdraws the request. Awaiting afterwards yields
    /// [`GenerationError::Cancelled`] unless the request had already
    /// finished.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notifier.notify_one();
    }
}

impl Future for PendingCompletion {
    type Output = GenerationResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(GenerationError::Closed)))
    }
}
