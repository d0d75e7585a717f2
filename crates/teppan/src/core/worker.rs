//! Module for handling the background tick loop task.

use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
use tokio::{task::JoinHandle, sync::Notify};
use tokio::task::JoinError;

/// A handle for managing the background task that runs the tick loop.
///
/// Spawning hands the task a running flag and a notifier. [`stop`](Self::stop)
/// clears the flag and wakes the task; [`join`](Self::join) waits for the
/// task to finish its shutdown sequence and returns what it produced.
///
/// Dropping the handle stops the task without waiting for it; the task
/// then finishes shutting down in the background.
pub struct BatchWorkerHandle<T> {
    /// Flag indicating whether the background task should keep ticking
    running: Arc<AtomicBool>,

    /// Handle to the spawned task, `None` once joined
    handle: Option<JoinHandle<T>>,

    /// Wakes the task when work arrives or shutdown begins
    notifier: Arc<Notify>,
}

impl<T> BatchWorkerHandle<T> {
    /// Creates a new `BatchWorkerHandle` by spawning a background task.
    ///
    /// `task` receives the running flag and the notifier, and is
    /// responsible for spawning the task itself.
    pub fn new<F>(task: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> JoinHandle<T>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let notifier = Arc::new(Notify::new());
        let handle = task(running.clone(), notifier.clone());

        Self {
            running,
            handle: Some(handle),
            notifier,
        }
    }

    /// Wakes the background task.
    pub fn notify(&self) {
        self.notifier.notify_one();
    }

    /// A clone of the notifier, for parties that need to wake the task
    /// without holding the handle.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notifier.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Asks the task to stop. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.notify_one();
    }

    /// Stops the task and waits for it to finish.
    ///
    /// Returns `None` if the task was already joined.
    pub async fn join(&mut self) -> Option<Result<T, JoinError>> {
        self.stop();
        match self.handle.take() {
            Some(handle) => Some(handle.await),
            None => None,
        }
    }
}

impl<T> Drop for BatchWorkerHandle<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
