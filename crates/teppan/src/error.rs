//! Error types surfaced by the cache store, the evaluator seam, and the host.

use thiserror::Error;
use crate::cache::CacheHandle;

/// Misuse of the [`CacheStore`](crate::cache::CacheStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The handle was never allocated, or has already been released.
    #[error("invalid cache handle: {0}")]
    InvalidHandle(CacheHandle),
}

/// Failure reported by a [`ModelEvaluator`](crate::evaluator::ModelEvaluator).
///
/// Cloned once per batch member when a tick fails, so every caller in the
/// batch sees the same cause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("evaluation failed: {message}")]
pub struct EvaluationError {
    message: String,
}

impl EvaluationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// How a submitted request can fail to produce a [`Completion`](crate::request::Completion).
///
/// Truncation at the output length limit is not represented here; it is a
/// normal completion with [`FinishReason::MaxOutputLength`](crate::request::FinishReason).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// The evaluator call for a tick this request took part in failed.
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    /// The request's cache slot was released out from under it.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The caller withdrew the request, or the host cancelled it on shutdown.
    #[error("request was cancelled")]
    Cancelled,

    /// The request carried no input tokens.
    #[error("request has no input tokens")]
    EmptyInput,

    /// The host stopped accepting work before the request could resolve.
    #[error("generation host is closed")]
    Closed,
}

/// Invalid [`HostConfig`](crate::config::HostConfig).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_batch_size must be at least 1")]
    ZeroBatchSize,

    #[error("max_output_length must be at least 1")]
    ZeroOutputLength,

    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("cannot read config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("invalid config document: {0}")]
    Parse(String),
}

/// Host lifecycle failures.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The host was started outside a tokio runtime.
    #[error("no tokio runtime to run the scheduler on: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// `shutdown` was already called.
    #[error("generation host already shut down")]
    AlreadyStopped,

    /// The scheduler task panicked or was aborted before finishing shutdown.
    #[error("scheduler task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}
