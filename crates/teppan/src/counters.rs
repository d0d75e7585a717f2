//! Process-scoped generation counters.
//!
//! Written by the tick loop, read by anyone holding the host.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct Counters {
    queries: AtomicU64,
    batches: AtomicU64,
    tokens: AtomicU64,
    inferences: AtomicU64,
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Requests accepted by `submit`.
    pub queries: u64,
    /// Evaluator invocations.
    pub batches: u64,
    /// Tokens generated across all requests.
    pub tokens: u64,
    /// Model inferences, as reported by the evaluator.
    pub inferences: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self, inferences: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.inferences.fetch_add(inferences, Ordering::Relaxed);
    }

    pub(crate) fn record_tokens(&self, tokens: u64) {
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            tokens: self.tokens.load(Ordering::Relaxed),
            inferences: self.inferences.load(Ordering::Relaxed),
        }
    }

    /// Zeroes all four counters. In-flight requests are not touched.
    pub fn reset(&self) {
        self.queries.store(0, Ordering::Relaxed);
        self.batches.store(0, Ordering::Relaxed);
        self.tokens.store(0, Ordering::Relaxed);
        self.inferences.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Query count: {}. Batch count: {} Token count: {}. Inference count: {}",
            self.queries, self.batches, self.tokens, self.inferences
        )
    }
}
