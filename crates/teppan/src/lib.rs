//! # Teppan
//!
//! A batched generation host: many concurrent callers, one shared model,
//! one evaluator call per decoding step.
//!
//! ## Overview
//!
//! Autoregressive models produce one token per forward pass. Serving each
//! request with its own passes wastes the hardware, so teppan multiplexes
//! every in-flight request onto a single batched evaluator call per
//! *tick*. Requests join the batch whenever a slot frees up and leave it
//! as soon as they finish, so short generations are never held back by
//! long ones.
//!
//! ```rust
//! # use async_trait::async_trait;
//! # use teppan::{Evaluation, EvaluationError, ModelEvaluator, StepInput, StepOutput, TokenId};
//! # struct Echo;
//! # #[async_trait]
//! # impl ModelEvaluator for Echo {
//! #     type Cache = ();
//! #     fn eos_token(&self) -> TokenId { 0 }
//! #     async fn evaluate(&self, batch: Vec<StepInput<()>>) -> Result<Evaluation<()>, EvaluationError> {
//! #         Ok(Evaluation::single(batch.into_iter().map(|_| StepOutput { token: 0, cache: () }).collect()))
//! #     }
//! # }
//! use teppan::{GenerationHost, HostConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), teppan::HostError> {
//! let host = GenerationHost::start(Echo, HostConfig::default().with_max_batch_size(8))?;
//!
//! let completion = host.generate(vec![17, 3]).await.unwrap();
//! assert_eq!(completion.generated(), &[0]);
//!
//! println!("{}", host.counters());
//! host.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ### Evaluator
//!
//! The [`ModelEvaluator`] trait is the only thing a model has to provide.
//! It receives one [`StepInput`] per active request, each carrying that
//! request's tokens for this step and its opaque incremental state, and
//! answers with one token and one updated state per member.
//!
//! ### Scheduling
//!
//! A single background task owns the active batch. Each tick it drops
//! withdrawn requests, admits waiting ones into free slots, calls the
//! evaluator exactly once, and resolves every request that produced its
//! end-of-sequence token or reached the output length limit. A failed
//! evaluator call fails only the requests in that tick.
//!
//! ### Caller surface
//!
//! [`GenerationHost::submit`] returns a [`PendingCompletion`], a future that
//! can also withdraw its request. [`GenerationHost::stream`] additionally
//! yields tokens as they are produced. [`with_host`] scopes a host to a
//! closure and guarantees shutdown.
//!
//! ## Features
//!
//! - **candle** - Greedy token selection helpers for evaluators built on candle
//!

mod communication;

pub mod cache;
pub mod config;
pub mod core;
pub mod counters;
pub mod error;
pub mod evaluator;
pub mod host;
pub mod request;

pub use cache::{CacheHandle, CacheStore};
pub use communication::{PendingCompletion, Streaming, TokenStream};
pub use config::{AdmissionPolicy, HostConfig, ShutdownPolicy};
pub use crate::core::scheduler::ShutdownReport;
pub use counters::CounterSnapshot;
pub use error::{CacheError, ConfigError, EvaluationError, GenerationError, HostError};
pub use evaluator::{Evaluation, ModelEvaluator, StepInput, StepOutput};
pub use host::{with_host, GenerationHost};
pub use request::{Completion, FinishReason, GenerationResult, RequestId, TokenId};
