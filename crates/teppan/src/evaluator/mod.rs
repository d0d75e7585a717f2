//! # Model Evaluator
//!
//! The seam between the scheduler and whatever actually runs the model.
//!
//! Teppan never computes logits itself. Each tick it hands the evaluator
//! one [`StepInput`] per batch member and expects exactly one
//! [`StepOutput`] back for each, in the same order. Everything numerical,
//! including how the evaluator vectorizes the batch on its device, stays
//! behind the [`ModelEvaluator`] trait.
//!
//! ## Feature Flags
//!
//! - `candle`: enables [`candle`](self::candle) helpers for evaluators
//!   whose forward pass produces a candle logits tensor.

mod core_trait;

#[cfg_attr(docsrs, doc(cfg(feature = "candle")))]
#[cfg(feature = "candle")]
/// Greedy decoding helpers for candle-backed evaluators.
///
/// Only available when the `candle` feature flag is enabled.
pub mod candle;

pub use core_trait::*;

#[cfg(test)]
/// Deterministic evaluator for tests.
pub(crate) mod mock;
