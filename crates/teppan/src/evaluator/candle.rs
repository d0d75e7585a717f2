use candle_core::{DType, Tensor, D};
use crate::error::EvaluationError;
use crate::request::TokenId;

impl From<candle_core::Error> for EvaluationError {
    fn from(err: candle_core::Error) -> Self {
        EvaluationError::new(err.to_string())
    }
}

/// Picks the highest scoring token for every row of a `(batch, vocab)`
/// logits tensor.
///
/// Rows map one to one onto the batch the evaluator was given, so the
/// result can be zipped straight back into [`StepOutput`](super::StepOutput)s.
pub fn greedy_tokens(logits: &Tensor) -> Result<Vec<TokenId>, EvaluationError> {
    if logits.rank() != 2 {
        return Err(EvaluationError::new(format!(
            "expected (batch, vocab) logits, got shape {:?}",
            logits.dims()
        )));
    }
    let tokens = logits
        .argmax(D::Minus1)?
        .to_dtype(DType::U32)?
        .to_vec1::<u32>()?;
    Ok(tokens)
}

/// Like [`greedy_tokens`], for `(batch, seq, vocab)` logits where only the
/// final position of each sequence matters.
pub fn greedy_last_tokens(logits: &Tensor) -> Result<Vec<TokenId>, EvaluationError> {
    if logits.rank() != 3 {
        return Err(EvaluationError::new(format!(
            "expected (batch, seq, vocab) logits, got shape {:?}",
            logits.dims()
        )));
    }
    let seq_len = logits.dim(1)?;
    if seq_len == 0 {
        return Err(EvaluationError::new("logits have an empty sequence dimension"));
    }
    let last = logits.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
    greedy_tokens(&last)
}
