use std::time::Duration;
use async_trait::async_trait;
use candle_core::{Device, Tensor};
use teppan::evaluator::candle::greedy_tokens;
use teppan::{Evaluation, EvaluationError, ModelEvaluator, StepInput, StepOutput, TokenId};

/// Byte-level vocabulary plus one end-of-text token.
pub const VOCAB: usize = 257;
pub const END_OF_TEXT: TokenId = 256;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Rolling digest of everything a sequence has been fed so far.
pub struct ByteState {
    digest: u64,
}

/// A stand-in language model over bytes.
///
/// Each step pays a fixed `step_delay` however many sequences are in the
/// batch, which is what makes batching worthwhile on real accelerators.
/// The next token is a pure function of the sequence's own history, so
/// results do not depend on how requests were batched together.
pub struct ByteModel {
    device: Device,
    step_delay: Duration,
    eos_every: u64,
}

impl ByteModel {
    pub fn new(step_delay: Duration, eos_every: u64) -> Self {
        Self {
            device: Device::Cpu,
            step_delay,
            eos_every: eos_every.max(1),
        }
    }

    fn next_token(&self, digest: u64) -> TokenId {
        if digest % self.eos_every == 0 {
            END_OF_TEXT
        } else {
            // printable ascii
            (digest % 95 + 32) as TokenId
        }
    }

    fn logits(&self, digests: &[u64]) -> Result<Tensor, EvaluationError> {
        let mut logits = vec![0f32; digests.len() * VOCAB];
        for (row, digest) in digests.iter().enumerate() {
            logits[row * VOCAB + self.next_token(*digest) as usize] = 1.0;
        }
        Ok(Tensor::from_vec(logits, (digests.len(), VOCAB), &self.device)?)
    }
}

#[async_trait]
impl ModelEvaluator for ByteModel {
    type Cache = ByteState;

    fn eos_token(&self) -> TokenId {
        END_OF_TEXT
    }

    async fn evaluate(&self, batch: Vec<StepInput<ByteState>>) -> Result<Evaluation<ByteState>, EvaluationError> {
        let digests = batch
            .into_iter()
            .map(|input| {
                let start = input.cache.map_or(FNV_OFFSET, |state| state.digest);
                input.tokens
                    .iter()
                    .fold(start, |acc, token| (acc ^ *token as u64).wrapping_mul(FNV_PRIME))
            })
            .collect::<Vec<_>>();

        tokio::time::sleep(self.step_delay).await;
        let tokens = greedy_tokens(&self.logits(&digests)?)?;

        let outputs = tokens
            .into_iter()
            .zip(digests)
            .map(|(token, digest)| StepOutput { token, cache: ByteState { digest } })
            .collect();
        Ok(Evaluation::single(outputs))
    }
}

pub fn encode(text: &str) -> Vec<TokenId> {
    text.bytes().map(TokenId::from).collect()
}

pub fn decode(tokens: &[TokenId]) -> String {
    let bytes = tokens
        .iter()
        .filter_map(|token| u8::try_from(*token).ok())
        .collect::<Vec<_>>();
    String::from_utf8_lossy(&bytes).into_owned()
}
