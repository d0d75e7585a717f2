use std::pin::Pin;
use std::task::{Context, Poll};
use futures::Stream;
use tokio::sync::mpsc;
use crate::communication::PendingCompletion;
use crate::request::TokenId;

/// # TokenStream
///
/// Generated tokens of one request, yielded as soon as the tick that
/// produced each of them finishes.
///
/// The stream ends when the request resolves, whatever the outcome; the
/// paired [`PendingCompletion`] says how it ended. Backed by an unbounded
/// channel, so a slow reader never stalls the tick loop.
pub struct TokenStream {
    receiver: mpsc::UnboundedReceiver<TokenId>,
}

impl TokenStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<TokenId>) -> Self {
        Self { receiver }
    }
}

impl Stream for TokenStream {
    type Item = TokenId;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().receiver).poll_recv(cx)
    }
}

/// A streaming submission: tokens as they are produced, plus the final
/// result.
///
/// Dropping `completion` withdraws the request even if `tokens` is still
/// being read.
pub struct Streaming {
    pub tokens: TokenStream,
    pub completion: PendingCompletion,
}
