mod pending;
mod token_stream;

pub use pending::PendingCompletion;
pub use token_stream::{Streaming, TokenStream};
