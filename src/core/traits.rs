//! Core traits for the domain layer
//!
//! These traits define the interfaces that domain components depend on,
//! allowing infrastructure to be injected and tests to use mocks.

use async_trait::async_trait;

use super::errors::CounterError;

/// Synchronous tokenizer for counting tokens in text
///
/// Different model families use different tokenizers:
/// - OpenAI uses tiktoken (cl100k_base for GPT-4 class models)
/// - Local models vary
///
/// Implementations may be CPU heavy; the accounting pipeline never calls them
/// on the caller's thread (see `WorkerTokenCounter`).
pub trait Tokenizer: Send + Sync {
    /// Count tokens in a text string
    fn count_tokens(&self, text: &str) -> usize;

    /// Short name used in logs
    fn name(&self) -> &'static str {
        "tokenizer"
    }
}

/// Asynchronous token counter consumed by the accounting pipeline
///
/// Assumed pure: the same text always yields the same count. Failures are
/// reported to the caller, which keeps the previous value.
#[async_trait]
pub trait TokenCounter: Send + Sync {
    async fn count_tokens(&self, text: &str) -> Result<usize, CounterError>;
}
