//! Tokenizer implementations
//!
//! Provides token counting for the accounting pipeline. The approximate
//! tokenizer is always available; the BPE tokenizer (`cl100k_base` through
//! tiktoken-rs) is compiled in with the default `tiktoken` feature.

use std::sync::Arc;

use async_trait::async_trait;

use super::errors::CounterError;
use super::traits::{TokenCounter, Tokenizer};

/// Approximate tokenizer using character-based estimation
///
/// The ratio of ~4 characters per token is a reasonable approximation for
/// English text on GPT-4 class models.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproximateTokenizer;

impl Tokenizer for ApproximateTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        // Ceiling division to avoid underestimating
        text.len().div_ceil(4)
    }

    fn name(&self) -> &'static str {
        "approximate"
    }
}

/// Exact BPE token counts for OpenAI models
#[cfg(feature = "tiktoken")]
pub struct TiktokenTokenizer {
    bpe: std::sync::Mutex<tiktoken_rs::CoreBPE>,
}

#[cfg(feature = "tiktoken")]
impl TiktokenTokenizer {
    /// Load the `cl100k_base` vocabulary
    pub fn cl100k() -> Result<Self, CounterError> {
        let bpe =
            tiktoken_rs::cl100k_base().map_err(|e| CounterError::Tokenizer(e.to_string()))?;
        Ok(Self {
            bpe: std::sync::Mutex::new(bpe),
        })
    }
}

#[cfg(feature = "tiktoken")]
impl Tokenizer for TiktokenTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        let bpe = self
            .bpe
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        bpe.encode_with_special_tokens(text).len()
    }

    fn name(&self) -> &'static str {
        "cl100k_base"
    }
}

/// Best tokenizer available in this build
pub fn default_tokenizer() -> Arc<dyn Tokenizer> {
    #[cfg(feature = "tiktoken")]
    {
        match TiktokenTokenizer::cl100k() {
            Ok(tokenizer) => return Arc::new(tokenizer),
            Err(e) => {
                tracing::warn!("Falling back to approximate token counts: {}", e);
            }
        }
    }
    Arc::new(ApproximateTokenizer)
}

/// Runs a synchronous tokenizer on Tokio's blocking pool
///
/// Tokenizing long histories never blocks the task that requested the count.
#[derive(Clone)]
pub struct WorkerTokenCounter {
    tokenizer: Arc<dyn Tokenizer>,
}

impl WorkerTokenCounter {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer }
    }

    pub fn approximate() -> Self {
        Self::new(Arc::new(ApproximateTokenizer))
    }

    pub fn tokenizer_name(&self) -> &'static str {
        self.tokenizer.name()
    }
}

impl Default for WorkerTokenCounter {
    fn default() -> Self {
        Self::new(default_tokenizer())
    }
}

#[async_trait]
impl TokenCounter for WorkerTokenCounter {
    async fn count_tokens(&self, text: &str) -> Result<usize, CounterError> {
        let tokenizer = Arc::clone(&self.tokenizer);
        let text = text.to_owned();
        tokio::task::spawn_blocking(move || tokenizer.count_tokens(&text))
            .await
            .map_err(|e| CounterError::WorkerFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approximate_tokenizer_basic() {
        let tokenizer = ApproximateTokenizer;

        // Empty string
        assert_eq!(tokenizer.count_tokens(""), 0);

        // Short text (4 chars = 1 token)
        assert_eq!(tokenizer.count_tokens("test"), 1);

        // Longer text
        let text = "Hello, world!"; // 13 chars
        assert_eq!(tokenizer.count_tokens(text), 4); // (13+3)/4 = 4
    }

    #[tokio::test]
    async fn test_worker_counter_matches_tokenizer() {
        let counter = WorkerTokenCounter::approximate();
        let count = counter.count_tokens("Hello, world!").await.unwrap();
        assert_eq!(count, 4);
        assert_eq!(counter.tokenizer_name(), "approximate");
    }

    #[cfg(feature = "tiktoken")]
    #[test]
    fn test_tiktoken_counts_words() {
        let tokenizer = TiktokenTokenizer::cl100k().unwrap();
        assert_eq!(tokenizer.count_tokens(""), 0);
        assert_eq!(tokenizer.count_tokens("hello world"), 2);
        assert_eq!(tokenizer.name(), "cl100k_base");
    }
}
