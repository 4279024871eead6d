//! Debounced token accounting
//!
//! Three independent chains (input buffer, valid context, streaming assistant
//! reply) each own one background task. A chain keeps only the latest
//! submitted text; after a change it waits out its quiescence window, counts
//! whatever is latest at that moment, and hands the result to a sink. At most
//! one count per chain is in flight, and a value submitted during a count is
//! picked up by the next flush.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;

use super::pricing::{token_cost, Direction};
use super::traits::TokenCounter;
use super::types::Model;

/// Which derived counter a chain feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainKind {
    InputContent,
    Context,
    CurrentMessage,
}

impl ChainKind {
    /// Side of the request the counted tokens are billed to
    pub fn direction(self) -> Direction {
        match self {
            Self::InputContent | Self::Context => Direction::Input,
            Self::CurrentMessage => Direction::Output,
        }
    }
}

impl std::fmt::Display for ChainKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputContent => write!(f, "input"),
            Self::Context => write!(f, "context"),
            Self::CurrentMessage => write!(f, "current-message"),
        }
    }
}

/// Text waiting to be counted, scoped to the session it was issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountRequest {
    pub session_id: String,
    pub text: String,
}

/// Finished count delivered to the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountResult {
    pub kind: ChainKind,
    pub session_id: String,
    pub tokens: usize,
}

/// Receives finished counts
pub type CountSink = Arc<dyn Fn(CountResult) + Send + Sync>;

/// Quiescence windows per chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleWindows {
    pub input_content: Duration,
    pub context: Duration,
    pub current_message: Duration,
}

impl Default for ThrottleWindows {
    fn default() -> Self {
        Self {
            input_content: Duration::from_millis(100),
            context: Duration::from_millis(100),
            current_message: Duration::from_millis(50),
        }
    }
}

impl ThrottleWindows {
    pub fn get(&self, kind: ChainKind) -> Duration {
        match kind {
            ChainKind::InputContent => self.input_content,
            ChainKind::Context => self.context,
            ChainKind::CurrentMessage => self.current_message,
        }
    }
}

/// One throttled counting chain
///
/// The background task ends when the chain is dropped.
pub struct ThrottledChain {
    tx: watch::Sender<Option<CountRequest>>,
}

impl ThrottledChain {
    pub fn spawn(
        handle: &Handle,
        kind: ChainKind,
        window: Duration,
        counter: Arc<dyn TokenCounter>,
        sink: CountSink,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        handle.spawn(run_chain(kind, window, counter, rx, sink));
        Self { tx }
    }

    /// Queue `text` for counting; identical consecutive submissions are dropped
    pub fn submit(&self, session_id: &str, text: &str) {
        self.tx.send_if_modified(|pending| {
            let unchanged = pending
                .as_ref()
                .is_some_and(|p| p.session_id == session_id && p.text == text);
            if unchanged {
                return false;
            }
            *pending = Some(CountRequest {
                session_id: session_id.to_string(),
                text: text.to_string(),
            });
            true
        });
    }
}

async fn run_chain(
    kind: ChainKind,
    window: Duration,
    counter: Arc<dyn TokenCounter>,
    mut rx: watch::Receiver<Option<CountRequest>>,
    sink: CountSink,
) {
    // Exits once the sending half is dropped
    while rx.changed().await.is_ok() {
        tokio::time::sleep(window).await;

        let Some(request) = rx.borrow_and_update().clone() else {
            continue;
        };

        match counter.count_tokens(&request.text).await {
            Ok(tokens) => {
                tracing::debug!(
                    chain = %kind,
                    session = %request.session_id,
                    tokens,
                    "Token count flushed"
                );
                sink(CountResult {
                    kind,
                    session_id: request.session_id,
                    tokens,
                });
            }
            Err(e) => {
                tracing::warn!(chain = %kind, "Token count failed, keeping previous value: {}", e);
            }
        }
    }
}

/// The three chains feeding a session store
pub struct AccountingPipeline {
    input_content: ThrottledChain,
    context: ThrottledChain,
    current_message: ThrottledChain,
}

impl AccountingPipeline {
    pub fn spawn(
        handle: &Handle,
        windows: ThrottleWindows,
        counter: Arc<dyn TokenCounter>,
        sink: CountSink,
    ) -> Self {
        let chain = |kind: ChainKind| {
            ThrottledChain::spawn(
                handle,
                kind,
                windows.get(kind),
                Arc::clone(&counter),
                Arc::clone(&sink),
            )
        };
        Self {
            input_content: chain(ChainKind::InputContent),
            context: chain(ChainKind::Context),
            current_message: chain(ChainKind::CurrentMessage),
        }
    }

    pub fn chain(&self, kind: ChainKind) -> &ThrottledChain {
        match kind {
            ChainKind::InputContent => &self.input_content,
            ChainKind::Context => &self.context,
            ChainKind::CurrentMessage => &self.current_message,
        }
    }

    pub fn submit(&self, kind: ChainKind, session_id: &str, text: &str) {
        self.chain(kind).submit(session_id, text);
    }
}

/// Token counts of the active session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub context_token: usize,
    pub current_message_token: usize,
    pub input_content_token: usize,
}

impl TokenUsage {
    pub fn get(&self, kind: ChainKind) -> usize {
        match kind {
            ChainKind::InputContent => self.input_content_token,
            ChainKind::Context => self.context_token,
            ChainKind::CurrentMessage => self.current_message_token,
        }
    }

    pub fn set(&mut self, kind: ChainKind, tokens: usize) {
        match kind {
            ChainKind::InputContent => self.input_content_token = tokens,
            ChainKind::Context => self.context_token = tokens,
            ChainKind::CurrentMessage => self.current_message_token = tokens,
        }
    }

    /// Dollar cost of each counter on `model`
    pub fn costs(&self, model: Model) -> TokenCosts {
        let cost = |kind: ChainKind| token_cost(self.get(kind), model, kind.direction());
        TokenCosts {
            context: cost(ChainKind::Context),
            current_message: cost(ChainKind::CurrentMessage),
            input_content: cost(ChainKind::InputContent),
        }
    }
}

/// Dollar counterparts of `TokenUsage`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TokenCosts {
    pub context: f64,
    pub current_message: f64,
    pub input_content: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::CounterError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Counts characters and records every text it was asked about
    #[derive(Default)]
    struct RecordingCounter {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TokenCounter for RecordingCounter {
        async fn count_tokens(&self, text: &str) -> Result<usize, CounterError> {
            self.calls.lock().unwrap().push(text.to_string());
            Ok(text.chars().count())
        }
    }

    /// Records like `RecordingCounter` but takes 200ms per count
    #[derive(Default)]
    struct SlowRecordingCounter {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TokenCounter for SlowRecordingCounter {
        async fn count_tokens(&self, text: &str) -> Result<usize, CounterError> {
            self.calls.lock().unwrap().push(text.to_string());
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(text.chars().count())
        }
    }

    struct FailingCounter;

    #[async_trait]
    impl TokenCounter for FailingCounter {
        async fn count_tokens(&self, _text: &str) -> Result<usize, CounterError> {
            Err(CounterError::WorkerFailed("offline".into()))
        }
    }

    fn collecting_sink() -> (CountSink, Arc<Mutex<Vec<CountResult>>>) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&results);
        let sink: CountSink = Arc::new(move |r| captured.lock().unwrap().push(r));
        (sink, results)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_latest_value() {
        let counter = Arc::new(RecordingCounter::default());
        let (sink, results) = collecting_sink();
        let chain = ThrottledChain::spawn(
            &Handle::current(),
            ChainKind::InputContent,
            Duration::from_millis(100),
            counter.clone(),
            sink,
        );

        for text in ["h", "he", "hel", "hell", "hello"] {
            chain.submit("s1", text);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(*counter.calls.lock().unwrap(), vec!["hello".to_string()]);
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tokens, 5);
        assert_eq!(results[0].session_id, "s1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_windows_count_separately() {
        let counter = Arc::new(RecordingCounter::default());
        let (sink, _results) = collecting_sink();
        let chain = ThrottledChain::spawn(
            &Handle::current(),
            ChainKind::CurrentMessage,
            Duration::from_millis(50),
            counter.clone(),
            sink,
        );

        chain.submit("s1", "one");
        tokio::time::sleep(Duration::from_millis(200)).await;
        chain.submit("s1", "one two");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            *counter.calls.lock().unwrap(),
            vec!["one".to_string(), "one two".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_submission_is_not_recounted() {
        let counter = Arc::new(RecordingCounter::default());
        let (sink, _results) = collecting_sink();
        let chain = ThrottledChain::spawn(
            &Handle::current(),
            ChainKind::Context,
            Duration::from_millis(100),
            counter.clone(),
            sink,
        );

        chain.submit("s1", "same");
        tokio::time::sleep(Duration::from_millis(300)).await;
        chain.submit("s1", "same");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(counter.calls.lock().unwrap().len(), 1);

        // A different session with the same text is a new request
        chain.submit("s2", "same");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(counter.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_submitted_during_count_is_counted_next() {
        let counter = Arc::new(SlowRecordingCounter::default());
        let (sink, results) = collecting_sink();
        let chain = ThrottledChain::spawn(
            &Handle::current(),
            ChainKind::InputContent,
            Duration::from_millis(100),
            counter.clone(),
            sink,
        );

        // "ab" is being counted from t=100 to t=300
        chain.submit("s1", "ab");
        tokio::time::sleep(Duration::from_millis(150)).await;
        chain.submit("s1", "abcd");
        tokio::time::sleep(Duration::from_millis(650)).await;

        assert_eq!(
            *counter.calls.lock().unwrap(),
            vec!["ab".to_string(), "abcd".to_string()]
        );
        let results = results.lock().unwrap();
        let tokens: Vec<usize> = results.iter().map(|r| r.tokens).collect();
        assert_eq!(tokens, vec![2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_count_produces_no_result() {
        let (sink, results) = collecting_sink();
        let chain = ThrottledChain::spawn(
            &Handle::current(),
            ChainKind::Context,
            Duration::from_millis(100),
            Arc::new(FailingCounter),
            sink,
        );

        chain.submit("s1", "text");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(results.lock().unwrap().is_empty());
    }

    #[test]
    fn test_costs_use_direction_per_chain() {
        let usage = TokenUsage {
            context_token: 2000,
            current_message_token: 1000,
            input_content_token: 4000,
        };
        let costs = usage.costs(Model::Gpt4oMini);
        assert!((costs.input_content - 0.0006).abs() < 1e-12);
        assert!((costs.context - 0.0003).abs() < 1e-12);
        assert!((costs.current_message - 0.0006).abs() < 1e-12);
    }
}
