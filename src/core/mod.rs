//! Core domain modules
//!
//! Session state, settings merging, context resolution, token accounting and
//! the session index. Nothing here touches the terminal; the CLI in
//! `transport` drives it.

pub mod accounting;
pub mod context;
pub mod errors;
pub mod pricing;
pub mod session_index;
pub mod session_store;
pub mod settings;
pub mod tokenizer;
pub mod traits;
pub mod types;

// Re-export main types for convenience
pub use accounting::{ChainKind, ThrottleWindows, TokenCosts, TokenUsage};
pub use errors::{CounterError, SessionError, StoreError};
pub use session_index::{SearchHit, SessionIndex, SessionOption};
pub use session_store::{SessionStore, StoreSnapshot};
pub use tokenizer::{ApproximateTokenizer, WorkerTokenCounter};
pub use traits::{TokenCounter, Tokenizer};
pub use types::{
    ChatMessage, GlobalSettings, MessageType, Model, Role, Session, SessionSettings, SimpleModel,
    INDEX_SESSION_ID,
};
