//! chat-ledger: session state and token-budget engine for a chat client
//!
//! This library provides:
//! - Session persistence over a key-value store (one JSON record per session)
//! - Layered settings (defaults, environment, stored) with self-healing enums
//! - The valid context of a conversation, kept in sync with every mutation
//! - Throttled background token counting with cost and budget estimates
//! - A fuzzy-searchable index of saved sessions

pub mod config;
pub mod core;
pub mod storage;
pub mod transport;

pub use config::{Config, EngineConfig, EnvOverrides};
pub use core::{SessionStore, StoreSnapshot};
pub use storage::{FileStore, KeyValueStore, LocalStorage, MemoryStore};
