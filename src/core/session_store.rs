//! Session store
//!
//! Owns the state of the active session: settings, message list, input and
//! streaming buffers, and the derived fields computed from them (valid
//! context, token counts, costs, remaining budget). Handles are cheap to clone
//! and share one state.
//!
//! Every operation takes the state lock once, so an observer never sees a
//! half-applied session switch. Token counts are recomputed in the background
//! by the accounting pipeline and only land if the session they were counted
//! for is still active.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tokio::runtime::Handle;

use super::accounting::{
    AccountingPipeline, ChainKind, CountResult, CountSink, TokenCosts, TokenUsage,
};
use super::context::{joined_content, valid_context};
use super::errors::{CounterError, SessionError, StoreError};
use super::pricing::{remaining_tokens, TokenTable};
use super::session_index::{build_index, HomeOption, IndexScheduler, SearchHit, SessionIndex};
use super::settings::{apply_layer, merge_settings};
use super::traits::TokenCounter;
use super::types::{
    ChatMessage, GlobalSettings, MessageType, Model, Role, Session, SessionSettings,
    INDEX_SESSION_ID,
};
use crate::config::EngineConfig;
use crate::storage::LocalStorage;

/// Give up on id generation after this many collisions
pub const MAX_ID_ATTEMPTS: usize = 64;

/// Mutable state of the active session
#[derive(Debug, Clone)]
pub struct StoreState {
    pub session_id: String,
    pub global_settings: GlobalSettings,
    pub session_settings: SessionSettings,
    pub messages: Vec<ChatMessage>,
    pub input_content: String,
    pub current_assistant_message: String,
    pub loading: bool,
    pub usage: TokenUsage,
    valid_context: Vec<ChatMessage>,
    context_text: String,
    context_revision: u64,
}

impl StoreState {
    fn new(global_settings: GlobalSettings, session_settings: SessionSettings) -> Self {
        let mut state = Self {
            session_id: INDEX_SESSION_ID.to_string(),
            global_settings,
            session_settings,
            messages: Vec::new(),
            input_content: String::new(),
            current_assistant_message: String::new(),
            loading: false,
            usage: TokenUsage::default(),
            valid_context: Vec::new(),
            context_text: String::new(),
            context_revision: 0,
        };
        state.refresh_valid_context();
        state
    }

    /// Re-derive the valid context and its joined text from the history
    fn refresh_valid_context(&mut self) {
        self.valid_context = valid_context(&self.messages, self.session_settings.continuous_dialogue);
        self.context_text = joined_content(&self.valid_context);
        self.context_revision += 1;
        tracing::trace!(revision = self.context_revision, "Valid context refreshed");
    }

    pub fn valid_context(&self) -> &[ChatMessage] {
        &self.valid_context
    }

    pub fn current_model(&self) -> Model {
        self.session_settings.model.resolve()
    }

    /// Messages that would be written for this session
    fn persistable_messages(&self) -> Vec<ChatMessage> {
        if self.session_settings.save_session {
            self.messages.clone()
        } else {
            self.messages.iter().filter(|m| m.is_locked()).cloned().collect()
        }
    }
}

/// Parts of the state an update touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Touched {
    history: bool,
    input: bool,
    reply: bool,
}

impl Touched {
    const NONE: Self = Self {
        history: false,
        input: false,
        reply: false,
    };
    const HISTORY: Self = Self {
        history: true,
        ..Self::NONE
    };
    const INPUT: Self = Self {
        input: true,
        ..Self::NONE
    };
    const REPLY: Self = Self {
        reply: true,
        ..Self::NONE
    };
    const ALL: Self = Self {
        history: true,
        input: true,
        reply: true,
    };
}

/// Consistent copy of base and derived state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub session_id: String,
    pub global_settings: GlobalSettings,
    pub session_settings: SessionSettings,
    pub messages: Vec<ChatMessage>,
    pub valid_context: Vec<ChatMessage>,
    pub input_content: String,
    pub current_assistant_message: String,
    pub loading: bool,
    pub current_model: Model,
    pub usage: TokenUsage,
    pub costs: TokenCosts,
    pub remaining_token: i64,
}

struct Inner {
    state: Arc<RwLock<StoreState>>,
    storage: LocalStorage,
    config: EngineConfig,
    home: HomeOption,
    counter: Arc<dyn TokenCounter>,
    pipeline: AccountingPipeline,
    index: IndexScheduler,
}

/// Handle to the session store
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    /// Build the store; must be called inside a Tokio runtime
    ///
    /// Global settings start from defaults, then the environment override,
    /// then the persisted record. Session settings start from defaults and the
    /// environment override. The home session is active, but nothing is
    /// loaded until `load_session` is called.
    pub fn new(
        storage: LocalStorage,
        config: EngineConfig,
        counter: Arc<dyn TokenCounter>,
    ) -> Result<Self, StoreError> {
        let handle = Handle::try_current().map_err(|_| StoreError::NoRuntime)?;

        let stored_global = storage.global_settings_override().unwrap_or_else(|e| {
            tracing::error!("Failed to read global settings: {:#}", e);
            None
        });
        let global_settings = merge_settings(
            &GlobalSettings::default(),
            config.env.global_settings.as_ref(),
            stored_global.as_ref(),
        );
        let session_settings = merge_settings(
            &SessionSettings::default(),
            config.env.session_settings.as_ref(),
            None,
        );

        let state = Arc::new(RwLock::new(StoreState::new(global_settings, session_settings)));
        let pipeline = AccountingPipeline::spawn(
            &handle,
            config.windows,
            Arc::clone(&counter),
            apply_count_sink(Arc::clone(&state)),
        );
        let index = IndexScheduler::new(handle, config.index_debounce);
        let home = HomeOption {
            title: config.home_title.clone(),
            hint: config.home_hint.clone(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                state,
                storage,
                config,
                home,
                counter,
                pipeline,
                index,
            }),
        })
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.inner.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StoreState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` as one update, then refresh what it touched
    fn mutate<R>(&self, touched: Touched, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut state = self.write_state();
        let result = f(&mut *state);
        self.after_update(&mut *state, touched);
        result
    }

    /// Re-derive the context if the history changed and feed only the affected chains
    fn after_update(&self, state: &mut StoreState, touched: Touched) {
        if touched.history {
            state.refresh_valid_context();
        }

        let pipeline = &self.inner.pipeline;
        let id = state.session_id.as_str();
        if touched.input {
            pipeline.submit(ChainKind::InputContent, id, &state.input_content);
        }
        if touched.history {
            pipeline.submit(ChainKind::Context, id, &state.context_text);
        }
        if touched.reply {
            pipeline.submit(
                ChainKind::CurrentMessage,
                id,
                &state.current_assistant_message,
            );
        }
    }

    // ========== Session lifecycle ==========

    /// Switch to session `id`
    ///
    /// Reloads global settings, merges the session's stored settings over the
    /// current ones, and replaces the message list. A session without a record
    /// starts with default settings and no messages. Unreadable records are
    /// logged and skipped. A blank id loads the home session. Schedules a
    /// rebuild of the session index.
    pub fn load_session(&self, id: &str) {
        let id = if id.trim().is_empty() {
            tracing::warn!("Blank session id, loading the home session instead");
            INDEX_SESSION_ID
        } else {
            id
        };

        let storage = &self.inner.storage;
        let stored_global = storage.global_settings_override().unwrap_or_else(|e| {
            tracing::error!("Failed to read global settings: {:#}", e);
            None
        });
        let stored_session = storage.get_session(id).unwrap_or_else(|e| {
            tracing::error!("Failed to read session {}: {:#}", id, e);
            None
        });
        let exists = stored_session.is_some()
            || storage.session_exists(id).unwrap_or_else(|e| {
                tracing::error!("Failed to read session {}: {:#}", id, e);
                false
            });

        self.mutate(Touched::ALL, |state| {
            state.session_id = id.to_string();

            if let Some(layer) = &stored_global {
                state.global_settings =
                    apply_layer(&GlobalSettings::default(), &state.global_settings, layer);
            }

            match stored_session {
                Some(record) => {
                    if let Some(settings) = &record.settings {
                        state.session_settings = apply_layer(
                            &SessionSettings::default(),
                            &state.session_settings,
                            settings,
                        );
                    }
                    if let Some(messages) = record.messages {
                        state.messages = if state.session_settings.save_session {
                            messages
                        } else {
                            messages.into_iter().filter(|m| m.is_locked()).collect()
                        };
                    }
                }
                // A corrupt record keeps whatever is already in memory
                None if exists => {}
                None => {
                    state.session_settings = self.initial_session_settings();
                    state.messages.clear();
                }
            }
        });

        tracing::debug!(session = %id, "Session loaded");
        self.schedule_index_rebuild();
    }

    /// Session settings a session without a record starts from
    fn initial_session_settings(&self) -> SessionSettings {
        merge_settings(
            &SessionSettings::default(),
            self.inner.config.env.session_settings.as_ref(),
            None,
        )
    }

    /// Create a session with a generated id and switch to it
    pub fn create_session(&self) -> Result<String, StoreError> {
        self.create_session_with(generate_session_id)
    }

    /// Create a session with ids drawn from `generate`
    ///
    /// Ids already used by a persisted session (or reserved) are skipped.
    pub fn create_session_with<G>(&self, mut generate: G) -> Result<String, StoreError>
    where
        G: FnMut() -> String,
    {
        let storage = &self.inner.storage;
        let mut attempts = 0;
        let id = loop {
            if attempts >= MAX_ID_ATTEMPTS {
                return Err(SessionError::IdExhausted { attempts }.into());
            }
            attempts += 1;

            let candidate = generate();
            if candidate.is_empty() || candidate == INDEX_SESSION_ID {
                continue;
            }
            let taken = storage
                .session_exists(&candidate)
                .map_err(|e| SessionError::Storage(e.to_string()))?;
            if !taken {
                break candidate;
            }
            tracing::debug!("Session id {} already taken, regenerating", candidate);
        };

        let settings = SessionSettings {
            title: self.inner.config.new_session_title.clone(),
            ..SessionSettings::default()
        };
        storage
            .set_session(&Session::new(id.clone(), settings))
            .map_err(|e| SessionError::Storage(e.to_string()))?;

        tracing::info!("Created session {}", id);
        self.load_session(&id);
        Ok(id)
    }

    /// Drop every message that is not locked
    pub fn clear_session(&self) {
        self.mutate(Touched::HISTORY, |state| {
            state.messages.retain(ChatMessage::is_locked)
        });
    }

    /// Delete a persisted session and return to the home session
    pub fn delete_session(&self, id: &str) -> Result<(), SessionError> {
        if id == INDEX_SESSION_ID {
            tracing::warn!("Refusing to delete the home session");
            return Err(SessionError::CannotDeleteIndex);
        }

        self.inner
            .storage
            .delete_session(id)
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        tracing::info!("Deleted session {}", id);

        self.load_session(INDEX_SESSION_ID);
        Ok(())
    }

    /// Write the active session with `lastVisit` set to now
    ///
    /// With `saveSession` off only locked messages are written.
    pub fn persist(&self) -> Result<(), SessionError> {
        let session = {
            let state = self.read_state();
            let mut session = Session::new(state.session_id.clone(), state.session_settings.clone());
            session.messages = state.persistable_messages();
            session
        };
        self.inner
            .storage
            .set_session(&session)
            .map_err(|e| SessionError::Storage(e.to_string()))
    }

    pub fn persist_global_settings(&self) -> Result<(), SessionError> {
        let settings = self.read_state().global_settings.clone();
        self.inner
            .storage
            .set_global_settings(&settings)
            .map_err(|e| SessionError::Storage(e.to_string()))
    }

    // ========== Mutators ==========

    pub fn update_global_settings(&self, f: impl FnOnce(&mut GlobalSettings)) {
        self.mutate(Touched::NONE, |state| f(&mut state.global_settings));
    }

    /// Only a change of `continuousDialogue` re-derives the context
    pub fn update_session_settings(&self, f: impl FnOnce(&mut SessionSettings)) {
        let mut state = self.write_state();
        let continuous = state.session_settings.continuous_dialogue;
        f(&mut state.session_settings);
        if state.session_settings.continuous_dialogue != continuous {
            self.after_update(&mut *state, Touched::HISTORY);
        }
    }

    pub fn set_input_content(&self, text: impl Into<String>) {
        let text = text.into();
        self.mutate(Touched::INPUT, |state| state.input_content = text);
    }

    pub fn set_current_assistant_message(&self, text: impl Into<String>) {
        let text = text.into();
        self.mutate(Touched::REPLY, |state| state.current_assistant_message = text);
    }

    /// Append a streamed fragment to the assistant buffer
    pub fn append_assistant_chunk(&self, chunk: &str) {
        self.mutate(Touched::REPLY, |state| {
            state.current_assistant_message.push_str(chunk)
        });
    }

    /// Move the streaming buffer into the message list
    ///
    /// Returns false when the buffer was empty.
    pub fn commit_assistant_message(&self) -> bool {
        let mut state = self.write_state();
        if state.current_assistant_message.is_empty() {
            return false;
        }
        let content = std::mem::take(&mut state.current_assistant_message);
        state.messages.push(ChatMessage::new(Role::Assistant, content));
        self.after_update(
            &mut *state,
            Touched {
                history: true,
                reply: true,
                ..Touched::NONE
            },
        );
        true
    }

    pub fn set_loading(&self, loading: bool) {
        self.mutate(Touched::NONE, |state| state.loading = loading);
    }

    pub fn push_message(&self, message: ChatMessage) {
        self.mutate(Touched::HISTORY, |state| state.messages.push(message));
    }

    pub fn set_messages(&self, messages: Vec<ChatMessage>) {
        self.mutate(Touched::HISTORY, |state| state.messages = messages);
    }

    pub fn remove_message(&self, index: usize) -> Option<ChatMessage> {
        let mut state = self.write_state();
        if index >= state.messages.len() {
            return None;
        }
        let removed = state.messages.remove(index);
        self.after_update(&mut *state, Touched::HISTORY);
        Some(removed)
    }

    /// Lock, unlock or retag a message; false when `index` is out of range
    pub fn set_message_type(&self, index: usize, kind: Option<MessageType>) -> bool {
        let mut state = self.write_state();
        let Some(message) = state.messages.get_mut(index) else {
            return false;
        };
        message.kind = kind;
        self.after_update(&mut *state, Touched::HISTORY);
        true
    }

    // ========== Readers ==========

    pub fn session_id(&self) -> String {
        self.read_state().session_id.clone()
    }

    pub fn global_settings(&self) -> GlobalSettings {
        self.read_state().global_settings.clone()
    }

    pub fn session_settings(&self) -> SessionSettings {
        self.read_state().session_settings.clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.read_state().messages.clone()
    }

    pub fn valid_context(&self) -> Vec<ChatMessage> {
        self.read_state().valid_context.clone()
    }

    pub fn current_model(&self) -> Model {
        self.read_state().current_model()
    }

    pub fn usage(&self) -> TokenUsage {
        self.read_state().usage
    }

    pub fn costs(&self) -> TokenCosts {
        let state = self.read_state();
        state.usage.costs(state.current_model())
    }

    /// Budget left for the next request
    pub fn remaining_token(&self) -> i64 {
        self.remaining_for(&self.read_state())
    }

    fn remaining_for(&self, state: &StoreState) -> i64 {
        let table = self.token_table(&state.global_settings);
        remaining_tokens(
            table.get(state.session_settings.model),
            state.usage.context_token,
            state.usage.input_content_token,
        )
    }

    /// Budget table in effect: the configured one once an API key is set
    fn token_table(&self, global: &GlobalSettings) -> &TokenTable {
        if global.api_key.is_empty() {
            &self.inner.config.default_tokens
        } else {
            &self.inner.config.privileged_tokens
        }
    }

    /// Count all three buffers now, bypassing the throttle
    ///
    /// The result is applied only if the same session is still active.
    pub async fn recount_now(&self) -> Result<TokenUsage, CounterError> {
        let (id, input, context, current) = {
            let state = self.read_state();
            (
                state.session_id.clone(),
                state.input_content.clone(),
                state.context_text.clone(),
                state.current_assistant_message.clone(),
            )
        };

        let counter = &self.inner.counter;
        let (context_token, current_message_token, input_content_token) = futures::try_join!(
            counter.count_tokens(&context),
            counter.count_tokens(&current),
            counter.count_tokens(&input),
        )?;
        let usage = TokenUsage {
            context_token,
            current_message_token,
            input_content_token,
        };

        let mut state = self.write_state();
        if state.session_id == id {
            state.usage = usage;
        }
        Ok(usage)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.read_state();
        let current_model = state.current_model();
        StoreSnapshot {
            session_id: state.session_id.clone(),
            global_settings: state.global_settings.clone(),
            session_settings: state.session_settings.clone(),
            messages: state.messages.clone(),
            valid_context: state.valid_context.clone(),
            input_content: state.input_content.clone(),
            current_assistant_message: state.current_assistant_message.clone(),
            loading: state.loading,
            current_model,
            usage: state.usage,
            costs: state.usage.costs(current_model),
            remaining_token: self.remaining_for(&state),
        }
    }

    /// Greeting the renderer shows in an empty session
    pub fn default_message(&self) -> ChatMessage {
        self.inner.config.greeting()
    }

    // ========== Session index ==========

    fn schedule_index_rebuild(&self) {
        let storage = self.inner.storage.clone();
        let state = Arc::clone(&self.inner.state);
        let home = self.inner.home.clone();

        self.inner.index.schedule(move || {
            let active = state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .session_id
                .clone();
            build_index(&storage, &active, &home)
        });
    }

    /// Latest index built by the debounced rebuild
    pub fn session_index(&self) -> Option<Arc<SessionIndex>> {
        self.inner.index.current()
    }

    /// Build the index immediately and install it
    pub fn rebuild_index_now(&self) -> Result<Arc<SessionIndex>, SessionError> {
        let active = self.session_id();
        let index = build_index(&self.inner.storage, &active, &self.inner.home)
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        Ok(self.inner.index.replace(index))
    }

    /// Search the current index; empty until a rebuild has completed
    pub fn search_sessions(&self, query: &str) -> Vec<SearchHit> {
        self.session_index()
            .map(|index| index.search(query))
            .unwrap_or_default()
    }
}

/// Sink writing finished counts into the state, if still relevant
fn apply_count_sink(state: Arc<RwLock<StoreState>>) -> CountSink {
    Arc::new(move |result: CountResult| {
        let mut state = state.write().unwrap_or_else(PoisonError::into_inner);
        if state.session_id != result.session_id {
            tracing::debug!(
                chain = %result.kind,
                counted_for = %result.session_id,
                active = %state.session_id,
                "Discarding stale token count"
            );
            return;
        }
        state.usage.set(result.kind, result.tokens);
    })
}

/// Short random id
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
