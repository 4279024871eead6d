//! Session index
//!
//! A searchable catalogue of saved sessions used for quick navigation. Each
//! option is matched on `title + "\n" + desc`, where `desc` is the session's
//! message contents. The catalogue is rebuilt after every session switch, but
//! only once the switches settle down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;

use super::types::INDEX_SESSION_ID;
use crate::storage::{LocalStorage, StoredSession};

/// One navigable entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionOption {
    pub id: String,
    pub title: String,
    pub desc: String,
}

impl SessionOption {
    fn from_stored(session: &StoredSession) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title().to_string(),
            desc: message_text(session),
        }
    }

    /// Text the fuzzy matcher runs over
    pub fn haystack(&self) -> String {
        format!("{}\n{}", self.title, self.desc)
    }
}

/// Localized strings of the "return to home" option
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeOption {
    pub title: String,
    pub hint: String,
}

/// A ranked search result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub option: SessionOption,
    pub score: i32,
}

/// Catalogue of sessions other than the active one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIndex {
    options: Vec<SessionOption>,
}

impl SessionIndex {
    /// Build from every persisted session
    ///
    /// Sessions are ordered by `lastVisit`, most recent first. The active
    /// session and the home session are left out; unless the home session is
    /// the active one, a "return to home" option is put in front.
    pub fn build(mut sessions: Vec<StoredSession>, active_id: &str, home: &HomeOption) -> Self {
        sessions.sort_by(|a, b| b.last_visit.cmp(&a.last_visit));

        let mut options: Vec<SessionOption> = sessions
            .iter()
            .filter(|s| s.id != active_id && s.id != INDEX_SESSION_ID)
            .map(SessionOption::from_stored)
            .collect();

        if active_id != INDEX_SESSION_ID {
            let mut desc = home.hint.clone();
            if let Some(index) = sessions.iter().find(|s| s.id == INDEX_SESSION_ID) {
                let contents = message_text(index);
                if !contents.is_empty() {
                    desc.push('\n');
                    desc.push_str(&contents);
                }
            }
            options.insert(
                0,
                SessionOption {
                    id: INDEX_SESSION_ID.to_string(),
                    title: home.title.clone(),
                    desc,
                },
            );
        }

        Self { options }
    }

    pub fn options(&self) -> &[SessionOption] {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Options matching `query`, best first
    ///
    /// Equal scores keep catalogue order. An empty query returns everything.
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        let mut hits: Vec<SearchHit> = self
            .options
            .iter()
            .filter_map(|option| {
                fuzzy_score(&option.haystack(), query).map(|score| SearchHit {
                    option: option.clone(),
                    score,
                })
            })
            .collect();

        // Stable sort keeps catalogue order for ties
        hits.sort_by(|a, b| b.score.cmp(&a.score));
        hits
    }
}

/// Read every persisted session and build the index for `active_id`
pub fn build_index(
    storage: &LocalStorage,
    active_id: &str,
    home: &HomeOption,
) -> anyhow::Result<SessionIndex> {
    let sessions = storage.fetch_all_sessions()?;
    Ok(SessionIndex::build(sessions, active_id, home))
}

fn message_text(session: &StoredSession) -> String {
    session
        .messages()
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Score `query` against `candidate`, case-insensitively
///
/// Prefix matches rank above substring matches, which rank above in-order
/// subsequence matches. Returns `None` when the query characters do not all
/// appear in order.
pub fn fuzzy_score(candidate: &str, query: &str) -> Option<i32> {
    let query = query.trim();
    if query.is_empty() {
        return Some(0);
    }

    let cand = candidate.to_lowercase();
    let query = query.to_lowercase();

    if cand.starts_with(&query) {
        // Prefer shorter candidates among prefix matches
        let penalty = clamp(cand.len().saturating_sub(query.len())).min(299);
        return Some(1_000 - penalty);
    }

    if let Some(idx) = cand.find(&query) {
        return Some(700 - clamp(idx).min(199));
    }

    let mut score = 500i32;
    let mut search_from = 0usize;
    for q in query.chars() {
        let pos = cand[search_from..].find(q)?;
        score -= clamp(pos);
        search_from += pos + q.len_utf8();
    }
    score -= clamp(cand.len()) / 10;
    Some(score.min(499))
}

fn clamp(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Debounced rebuild of the session index
///
/// Every `schedule` supersedes the ones before it; only a request that is
/// still the latest when its delay expires runs.
#[derive(Clone)]
pub struct IndexScheduler {
    handle: Handle,
    debounce: Duration,
    generation: Arc<AtomicU64>,
    current: Arc<RwLock<Option<Arc<SessionIndex>>>>,
}

impl IndexScheduler {
    pub fn new(handle: Handle, debounce: Duration) -> Self {
        Self {
            handle,
            debounce,
            generation: Arc::new(AtomicU64::new(0)),
            current: Arc::new(RwLock::new(None)),
        }
    }

    /// Queue a rebuild; `build` runs on the blocking pool after the delay
    pub fn schedule<F>(&self, build: F)
    where
        F: FnOnce() -> anyhow::Result<SessionIndex> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let latest = Arc::clone(&self.generation);
        let current = Arc::clone(&self.current);
        let debounce = self.debounce;

        self.handle.spawn(async move {
            tokio::time::sleep(debounce).await;

            if latest.load(Ordering::SeqCst) != generation {
                tracing::debug!(generation, "Index rebuild superseded");
                return;
            }

            match tokio::task::spawn_blocking(build).await {
                Ok(Ok(index)) => {
                    tracing::debug!(options = index.len(), "Session index rebuilt");
                    *current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(index));
                }
                Ok(Err(e)) => tracing::warn!("Failed to rebuild session index: {:#}", e),
                Err(e) => tracing::warn!("Session index worker failed: {}", e),
            }
        });
    }

    /// Most recently built index, if any rebuild has completed
    pub fn current(&self) -> Option<Arc<SessionIndex>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install an index built synchronously by the caller
    pub fn replace(&self, index: SessionIndex) -> Arc<SessionIndex> {
        let index = Arc::new(index);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&index));
        index
    }

    /// Number of rebuilds requested so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ChatMessage, Session, SessionSettings};
    use std::sync::atomic::AtomicUsize;

    fn home() -> HomeOption {
        HomeOption {
            title: "Home".to_string(),
            hint: "Back to the start.".to_string(),
        }
    }

    fn stored(id: &str, title: &str, last_visit: i64, messages: &[&str]) -> StoredSession {
        let mut session = Session::new(
            id,
            SessionSettings {
                title: title.to_string(),
                ..Default::default()
            },
        );
        session.last_visit = last_visit;
        session.messages = messages.iter().map(|m| ChatMessage::user(*m)).collect();
        let raw = serde_json::to_string(&session).unwrap();
        StoredSession::parse(&raw, id).unwrap()
    }

    #[test]
    fn test_build_orders_and_excludes() {
        let sessions = vec![
            stored("old", "Old", 1, &["a"]),
            stored(INDEX_SESSION_ID, "", 9, &["home text"]),
            stored("active", "Active", 5, &[]),
            stored("new", "New", 3, &["b", "c"]),
        ];

        let index = SessionIndex::build(sessions, "active", &home());
        let ids: Vec<&str> = index.options().iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec![INDEX_SESSION_ID, "new", "old"]);
        assert_eq!(index.options()[0].desc, "Back to the start.\nhome text");
        assert_eq!(index.options()[1].desc, "b\nc");
    }

    #[test]
    fn test_no_home_option_on_home() {
        let sessions = vec![stored(INDEX_SESSION_ID, "", 9, &[]), stored("a", "A", 1, &[])];
        let index = SessionIndex::build(sessions, INDEX_SESSION_ID, &home());
        assert_eq!(index.len(), 1);
        assert_eq!(index.options()[0].id, "a");
    }

    #[test]
    fn test_home_option_without_home_record() {
        let index = SessionIndex::build(Vec::new(), "a", &home());
        assert_eq!(index.options()[0].desc, "Back to the start.");
    }

    #[test]
    fn test_search_ranks_prefix_over_substring_over_subsequence() {
        let sessions = vec![
            stored("sub", "rxuxsxt", 4, &[]),
            stored("mid", "learning rust", 3, &[]),
            stored("pre", "rust tips", 2, &[]),
            stored("none", "python", 1, &[]),
        ];
        let index = SessionIndex::build(sessions, INDEX_SESSION_ID, &home());

        let ids: Vec<String> = index
            .search("Rust")
            .into_iter()
            .map(|h| h.option.id)
            .collect();
        assert_eq!(ids, vec!["pre", "mid", "sub"]);
    }

    #[test]
    fn test_search_matches_message_contents() {
        let sessions = vec![stored("a", "Untitled", 1, &["how do lifetimes work"])];
        let index = SessionIndex::build(sessions, INDEX_SESSION_ID, &home());
        assert_eq!(index.search("lifetimes").len(), 1);
        assert!(index.search("borrowck").is_empty());
    }

    #[test]
    fn test_empty_query_returns_catalogue_in_order() {
        let sessions = vec![stored("a", "A", 2, &[]), stored("b", "B", 1, &[])];
        let index = SessionIndex::build(sessions, "b", &home());
        let ids: Vec<String> = index.search("").into_iter().map(|h| h.option.id).collect();
        assert_eq!(ids, vec![INDEX_SESSION_ID.to_string(), "a".to_string()]);
    }

    #[test]
    fn test_fuzzy_score_tiers() {
        assert!(fuzzy_score("rust", "ru").unwrap() > fuzzy_score("trust", "ru").unwrap());
        assert!(fuzzy_score("trust", "ru").unwrap() > fuzzy_score("r-u", "ru").unwrap());
        assert_eq!(fuzzy_score("abc", "abd"), None);
        // Unicode lowercase
        assert!(fuzzy_score("Trần", "trần").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_runs_only_latest() {
        let scheduler = IndexScheduler::new(Handle::current(), Duration::from_millis(500));
        let runs = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let runs = Arc::clone(&runs);
            scheduler.schedule(move || {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(SessionIndex::build(Vec::new(), &format!("s{}", i), &home()))
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(scheduler.current().is_none());

        tokio::time::sleep(Duration::from_millis(600)).await;
        // Blocking-pool work completes outside the paused clock
        for _ in 0..50 {
            if scheduler.current().is_some() {
                break;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.generation(), 3);
        assert!(scheduler.current().is_some());
    }
}

/// Property-based tests for fuzzy ranking
#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_index() -> impl Strategy<Value = SessionIndex> {
        prop::collection::vec(("[a-z ]{0,12}", "[a-z\n ]{0,24}"), 0..12).prop_map(|entries| {
            SessionIndex {
                options: entries
                    .into_iter()
                    .enumerate()
                    .map(|(i, (title, desc))| SessionOption {
                        id: format!("s{}", i),
                        title,
                        desc,
                    })
                    .collect(),
            }
        })
    }

    proptest! {
        #[test]
        fn prop_hits_are_sorted_by_score(index in arb_index(), query in "[a-z]{0,4}") {
            let hits = index.search(&query);
            prop_assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
            prop_assert!(hits.len() <= index.len());
        }

        #[test]
        fn prop_substring_matches_are_found(index in arb_index(), pick in any::<prop::sample::Index>()) {
            prop_assume!(!index.is_empty());
            let option = &index.options()[pick.index(index.len())];
            let query: String = option.title.trim().chars().take(3).collect();
            prop_assume!(!query.trim().is_empty());

            let hits = index.search(&query);
            prop_assert!(hits.iter().any(|h| h.option.id == option.id));
        }
    }
}
