//! CLI transport for direct terminal interaction
//!
//! Each `run_*` function drives one subcommand against a session store opened
//! on the on-disk key-value store.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};

use crate::config::{Config, EngineConfig, EnvOverrides};
use crate::core::traits::TokenCounter;
use crate::core::{
    ChatMessage, MessageType, Role, SessionStore, SimpleModel, WorkerTokenCounter,
    INDEX_SESSION_ID,
};
use crate::storage::LocalStorage;

/// Options shared by every subcommand
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub store_dir: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub approximate: bool,
}

/// Open the configured store and build a session store over it
pub fn open_store(options: &CliOptions) -> Result<SessionStore> {
    let config = match &options.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_else(|e| {
            tracing::warn!("Using default configuration: {:#}", e);
            Config::default()
        }),
    };

    let dir = options
        .store_dir
        .clone()
        .unwrap_or_else(|| config.storage.resolve_dir());
    tracing::debug!("Opening store at {}", dir.display());
    let storage = LocalStorage::open(&dir)?;

    let counter = if options.approximate {
        WorkerTokenCounter::approximate()
    } else {
        WorkerTokenCounter::default()
    };
    tracing::debug!(tokenizer = counter.tokenizer_name(), "Token counter ready");
    let counter: Arc<dyn TokenCounter> = Arc::new(counter);

    let engine = EngineConfig::new(&config, EnvOverrides::from_env());
    let store = SessionStore::new(storage, engine, counter)?;
    Ok(store)
}

/// Persist the active session
fn save(store: &SessionStore) -> Result<()> {
    store.persist().context("Failed to save session")
}

fn role_label(role: Role) -> String {
    match role {
        Role::User => "user".blue().to_string(),
        Role::Assistant => "assistant".green().to_string(),
        Role::System => "system".yellow().to_string(),
        Role::Error => "error".red().to_string(),
    }
}

fn kind_label(kind: Option<MessageType>) -> &'static str {
    match kind {
        Some(MessageType::Locked) => "locked",
        Some(MessageType::Temporary) => "temporary",
        Some(MessageType::Default) => "default",
        Some(MessageType::Normal) | None => "",
    }
}

/// Trim to one line of at most `max` characters
fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max || text.contains('\n') {
        let cut: String = line.chars().take(max).collect();
        format!("{}…", cut)
    } else {
        line.to_string()
    }
}

fn format_visit(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// List saved sessions
pub fn run_list(store: &SessionStore, format: &str) -> Result<()> {
    let mut sessions = store.storage().fetch_all_sessions()?;
    sessions.sort_by(|a, b| b.last_visit.cmp(&a.last_visit));

    match format {
        "json" => {
            let output: Vec<_> = sessions
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "id": s.id,
                        "title": s.title(),
                        "lastVisit": s.last_visit,
                        "messages": s.messages().len(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => {
            if sessions.is_empty() {
                println!("No saved sessions.");
                return Ok(());
            }

            #[derive(Tabled)]
            struct SessionRow {
                #[tabled(rename = "Id")]
                id: String,
                #[tabled(rename = "Title")]
                title: String,
                #[tabled(rename = "Messages")]
                messages: usize,
                #[tabled(rename = "Last Visit")]
                last_visit: String,
            }

            let rows: Vec<SessionRow> = sessions
                .iter()
                .map(|s| SessionRow {
                    id: s.id.clone(),
                    title: preview(s.title(), 40),
                    messages: s.messages().len(),
                    last_visit: format_visit(s.last_visit),
                })
                .collect();

            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{}", table);
        }
    }

    Ok(())
}

/// Create a session and print its id
pub fn run_new(store: &SessionStore, title: Option<String>) -> Result<()> {
    let id = store.create_session()?;
    if let Some(title) = title {
        store.update_session_settings(|s| s.title = title);
        save(store)?;
    }
    println!("{}", id);
    Ok(())
}

/// Print a session's messages
pub fn run_show(store: &SessionStore, id: &str, format: &str) -> Result<()> {
    store.load_session(id);
    let snapshot = store.snapshot();

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let title = if snapshot.session_settings.title.is_empty() {
        id.to_string()
    } else {
        snapshot.session_settings.title.clone()
    };
    println!("{}", title.bold().cyan());
    println!(
        "{} {}  {} {}  {} {}",
        "model:".dimmed(),
        snapshot.session_settings.model,
        "continuous:".dimmed(),
        snapshot.session_settings.continuous_dialogue,
        "saved:".dimmed(),
        snapshot.session_settings.save_session,
    );
    println!();

    if snapshot.messages.is_empty() {
        println!("{}", store.default_message().content.dimmed());
        return Ok(());
    }

    #[derive(Tabled)]
    struct MessageRow {
        #[tabled(rename = "#")]
        index: usize,
        #[tabled(rename = "Role")]
        role: String,
        #[tabled(rename = "Type")]
        kind: String,
        #[tabled(rename = "Content")]
        content: String,
    }

    let rows: Vec<MessageRow> = snapshot
        .messages
        .iter()
        .enumerate()
        .map(|(index, m)| MessageRow {
            index,
            role: role_label(m.role),
            kind: kind_label(m.kind).to_string(),
            content: preview(&m.content, 60),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);
    println!(
        "{} {} of {} messages",
        "context:".dimmed(),
        snapshot.valid_context.len(),
        snapshot.messages.len()
    );

    Ok(())
}

fn parse_role(role: &str) -> Result<Role> {
    match role.to_lowercase().as_str() {
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "system" => Ok(Role::System),
        "error" => Ok(Role::Error),
        other => anyhow::bail!("Unknown role: {} (expected user, assistant, system or error)", other),
    }
}

/// Append a message and save the session
pub fn run_add(
    store: &SessionStore,
    id: &str,
    role: &str,
    content: String,
    locked: bool,
) -> Result<()> {
    let role = parse_role(role)?;
    store.load_session(id);

    let mut message = ChatMessage::new(role, content);
    if locked {
        message = message.with_kind(MessageType::Locked);
    }
    store.push_message(message);
    save(store)?;

    println!(
        "{} {} message to {}",
        "✓".green(),
        role,
        id.bold()
    );
    Ok(())
}

/// Settings changed by `set`
#[derive(Debug, Clone, Default)]
pub struct SessionChanges {
    pub title: Option<String>,
    pub model: Option<SimpleModel>,
    pub temperature: Option<f64>,
    pub continuous: Option<bool>,
    pub save_session: Option<bool>,
}

/// Update a session's settings and save it
pub fn run_set(store: &SessionStore, id: &str, changes: SessionChanges) -> Result<()> {
    if let Some(t) = changes.temperature {
        if !(0.0..=2.0).contains(&t) {
            anyhow::bail!("Temperature must be between 0.0 and 2.0, got {}", t);
        }
    }

    store.load_session(id);
    store.update_session_settings(|s| {
        if let Some(title) = changes.title {
            s.title = title;
        }
        if let Some(model) = changes.model {
            s.model = model;
        }
        if let Some(t) = changes.temperature {
            s.api_temperature = t;
        }
        if let Some(c) = changes.continuous {
            s.continuous_dialogue = c;
        }
        if let Some(save) = changes.save_session {
            s.save_session = save;
        }
    });
    save(store)?;

    let settings = store.session_settings();
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

/// Print global settings, saving any changes first
pub fn run_global(
    store: &SessionStore,
    api_key: Option<String>,
    enter_to_send: Option<bool>,
) -> Result<()> {
    let changed = api_key.is_some() || enter_to_send.is_some();
    store.update_global_settings(|g| {
        if let Some(key) = api_key {
            g.api_key = key;
        }
        if let Some(enter) = enter_to_send {
            g.enter_to_send = enter;
        }
    });
    if changed {
        store
            .persist_global_settings()
            .context("Failed to save global settings")?;
    }

    let settings = store.global_settings();
    let masked = if settings.api_key.is_empty() {
        "(not set)".to_string()
    } else {
        let tail: String = settings
            .api_key
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("…{}", tail)
    };
    println!("{} {}", "API key:".bold(), masked);
    println!("{} {}", "Enter to send:".bold(), settings.enter_to_send);
    Ok(())
}

/// Search saved sessions
pub fn run_search(store: &SessionStore, query: &str, from: &str, format: &str) -> Result<()> {
    store.load_session(from);
    store.rebuild_index_now()?;
    let hits = store.search_sessions(query);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&hits)?),
        _ => {
            if hits.is_empty() {
                println!("No sessions match \"{}\".", query);
                return Ok(());
            }

            #[derive(Tabled)]
            struct HitRow {
                #[tabled(rename = "Id")]
                id: String,
                #[tabled(rename = "Title")]
                title: String,
                #[tabled(rename = "Preview")]
                preview: String,
                #[tabled(rename = "Score")]
                score: i32,
            }

            let rows: Vec<HitRow> = hits
                .iter()
                .map(|h| HitRow {
                    id: h.option.id.clone(),
                    title: preview(&h.option.title, 30),
                    preview: preview(&h.option.desc, 50),
                    score: h.score,
                })
                .collect();

            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{}", table);
        }
    }

    Ok(())
}

/// Clear a session, keeping locked messages
pub fn run_clear(store: &SessionStore, id: &str) -> Result<()> {
    store.load_session(id);
    store.clear_session();
    save(store)?;

    println!(
        "{} Cleared {} ({} locked messages kept)",
        "✓".green(),
        id.bold(),
        store.messages().len()
    );
    Ok(())
}

/// Delete a session
pub fn run_delete(store: &SessionStore, id: &str) -> Result<()> {
    if !store.storage().session_exists(id)? && id != INDEX_SESSION_ID {
        println!("Session {} does not exist.", id.bold());
        return Ok(());
    }
    store.delete_session(id)?;
    println!("{} Deleted {}", "✓".green(), id.bold());
    Ok(())
}

/// Print token counts, costs and remaining budget
pub async fn run_budget(
    store: &SessionStore,
    id: &str,
    input: Option<String>,
    format: &str,
) -> Result<()> {
    store.load_session(id);
    if let Some(input) = input {
        store.set_input_content(input);
    }
    store.recount_now().await?;
    let snapshot = store.snapshot();

    match format {
        "json" => {
            let output = serde_json::json!({
                "sessionId": snapshot.session_id,
                "model": snapshot.current_model,
                "usage": snapshot.usage,
                "costs": snapshot.costs,
                "remainingToken": snapshot.remaining_token,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => {
            println!(
                "\n{}",
                format!("=== BUDGET: {} ({}) ===", id, snapshot.current_model)
                    .bold()
                    .cyan()
            );
            println!();

            #[derive(Tabled)]
            struct BudgetRow {
                #[tabled(rename = "Counter")]
                counter: String,
                #[tabled(rename = "Tokens")]
                tokens: usize,
                #[tabled(rename = "Cost")]
                cost: String,
            }

            let usage = snapshot.usage;
            let costs = snapshot.costs;
            let rows = vec![
                BudgetRow {
                    counter: "Context".to_string(),
                    tokens: usage.context_token,
                    cost: format!("${:.6}", costs.context),
                },
                BudgetRow {
                    counter: "Input".to_string(),
                    tokens: usage.input_content_token,
                    cost: format!("${:.6}", costs.input_content),
                },
                BudgetRow {
                    counter: "Streaming reply".to_string(),
                    tokens: usage.current_message_token,
                    cost: format!("${:.6}", costs.current_message),
                },
            ];

            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{}", table);

            let remaining = snapshot.remaining_token.to_string();
            let remaining = if snapshot.remaining_token < 0 {
                remaining.red().bold()
            } else {
                remaining.green().bold()
            };
            println!("{} {}", "Remaining tokens:".bold(), remaining);
        }
    }

    Ok(())
}

/// Write every key of the store as one JSON object
pub fn run_export(store: &SessionStore, output: Option<&Path>) -> Result<()> {
    let dump = serde_json::to_string_pretty(&store.storage().export_all()?)?;
    match output {
        Some(path) => {
            std::fs::write(path, dump)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("{} Exported to {}", "✓".green(), path.display());
        }
        None => println!("{}", dump),
    }
    Ok(())
}

/// Replace the store with a dump
pub fn run_import(store: &SessionStore, file: &Path) -> Result<()> {
    let dump = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let count = store.storage().import_all(&dump)?;
    println!("{} Imported {} keys", "✓".green(), count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_to_first_line() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("first\nsecond", 10), "first…");
        assert_eq!(preview("abcdefghij", 4), "abcd…");
        assert_eq!(preview("", 4), "");
    }

    #[test]
    fn test_parse_role() {
        assert_eq!(parse_role("User").unwrap(), Role::User);
        assert!(parse_role("tool").is_err());
    }

    #[test]
    fn test_kind_label() {
        assert_eq!(kind_label(Some(MessageType::Locked)), "locked");
        assert_eq!(kind_label(None), "");
    }
}
