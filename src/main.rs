use anyhow::Result;
use clap::{Parser, Subcommand};
use once_cell::sync::Lazy;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_ledger::core::SimpleModel;
use chat_ledger::transport::cli::{self, CliOptions};

static VERSION: Lazy<String> = Lazy::new(|| {
    format!(
        "{}{}",
        env!("CARGO_PKG_VERSION"),
        env!("CHAT_LEDGER_VERSION_SUFFIX")
    )
});

#[derive(Parser)]
#[command(name = "chat-ledger")]
#[command(author, version = VERSION.as_str(), about = "Chat sessions, context and token budgets from the terminal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory of the session store (default: platform data dir)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Configuration file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Count tokens with the 4-characters-per-token estimate
    #[arg(long, global = true)]
    approximate: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List saved sessions, most recently visited first
    List {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Create a new session
    New {
        /// Title instead of the placeholder
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Show a session's messages and valid context
    Show {
        /// Session id
        #[arg(default_value = "index")]
        id: String,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Append a message to a session
    Add {
        /// Session id
        id: String,

        /// Message author (user, assistant, system, error)
        role: String,

        /// Message text
        content: String,

        /// Pin the message so it survives clearing
        #[arg(long)]
        locked: bool,
    },

    /// Change a session's settings
    Set {
        /// Session id
        id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        model: Option<SimpleModel>,

        /// Sampling temperature (0.0 to 2.0)
        #[arg(long)]
        temperature: Option<f64>,

        /// Send the whole conversation as context
        #[arg(long)]
        continuous: Option<bool>,

        /// Keep unlocked messages when the session is saved
        #[arg(long)]
        save_session: Option<bool>,
    },

    /// Show or change global settings
    Global {
        #[arg(long)]
        api_key: Option<String>,

        #[arg(long)]
        enter_to_send: Option<bool>,
    },

    /// Fuzzy-search saved sessions
    Search {
        /// Search text
        query: String,

        /// Session treated as active (excluded from results)
        #[arg(long, default_value = "index")]
        from: String,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Remove every unlocked message from a session
    Clear {
        /// Session id
        id: String,
    },

    /// Delete a session
    Delete {
        /// Session id
        id: String,
    },

    /// Token counts, costs and remaining budget of a session
    Budget {
        /// Session id
        #[arg(default_value = "index")]
        id: String,

        /// Text in the input box
        #[arg(short, long)]
        input: Option<String>,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Dump the whole store as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace the whole store with a JSON dump
    Import {
        /// Dump produced by `export`
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "chat_ledger=debug"
    } else {
        "chat_ledger=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let options = CliOptions {
        store_dir: cli.store,
        config_path: cli.config,
        approximate: cli.approximate,
    };
    let store = cli::open_store(&options)?;

    match cli.command {
        Commands::List { format } => cli::run_list(&store, &format)?,
        Commands::New { title } => cli::run_new(&store, title)?,
        Commands::Show { id, format } => cli::run_show(&store, &id, &format)?,
        Commands::Add {
            id,
            role,
            content,
            locked,
        } => cli::run_add(&store, &id, &role, content, locked)?,
        Commands::Set {
            id,
            title,
            model,
            temperature,
            continuous,
            save_session,
        } => {
            let changes = cli::SessionChanges {
                title,
                model,
                temperature,
                continuous,
                save_session,
            };
            cli::run_set(&store, &id, changes)?;
        }
        Commands::Global {
            api_key,
            enter_to_send,
        } => cli::run_global(&store, api_key, enter_to_send)?,
        Commands::Search {
            query,
            from,
            format,
        } => cli::run_search(&store, &query, &from, &format)?,
        Commands::Clear { id } => cli::run_clear(&store, &id)?,
        Commands::Delete { id } => cli::run_delete(&store, &id)?,
        Commands::Budget { id, input, format } => {
            cli::run_budget(&store, &id, input, &format).await?
        }
        Commands::Export { output } => cli::run_export(&store, output.as_deref())?,
        Commands::Import { file } => cli::run_import(&store, &file)?,
    }

    Ok(())
}
