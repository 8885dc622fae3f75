mod render;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use twig_core::{ConversationRecord, PersistenceGateway};
use twig_db::{ListConversations, SqliteGateway, Store};

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Parser)]
#[command(name = "twig", about = "Inspect stored twig conversations")]
struct Cli {
    /// Database file. Defaults to TWIG_DB_PATH or the platform data dir.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List conversations, most recently updated first.
    List {
        #[arg(long)]
        project: Option<String>,
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },
    /// Print the current path of a conversation.
    Show { id: String },
    /// Find conversations whose current path mentions a phrase.
    Search {
        query: String,
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },
    /// Delete a conversation.
    Delete { id: String },
    /// Print the database path in use.
    Path,
    /// Print the resolved configuration.
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = twig_app::Config::from_env()?;
    let db_path = resolve_db_path(cli.db, &config)?;

    match cli.command {
        Command::Path => {
            println!("{}", db_path.display());
        }
        Command::Config => {
            println!("db_path = {}", db_path.display());
            println!("default_model = {}", config.default_model);
            println!(
                "first_chunk_timeout_secs = {}",
                config.first_chunk_timeout.as_secs()
            );
        }
        Command::List { project, limit } => {
            let mut store = Store::open(&db_path)?;
            let filter = ListConversations {
                project_id: project,
                limit: Some(limit),
            };
            for summary in store.conversations().list(&filter)? {
                println!("{}", render::summary_line(&summary));
            }
        }
        Command::Search { query, limit } => {
            let mut store = Store::open(&db_path)?;
            for summary in store.conversations().search(&query, limit)? {
                println!("{}", render::summary_line(&summary));
            }
        }
        Command::Show { id } => {
            let gateway = SqliteGateway::open(&db_path)?;
            let Some(snapshot) = gateway.load_conversation(&id).await? else {
                return Err(format!("conversation not found: {id}").into());
            };
            let record = ConversationRecord::from_snapshot(snapshot);
            println!(
                "# {} ({})",
                record.title().unwrap_or("(untitled)"),
                record.model()
            );
            if record.has_error() {
                println!("(last reply failed)");
            }
            println!();
            print!("{}", render::transcript(record.tree()));
        }
        Command::Delete { id } => {
            let gateway = SqliteGateway::open(&db_path)?;
            if gateway.delete_conversation(&id).await? {
                println!("deleted {id}");
            } else {
                return Err(format!("conversation not found: {id}").into());
            }
        }
    }

    Ok(())
}

/// `--db` wins over the environment; the platform data directory is only
/// consulted when neither is set.
fn resolve_db_path(flag: Option<PathBuf>, config: &twig_app::Config) -> twig_app::Result<PathBuf> {
    match flag {
        Some(path) => Ok(path),
        None => config.db_path(),
    }
}
