//! Mirrorsync CLI - command-line interface for the sync pipeline.

mod backend;
mod commands;
mod config;
mod progress;
mod shutdown;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::Term;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mirrorsync")]
#[command(version)]
#[command(about = "A resumable dataset mirroring pipeline")]
#[command(
    long_about = "Mirrorsync copies paginated remote datasets into a local store. Runs are \
cacheable, rate-aware and resumable: responses are cached across runs, request \
concurrency adapts to observed latency, and every task can be paused, resumed, \
cancelled or retried while observers follow its progress live."
)]
#[command(after_long_help = r#"EXAMPLES
    Mirror a manifest into a directory:
        $ mirrorsync run catalog.json --dest ./mirror

    Only sync records that changed since the last run:
        $ mirrorsync run catalog.json --dest ./mirror --incremental

    Expose the pipeline over HTTP (progress via SSE):
        $ mirrorsync serve catalog.json --dest ./mirror --listen 127.0.0.1:8080

    Inspect a finished task:
        $ mirrorsync tasks status <task-id>

    Drop task records older than a week:
        $ mirrorsync tasks purge --older-than-hours 168

CONFIGURATION
    Mirrorsync reads configuration from:
      1. ~/.config/mirrorsync/config.toml (or $XDG_CONFIG_HOME/mirrorsync/config.toml)
      2. ./mirrorsync.toml in the current directory
      3. Environment variables (MIRRORSYNC_* prefix)
      4. .env file in current directory

ENVIRONMENT VARIABLES
    MIRRORSYNC_DATABASE_URL    Database connection string (default: ~/.local/state/mirrorsync/mirrorsync.db)
    MIRRORSYNC_SERVER_LISTEN   API listen address (default: 127.0.0.1:8080)
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync task and watch it to completion
    Run {
        /// JSON manifest describing the dataset to mirror
        manifest: PathBuf,

        /// Destination directory for mirrored records and assets
        #[arg(short, long)]
        dest: PathBuf,

        /// Skip records whose content is unchanged since the last run
        #[arg(short, long)]
        incremental: bool,
    },
    /// Serve the sync API over HTTP
    Serve {
        /// JSON manifest describing the dataset to mirror
        manifest: PathBuf,

        /// Destination directory for mirrored records and assets
        #[arg(short, long)]
        dest: PathBuf,

        /// Listen address (default from config or 127.0.0.1:8080)
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Inspect and prune durable task records
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },
    /// Run database migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Subcommand)]
enum TasksAction {
    /// Show the stored status and snapshot of a task
    Status {
        /// Task identifier as printed by `run` or returned by the API
        task_id: String,
    },
    /// Delete finished task records older than a cutoff
    Purge {
        /// Age cutoff in hours
        #[arg(long, default_value_t = 168)]
        older_than_hours: i64,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Rollback the last migration
    Down,
    /// Show migration status
    Status,
    /// Fresh install - drop all tables and reapply migrations
    Fresh,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize tracing for non-TTY mode (structured logging)
    // Only initialize if not connected to a TTY
    if !Term::stdout().is_term() {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::new("mirrorsync=info,mirrorsync_cli=info"),
        };

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    // Load configuration (config file -> env vars -> defaults)
    let config = config::Config::load();

    let cli = Cli::parse();

    let database_url = config
        .database_url()
        .ok_or("Failed to determine database URL")?;

    // Ensure the database directory exists for SQLite
    if database_url.starts_with("sqlite://") {
        let db_path = database_url.trim_start_matches("sqlite://");
        // Strip query parameters (e.g., ?mode=rwc) before path operations
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        let db_path = std::path::Path::new(db_path);

        // Warn if using a relative path (can cause issues depending on cwd)
        if db_path.is_relative() && !db_path.as_os_str().is_empty() {
            tracing::warn!(
                "Database path '{}' is relative - behavior depends on current directory. \
                 Consider using an absolute path.",
                db_path.display()
            );
        }

        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
    }

    match cli.command {
        Commands::Run {
            manifest,
            dest,
            incremental,
        } => {
            // First Ctrl+C cancels the task cleanly, second force-quits.
            shutdown::setup_shutdown_handler();
            commands::run::handle_run(&manifest, &dest, incremental, &config, &database_url)
                .await?;
        }
        Commands::Serve {
            manifest,
            dest,
            listen,
        } => {
            let listen = listen.unwrap_or_else(|| config.listen_addr());
            commands::serve::handle_serve(&manifest, &dest, &listen, &config, &database_url)
                .await?;
        }
        Commands::Tasks { action } => {
            commands::tasks::handle_tasks(action, &database_url).await?;
        }
        Commands::Migrate { action } => {
            commands::migrate::handle_migrate(action, &database_url).await?;
        }
    }

    Ok(())
}
