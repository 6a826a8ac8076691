//! DB Query Engine - command line entry point.
//!
//! Manages registered connections in a SQLite-backed store, introspects their
//! schemas and runs ad-hoc SQL against them. Every command prints JSON.

use clap::{Parser, Subcommand};
use db_query_engine::models::{ConnectionUpdate, ExecuteRequest, IntrospectRequest, NewConnection};
use db_query_engine::store::SqliteStore;
use db_query_engine::{Config, DbError, Engine};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "db-query-engine", version, about)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a new connection
    Register {
        name: String,
        /// postgres://, mysql://, mariadb:// or sqlite: URL
        url: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Update a registered connection
    Update {
        /// Connection id or name
        connection: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long, conflicts_with = "clear_description")]
        description: Option<String>,
        #[arg(long)]
        clear_description: bool,
        #[arg(long, conflicts_with = "deactivate")]
        activate: bool,
        #[arg(long)]
        deactivate: bool,
    },
    /// List registered connections
    List {
        #[arg(long)]
        active_only: bool,
    },
    /// Delete a connection with its metadata and history
    Delete {
        /// Connection id or name
        connection: String,
    },
    /// Print the schema metadata snapshot of a connection
    Introspect {
        /// Connection id or name
        connection: String,
        /// Ignore the cached snapshot
        #[arg(long)]
        refresh: bool,
        /// Timeout in seconds, capped by --introspection-timeout
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Run SQL against a connection
    Execute {
        /// Connection id or name
        connection: String,
        sql: String,
        /// Timeout in seconds, capped by --max-query-timeout
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show recent executions of a connection
    History {
        /// Connection id or name
        connection: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr so stdout carries only command output.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), DbError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| DbError::internal(format!("Failed to encode output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            token.cancel();
        }
    });
}

async fn run(engine: &Engine, command: Command) -> Result<(), DbError> {
    match command {
        Command::Register {
            name,
            url,
            description,
        } => {
            let input = NewConnection {
                name,
                url,
                description,
            };
            print_json(&engine.register(input).await?)
        }
        Command::Update {
            connection,
            name,
            url,
            description,
            clear_description,
            activate,
            deactivate,
        } => {
            let update = ConnectionUpdate {
                name,
                url,
                description: if clear_description {
                    Some(None)
                } else {
                    description.map(Some)
                },
                is_active: match (activate, deactivate) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
            };
            print_json(&engine.update(&connection, update).await?)
        }
        Command::List { active_only } => print_json(&engine.list(active_only).await?),
        Command::Delete { connection } => {
            let deleted = engine.delete(&connection).await?;
            print_json(&serde_json::json!({ "deleted": deleted.id, "name": deleted.name }))
        }
        Command::Introspect {
            connection,
            refresh,
            timeout,
        } => {
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let mut request = IntrospectRequest::new(refresh).with_cancel(cancel);
            if let Some(secs) = timeout {
                request = request.with_timeout(Duration::from_secs(secs));
            }
            print_json(engine.introspect_with(&connection, request).await?.as_ref())
        }
        Command::Execute {
            connection,
            sql,
            timeout,
        } => {
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let mut request = ExecuteRequest::new(sql).with_cancel(cancel);
            if let Some(secs) = timeout {
                request = request.with_timeout(Duration::from_secs(secs));
            }
            print_json(&engine.execute_with(&connection, request).await?)
        }
        Command::History { connection, limit } => {
            print_json(&engine.history(&connection, limit).await?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let cli = Cli::parse();

    // Initialize logging
    init_tracing(&cli.config);

    if let Err(e) = cli.config.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }

    info!("Starting DB Query Engine v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(SqliteStore::open(&cli.config.store_url).await?);
    let engine = Engine::new(store.clone(), cli.config)?;

    let result = run(&engine, cli.command).await;

    engine.shutdown().await;
    store.close().await;

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        if let Some(suggestion) = e.suggestion() {
            eprintln!("Hint: {}", suggestion);
        }
        std::process::exit(1);
    }

    Ok(())
}
