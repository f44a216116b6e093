use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tau_core::{current_unix_timestamp_ms, write_text_atomic};
use tau_slowmode::{
    load_slowmode_replay_fixture, load_slowmode_runtime_config, run_slowmode_replay,
    InMemoryLeaseStore, LeaseStore, SlowmodeRuntimeConfig, SqliteLeaseStore,
};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "tau-slowmode",
    about = "Operator tooling for bot-maintained channel slowmode",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "TAU_SLOWMODE_CONFIG",
        default_value = ".tau/slowmode/config.json",
        help = "Runtime config JSON; defaults apply when the file is missing"
    )]
    config: PathBuf,

    #[arg(
        long,
        env = "TAU_SLOWMODE_DATABASE",
        help = "SQLite lease database; overrides database_path from the config"
    )]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a message fixture through the enforcer and print the report.
    Replay {
        #[arg(long)]
        fixture: PathBuf,
        #[arg(long, help = "Also write the JSON report to this path")]
        report: Option<PathBuf>,
        #[arg(
            long,
            help = "Replay against the configured SQLite database instead of memory"
        )]
        persist: bool,
    },
    /// List stored leases.
    Leases {
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        include_expired: bool,
    },
    /// List channels with bot slowmode configured.
    Channels,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn open_sqlite_store(cli: &Cli, config: &SlowmodeRuntimeConfig) -> Result<SqliteLeaseStore> {
    let path = cli
        .database
        .clone()
        .unwrap_or_else(|| config.database_path.clone());
    SqliteLeaseStore::new(&path)
        .with_context(|| format!("failed to open slowmode database {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_slowmode_runtime_config(&cli.config)?;

    match &cli.command {
        Command::Replay {
            fixture,
            report,
            persist,
        } => {
            let fixture = load_slowmode_replay_fixture(fixture)?;
            let store: Arc<dyn LeaseStore> = if *persist {
                Arc::new(open_sqlite_store(&cli, &config)?)
            } else {
                Arc::new(InMemoryLeaseStore::new())
            };
            let replay = run_slowmode_replay(&fixture, store, &config).await?;
            let rendered = serde_json::to_string_pretty(&replay)?;
            if let Some(path) = report {
                write_text_atomic(path, &rendered)?;
            }
            println!("{rendered}");
            let mismatches = replay.mismatches();
            if !mismatches.is_empty() {
                anyhow::bail!(
                    "{} replay event(s) did not match their expected reason code",
                    mismatches.len()
                );
            }
        }
        Command::Leases {
            channel,
            include_expired,
        } => {
            let store = open_sqlite_store(&cli, &config)?;
            let now_unix_ms = current_unix_timestamp_ms();
            let leases = store
                .list_leases(channel.as_deref())
                .await?
                .into_iter()
                .filter(|lease| *include_expired || lease.is_active_at(now_unix_ms))
                .collect::<Vec<_>>();
            println!("{}", serde_json::to_string_pretty(&leases)?);
        }
        Command::Channels => {
            let store = open_sqlite_store(&cli, &config)?;
            let configs = store.list_configs().await?;
            println!("{}", serde_json::to_string_pretty(&configs)?);
        }
    }
    Ok(())
}
