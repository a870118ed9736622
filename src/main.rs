use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flocksync::sync::{RequestOptions, Role};
use flocksync::{OfflineConfig, OfflineContext};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flocksync", version, about = "Offline cache and sync queue for the church API")]
struct Cli {
    /// TOML file with configuration overrides
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the cache database
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the API origin
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Act as this user
    #[arg(long, global = true)]
    user_id: Option<i64>,

    #[arg(long, global = true, default_value = "member")]
    role: Role,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show cache, queue and key state
    Status,
    /// Replay every queued mutation now
    Sync,
    /// Fetch a resource through the offline layer
    Get { path: String },
    /// Inspect or dismiss recorded conflicts
    Conflicts {
        #[command(subcommand)]
        action: ConflictAction,
    },
    /// Inspect or purge mutations that ran out of attempts
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
    /// Remove cache entries past the retention window
    PurgeExpired,
    /// Derive a new cache key and discard everything encrypted with the old one
    RotateKey,
}

#[derive(Subcommand)]
enum ConflictAction {
    List,
    Dismiss { id: i64 },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    List,
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flocksync=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => OfflineConfig::load(path)?,
        None => OfflineConfig::default(),
    };
    if let Some(api_url) = cli.api_url {
        config.api_base_url = api_url;
    }

    let data_dir = cli.data_dir.unwrap_or_else(OfflineConfig::default_data_dir);
    let ctx = OfflineContext::init(config, Some(data_dir.join("flocksync.db")))
        .await
        .context("Failed to initialize offline layer")?;

    if let Some(user_id) = cli.user_id {
        ctx.login(user_id, cli.role).await;
    }

    let outcome = run(&ctx, cli.command).await;
    ctx.teardown().await;
    outcome
}

async fn run(ctx: &OfflineContext, command: Command) -> Result<()> {
    match command {
        Command::Status => {
            let stats = ctx.db.get_stats().await?;
            for (table, count) in &stats.cached {
                println!("{:<10} {} cached", table, count);
            }
            println!("queued       {}", stats.queued);
            println!("conflicts    {}", stats.conflicts);
            println!("dead letters {}", stats.dead_letters);
            println!("key version  {}", ctx.keys.key_version().await?);
        }

        Command::Sync => {
            let report = ctx.sync.force_sync().await?;
            println!(
                "{} acknowledged, {} retrying, {} conflicts, {} dropped, {} skipped",
                report.acknowledged().len(),
                report.retried(),
                report.conflicts(),
                report.dropped(),
                report.skipped()
            );
        }

        Command::Get { path } => {
            let response = ctx.interceptor.request(&path, RequestOptions::get()).await?;
            if response.is_offline_cache() {
                info!("Served from offline cache");
            }
            println!("{}", response.status());
            println!("{}", response.text());
        }

        Command::Conflicts { action } => match action {
            ConflictAction::List => {
                for conflict in ctx.conflicts.list().await? {
                    println!("{}", serde_json::to_string_pretty(&conflict)?);
                }
            }
            ConflictAction::Dismiss { id } => {
                if !ctx.conflicts.dismiss(id).await? {
                    anyhow::bail!("No conflict with id {}", id);
                }
            }
        },

        Command::DeadLetters { action } => match action {
            DeadLetterAction::List => {
                for dead in ctx.queue.dead_letters().await? {
                    println!("{}", serde_json::to_string_pretty(&dead)?);
                }
            }
            DeadLetterAction::Purge => {
                let removed = ctx.queue.purge_dead_letters().await?;
                println!("Purged {} dead letters", removed);
            }
        },

        Command::PurgeExpired => {
            let removed = ctx.store.clean_expired_data().await?;
            println!("Removed {} expired cache entries", removed);
        }

        Command::RotateKey => {
            let key = ctx.keys.rotate_key().await?;
            println!("Rotated cache key to version {}", key.version());
        }
    }

    Ok(())
}
